//! On-disk format types for WIA and RVZ containers.
//!
//! All multi-byte integers are stored big-endian. Struct layouts follow the
//! wit/Dolphin format documentation; sizes are checked at compile time.

use std::mem::size_of;

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{Compression, DiscKind, HashBytes, KeyBytes, MagicBytes},
    util::{digest::sha1_hash, static_assert},
    wii::SECTOR_SIZE,
    Error, Result,
};

/// WIA container magic. The first byte is `W`.
pub const WIA_MAGIC: MagicBytes = *b"WIA\x01";

/// RVZ container magic. The first byte is `R`.
pub const RVZ_MAGIC: MagicBytes = *b"RVZ\x01";

pub(crate) const WIA_VERSION: u32 = 0x01000000;
pub(crate) const WIA_VERSION_WRITE_COMPATIBLE: u32 = 0x01000000;
pub(crate) const WIA_VERSION_READ_COMPATIBLE: u32 = 0x00080000;

pub(crate) const RVZ_VERSION: u32 = 0x01000000;
pub(crate) const RVZ_VERSION_WRITE_COMPATIBLE: u32 = 0x00030000;
pub(crate) const RVZ_VERSION_READ_COMPATIBLE: u32 = 0x00030000;

/// Size of the disc header snapshot stored in [`DiscInfo`].
pub const DISC_HEAD_SIZE: usize = 0x80;

/// Verifies the SHA-1 hash of a byte range against the stored hash.
pub(crate) fn verify_hash(buf: &[u8], expected: &HashBytes) -> Result<()> {
    let out = sha1_hash(buf);
    if out != *expected {
        let mut got_bytes = [0u8; 40];
        let got = base16ct::lower::encode_str(&out, &mut got_bytes).unwrap(); // Safe: fixed buffer size
        let mut expected_bytes = [0u8; 40];
        let expected = base16ct::lower::encode_str(expected, &mut expected_bytes).unwrap(); // Safe: fixed buffer size
        return Err(Error::CorruptHeader(format!("hash mismatch: {}, expected {}", got, expected)));
    }
    Ok(())
}

/// Header-1: stored at offset 0x0, 0x48 bytes. The wit source code says its
/// format will never be changed.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct FileHeader {
    /// [`WIA_MAGIC`] or [`RVZ_MAGIC`].
    pub magic: MagicBytes,
    /// The format version.
    ///
    /// A note from the wit source code about how version numbers are encoded:
    ///
    /// ```c
    /// //-----------------------------------------------------
    /// // Format of version number: AABBCCDD = A.BB | A.BB.CC
    /// // If D != 0x00 && D != 0xff => append: 'beta' D
    /// //-----------------------------------------------------
    /// ```
    pub version: U32,
    /// If the reading program supports the version indicated here, it can
    /// read the file. [version](Self::version) can be higher than
    /// `version_compatible`.
    pub version_compatible: U32,
    /// The size of the [`DiscInfo`] struct.
    pub disc_size: U32,
    /// The SHA-1 hash of the [`DiscInfo`] struct. The number of bytes to hash
    /// is determined by [disc_size](Self::disc_size).
    pub disc_hash: HashBytes,
    /// The original size of the ISO.
    pub iso_file_size: U64,
    /// The size of this file.
    pub file_size: U64,
    /// The SHA-1 hash of this struct, up to but not including
    /// `file_head_hash` itself.
    pub file_head_hash: HashBytes,
}

static_assert!(size_of::<FileHeader>() == 0x48);

impl FileHeader {
    /// Validates the magic, version windows, and self-hash.
    pub fn validate(&self) -> Result<()> {
        if self.magic != WIA_MAGIC && self.magic != RVZ_MAGIC {
            return Err(Error::CorruptHeader(format!("Invalid WIA/RVZ magic: {:#X?}", self.magic)));
        }
        let is_rvz = self.is_rvz();
        let version = if is_rvz { RVZ_VERSION } else { WIA_VERSION };
        let version_read_compat =
            if is_rvz { RVZ_VERSION_READ_COMPATIBLE } else { WIA_VERSION_READ_COMPATIBLE };
        if self.version_compatible.get() > version {
            return Err(Error::UnsupportedCompression(format!(
                "WIA/RVZ version {:#X} requires a newer reader",
                self.version_compatible.get()
            )));
        }
        if self.version.get() < version_read_compat {
            return Err(Error::CorruptHeader(format!(
                "WIA/RVZ version {:#X} is no longer readable",
                self.version.get()
            )));
        }
        let bytes = self.as_bytes();
        verify_hash(&bytes[..bytes.len() - size_of::<HashBytes>()], &self.file_head_hash)
    }

    /// Whether this is an RVZ container.
    #[inline]
    pub fn is_rvz(&self) -> bool { self.magic == RVZ_MAGIC }
}

/// The on-disk compression type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None,
    /// (WIA only) Zero-suppressing segment encoding, see [`PurgeSegment`].
    Purge,
    /// BZIP2 compression.
    Bzip2,
    /// LZMA compression.
    Lzma,
    /// LZMA2 compression.
    Lzma2,
    /// (RVZ only) Zstandard compression.
    Zstandard,
}

impl From<CompressionType> for u32 {
    fn from(value: CompressionType) -> Self {
        match value {
            CompressionType::None => 0,
            CompressionType::Purge => 1,
            CompressionType::Bzip2 => 2,
            CompressionType::Lzma => 3,
            CompressionType::Lzma2 => 4,
            CompressionType::Zstandard => 5,
        }
    }
}

impl From<CompressionType> for U32 {
    fn from(value: CompressionType) -> Self { u32::from(value).into() }
}

impl TryFrom<u32> for CompressionType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Purge),
            2 => Ok(Self::Bzip2),
            3 => Ok(Self::Lzma),
            4 => Ok(Self::Lzma2),
            5 => Ok(Self::Zstandard),
            v => Err(Error::UnsupportedCompression(format!("Invalid compression type {}", v))),
        }
    }
}

impl CompressionType {
    /// Splits a [`Compression`] into the on-disk tag and informative level.
    pub fn from_compression(compression: Compression) -> (CompressionType, i32) {
        match compression {
            Compression::None => (CompressionType::None, 0),
            Compression::Purge => (CompressionType::Purge, 0),
            Compression::Bzip2(level) => (CompressionType::Bzip2, level as i32),
            Compression::Lzma(level) => (CompressionType::Lzma, level as i32),
            Compression::Lzma2(level) => (CompressionType::Lzma2, level as i32),
            Compression::Zstandard(level) => (CompressionType::Zstandard, level as i32),
        }
    }
}

/// Header-2: stored immediately after [`FileHeader`], 0xDC bytes.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct DiscInfo {
    /// The disc type. (1 = GameCube, 2 = Wii)
    pub disc_type: U32,
    /// The compression type tag.
    pub compression: U32,
    /// The compression level used by the compressor. Informative only;
    /// signed to support negative Zstandard levels (RVZ only).
    pub compression_level: I32,
    /// The size of the chunks that data is divided into.
    ///
    /// WIA: must be a multiple of 2 MiB. RVZ: sizes below 2 MiB must be a
    /// power of two no smaller than one sector (32 KiB).
    pub chunk_size: U32,
    /// The first 0x80 bytes of the disc image.
    pub disc_head: [u8; DISC_HEAD_SIZE],
    /// The number of [`PartitionEntry`] structs.
    pub num_partitions: U32,
    /// The size of one [`PartitionEntry`] struct. If this is smaller than
    /// the struct, the missing bytes are zero.
    pub partition_entry_size: U32,
    /// The offset in the file where the [`PartitionEntry`] structs are
    /// stored (uncompressed).
    pub partition_offset: U64,
    /// The SHA-1 hash of the [`PartitionEntry`] structs. The number of bytes
    /// to hash is `num_partitions * partition_entry_size`.
    pub partition_hash: HashBytes,
    /// The number of [`RawDataEntry`] structs.
    pub num_raw_data: U32,
    /// The offset in the file where the [`RawDataEntry`] structs are stored
    /// (compressed).
    pub raw_data_offset: U64,
    /// The total compressed size of the [`RawDataEntry`] structs.
    pub raw_data_size: U32,
    /// The number of group entries.
    pub num_groups: U32,
    /// The offset in the file where the group entries are stored
    /// (compressed).
    pub group_offset: U64,
    /// The total compressed size of the group entries.
    pub group_size: U32,
    /// The number of used bytes in the [compr_data](Self::compr_data) array.
    pub compr_data_len: u8,
    /// Compressor specific data.
    ///
    /// Empty for None, Purge, Bzip2, and Zstandard. For LZMA this is the
    /// 5-byte 7-Zip filter properties (lc/lp/pb byte plus little-endian
    /// dictionary size); for LZMA2 a single dictionary size byte.
    pub compr_data: [u8; 7],
}

static_assert!(size_of::<DiscInfo>() == 0xDC);

impl DiscInfo {
    /// Validates the disc type, compression tag, chunk size, and entry size.
    pub fn validate(&self, is_rvz: bool) -> Result<()> {
        DiscKind::try_from(self.disc_type.get())?;
        let compression = CompressionType::try_from(self.compression.get())?;
        if is_rvz && compression == CompressionType::Purge {
            return Err(Error::UnsupportedCompression(
                "Purge compression is not supported in RVZ".to_string(),
            ));
        }
        if !is_rvz && compression == CompressionType::Zstandard {
            return Err(Error::UnsupportedCompression(
                "Zstandard compression is not supported in WIA".to_string(),
            ));
        }
        let chunk_size = self.chunk_size.get();
        if is_rvz {
            if chunk_size < SECTOR_SIZE as u32
                || (chunk_size < 0x200000 && !chunk_size.is_power_of_two())
                || (chunk_size >= 0x200000 && chunk_size % 0x200000 != 0)
            {
                return Err(Error::CorruptHeader(format!(
                    "Invalid RVZ chunk size: {:#X}",
                    chunk_size
                )));
            }
        } else if chunk_size < 0x200000 || chunk_size % 0x200000 != 0 {
            return Err(Error::CorruptHeader(format!("Invalid WIA chunk size: {:#X}", chunk_size)));
        }
        if self.partition_entry_size.get() != size_of::<PartitionEntry>() as u32 {
            return Err(Error::CorruptHeader(format!(
                "WIA/RVZ partition entry size is {}, expected {}",
                self.partition_entry_size.get(),
                size_of::<PartitionEntry>()
            )));
        }
        if self.compr_data_len as usize > self.compr_data.len() {
            return Err(Error::CorruptHeader(format!(
                "Invalid compressor data length: {}",
                self.compr_data_len
            )));
        }
        Ok(())
    }

    /// The compression type tag. Must be validated first.
    pub fn compression(&self) -> CompressionType {
        CompressionType::try_from(self.compression.get()).unwrap()
    }

    /// The used portion of the compressor-specific data.
    #[inline]
    pub fn compr_data(&self) -> &[u8] { &self.compr_data[..self.compr_data_len as usize] }
}

/// One of the two regions a Wii partition is split into: a small management
/// region (boot to FST) and the bulk data region.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PartitionDataEntry {
    /// The sector on the disc at which this data starts.
    /// One sector is 32 KiB (or 31 KiB excluding hashes).
    pub first_sector: U32,
    /// The number of sectors on the disc covered by this struct.
    pub num_sectors: U32,
    /// The index of the first group entry that points to the data covered by
    /// this struct. The other group indices follow sequentially.
    pub group_index: U32,
    /// The number of groups used for this data.
    pub num_groups: U32,
}

static_assert!(size_of::<PartitionDataEntry>() == 0x10);

impl PartitionDataEntry {
    /// Start offset of the region on the disc.
    #[inline]
    pub fn start_offset(&self) -> u64 { self.first_sector.get() as u64 * SECTOR_SIZE as u64 }

    /// End offset of the region on the disc.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.start_offset() + self.num_sectors.get() as u64 * SECTOR_SIZE as u64
    }

    /// Whether the region contains the given disc sector.
    #[inline]
    pub fn contains_sector(&self, sector: u32) -> bool {
        let start = self.first_sector.get();
        sector >= start && sector < start + self.num_sectors.get()
    }
}

/// Tracks Wii partition data that on the actual disc is encrypted and
/// hashed. This does not include the unencrypted area at the beginning of
/// partitions (ticket, TMD, certificate chain, H3 table), so for a typical
/// game partition the first sector offset is 0x0F820000, not 0x0F800000.
///
/// Partition data is stored decrypted and with hashes removed: for each
/// 0x8000 bytes on the disc, 0x7C00 bytes are stored (prior to compression).
/// To reproduce the hashes, the reading program recalculates them as done
/// when creating a Wii disc image from scratch and then applies the hash
/// exceptions stored along with the data.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PartitionEntry {
    /// The title key for this partition (128-bit AES), usable directly for
    /// re-encrypting the partition data.
    pub partition_key: KeyBytes,
    /// To quote the wit source code: `segment 0 is small and defined for
    /// management data (boot .. fst). segment 1 takes the remaining data.`
    pub partition_data: [PartitionDataEntry; 2],
}

static_assert!(size_of::<PartitionEntry>() == 0x30);

/// Tracks disc data that is not stored as partition data. The data is stored
/// as is, other than compression being applied.
///
/// The first entry has `data_offset` set to 0x80 but its group actually
/// contains data from offset 0 (the first 0x80 bytes are read from
/// [`DiscInfo::disc_head`] instead). This is handled by rounding the offset
/// down to the previous sector boundary, adding the difference to the size.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct RawDataEntry {
    /// The offset on the disc at which this data starts.
    pub data_offset: U64,
    /// The number of bytes on the disc covered by this struct.
    pub data_size: U64,
    /// The index of the first group entry that points to the data covered by
    /// this struct. The other group indices follow sequentially.
    pub group_index: U32,
    /// The number of groups used for this data.
    pub num_groups: U32,
}

static_assert!(size_of::<RawDataEntry>() == 0x18);

impl RawDataEntry {
    /// Start offset, rounded down to a sector boundary.
    #[inline]
    pub fn start_offset(&self) -> u64 { self.data_offset.get() & !(SECTOR_SIZE as u64 - 1) }

    /// End offset. May be unaligned for the last entry.
    #[inline]
    pub fn end_offset(&self) -> u64 { self.data_offset.get() + self.data_size.get() }

    /// Size of the region including the rounded-down start.
    #[inline]
    pub fn size(&self) -> u64 { self.end_offset() - self.start_offset() }
}

/// WIA group entry, pointing to the compressed data of one chunk.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct WiaGroupEntry {
    /// The offset in the file where the compressed data is stored, divided
    /// by 4 (all chunks are 4-byte aligned).
    pub data_offset: U32,
    /// The size of the compressed data, including any exception lists. 0 is
    /// a special case meaning every byte of the decompressed data is 0x00
    /// and the exception lists (if any) contain 0 exceptions.
    pub data_size: U32,
}

static_assert!(size_of::<WiaGroupEntry>() == 0x8);

/// RVZ group entry. Compared to [`WiaGroupEntry`], the most significant bit
/// of the size word becomes a compression flag and a packed-size field is
/// added. WIA entries are normalized to this shape on load.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct GroupEntry {
    /// The offset in the file where the data is stored, divided by 4.
    pub data_offset: U32,
    /// The most significant bit is 1 if the data is compressed using the
    /// container's compression method. The lower 31 bits are the size of the
    /// stored data, including any exception lists; 0 means the decompressed
    /// and unpacked data is all zero and the exception lists are empty.
    pub data_size_and_flag: U32,
    /// The size after decompressing but before decoding the RVZ packing.
    /// If this is 0, RVZ packing is not used for this group.
    pub rvz_packed_size: U32,
}

static_assert!(size_of::<GroupEntry>() == 0xC);

impl GroupEntry {
    /// The stored data size in bytes.
    #[inline]
    pub fn data_size(&self) -> u32 { self.data_size_and_flag.get() & 0x7FFFFFFF }

    /// Whether the stored data is compressed with the container's codec.
    #[inline]
    pub fn is_compressed(&self) -> bool { self.data_size_and_flag.get() & 0x80000000 != 0 }

    /// Whether the stored data is RVZ packed.
    #[inline]
    pub fn is_packed(&self) -> bool { self.rvz_packed_size.get() > 0 }

    /// The file offset of the stored data.
    #[inline]
    pub fn file_offset(&self) -> u64 { self.data_offset.get() as u64 * 4 }
}

impl From<&WiaGroupEntry> for GroupEntry {
    fn from(value: &WiaGroupEntry) -> Self {
        Self {
            data_offset: value.data_offset,
            data_size_and_flag: U32::new(value.data_size.get() | 0x80000000),
            rvz_packed_size: U32::new(0),
        }
    }
}

impl From<&GroupEntry> for WiaGroupEntry {
    fn from(value: &GroupEntry) -> Self {
        Self { data_offset: value.data_offset, data_size: value.data_size().into() }
    }
}

/// A 20-byte difference between recalculated hash data and the original
/// disc's hash data.
///
/// When recalculating hashes for a group with a size which is not evenly
/// divisible by 2 MiB (with the size of the hashes included), the missing
/// bytes are treated as zeroes for the purpose of hashing.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct HashException {
    /// The offset among the hashes, in bytes from the start of the group's
    /// hash area. Offsets 0x0000-0x0400 map to the first sector's hash
    /// block, 0x0400-0x0800 to the second sector's, and so on. Offsets start
    /// over at 0 for each new exception list.
    pub offset: U16,
    /// The hash that the recalculated hash at the given offset needs to be
    /// replaced with. The replacement happens after calculating all hashes
    /// for the current 2 MiB of data but before encrypting the hashes.
    pub hash: HashBytes,
}

static_assert!(size_of::<HashException>() == 0x16);

/// One parsed exception list: the overrides for a single Wii hash group.
///
/// Each partition-data chunk is preceded by `max(1, chunk_size / 0x200000)`
/// exception lists, one for each 2 MiB of data. For chunk sizes smaller than
/// 2 MiB (RVZ), a chunk carries a single list whose offset 0 refers to the
/// first hash of that chunk rather than of the full 2 MiB.
///
/// For the compression methods None and Purge the lists are stored
/// uncompressed before the codec payload, padded so that the payload starts
/// at a 4-byte boundary. For the other methods they are compressed along
/// with the payload and no padding is inserted.
pub type ExceptionList = Box<[HashException]>;

/// A Purge-codec segment header, marking a run of stored bytes inside an
/// otherwise zero-filled chunk. `size` payload bytes follow the header. The
/// segment stream is terminated by a SHA-1 hash of the preceding exception
/// lists (if any) and the emitted segments.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PurgeSegment {
    /// Offset of the run within the decompressed chunk.
    pub offset: U32,
    /// Length of the run in bytes.
    pub size: U32,
}

static_assert!(size_of::<PurgeSegment>() == 0x8);

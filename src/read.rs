//! The reader: container validation, the offset index, and the blob
//! surface.

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom},
    mem::size_of,
    path::{Path, PathBuf},
    sync::Arc,
};

use dyn_clone::DynClone;
use tracing::{debug, instrument};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    chunk::Chunk,
    common::{Compression, Format},
    format::{
        verify_hash, CompressionType, DiscInfo, FileHeader, GroupEntry, HashException,
        PartitionEntry, RawDataEntry, WiaGroupEntry, DISC_HEAD_SIZE,
    },
    util::{
        align_up_32, array_ref, array_ref_mut,
        compress::DecompressionKind,
        read::{read_arc_slice, read_from, read_vec},
    },
    wii::{
        apply_hash_exceptions, compute_group_hashes, encrypt_sector, HashBlock, BLOCKS_PER_GROUP,
        GROUP_DATA_SIZE, GROUP_SIZE, SECTOR_DATA_SIZE, SECTOR_SIZE,
    },
    Error, ErrorContext, Result, ResultContext,
};

/// Required trait bounds for container input streams.
pub trait DiscStream: Read + Seek + DynClone + Send + Sync {}

impl<T> DiscStream for T where T: Read + Seek + DynClone + Send + Sync + ?Sized {}

dyn_clone::clone_trait_object!(DiscStream);

/// The format a [`BlobReader`] provides data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    /// Plain (uncompressed) disc image.
    Iso,
    /// WIA container.
    Wia,
    /// RVZ container.
    Rvz,
}

/// A random-access view of a logical disc image.
///
/// [`WiaRvzReader`] implements this for its containers; the conversion
/// pipeline consumes any implementation as its source.
pub trait BlobReader: DynClone + Send {
    /// The underlying format.
    fn blob_type(&self) -> BlobType;

    /// Size of the stored (possibly compressed) file.
    fn raw_size(&self) -> u64;

    /// Size of the logical disc image.
    fn data_size(&self) -> u64;

    /// Whether [`data_size`](Self::data_size) is exact rather than an
    /// estimate.
    fn is_data_size_accurate(&self) -> bool { true }

    /// The granularity of efficient reads.
    fn block_size(&self) -> u32;

    /// Whether random access within a block is cheap.
    fn has_fast_random_access_in_block(&self) -> bool;

    /// Fills `out` with logical image bytes starting at `offset`.
    fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Whether the image contains Wii partitions whose decrypted data can be
    /// read directly.
    fn supports_read_wii_decrypted(&self) -> bool { false }

    /// Reads from the decrypted payload stream of the Wii partition whose
    /// data begins at `partition_data_offset`.
    fn read_wii_decrypted(
        &mut self,
        _offset: u64,
        _out: &mut [u8],
        _partition_data_offset: u64,
    ) -> Result<()> {
        Err(Error::Io(
            "Decrypted partition reads are not supported by this format".to_string(),
            io::Error::from(io::ErrorKind::Unsupported),
        ))
    }
}

dyn_clone::clone_trait_object!(BlobReader);

/// A cloneable stream over a single file. Clones reopen the file lazily so
/// each holds its own cursor.
pub struct FileStream {
    path: PathBuf,
    file: Option<File>,
    pos: u64,
}

impl FileStream {
    /// Opens the file once to surface errors early.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { path, file: Some(file), pos: 0 })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(self.pos))?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }
}

impl Clone for FileStream {
    fn clone(&self) -> Self { Self { path: self.path.clone(), file: None, pos: self.pos } }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.file()?.read(buf)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.file()?.seek(pos)?;
        Ok(self.pos)
    }
}

/// A pass-through [`BlobReader`] over a plain disc image.
#[derive(Clone)]
pub struct IsoReader {
    stream: Box<dyn DiscStream>,
    size: u64,
}

impl IsoReader {
    /// Wraps a stream, using its length as the image size.
    pub fn new(mut stream: Box<dyn DiscStream>) -> Result<IsoReader> {
        let size = stream.seek(SeekFrom::End(0)).context("Determining stream length")?;
        Ok(IsoReader { stream, size })
    }
}

/// Opens a plain disc image from a file path.
pub fn open_iso<P: AsRef<Path>>(path: P) -> Result<Box<dyn BlobReader>> {
    let stream = FileStream::new(path.as_ref())
        .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
    Ok(Box::new(IsoReader::new(Box::new(stream))?))
}

impl BlobReader for IsoReader {
    fn blob_type(&self) -> BlobType { BlobType::Iso }

    fn raw_size(&self) -> u64 { self.size }

    fn data_size(&self) -> u64 { self.size }

    fn block_size(&self) -> u32 { SECTOR_SIZE as u32 }

    fn has_fast_random_access_in_block(&self) -> bool { true }

    fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        if offset + out.len() as u64 > self.size {
            // Reads past the end of the file yield zeroes, so callers can
            // round image sizes up to a block boundary.
            let valid = self.size.saturating_sub(offset).min(out.len() as u64) as usize;
            let (head, tail) = out.split_at_mut(valid);
            tail.fill(0);
            if head.is_empty() {
                return Ok(());
            }
            return self.read(offset, head);
        }
        if out.is_empty() {
            return Ok(());
        }
        self.stream
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.stream.read_exact(out))
            .with_context(|| format!("Reading {:#X} bytes at {:#X}", out.len(), offset))
    }
}

/// In-memory index entry: which partition or raw-data region covers a range
/// of logical image offsets.
#[derive(Debug, Clone, Copy)]
struct DataEntry {
    is_partition: bool,
    index: usize,
    #[allow(dead_code)] // identifies the sub-entry; reads span the partition
    partition_data_index: usize,
    start: u64,
    end: u64,
}

/// A reader for WIA and RVZ containers.
pub struct WiaRvzReader {
    stream: Box<dyn DiscStream>,
    header: FileHeader,
    disc: DiscInfo,
    partitions: Arc<[PartitionEntry]>,
    raw_data: Arc<[RawDataEntry]>,
    groups: Arc<[GroupEntry]>,
    data_entries: BTreeMap<u64, DataEntry>,
    decompression: DecompressionKind,
    /// Most recently used chunk, keyed by file offset and pack data offset.
    cached_chunk: Option<((u64, u64), Chunk)>,
    /// Most recently reconstructed (re-hashed and re-encrypted) Wii group
    /// for the plain read path, keyed by its disc offset.
    cached_wii_group: Option<(u64, Box<[u8]>)>,
}

impl Clone for WiaRvzReader {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            header: self.header.clone(),
            disc: self.disc.clone(),
            partitions: self.partitions.clone(),
            raw_data: self.raw_data.clone(),
            groups: self.groups.clone(),
            data_entries: self.data_entries.clone(),
            decompression: self.decompression.clone(),
            cached_chunk: None,
            cached_wii_group: None,
        }
    }
}

impl WiaRvzReader {
    /// Opens a container from a file path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WiaRvzReader> {
        let stream = FileStream::new(path.as_ref())
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
        Self::new(Box::new(stream))
    }

    /// Opens a container from a stream, validating headers and loading the
    /// partition, raw-data, and group tables.
    pub fn new(mut stream: Box<dyn DiscStream>) -> Result<WiaRvzReader> {
        // Load & verify header-1
        stream.seek(SeekFrom::Start(0)).context("Seeking to start")?;
        let header: FileHeader = read_from(stream.as_mut()).context("Reading file header")?;
        header.validate()?;
        let is_rvz = header.is_rvz();
        debug!("File header: {:?}", header);

        // Load & verify header-2
        let mut disc_buf: Vec<u8> = read_vec(stream.as_mut(), header.disc_size.get() as usize)
            .context("Reading disc header")?;
        verify_hash(&disc_buf, &header.disc_hash)?;
        disc_buf.resize(size_of::<DiscInfo>(), 0);
        let disc = DiscInfo::read_from_bytes(disc_buf.as_slice()).unwrap();
        disc.validate(is_rvz)?;
        debug!("Disc header: {:?}", disc);

        // Load & verify partition entries (stored plain)
        stream
            .seek(SeekFrom::Start(disc.partition_offset.get()))
            .context("Seeking to partition entries")?;
        let partitions: Arc<[PartitionEntry]> =
            read_arc_slice(stream.as_mut(), disc.num_partitions.get() as usize)
                .context("Reading partition entries")?;
        verify_hash(partitions.as_ref().as_bytes(), &disc.partition_hash)?;
        for (idx, partition) in partitions.iter().enumerate() {
            let [pd0, pd1] = &partition.partition_data;
            if pd1.num_sectors.get() > 0
                && pd1.first_sector.get() < pd0.first_sector.get() + pd0.num_sectors.get()
            {
                return Err(Error::CorruptHeader(format!(
                    "Partition {} data ranges out of order",
                    idx
                )));
            }
        }

        let decompression = DecompressionKind::from_disc_info(&disc)?;

        // The raw-data and group tables are stored as a single chunk in the
        // container's codec.
        let raw_data: Arc<[RawDataEntry]> = {
            let bytes = read_table_chunk(
                stream.as_mut(),
                &decompression,
                disc.raw_data_offset.get(),
                disc.raw_data_size.get(),
                disc.num_raw_data.get() as usize * size_of::<RawDataEntry>(),
            )
            .context("Reading raw data entries")?;
            parse_table(&bytes)?
        };
        for (idx, rd) in raw_data.iter().enumerate() {
            let is_last = idx == raw_data.len() - 1;
            if (rd.start_offset() % SECTOR_SIZE as u64) != 0
                // Allow raw data end to be unaligned if it's the last
                || (!is_last && (rd.end_offset() % SECTOR_SIZE as u64) != 0)
            {
                return Err(Error::CorruptHeader(format!(
                    "Raw data {} not aligned to sector: {:#X}..{:#X}",
                    idx,
                    rd.start_offset(),
                    rd.end_offset()
                )));
            }
        }
        debug!("Num raw data: {}", raw_data.len());

        let groups: Arc<[GroupEntry]> = {
            let entry_size =
                if is_rvz { size_of::<GroupEntry>() } else { size_of::<WiaGroupEntry>() };
            let bytes = read_table_chunk(
                stream.as_mut(),
                &decompression,
                disc.group_offset.get(),
                disc.group_size.get(),
                disc.num_groups.get() as usize * entry_size,
            )
            .context("Reading group entries")?;
            if is_rvz {
                parse_table(&bytes)?
            } else {
                let wia_groups: Arc<[WiaGroupEntry]> = parse_table(&bytes)?;
                wia_groups.iter().map(GroupEntry::from).collect()
            }
        };
        debug!("Num groups: {}", groups.len());

        let data_entries = build_data_entries(&partitions, &raw_data, is_rvz)?;

        Ok(WiaRvzReader {
            stream,
            header,
            disc,
            partitions,
            raw_data,
            groups,
            data_entries,
            decompression,
            cached_chunk: None,
            cached_wii_group: None,
        })
    }

    /// The container format.
    #[inline]
    pub fn format(&self) -> Format {
        if self.header.is_rvz() {
            Format::Rvz
        } else {
            Format::Wia
        }
    }

    /// The container's compression algorithm with its informative level.
    pub fn compression(&self) -> Compression {
        let level = self.disc.compression_level.get();
        match self.disc.compression() {
            CompressionType::None => Compression::None,
            CompressionType::Purge => Compression::Purge,
            CompressionType::Bzip2 => Compression::Bzip2(level as u8),
            CompressionType::Lzma => Compression::Lzma(level as u8),
            CompressionType::Lzma2 => Compression::Lzma2(level as u8),
            CompressionType::Zstandard => Compression::Zstandard(level as i8),
        }
    }

    /// The partition entries.
    #[inline]
    pub fn partitions(&self) -> &[PartitionEntry] { &self.partitions }

    #[cfg(test)]
    pub(crate) fn group_entries(&self) -> &[GroupEntry] { &self.groups }

    /// Bytes of decrypted payload per stored chunk of partition data.
    fn partition_chunk_size(&self) -> u64 {
        self.disc.chunk_size.get() as u64 / SECTOR_SIZE as u64 * SECTOR_DATA_SIZE as u64
    }

    /// Exception lists preceding each partition-data chunk: one per 2 MiB of
    /// chunk, at least one.
    fn exception_lists_per_chunk(&self) -> u32 {
        (self.disc.chunk_size.get() / GROUP_SIZE as u32).max(1)
    }

    fn find_entry(&self, offset: u64) -> Result<DataEntry> {
        self.data_entries
            .range(..=offset)
            .next_back()
            .map(|(_, e)| *e)
            .filter(|e| offset < e.end)
            .ok_or_else(|| {
                Error::CorruptChunk(format!("No data entry covers offset {:#X}", offset))
            })
    }

    /// Fetches (or reuses) the decode state for one group and reads a slice
    /// of its payload. The single-slot chunk cache is updated on success and
    /// invalidated on failure.
    fn read_group_slice(
        &mut self,
        group_index: u32,
        chunk_payload_size: u32,
        exception_lists: u32,
        chunk_data_offset: u64,
        inner_offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let Some(group) = self.groups.get(group_index as usize).cloned() else {
            return Err(Error::CorruptChunk(format!("Missing group entry {}", group_index)));
        };
        if group.data_size() == 0 {
            // Every byte of the decompressed data is zero.
            out.fill(0);
            return Ok(());
        }
        let mut chunk =
            self.obtain_chunk(&group, chunk_payload_size, exception_lists, chunk_data_offset)?;
        let result = chunk.read(self.stream.as_mut(), inner_offset, out);
        match result {
            Ok(()) => {
                self.cached_chunk = Some(((group.file_offset(), chunk_data_offset), chunk));
                Ok(())
            }
            Err(e) => Err(chunk_error(e, group_index)),
        }
    }

    /// Returns one exception list of a partition group, with entry offsets
    /// shifted by `additional_offset`.
    fn read_group_exceptions(
        &mut self,
        group_index: u32,
        chunk_payload_size: u32,
        exception_lists: u32,
        chunk_data_offset: u64,
        list_index: usize,
        additional_offset: u16,
    ) -> Result<Vec<HashException>> {
        let Some(group) = self.groups.get(group_index as usize).cloned() else {
            return Err(Error::CorruptChunk(format!("Missing group entry {}", group_index)));
        };
        if group.data_size() == 0 {
            // Zero groups have no stored exception lists.
            return Ok(Vec::new());
        }
        let mut chunk =
            self.obtain_chunk(&group, chunk_payload_size, exception_lists, chunk_data_offset)?;
        // A zero-length read decodes just far enough to parse the lists.
        let result = chunk
            .read(self.stream.as_mut(), 0, &mut [])
            .and_then(|()| chunk.hash_exceptions(list_index, additional_offset));
        match result {
            Ok(exceptions) => {
                self.cached_chunk = Some(((group.file_offset(), chunk_data_offset), chunk));
                Ok(exceptions)
            }
            Err(e) => Err(chunk_error(e, group_index)),
        }
    }

    /// Builds or reuses the cached chunk for a group entry.
    fn obtain_chunk(
        &mut self,
        group: &GroupEntry,
        chunk_payload_size: u32,
        exception_lists: u32,
        chunk_data_offset: u64,
    ) -> Result<Chunk> {
        let key = (group.file_offset(), chunk_data_offset);
        if let Some((cached_key, chunk)) = self.cached_chunk.take() {
            if cached_key == key && chunk.decompressed_size() == chunk_payload_size as usize {
                return Ok(chunk);
            }
        }
        let none_like = matches!(
            self.disc.compression(),
            CompressionType::None | CompressionType::Purge
        );
        let mut compressed = group.is_compressed();
        if compressed && !self.header.is_rvz() && !none_like {
            // WIA has no uncompressed-group flag. A group whose stored size
            // equals the payload size plus the empty-exception-list overhead
            // is taken as stored plain.
            let overhead = if exception_lists > 0 {
                align_up_32(exception_lists * size_of::<u16>() as u32, 4)
            } else {
                0
            };
            if group.data_size() == chunk_payload_size + overhead {
                compressed = false;
            }
        }
        let kind =
            if compressed { self.decompression.clone() } else { DecompressionKind::None };
        let compressed_exception_lists = compressed && !none_like;
        Chunk::new(
            &kind,
            group.file_offset(),
            group.data_size(),
            chunk_payload_size,
            exception_lists,
            compressed_exception_lists,
            group.rvz_packed_size.get(),
            chunk_data_offset,
            // Junk data regenerates from the disc identity and position.
            *array_ref![self.disc.disc_head, 0, 4],
            self.disc.disc_head[6],
        )
        .map_err(|e| Error::CorruptChunk(e.to_string()))
    }

    /// Reads from the sequence of groups covering one region of a data
    /// stream (a raw-data range, or one partition data range in payload
    /// coordinates).
    #[allow(clippy::too_many_arguments)]
    fn read_from_groups(
        &mut self,
        mut offset: u64,
        mut out: &mut [u8],
        chunk_size: u64,
        region_start: u64,
        region_end: u64,
        group_index: u32,
        num_groups: u32,
        exception_lists: u32,
    ) -> Result<()> {
        while !out.is_empty() {
            let rel = offset - region_start;
            let group_in_region = rel / chunk_size;
            if group_in_region >= num_groups as u64 {
                return Err(Error::CorruptChunk(format!(
                    "Group {} out of range for data entry",
                    group_in_region
                )));
            }
            let chunk_start = region_start + group_in_region * chunk_size;
            let chunk_payload = chunk_size.min(region_end - chunk_start) as u32;
            let inner = (offset - chunk_start) as usize;
            let len = out.len().min(chunk_payload as usize - inner);
            let (head, rest) = out.split_at_mut(len);
            self.read_group_slice(
                group_index + group_in_region as u32,
                chunk_payload,
                exception_lists,
                chunk_start,
                inner,
                head,
            )?;
            offset += len as u64;
            out = rest;
        }
        Ok(())
    }

    fn read_raw(&mut self, entry: &DataEntry, offset: u64, out: &mut [u8]) -> Result<()> {
        let rd = &self.raw_data[entry.index];
        let (region_start, region_end) = (rd.start_offset(), rd.end_offset());
        let (group_index, num_groups) = (rd.group_index.get(), rd.num_groups.get());
        let chunk_size = self.disc.chunk_size.get() as u64;
        self.read_from_groups(
            offset,
            out,
            chunk_size,
            region_start,
            region_end,
            group_index,
            num_groups,
            0,
        )?;
        // The first 0x80 bytes are read from the disc-head snapshot instead.
        if offset < DISC_HEAD_SIZE as u64 {
            let head_len = (DISC_HEAD_SIZE as u64 - offset).min(out.len() as u64) as usize;
            out[..head_len].copy_from_slice(
                &self.disc.disc_head[offset as usize..offset as usize + head_len],
            );
        }
        Ok(())
    }

    /// Total decrypted payload size of a partition, across both of its data
    /// ranges.
    fn partition_payload_end(partition: &PartitionEntry) -> u64 {
        let pd0 = &partition.partition_data[0];
        let pd1 = &partition.partition_data[1];
        let total_sectors = if pd1.num_sectors.get() > 0 {
            pd1.first_sector.get() + pd1.num_sectors.get() - pd0.first_sector.get()
        } else {
            pd0.num_sectors.get()
        };
        total_sectors as u64 * SECTOR_DATA_SIZE as u64
    }

    fn read_decrypted_inner(
        &mut self,
        partition_index: usize,
        mut offset: u64,
        mut out: &mut [u8],
    ) -> Result<()> {
        let partition = self.partitions[partition_index].clone();
        let pd0_first = partition.partition_data[0].first_sector.get();
        let chunk_size = self.partition_chunk_size();
        let exception_lists = self.exception_lists_per_chunk();
        while !out.is_empty() {
            let Some(pd) = partition.partition_data.iter().find(|pd| {
                let start =
                    (pd.first_sector.get() - pd0_first) as u64 * SECTOR_DATA_SIZE as u64;
                let end = start + pd.num_sectors.get() as u64 * SECTOR_DATA_SIZE as u64;
                pd.num_sectors.get() > 0 && offset >= start && offset < end
            }) else {
                return Err(Error::CorruptChunk(format!(
                    "Partition data offset {:#X} out of range",
                    offset
                )));
            };
            let region_start =
                (pd.first_sector.get() - pd0_first) as u64 * SECTOR_DATA_SIZE as u64;
            let region_end =
                region_start + pd.num_sectors.get() as u64 * SECTOR_DATA_SIZE as u64;
            let len = out.len().min((region_end - offset) as usize);
            let (head, rest) = out.split_at_mut(len);
            self.read_from_groups(
                offset,
                head,
                chunk_size,
                region_start,
                region_end,
                pd.group_index.get(),
                pd.num_groups.get(),
                exception_lists,
            )?;
            offset += len as u64;
            out = rest;
        }
        Ok(())
    }

    /// Collects the hash exceptions for one Wii group of a partition, in
    /// group-relative offsets.
    fn wii_group_exceptions(
        &mut self,
        partition_index: usize,
        wii_group: u64,
        payload_end: u64,
    ) -> Result<Vec<HashException>> {
        let partition = self.partitions[partition_index].clone();
        let pd0_first = partition.partition_data[0].first_sector.get();
        let chunk_size = self.partition_chunk_size();
        let exception_lists = self.exception_lists_per_chunk();

        let group_start = wii_group * GROUP_DATA_SIZE as u64;
        let group_len = (payload_end - group_start).min(GROUP_DATA_SIZE as u64);
        let mut exceptions = Vec::new();
        let mut offset = group_start;
        while offset < group_start + group_len {
            let Some(pd) = partition.partition_data.iter().find(|pd| {
                let start =
                    (pd.first_sector.get() - pd0_first) as u64 * SECTOR_DATA_SIZE as u64;
                let end = start + pd.num_sectors.get() as u64 * SECTOR_DATA_SIZE as u64;
                pd.num_sectors.get() > 0 && offset >= start && offset < end
            }) else {
                return Err(Error::CorruptChunk(format!(
                    "Partition data offset {:#X} out of range",
                    offset
                )));
            };
            let region_start =
                (pd.first_sector.get() - pd0_first) as u64 * SECTOR_DATA_SIZE as u64;
            let region_end =
                region_start + pd.num_sectors.get() as u64 * SECTOR_DATA_SIZE as u64;
            let group_in_region = (offset - region_start) / chunk_size;
            let chunk_start = region_start + group_in_region * chunk_size;
            let chunk_payload = chunk_size.min(region_end - chunk_start) as u32;
            let (list_index, additional_offset) = if chunk_size >= GROUP_DATA_SIZE as u64 {
                // Each list covers one full Wii group of the chunk.
                (((offset - chunk_start) / GROUP_DATA_SIZE as u64) as usize, 0u16)
            } else {
                // One chunk-relative list per chunk; shift its offsets to the
                // group's hash area.
                let chunk_in_group = (offset - group_start) / chunk_size;
                (0, (chunk_in_group * chunk_size / SECTOR_DATA_SIZE as u64 * 0x400) as u16)
            };
            let entries = self.read_group_exceptions(
                pd.group_index.get() + group_in_region as u32,
                chunk_payload,
                exception_lists,
                chunk_start,
                list_index,
                additional_offset,
            )?;
            exceptions.extend(entries);
            // Advance by one list's coverage.
            offset = (chunk_start + (list_index as u64 + 1) * chunk_size.min(GROUP_DATA_SIZE as u64))
                .min(group_start + group_len);
        }
        Ok(exceptions)
    }

    /// Reconstructs one Wii group as it appeared on the original disc:
    /// decode the payload, recompute the hash tree, apply the stored hash
    /// exceptions, and re-encrypt.
    #[instrument(name = "WiaRvzReader::reconstruct_wii_group", skip_all)]
    fn reconstruct_wii_group(
        &mut self,
        partition_index: usize,
        wii_group: u64,
    ) -> Result<Box<[u8]>> {
        let partition = self.partitions[partition_index].clone();
        let payload_end = Self::partition_payload_end(&partition);
        let group_start = wii_group * GROUP_DATA_SIZE as u64;
        let payload_len = (payload_end - group_start).min(GROUP_DATA_SIZE as u64) as usize;

        let mut data = <[u8]>::new_box_zeroed_with_elems(GROUP_DATA_SIZE)?;
        self.read_decrypted_inner(partition_index, group_start, &mut data[..payload_len])?;
        let exceptions = self.wii_group_exceptions(partition_index, wii_group, payload_end)?;

        let mut hash_blocks = <[HashBlock; BLOCKS_PER_GROUP]>::new_box_zeroed()?;
        compute_group_hashes(&data, &mut hash_blocks);
        apply_hash_exceptions(&exceptions, &mut hash_blocks)
            .map_err(|e| Error::CorruptChunk(e.to_string()))?;

        let sectors = payload_len.div_ceil(SECTOR_DATA_SIZE);
        let mut encrypted = <[u8]>::new_box_zeroed_with_elems(sectors * SECTOR_SIZE)?;
        for sector in 0..sectors {
            encrypt_sector(
                &hash_blocks[sector],
                array_ref![data, sector * SECTOR_DATA_SIZE, SECTOR_DATA_SIZE],
                &partition.partition_key,
                array_ref_mut![encrypted, sector * SECTOR_SIZE, SECTOR_SIZE],
            );
        }
        Ok(encrypted)
    }

    fn read_partition(&mut self, entry: &DataEntry, offset: u64, mut out: &mut [u8]) -> Result<()> {
        let partition = &self.partitions[entry.index];
        let pd0_first = partition.partition_data[0].first_sector.get();
        let mut offset = offset;
        while !out.is_empty() {
            let part_sector = (offset / SECTOR_SIZE as u64) as u32 - pd0_first;
            let wii_group = (part_sector / BLOCKS_PER_GROUP as u32) as u64;
            let group_disc_start = (pd0_first as u64
                + wii_group * BLOCKS_PER_GROUP as u64)
                * SECTOR_SIZE as u64;
            if self.cached_wii_group.as_ref().map(|(o, _)| *o) != Some(group_disc_start) {
                let encrypted = self.reconstruct_wii_group(entry.index, wii_group)?;
                self.cached_wii_group = Some((group_disc_start, encrypted));
            }
            let (_, encrypted) = self.cached_wii_group.as_ref().unwrap();
            let inner = (offset - group_disc_start) as usize;
            let len = out.len().min(encrypted.len() - inner);
            let (head, rest) = out.split_at_mut(len);
            head.copy_from_slice(&encrypted[inner..inner + len]);
            offset += len as u64;
            out = rest;
        }
        Ok(())
    }
}

impl BlobReader for WiaRvzReader {
    fn blob_type(&self) -> BlobType {
        if self.header.is_rvz() {
            BlobType::Rvz
        } else {
            BlobType::Wia
        }
    }

    fn raw_size(&self) -> u64 { self.header.file_size.get() }

    fn data_size(&self) -> u64 { self.header.iso_file_size.get() }

    fn block_size(&self) -> u32 { self.disc.chunk_size.get() }

    fn has_fast_random_access_in_block(&self) -> bool { false }

    #[instrument(name = "WiaRvzReader::read", skip_all)]
    fn read(&mut self, mut offset: u64, mut out: &mut [u8]) -> Result<()> {
        if offset + out.len() as u64 > self.data_size() {
            return Err(Error::Io(
                format!(
                    "Read {:#X}..{:#X} beyond image size {:#X}",
                    offset,
                    offset + out.len() as u64,
                    self.data_size()
                ),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        while !out.is_empty() {
            let entry = self.find_entry(offset)?;
            let len = out.len().min((entry.end - offset) as usize);
            let (head, rest) = out.split_at_mut(len);
            let result = if entry.is_partition {
                self.read_partition(&entry, offset, head)
            } else {
                self.read_raw(&entry, offset, head)
            };
            if let Err(e) = result {
                // A failed read leaves no trustworthy decode state behind.
                self.cached_chunk = None;
                self.cached_wii_group = None;
                return Err(e);
            }
            offset += len as u64;
            out = rest;
        }
        Ok(())
    }

    fn supports_read_wii_decrypted(&self) -> bool { !self.partitions.is_empty() }

    #[instrument(name = "WiaRvzReader::read_wii_decrypted", skip_all)]
    fn read_wii_decrypted(
        &mut self,
        offset: u64,
        out: &mut [u8],
        partition_data_offset: u64,
    ) -> Result<()> {
        let Some(index) = self.partitions.iter().position(|p| {
            p.partition_data[0].start_offset() == partition_data_offset
        }) else {
            return Err(Error::Io(
                format!("No partition data at offset {:#X}", partition_data_offset),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        };
        let result = self.read_decrypted_inner(index, offset, out);
        if result.is_err() {
            self.cached_chunk = None;
        }
        result
    }
}

/// Maps a chunk-engine failure to the public taxonomy: decode faults poison
/// the chunk and surface as corruption, anything else is I/O.
fn chunk_error(e: io::Error, group_index: u32) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::CorruptChunk(format!("Group {}: {}", group_index, e))
        }
        _ => e.context(format!("Reading group {}", group_index)),
    }
}

/// Reads and decodes one of the tables stored as a single container-codec
/// chunk.
fn read_table_chunk(
    stream: &mut dyn DiscStream,
    kind: &DecompressionKind,
    offset: u64,
    compressed_size: u32,
    decompressed_size: usize,
) -> io::Result<Vec<u8>> {
    let mut chunk = Chunk::new(
        kind,
        offset,
        compressed_size,
        decompressed_size as u32,
        0,
        false,
        0,
        0,
        [0u8; 4],
        0,
    )?;
    chunk.read_all(stream)
}

fn parse_table<T>(bytes: &[u8]) -> Result<Arc<[T]>>
where T: FromBytes + IntoBytes + Clone {
    let mut table = <[T]>::new_box_zeroed_with_elems(bytes.len() / size_of::<T>())?;
    table.as_mut_bytes().copy_from_slice(bytes);
    Ok(Arc::from(table))
}

/// Builds the offset index over partition and raw-data entries, checking
/// for range overlap. Two non-empty ranges may never intersect. A
/// zero-sized raw-data entry sharing an offset with another range is a hard
/// error for RVZ; WIA tolerates it, because its writers emit such entries
/// as anchors at partition boundaries.
fn build_data_entries(
    partitions: &[PartitionEntry],
    raw_data: &[RawDataEntry],
    is_rvz: bool,
) -> Result<BTreeMap<u64, DataEntry>> {
    let mut entries = Vec::new();
    for (index, partition) in partitions.iter().enumerate() {
        for (pdi, pd) in partition.partition_data.iter().enumerate() {
            // An empty second data range is normal structure, not an anchor.
            if pd.num_sectors.get() == 0 {
                continue;
            }
            entries.push(DataEntry {
                is_partition: true,
                index,
                partition_data_index: pdi,
                start: pd.start_offset(),
                end: pd.end_offset(),
            });
        }
    }
    for (index, rd) in raw_data.iter().enumerate() {
        entries.push(DataEntry {
            is_partition: false,
            index,
            partition_data_index: 0,
            start: rd.start_offset(),
            end: rd.end_offset(),
        });
    }
    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            let collides = if a.start == a.end && b.start == b.end {
                false
            } else if a.start == a.end {
                // Zero-sized anchor against a range
                b.start <= a.start && a.start < b.end
            } else if b.start == b.end {
                a.start <= b.start && b.start < a.end
            } else {
                a.start < b.end && b.start < a.end
            };
            if !collides {
                continue;
            }
            if is_rvz || (a.start != a.end && b.start != b.end) {
                return Err(Error::DataOverlap(format!(
                    "{:#X}..{:#X} overlaps {:#X}..{:#X}",
                    a.start, a.end, b.start, b.end
                )));
            }
            debug!(
                "Tolerating zero-sized raw data anchor within {:#X}..{:#X}",
                a.start.max(b.start),
                a.end.max(b.end)
            );
        }
    }
    Ok(entries.into_iter().filter(|e| e.start < e.end).map(|e| (e.start, e)).collect())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        format::{PartitionDataEntry, WIA_MAGIC},
        util::{
            compress::{compress_bound, Compressor},
            digest::sha1_hash,
        },
    };

    /// Hand-builds a minimal single-raw-region WIA container around the
    /// given stored group bytes. The group entry records `data_size` and
    /// points at wherever the payload lands after the tables.
    fn build_wia(
        compression: Compression,
        compr_data_bytes: &[u8],
        image_size: u64,
        data_size: u32,
        group_payload: &[u8],
        patch_header: impl FnOnce(&mut FileHeader),
    ) -> Vec<u8> {
        let raw_data = [RawDataEntry {
            data_offset: (DISC_HEAD_SIZE as u64).into(),
            data_size: (image_size - DISC_HEAD_SIZE as u64).into(),
            group_index: 0.into(),
            num_groups: 1.into(),
        }];
        let mut compressor =
            Compressor::new(compression, compress_bound(compression, size_of::<RawDataEntry>()));
        assert!(compressor.compress(raw_data.as_bytes()).unwrap());
        let compressed_raw_data = compressor.buffer.clone();

        // The group table depends on where the payload starts, which depends
        // on the compressed group table size; compressing a placeholder
        // first makes the size stable.
        let header_size = size_of::<FileHeader>() as u64 + size_of::<DiscInfo>() as u64;
        let raw_data_offset = header_size;
        let group_offset = raw_data_offset + compressed_raw_data.len() as u64;
        let mut data_start = 0u64;
        let mut compressed_groups = Vec::new();
        for _ in 0..4 {
            let wia_group = WiaGroupEntry {
                data_offset: ((data_start / 4) as u32).into(),
                data_size: data_size.into(),
            };
            assert!(compressor.compress(wia_group.as_bytes()).unwrap());
            compressed_groups = compressor.buffer.clone();
            let next = crate::util::align_up_64(group_offset + compressed_groups.len() as u64, 4);
            if next == data_start {
                break;
            }
            data_start = next;
        }
        assert_eq!(
            crate::util::align_up_64(group_offset + compressed_groups.len() as u64, 4),
            data_start
        );

        let (compression_type, level) = CompressionType::from_compression(compression);
        let mut disc = DiscInfo {
            disc_type: 1.into(),
            compression: u32::from(compression_type).into(),
            compression_level: level.into(),
            chunk_size: 0x200000.into(),
            disc_head: [0u8; DISC_HEAD_SIZE],
            num_partitions: 0.into(),
            partition_entry_size: (size_of::<PartitionEntry>() as u32).into(),
            partition_offset: header_size.into(),
            partition_hash: sha1_hash(&[]),
            num_raw_data: 1.into(),
            raw_data_offset: raw_data_offset.into(),
            raw_data_size: (compressed_raw_data.len() as u32).into(),
            num_groups: 1.into(),
            group_offset: group_offset.into(),
            group_size: (compressed_groups.len() as u32).into(),
            compr_data_len: compr_data_bytes.len() as u8,
            compr_data: [0u8; 7],
        };
        disc.compr_data[..compr_data_bytes.len()].copy_from_slice(compr_data_bytes);

        let mut header = FileHeader {
            magic: WIA_MAGIC,
            version: crate::format::WIA_VERSION.into(),
            version_compatible: crate::format::WIA_VERSION_WRITE_COMPATIBLE.into(),
            disc_size: (size_of::<DiscInfo>() as u32).into(),
            disc_hash: sha1_hash(disc.as_bytes()),
            iso_file_size: image_size.into(),
            file_size: (data_start + group_payload.len() as u64).into(),
            file_head_hash: Default::default(),
        };
        patch_header(&mut header);
        let bytes = header.as_bytes();
        header.file_head_hash = sha1_hash(&bytes[..bytes.len() - 20]);

        let mut file = Vec::new();
        file.extend_from_slice(header.as_bytes());
        file.extend_from_slice(disc.as_bytes());
        file.extend_from_slice(&compressed_raw_data);
        file.extend_from_slice(&compressed_groups);
        file.resize(data_start as usize, 0);
        file.extend_from_slice(group_payload);
        file
    }

    #[test]
    fn test_none_container_round_trip() {
        let image_size = 0x200000u64;
        let mut payload = vec![0u8; image_size as usize];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = i as u8;
        }
        let file =
            build_wia(Compression::None, &[], image_size, image_size as u32, &payload, |_| {});
        let mut reader = WiaRvzReader::new(Box::new(Cursor::new(file))).unwrap();
        assert_eq!(reader.blob_type(), BlobType::Wia);
        assert_eq!(reader.data_size(), image_size);
        let mut out = vec![0u8; image_size as usize];
        reader.read(0, &mut out).unwrap();
        // The first 0x80 bytes come from the disc head (zeroed here).
        assert_eq!(&out[..DISC_HEAD_SIZE], &[0u8; DISC_HEAD_SIZE]);
        assert_eq!(&out[DISC_HEAD_SIZE..], &payload[DISC_HEAD_SIZE..]);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_wia_uncompressed_size_fallback() {
        // An LZMA container whose only group is stored plain, detectable
        // only because its stored size equals the decompressed size.
        let options = liblzma::stream::LzmaOptions::new_preset(6).unwrap();
        let props = crate::util::compress::lzma_util::lzma_props_encode(&options).unwrap();
        let image_size = 0x200000u64;
        let mut payload = vec![0u8; image_size as usize];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31);
        }
        let file =
            build_wia(Compression::Lzma(6), &props, image_size, image_size as u32, &payload, |_| {});
        let mut reader = WiaRvzReader::new(Box::new(Cursor::new(file))).unwrap();
        let mut out = vec![0u8; 16];
        reader.read(0x100000, &mut out).unwrap();
        assert_eq!(out, payload[0x100000..0x100010]);
    }

    #[test]
    fn test_version_gating() {
        let payload = vec![0xAAu8; 0x200000];
        // A compatible version above ours fails as unsupported.
        let file = build_wia(Compression::None, &[], 0x200000, 0x200000, &payload, |header| {
            header.version_compatible = 0x02000000.into()
        });
        match WiaRvzReader::new(Box::new(Cursor::new(file))) {
            Err(Error::UnsupportedCompression(_)) => {}
            other => panic!("Expected UnsupportedCompression, got {:?}", other.err()),
        }
        // A version below our read floor fails as corrupt.
        let file = build_wia(Compression::None, &[], 0x200000, 0x200000, &payload, |header| {
            header.version = 0x00010000.into()
        });
        match WiaRvzReader::new(Box::new(Cursor::new(file))) {
            Err(Error::CorruptHeader(_)) => {}
            other => panic!("Expected CorruptHeader, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let payload = vec![0u8; 0x200000];
        // Byte-swapped magic does not match.
        let file = build_wia(Compression::None, &[], 0x200000, 0x200000, &payload, |header| {
            header.magic.reverse();
        });
        assert!(matches!(
            WiaRvzReader::new(Box::new(Cursor::new(file))),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_overlap_tolerance() {
        let partitions = [PartitionEntry {
            partition_key: [0u8; 16],
            partition_data: [
                PartitionDataEntry {
                    first_sector: 64.into(),
                    num_sectors: 64.into(),
                    group_index: 0.into(),
                    num_groups: 64.into(),
                },
                PartitionDataEntry {
                    first_sector: 128.into(),
                    num_sectors: 0.into(),
                    group_index: 64.into(),
                    num_groups: 0.into(),
                },
            ],
        }];
        // Two non-empty ranges intersecting is an error in both variants.
        let raw_data = [RawDataEntry {
            data_offset: 0x80.into(),
            data_size: (65 * SECTOR_SIZE as u64 - 0x80).into(),
            group_index: 64.into(),
            num_groups: 65.into(),
        }];
        assert!(matches!(
            build_data_entries(&partitions, &raw_data, true),
            Err(Error::DataOverlap(_))
        ));
        assert!(matches!(
            build_data_entries(&partitions, &raw_data, false),
            Err(Error::DataOverlap(_))
        ));

        // A zero-sized raw anchor sharing the partition's start offset is
        // tolerated for WIA and rejected for RVZ.
        let anchors = [RawDataEntry {
            data_offset: (64 * SECTOR_SIZE as u64).into(),
            data_size: 0.into(),
            group_index: 64.into(),
            num_groups: 0.into(),
        }];
        assert!(build_data_entries(&partitions, &anchors, false).is_ok());
        assert!(matches!(
            build_data_entries(&partitions, &anchors, true),
            Err(Error::DataOverlap(_))
        ));

        // An anchor at an uncovered offset is no collision for either.
        let detached = [RawDataEntry {
            data_offset: (192 * SECTOR_SIZE as u64).into(),
            data_size: 0.into(),
            group_index: 64.into(),
            num_groups: 0.into(),
        }];
        assert!(build_data_entries(&partitions, &detached, true).is_ok());
        assert!(build_data_entries(&partitions, &detached, false).is_ok());
    }

    #[test]
    fn test_header_hash_mismatch() {
        let payload = vec![0u8; 0x200000];
        let mut file =
            build_wia(Compression::None, &[], 0x200000, 0x200000, &payload, |_| {});
        // Corrupt a byte of the disc header; its hash no longer matches.
        file[size_of::<FileHeader>() + 1] ^= 1;
        assert!(matches!(
            WiaRvzReader::new(Box::new(Cursor::new(file))),
            Err(Error::CorruptHeader(_))
        ));
    }
}

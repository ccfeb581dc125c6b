//! The conversion pipeline: parallel compression of a source image into a
//! WIA or RVZ container.
//!
//! Groups are compressed in parallel and written strictly in group-index
//! order. Identical constant-byte groups are deduplicated through a shared
//! reuse map; the map is only consulted for groups that have already been
//! written, so a copied group entry always points at complete bytes.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    io::{Seek, SeekFrom, Write},
    mem::size_of,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing::{debug, instrument};
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    common::{Compression, DiscKind, Format, KeyBytes},
    format::{
        CompressionType, DiscInfo, FileHeader, GroupEntry, HashException, PartitionDataEntry,
        PartitionEntry, RawDataEntry, WiaGroupEntry, DISC_HEAD_SIZE, RVZ_MAGIC,
        RVZ_VERSION, RVZ_VERSION_WRITE_COMPATIBLE, WIA_MAGIC, WIA_VERSION,
        WIA_VERSION_WRITE_COMPATIBLE,
    },
    pack::pack_chunk,
    read::BlobReader,
    util::{
        align_up_32, align_up_64, align_up_usize, array_ref,
        compress::{compress_bound, Compressor},
        digest::{sha1_hash, DigestManager},
        lfg::LaggedFibonacci,
    },
    wii::{
        compute_group_hashes, decrypt_group, HashBlock, BLOCKS_PER_GROUP, GROUP_DATA_SIZE,
        GROUP_SIZE, HASHES_SIZE, SECTOR_DATA_SIZE, SECTOR_SIZE,
    },
    Error, Result, ResultContext,
};

/// Default RVZ chunk size. (128 KiB)
pub const RVZ_DEFAULT_CHUNK_SIZE: u32 = 0x20000;

/// Default WIA chunk size. (2 MiB)
pub const WIA_DEFAULT_CHUNK_SIZE: u32 = 0x200000;

// Level 0 is converted to the codec default by `Compression::validate_level`
/// Default RVZ compression.
pub const RVZ_DEFAULT_COMPRESSION: Compression = Compression::Zstandard(0);
/// Default WIA compression.
pub const WIA_DEFAULT_COMPRESSION: Compression = Compression::Lzma(0);

/// Options describing the container to produce.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// The container format to write.
    pub format: Format,
    /// The compression algorithm and level.
    pub compression: Compression,
    /// Chunk size in bytes. WIA requires a multiple of 2 MiB; RVZ accepts
    /// powers of two down to 32 KiB.
    pub chunk_size: u32,
    /// Whether a chunk consisting entirely of regenerable junk may be
    /// deduplicated against an identical one.
    pub allow_junk_reuse: bool,
}

impl FormatOptions {
    /// Creates options for the specified format with its default compression
    /// and chunk size.
    pub fn new(format: Format) -> FormatOptions {
        FormatOptions {
            format,
            compression: format.default_compression(),
            chunk_size: format.default_chunk_size(),
            allow_junk_reuse: true,
        }
    }
}

/// Options for running a conversion.
#[derive(Default, Debug, Clone)]
pub struct ProcessOptions {
    /// Number of worker threads compressing groups. 0 disables threading and
    /// processes groups on the calling thread.
    pub processor_threads: usize,
    /// Enables CRC32 checksum calculation of the source image.
    pub digest_crc32: bool,
    /// Enables MD5 checksum calculation of the source image. (Slow!)
    pub digest_md5: bool,
    /// Enables SHA-1 checksum calculation of the source image.
    pub digest_sha1: bool,
    /// Enables XXH64 checksum calculation of the source image.
    pub digest_xxh64: bool,
}

/// A Wii partition of the source volume, described by the caller's volume
/// metadata: the title key and the sector ranges of the encrypted data area.
/// The management split must fall on a hash-group boundary (a multiple of 64
/// sectors from the data start).
#[derive(Debug, Clone)]
pub struct PartitionView {
    /// The partition's AES title key.
    pub key: KeyBytes,
    /// First sector of the encrypted data area.
    pub data_start_sector: u32,
    /// End of the management region (boot to FST); start of the bulk data
    /// region.
    pub management_end_sector: u32,
    /// End sector of the encrypted data area.
    pub data_end_sector: u32,
}

/// Progress of a running conversion.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Groups written so far.
    pub groups_written: u32,
    /// Total groups the container will hold.
    pub total_groups: u32,
    /// Bytes read from the source image.
    pub bytes_read: u64,
    /// Bytes written to the output.
    pub bytes_written: u64,
}

/// Results of a finished conversion.
#[derive(Debug, Default, Clone)]
pub struct ConversionSummary {
    /// Size of the written container file.
    pub file_size: u64,
    /// CRC32 of the source image, if requested.
    pub crc32: Option<u32>,
    /// MD5 of the source image, if requested.
    pub md5: Option<[u8; 16]>,
    /// SHA-1 of the source image, if requested.
    pub sha1: Option<[u8; 20]>,
    /// XXH64 of the source image, if requested.
    pub xxh64: Option<u64>,
}

/// Content-addressed identity of a group whose plaintext is one repeated
/// byte, used for cross-group deduplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReuseID {
    partition_key: Option<KeyBytes>,
    data_size: u64,
    encrypted: bool,
    value: u8,
}

/// One processed chunk, ready for the serialized output stage.
struct ChunkOut {
    /// Uncompressed exception-list bytes, already 4-aligned. Empty when the
    /// lists are carried inside `data` (compressed case) or absent.
    exceptions: Vec<u8>,
    /// The stored payload: compressed stream, or plain (possibly packed)
    /// data.
    data: Vec<u8>,
    is_compressed: bool,
    packed_size: u32,
    reuse_id: Option<ReuseID>,
    /// Set when the worker already found this chunk in the reuse map.
    reused_group: Option<GroupEntry>,
}

impl ChunkOut {
    fn zero() -> Self {
        Self {
            exceptions: Vec::new(),
            data: Vec::new(),
            is_compressed: false,
            packed_size: 0,
            reuse_id: None,
            reused_group: None,
        }
    }

    fn is_zero(&self) -> bool {
        self.exceptions.is_empty() && self.data.is_empty() && self.reused_group.is_none()
    }

    fn stored_size(&self) -> u32 { (self.exceptions.len() + self.data.len()) as u32 }
}

/// One unit of parallel work: a whole chunk for raw data, or a span of
/// `max(chunk_size, 2 MiB)` for partition data so hash groups decrypt and
/// hash as a unit.
#[derive(Debug, Clone)]
struct TaskPlan {
    first_group: u32,
    num_chunks: u32,
    /// Offset and length of the source bytes this task reads.
    disc_offset: u64,
    disc_size: u64,
    /// Partition index, or `None` for raw data.
    partition: Option<u32>,
    /// Offset of the task's data within its region stream: equal to
    /// `disc_offset` for raw data, a decrypted payload offset for partition
    /// data.
    payload_offset: u64,
}

struct ConversionPlan {
    is_rvz: bool,
    compression: Compression,
    chunk_size: u32,
    disc_head: [u8; DISC_HEAD_SIZE],
    disc_type: DiscKind,
    iso_size: u64,
    partitions: Box<[PartitionEntry]>,
    raw_data: Box<[RawDataEntry]>,
    tasks: Box<[TaskPlan]>,
    total_groups: u32,
    /// Junk generator identity: the disc id and disc number the pack
    /// transform derives its seeds from, for every region.
    junk_id: [u8; 4],
    junk_disc_num: u8,
    allow_junk_reuse: bool,
}

impl ConversionPlan {
    fn partition_chunk_size(&self) -> u64 {
        self.chunk_size as u64 / SECTOR_SIZE as u64 * SECTOR_DATA_SIZE as u64
    }

    fn exception_lists_per_chunk(&self) -> u32 { (self.chunk_size / GROUP_SIZE as u32).max(1) }
}

/// Worst-case input a chunk compressor sees: the payload plus full
/// exception lists.
fn compressor_buffer_size(compression: Compression, chunk_size: u32) -> usize {
    let lists = (chunk_size / GROUP_SIZE as u32).max(1) as usize;
    let exception_bound =
        lists * (size_of::<u16>() + (HASHES_SIZE / 20 + 1) * BLOCKS_PER_GROUP * 22);
    compress_bound(compression, chunk_size as usize + exception_bound)
}

/// Converts a disc image into a WIA or RVZ container.
///
/// `partitions` is the caller's volume-metadata view of the source: the
/// encrypted Wii partitions with their title keys and sector ranges (empty
/// for GameCube discs). The progress callback runs between groups; returning
/// `false` aborts the conversion with [`Error::CallbackAborted`], leaving a
/// partial file the caller must discard.
#[instrument(skip_all)]
pub fn convert<W>(
    reader: Box<dyn BlobReader>,
    partitions: &[PartitionView],
    out: &mut W,
    options: &FormatOptions,
    process: &ProcessOptions,
    mut progress: impl FnMut(Progress) -> bool,
) -> Result<ConversionSummary>
where
    W: Write + Seek + ?Sized,
{
    let mut options = options.clone();
    options.compression.validate_level()?;
    let is_rvz = options.format == Format::Rvz;
    match options.compression {
        Compression::Purge if is_rvz => {
            return Err(Error::UnsupportedCompression(
                "Purge compression is not supported in RVZ".to_string(),
            ));
        }
        Compression::Zstandard(_) if !is_rvz => {
            return Err(Error::UnsupportedCompression(
                "Zstandard compression is not supported in WIA".to_string(),
            ));
        }
        _ => {}
    }

    let mut reader = reader;
    let plan = Arc::new(build_plan(reader.as_mut(), partitions, &options)?);

    // Provisional headers: reserve space for both headers, the partition
    // table, and worst-case compressed raw-data and group tables.
    let raw_table_size = plan.raw_data.len() * size_of::<RawDataEntry>();
    let group_table_size = plan.total_groups as usize
        * if is_rvz { size_of::<GroupEntry>() } else { size_of::<WiaGroupEntry>() };
    let header_size = size_of::<FileHeader>()
        + size_of::<DiscInfo>()
        + plan.partitions.len() * size_of::<PartitionEntry>();
    let data_start = align_up_usize(
        header_size
            + compress_bound(plan.compression, raw_table_size)
            + compress_bound(plan.compression, group_table_size),
        4,
    ) as u64;
    out.seek(SeekFrom::Start(0)).map_err(write_err)?;
    write_zeroes(out, data_start).map_err(write_err)?;

    let reusable: Arc<Mutex<BTreeMap<ReuseID, GroupEntry>>> = Arc::default();
    let digest = DigestManager::new(process);
    let mut groups = <[GroupEntry]>::new_box_zeroed_with_elems(plan.total_groups as usize)?;
    let mut file_position = data_start;
    let mut bytes_read = 0u64;
    let mut groups_written = 0u32;

    let processor = GroupProcessor {
        reader: reader.clone(),
        plan: plan.clone(),
        compressor: Compressor::new(
            plan.compression,
            compressor_buffer_size(plan.compression, plan.chunk_size),
        ),
        reusable: reusable.clone(),
        lfg: LaggedFibonacci::default(),
    };
    par_process(
        processor,
        plan.tasks.len() as u32,
        process.processor_threads,
        |task| -> Result<()> {
            let task_plan = &plan.tasks[task.task_idx as usize];
            digest.send(task.disc_data);
            bytes_read += task_plan.disc_size;
            for (i, mut chunk) in task.chunks.into_iter().enumerate() {
                let group_idx = task_plan.first_group + i as u32;
                // The candidate may have been written since the worker
                // looked; reusing it drops this chunk's bytes entirely.
                if chunk.reused_group.is_none() {
                    if let Some(id) = &chunk.reuse_id {
                        chunk.reused_group = reusable.lock().unwrap().get(id).cloned();
                    }
                }
                let entry = if let Some(entry) = chunk.reused_group.take() {
                    entry
                } else if chunk.is_zero() {
                    GroupEntry::new_zeroed()
                } else {
                    debug_assert_eq!(file_position % 4, 0);
                    let entry = GroupEntry {
                        data_offset: ((file_position / 4) as u32).into(),
                        data_size_and_flag: (chunk.stored_size()
                            | if chunk.is_compressed { 0x80000000 } else { 0 })
                        .into(),
                        rvz_packed_size: chunk.packed_size.into(),
                    };
                    out.write_all(&chunk.exceptions).map_err(write_err)?;
                    out.write_all(&chunk.data).map_err(write_err)?;
                    file_position += chunk.stored_size() as u64;
                    let pad = align_up_64(file_position, 4) - file_position;
                    if pad > 0 {
                        out.write_all(&[0u8; 4][..pad as usize]).map_err(write_err)?;
                        file_position += pad;
                    }
                    if let Some(id) = chunk.reuse_id {
                        reusable.lock().unwrap().insert(id, entry.clone());
                    }
                    entry
                };
                groups[group_idx as usize] = entry;
            }
            groups_written = task_plan.first_group + task_plan.num_chunks;
            if !progress(Progress {
                groups_written,
                total_groups: plan.total_groups,
                bytes_read,
                bytes_written: file_position,
            }) {
                return Err(Error::CallbackAborted);
            }
            Ok(())
        },
    )?;

    // Compress the raw-data and group tables as single chunks in the
    // container's codec.
    let mut compressor = Compressor::new(
        plan.compression,
        compress_bound(plan.compression, raw_table_size.max(group_table_size)),
    );
    if !compressor.compress(plan.raw_data.as_bytes()).map_err(write_err)? {
        return Err(Error::WriteFailed("Failed to compress raw data table".to_string()));
    }
    let compressed_raw_data = compressor.buffer.clone();
    let groups_data = if is_rvz {
        groups.as_bytes().to_vec()
    } else {
        let mut buf = Vec::with_capacity(group_table_size);
        for group in groups.iter() {
            if group.is_packed() {
                return Err(Error::WriteFailed("Packed group in WIA".to_string()));
            }
            buf.extend_from_slice(WiaGroupEntry::from(group).as_bytes());
        }
        buf
    };
    if !compressor.compress(&groups_data).map_err(write_err)? {
        return Err(Error::WriteFailed("Failed to compress group table".to_string()));
    }
    let compressed_groups = compressor.buffer;

    // Assemble the final headers and back-patch the reserved region.
    let (compression_type, level) = CompressionType::from_compression(plan.compression);
    let compr_data = compr_data(plan.compression).context("Building compressor data")?;
    let mut disc = DiscInfo {
        disc_type: u32::from(plan.disc_type).into(),
        compression: compression_type.into(),
        compression_level: level.into(),
        chunk_size: plan.chunk_size.into(),
        disc_head: plan.disc_head,
        num_partitions: (plan.partitions.len() as u32).into(),
        partition_entry_size: (size_of::<PartitionEntry>() as u32).into(),
        partition_offset: Default::default(),
        partition_hash: sha1_hash(plan.partitions.as_bytes()),
        num_raw_data: (plan.raw_data.len() as u32).into(),
        raw_data_offset: Default::default(),
        raw_data_size: (compressed_raw_data.len() as u32).into(),
        num_groups: plan.total_groups.into(),
        group_offset: Default::default(),
        group_size: (compressed_groups.len() as u32).into(),
        compr_data_len: compr_data.len() as u8,
        compr_data: Default::default(),
    };
    disc.compr_data[..compr_data.len()].copy_from_slice(&compr_data);
    disc.validate(is_rvz)?;

    let mut header_offset = (size_of::<FileHeader>() + size_of::<DiscInfo>()) as u64;
    disc.partition_offset = header_offset.into();
    header_offset += (plan.partitions.len() * size_of::<PartitionEntry>()) as u64;
    disc.raw_data_offset = header_offset.into();
    header_offset += compressed_raw_data.len() as u64;
    disc.group_offset = header_offset.into();
    header_offset += compressed_groups.len() as u64;
    if header_offset > data_start {
        return Err(Error::WriteFailed("Header tables exceed reserved space".to_string()));
    }

    let mut header = FileHeader {
        magic: if is_rvz { RVZ_MAGIC } else { WIA_MAGIC },
        version: if is_rvz { RVZ_VERSION } else { WIA_VERSION }.into(),
        version_compatible: if is_rvz {
            RVZ_VERSION_WRITE_COMPATIBLE
        } else {
            WIA_VERSION_WRITE_COMPATIBLE
        }
        .into(),
        disc_size: (size_of::<DiscInfo>() as u32).into(),
        disc_hash: sha1_hash(disc.as_bytes()),
        iso_file_size: plan.iso_size.into(),
        file_size: file_position.into(),
        file_head_hash: Default::default(),
    };
    let header_bytes = header.as_bytes();
    header.file_head_hash =
        sha1_hash(&header_bytes[..size_of::<FileHeader>() - size_of::<crate::common::HashBytes>()]);

    out.seek(SeekFrom::Start(0)).map_err(write_err)?;
    out.write_all(header.as_bytes()).map_err(write_err)?;
    out.write_all(disc.as_bytes()).map_err(write_err)?;
    out.write_all(plan.partitions.as_bytes()).map_err(write_err)?;
    out.write_all(&compressed_raw_data).map_err(write_err)?;
    out.write_all(&compressed_groups).map_err(write_err)?;
    out.seek(SeekFrom::Start(file_position)).map_err(write_err)?;
    out.flush().map_err(write_err)?;
    debug!("Wrote {} groups, {} bytes", plan.total_groups, file_position);

    let digests = digest.finish();
    Ok(ConversionSummary {
        file_size: file_position,
        crc32: digests.crc32,
        md5: digests.md5,
        sha1: digests.sha1,
        xxh64: digests.xxh64,
    })
}

fn write_err(e: io::Error) -> Error { Error::WriteFailed(e.to_string()) }

fn write_zeroes<W>(out: &mut W, mut len: u64) -> io::Result<()>
where W: Write + ?Sized {
    let zeroes = [0u8; 0x1000];
    while len > 0 {
        let n = len.min(zeroes.len() as u64) as usize;
        out.write_all(&zeroes[..n])?;
        len -= n as u64;
    }
    Ok(())
}

/// Compressor-specific header data: LZMA filter properties.
fn compr_data(compression: Compression) -> io::Result<Box<[u8]>> {
    match compression {
        #[cfg(feature = "compress-lzma")]
        Compression::Lzma(level) => {
            let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
            Ok(Box::new(crate::util::compress::lzma_util::lzma_props_encode(&options)?))
        }
        #[cfg(feature = "compress-lzma")]
        Compression::Lzma2(level) => {
            let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
            Ok(Box::new(crate::util::compress::lzma_util::lzma2_props_encode(&options)?))
        }
        _ => Ok(Box::default()),
    }
}

/// Lays out the output container: partition entries, raw-data entries, and
/// the ordered task list.
fn build_plan(
    reader: &mut dyn BlobReader,
    partitions: &[PartitionView],
    options: &FormatOptions,
) -> Result<ConversionPlan> {
    let iso_size = reader.data_size();
    let chunk_size = options.chunk_size as u64;
    let is_rvz = options.format == Format::Rvz;

    let mut disc_head = [0u8; DISC_HEAD_SIZE];
    reader.read(0, &mut disc_head)?;
    let disc_type = if *array_ref![disc_head, 0x18, 4] == [0x5D, 0x1C, 0x9E, 0xA3] {
        DiscKind::Wii
    } else if *array_ref![disc_head, 0x1C, 4] == [0xC2, 0x33, 0x9F, 0x3D] {
        DiscKind::GameCube
    } else {
        return Err(Error::WriteFailed("Source is not a GameCube or Wii disc image".to_string()));
    };
    let junk_id = *array_ref![disc_head, 0, 4];
    let junk_disc_num = disc_head[6];

    let mut sorted: Vec<&PartitionView> = partitions.iter().collect();
    sorted.sort_by_key(|p| p.data_start_sector);
    for view in &sorted {
        if view.data_start_sector == 0
            || view.data_start_sector > view.management_end_sector
            || view.management_end_sector > view.data_end_sector
            || view.data_end_sector as u64 * SECTOR_SIZE as u64 > iso_size
        {
            return Err(Error::WriteFailed(format!(
                "Invalid partition sector range {}..{}..{}",
                view.data_start_sector, view.management_end_sector, view.data_end_sector
            )));
        }
        if (view.management_end_sector - view.data_start_sector) % BLOCKS_PER_GROUP as u32 != 0 {
            return Err(Error::WriteFailed(
                "Partition management split is not on a hash-group boundary".to_string(),
            ));
        }
    }

    let mut plan_partitions = Vec::with_capacity(sorted.len());
    let mut raw_data = Vec::with_capacity(sorted.len() + 1);
    let mut tasks = Vec::new();
    let mut group_idx = 0u32;
    let mut raw_cursor = DISC_HEAD_SIZE as u64;

    let mut add_raw = |raw_data: &mut Vec<RawDataEntry>,
                       tasks: &mut Vec<TaskPlan>,
                       group_idx: &mut u32,
                       offset: u64,
                       end: u64| {
        if end <= offset {
            // An empty gap gets no entry at all, not a zero-sized anchor.
            return;
        }
        let start = offset & !(SECTOR_SIZE as u64 - 1);
        let num_groups = (end - start).div_ceil(chunk_size) as u32;
        raw_data.push(RawDataEntry {
            data_offset: offset.into(),
            data_size: (end - offset).into(),
            group_index: (*group_idx).into(),
            num_groups: num_groups.into(),
        });
        for i in 0..num_groups as u64 {
            let task_start = start + i * chunk_size;
            tasks.push(TaskPlan {
                first_group: *group_idx + i as u32,
                num_chunks: 1,
                disc_offset: task_start,
                disc_size: chunk_size.min(end - task_start),
                partition: None,
                payload_offset: task_start,
            });
        }
        *group_idx += num_groups;
    };

    for (index, view) in sorted.iter().enumerate() {
        let partition_start = view.data_start_sector as u64 * SECTOR_SIZE as u64;
        add_raw(&mut raw_data, &mut tasks, &mut group_idx, raw_cursor, partition_start);

        let mut entry = PartitionEntry {
            partition_key: view.key,
            partition_data: [
                PartitionDataEntry {
                    first_sector: view.data_start_sector.into(),
                    num_sectors: (view.management_end_sector - view.data_start_sector).into(),
                    group_index: 0.into(),
                    num_groups: 0.into(),
                },
                PartitionDataEntry {
                    first_sector: view.management_end_sector.into(),
                    num_sectors: (view.data_end_sector - view.management_end_sector).into(),
                    group_index: 0.into(),
                    num_groups: 0.into(),
                },
            ],
        };
        for pd in entry.partition_data.iter_mut() {
            let span = pd.num_sectors.get() as u64 * SECTOR_SIZE as u64;
            let num_groups = span.div_ceil(chunk_size) as u32;
            pd.group_index = group_idx.into();
            pd.num_groups = num_groups.into();

            // Partition tasks cover whole hash groups so decryption and
            // hashing happen once per group.
            let unit = chunk_size.max(GROUP_SIZE as u64);
            let pd_start = pd.start_offset();
            let payload_base = (pd.first_sector.get() - view.data_start_sector) as u64
                * SECTOR_DATA_SIZE as u64;
            let mut offset = 0u64;
            let mut task_group = group_idx;
            while offset < span {
                let task_size = unit.min(span - offset);
                let num_chunks = task_size.div_ceil(chunk_size) as u32;
                tasks.push(TaskPlan {
                    first_group: task_group,
                    num_chunks,
                    disc_offset: pd_start + offset,
                    disc_size: task_size,
                    partition: Some(index as u32),
                    payload_offset: payload_base
                        + offset / SECTOR_SIZE as u64 * SECTOR_DATA_SIZE as u64,
                });
                task_group += num_chunks;
                offset += task_size;
            }
            group_idx += num_groups;
        }
        plan_partitions.push(entry);
        raw_cursor = view.data_end_sector as u64 * SECTOR_SIZE as u64;
    }
    add_raw(&mut raw_data, &mut tasks, &mut group_idx, raw_cursor, iso_size);

    debug!("Planned {} groups in {} tasks", group_idx, tasks.len());
    Ok(ConversionPlan {
        is_rvz,
        compression: options.compression,
        chunk_size: options.chunk_size,
        disc_head,
        disc_type,
        iso_size,
        partitions: plan_partitions.into_boxed_slice(),
        raw_data: raw_data.into_boxed_slice(),
        tasks: tasks.into_boxed_slice(),
        total_groups: group_idx,
        junk_id,
        junk_disc_num,
        allow_junk_reuse: options.allow_junk_reuse,
    })
}

struct TaskOut {
    task_idx: u32,
    /// The source bytes, for the digest threads.
    disc_data: Bytes,
    chunks: Vec<ChunkOut>,
}

struct GroupProcessor {
    reader: Box<dyn BlobReader>,
    plan: Arc<ConversionPlan>,
    compressor: Compressor,
    reusable: Arc<Mutex<BTreeMap<ReuseID, GroupEntry>>>,
    lfg: LaggedFibonacci,
}

impl Clone for GroupProcessor {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            plan: self.plan.clone(),
            compressor: self.compressor.clone(),
            reusable: self.reusable.clone(),
            lfg: LaggedFibonacci::default(),
        }
    }
}

impl GroupProcessor {
    #[instrument(name = "GroupProcessor::process_task", skip_all)]
    fn process_task(&mut self, task_idx: u32) -> Result<TaskOut> {
        let plan = self.plan.clone();
        let task = &plan.tasks[task_idx as usize];
        let mut disc_data = vec![0u8; task.disc_size as usize];
        self.reader.read(task.disc_offset, &mut disc_data)?;
        let disc_data = Bytes::from(disc_data);

        match task.partition {
            Some(partition) => self.process_partition_task(&plan, task, partition, &disc_data),
            None => self.process_raw_task(&plan, task, &disc_data),
        }
        .map(|chunks| TaskOut { task_idx, disc_data, chunks })
    }

    fn process_raw_task(
        &mut self,
        plan: &ConversionPlan,
        task: &TaskPlan,
        disc_data: &[u8],
    ) -> Result<Vec<ChunkOut>> {
        let junk = plan.is_rvz.then_some((plan.junk_id, plan.junk_disc_num));
        let chunk = self.finish_chunk(plan, disc_data, &[], task.payload_offset, junk, None)?;
        Ok(vec![chunk])
    }

    fn process_partition_task(
        &mut self,
        plan: &ConversionPlan,
        task: &TaskPlan,
        partition: u32,
        disc_data: &[u8],
    ) -> Result<Vec<ChunkOut>> {
        let entry = &plan.partitions[partition as usize];
        let key = entry.partition_key;
        let sectors = task.disc_size as usize / SECTOR_SIZE;
        let payload_len = sectors * SECTOR_DATA_SIZE;
        if task.disc_size as usize % SECTOR_SIZE != 0 {
            return Err(Error::WriteFailed(
                "Partition data size not aligned to sector".to_string(),
            ));
        }

        // Decrypt whole hash groups, recompute their hash trees, and collect
        // the differences against the original hashes.
        let mut payload = vec![0u8; payload_len];
        let num_wii_groups = sectors.div_ceil(BLOCKS_PER_GROUP);
        let mut group_exceptions: Vec<Vec<HashException>> = Vec::with_capacity(num_wii_groups);
        let mut original = <[HashBlock; BLOCKS_PER_GROUP]>::new_box_zeroed()?;
        let mut computed = <[HashBlock; BLOCKS_PER_GROUP]>::new_box_zeroed()?;
        for g in 0..num_wii_groups {
            let group_sectors = (sectors - g * BLOCKS_PER_GROUP).min(BLOCKS_PER_GROUP);
            let disc_range =
                g * GROUP_SIZE..g * GROUP_SIZE + group_sectors * SECTOR_SIZE;
            let payload_range = g * GROUP_DATA_SIZE
                ..g * GROUP_DATA_SIZE + group_sectors * SECTOR_DATA_SIZE;
            decrypt_group(
                &disc_data[disc_range],
                &key,
                &mut payload[payload_range.clone()],
                &mut original,
            );
            compute_group_hashes(&payload[payload_range], &mut computed);
            group_exceptions.push(diff_hash_blocks(
                &original[..group_sectors],
                &computed[..group_sectors],
            ));
        }

        // Slice the payload into chunks, each with its exception lists.
        let chunk_payload = plan.partition_chunk_size();
        let lists_per_chunk = plan.exception_lists_per_chunk() as usize;
        let junk = plan.is_rvz.then_some((plan.junk_id, plan.junk_disc_num));
        let mut chunks = Vec::with_capacity(task.num_chunks as usize);
        for c in 0..task.num_chunks as u64 {
            let start = c * chunk_payload;
            let end = ((c + 1) * chunk_payload).min(payload_len as u64);
            let lists = if lists_per_chunk > 1 {
                // One list per 2 MiB of chunk: whole hash groups.
                (0..lists_per_chunk)
                    .map(|i| group_exceptions.get(i).cloned().unwrap_or_default())
                    .collect()
            } else {
                // One chunk-relative list: the slice of its hash group's
                // exceptions covering this chunk's sectors.
                let sectors_per_chunk = (chunk_payload / SECTOR_DATA_SIZE as u64) as u32;
                let wii_group = (start / GROUP_DATA_SIZE as u64) as usize;
                let chunk_in_group =
                    ((start % GROUP_DATA_SIZE as u64) / chunk_payload) as u32;
                let base = chunk_in_group * sectors_per_chunk * HASHES_SIZE as u32;
                let span = sectors_per_chunk * HASHES_SIZE as u32;
                let list = group_exceptions[wii_group]
                    .iter()
                    .filter(|e| {
                        (e.offset.get() as u32) >= base && (e.offset.get() as u32) < base + span
                    })
                    .map(|e| HashException {
                        offset: ((e.offset.get() as u32 - base) as u16).into(),
                        hash: e.hash,
                    })
                    .collect();
                vec![list]
            };
            let chunk = self.finish_chunk(
                plan,
                &payload[start as usize..end as usize],
                &lists,
                task.payload_offset + start,
                junk,
                Some(key),
            )?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Packs (RVZ), compresses, and classifies one chunk of plaintext.
    #[allow(clippy::too_many_arguments)]
    fn finish_chunk(
        &mut self,
        plan: &ConversionPlan,
        plain: &[u8],
        lists: &[Vec<HashException>],
        payload_offset: u64,
        junk: Option<([u8; 4], u8)>,
        partition_key: Option<KeyBytes>,
    ) -> Result<ChunkOut> {
        let lists_empty = lists.iter().all(|l| l.is_empty());
        if lists_empty && plain.iter().all(|&b| b == 0) {
            return Ok(ChunkOut::zero());
        }

        let mut reuse_id = (lists_empty && plain.iter().all(|&b| b == plain[0])).then(|| ReuseID {
            partition_key,
            data_size: plain.len() as u64,
            encrypted: false,
            value: plain[0],
        });
        if let Some(id) = &reuse_id {
            if let Some(entry) = self.reusable.lock().unwrap().get(id) {
                return Ok(ChunkOut {
                    exceptions: Vec::new(),
                    data: Vec::new(),
                    is_compressed: false,
                    packed_size: 0,
                    reuse_id: Some(id.clone()),
                    reused_group: Some(entry.clone()),
                });
            }
        }

        // RVZ packing: only worthwhile when junk was actually found.
        let mut packed_size = 0u32;
        let mut packed = Vec::new();
        if let Some((junk_id, disc_num)) = junk {
            let result = pack_chunk(plain, payload_offset, junk_id, disc_num, &mut self.lfg);
            if result.has_junk {
                packed_size = result.data.len() as u32;
                packed = result.data;
                if !plan.allow_junk_reuse {
                    reuse_id = None;
                }
            }
        }
        let input = if packed_size > 0 { packed.as_slice() } else { plain };

        // Serialize the exception lists: unaligned for compression, aligned
        // for plain storage (and for the Purge hash side channel).
        let mut exc_unaligned = Vec::new();
        for list in lists {
            exc_unaligned.extend_from_slice(&(list.len() as u16).to_be_bytes());
            for exception in list {
                exc_unaligned.extend_from_slice(exception.as_bytes());
            }
        }
        let mut exc_aligned = exc_unaligned.clone();
        exc_aligned.resize(align_up_usize(exc_aligned.len(), 4), 0);

        match plan.compression {
            Compression::None => Ok(ChunkOut {
                exceptions: exc_aligned,
                data: input.to_vec(),
                is_compressed: false,
                packed_size,
                reuse_id,
                reused_group: None,
            }),
            Compression::Purge => {
                if !self.compressor.compress_purge(&exc_aligned, input).map_err(write_err)? {
                    return Err(Error::WriteFailed("Failed to Purge-compress group".to_string()));
                }
                Ok(ChunkOut {
                    exceptions: exc_aligned,
                    data: self.compressor.buffer.clone(),
                    is_compressed: false,
                    packed_size,
                    reuse_id,
                    reused_group: None,
                })
            }
            _ => {
                let mut stream = Vec::with_capacity(exc_unaligned.len() + input.len());
                stream.extend_from_slice(&exc_unaligned);
                stream.extend_from_slice(input);
                let compressed = self.compressor.compress(&stream).map_err(write_err)?;
                let plain_stored = exc_aligned.len() + input.len();
                if compressed
                    && (!plan.is_rvz
                        || align_up_32(self.compressor.buffer.len() as u32, 4)
                            < plain_stored as u32)
                {
                    Ok(ChunkOut {
                        exceptions: Vec::new(),
                        data: self.compressor.buffer.clone(),
                        is_compressed: true,
                        packed_size,
                        reuse_id,
                        reused_group: None,
                    })
                } else if !plan.is_rvz {
                    Err(Error::WriteFailed(format!(
                        "Failed to compress group: len {}, capacity {}",
                        self.compressor.buffer.len(),
                        self.compressor.buffer.capacity()
                    )))
                } else {
                    // RVZ stores the group uncompressed when compression
                    // does not shrink it.
                    Ok(ChunkOut {
                        exceptions: exc_aligned,
                        data: input.to_vec(),
                        is_compressed: false,
                        packed_size,
                        reuse_id,
                        reused_group: None,
                    })
                }
            }
        }
    }
}

/// Produces the exception entries for one hash group: every 20-byte hash
/// slot whose recomputed value differs from the original, plus overlapping
/// entries covering any differing padding bytes.
fn diff_hash_blocks(original: &[HashBlock], computed: &[HashBlock]) -> Vec<HashException> {
    let mut exceptions = Vec::new();
    for (sector, (orig, comp)) in original.iter().zip(computed.iter()).enumerate() {
        let base = (sector * HASHES_SIZE) as u16;
        let orig_bytes = orig.as_bytes();
        let comp_bytes = comp.as_bytes();
        // Hash slots: h0, h1, h2 arrays.
        for (start, count) in [(0usize, 31usize), (0x280, 8), (0x340, 8)] {
            for i in 0..count {
                let offset = start + i * 20;
                if orig_bytes[offset..offset + 20] != comp_bytes[offset..offset + 20] {
                    exceptions.push(HashException {
                        offset: (base + offset as u16).into(),
                        hash: orig_bytes[offset..offset + 20].try_into().unwrap(),
                    });
                }
            }
        }
        // Padding areas: cover a differing region with one entry per 20-byte
        // window, overlapping where the area is not a multiple of 20.
        for (start, len) in [(0x26C_usize, 20usize), (0x320, 32), (0x3E0, 32)] {
            if orig_bytes[start..start + len] != comp_bytes[start..start + len] {
                let mut offset = start;
                while offset < start + len {
                    let window = offset.min(start + len - 20);
                    exceptions.push(HashException {
                        offset: (base + window as u16).into(),
                        hash: orig_bytes[window..window + 20].try_into().unwrap(),
                    });
                    if window + 20 >= start + len {
                        break;
                    }
                    offset = window + 20;
                }
            }
        }
    }
    exceptions.sort_by_key(|e| e.offset.get());
    exceptions
}

/// Processes tasks in parallel, delivering results to the callback in
/// strictly increasing task order.
fn par_process(
    mut processor: GroupProcessor,
    task_count: u32,
    num_threads: usize,
    mut callback: impl FnMut(TaskOut) -> Result<()>,
) -> Result<()> {
    if num_threads == 0 {
        // Fall back to single-threaded processing
        for task_idx in 0..task_count {
            callback(processor.process_task(task_idx)?)?;
        }
        return Ok(());
    }

    std::thread::scope(|s| {
        let (task_tx, task_rx) = crossbeam_channel::bounded(task_count as usize);
        for task_idx in 0..task_count {
            task_tx.send(task_idx).unwrap();
        }
        drop(task_tx); // Disconnect channel

        let (result_tx, result_rx) = crossbeam_channel::bounded(0);

        // Spawn threads to process tasks
        for _ in 0..num_threads - 1 {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let mut processor = processor.clone();
            s.spawn(move || {
                while let Ok(task_idx) = task_rx.recv() {
                    let result = processor.process_task(task_idx);
                    let failed = result.is_err(); // Stop processing if an error occurs
                    if result_tx.send(result).is_err() || failed {
                        break;
                    }
                }
            });
        }

        // Last iteration moves instead of cloning
        s.spawn(move || {
            while let Ok(task_idx) = task_rx.recv() {
                let result = processor.process_task(task_idx);
                let failed = result.is_err(); // Stop processing if an error occurs
                if result_tx.send(result).is_err() || failed {
                    break;
                }
            }
        });

        // Main thread processes results
        let mut current_task = 0;
        let mut out_of_order = VecDeque::<TaskOut>::new();
        while let Ok(result) = result_rx.recv() {
            let result = result?;
            if result.task_idx == current_task {
                callback(result)?;
                current_task += 1;
                // Check if any out of order tasks can be delivered
                while out_of_order.front().is_some_and(|r| r.task_idx == current_task) {
                    callback(out_of_order.pop_front().unwrap())?;
                    current_task += 1;
                }
            } else {
                // Insert sorted
                match out_of_order.binary_search_by_key(&result.task_idx, |r| r.task_idx) {
                    Ok(idx) => Err(Error::WriteFailed(format!("Unexpected duplicate task {idx}")))?,
                    Err(idx) => out_of_order.insert(idx, result),
                }
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        read::{BlobReader, BlobType, IsoReader, WiaRvzReader},
        util::array_ref_mut,
        wii::encrypt_sector,
    };

    const GC_GAME_ID: [u8; 6] = *b"GWRE01";

    fn fill_pattern(buf: &mut [u8], seed: u8) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(seed) ^ (i >> 8) as u8;
        }
    }

    /// A GameCube-style image: disc head with the GC magic, patterned data.
    fn gc_image(len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len];
        fill_pattern(&mut image, 0x11);
        image[..6].copy_from_slice(&GC_GAME_ID);
        image[6] = 0; // disc number
        image[0x1C..0x20].copy_from_slice(&[0xC2, 0x33, 0x9F, 0x3D]);
        image
    }

    fn run_convert(
        image: &[u8],
        partitions: &[PartitionView],
        options: &FormatOptions,
        threads: usize,
    ) -> (Vec<u8>, ConversionSummary) {
        let reader = IsoReader::new(Box::new(Cursor::new(image.to_vec()))).unwrap();
        let mut out = Cursor::new(Vec::new());
        let summary = convert(
            Box::new(reader),
            partitions,
            &mut out,
            options,
            &ProcessOptions {
                processor_threads: threads,
                digest_crc32: true,
                digest_sha1: true,
                ..Default::default()
            },
            |_| true,
        )
        .unwrap();
        (out.into_inner(), summary)
    }

    fn assert_round_trip(
        image: &[u8],
        partitions: &[PartitionView],
        options: &FormatOptions,
        threads: usize,
    ) -> WiaRvzReader {
        let (file, summary) = run_convert(image, partitions, options, threads);
        assert_eq!(summary.file_size, file.len() as u64);
        assert_eq!(summary.crc32, Some(crc32fast::hash(image)));
        let mut reader = WiaRvzReader::new(Box::new(Cursor::new(file))).unwrap();
        assert_eq!(reader.data_size(), image.len() as u64);
        let mut out = vec![0u8; image.len()];
        reader.read(0, &mut out).unwrap();
        assert_eq!(out, image, "decoded image differs");
        reader
    }

    #[test]
    fn test_rvz_none_round_trip() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::None,
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        let image = gc_image(0x20000);
        let mut reader = assert_round_trip(&image, &[], &options, 0);
        assert_eq!(reader.blob_type(), BlobType::Rvz);
        // A read straddling a chunk boundary.
        let mut out = [0u8; 16];
        reader.read(0x8000 - 8, &mut out).unwrap();
        assert_eq!(out[..], image[0x7FF8..0x8008]);
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_rvz_zstd_round_trip() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::Zstandard(1),
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        // Unaligned image size: the last chunk is short.
        let image = gc_image(0x2C100);
        assert_round_trip(&image, &[], &options, 0);
        assert_round_trip(&image, &[], &options, 2);
    }

    #[cfg(feature = "compress-bzip2")]
    #[test]
    fn test_wia_bzip2_round_trip() {
        let options = FormatOptions {
            format: Format::Wia,
            compression: Compression::Bzip2(9),
            chunk_size: 0x200000,
            allow_junk_reuse: true,
        };
        let image = gc_image(0x280000);
        assert_round_trip(&image, &[], &options, 0);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_wia_lzma_round_trip() {
        let options = FormatOptions {
            format: Format::Wia,
            compression: Compression::Lzma(1),
            chunk_size: 0x200000,
            allow_junk_reuse: true,
        };
        let image = gc_image(0x300000);
        assert_round_trip(&image, &[], &options, 2);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_rvz_lzma2_round_trip() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::Lzma2(1),
            chunk_size: 0x10000,
            allow_junk_reuse: true,
        };
        let image = gc_image(0x40000);
        assert_round_trip(&image, &[], &options, 0);
    }

    #[test]
    fn test_wia_purge_round_trip() {
        let options = FormatOptions {
            format: Format::Wia,
            compression: Compression::Purge,
            chunk_size: 0x200000,
            allow_junk_reuse: true,
        };
        // A mostly zero image with a few scattered runs.
        let mut image = vec![0u8; 0x400000];
        image[..6].copy_from_slice(&GC_GAME_ID);
        image[0x1C..0x20].copy_from_slice(&[0xC2, 0x33, 0x9F, 0x3D]);
        image[0x12345..0x12349].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        fill_pattern(&mut image[0x250000..0x251000], 3);
        assert_round_trip(&image, &[], &options, 0);
    }

    #[test]
    fn test_zero_groups_write_no_payload() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::None,
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        // Only the first chunk holds data; the other three are zero.
        let mut image = vec![0u8; 0x20000];
        image[..0x80].copy_from_slice(&gc_image(0x80));
        let reader = assert_round_trip(&image, &[], &options, 0);
        let groups = reader.group_entries();
        assert_eq!(groups.len(), 4);
        for group in &groups[1..] {
            assert_eq!(group.data_size(), 0);
        }
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_rvz_packed_junk() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::Zstandard(1),
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        let mut image = gc_image(0x20000);
        // One region of generator output at its own position: the packer
        // must tag it as junk and the reader must regenerate it.
        let junk_start = 0x10000;
        let mut junk = [0u8; 0x1001];
        let mut lfg = LaggedFibonacci::default();
        lfg.init_with_seed(*array_ref![image, 0, 4], image[6], junk_start as u64);
        lfg.fill(&mut junk);
        image[junk_start..junk_start + 0x1000].copy_from_slice(&junk[..0x1000]);
        // Make sure the run ends exactly where intended.
        image[junk_start + 0x1000] = junk[0x1000] ^ 0x80;
        let reader = assert_round_trip(&image, &[], &options, 0);
        let junk_group = &reader.group_entries()[(junk_start / 0x8000) as usize];
        assert!(junk_group.is_packed());
        // A bare tag word for the junk, a tag word plus literals for the
        // rest of the chunk.
        assert_eq!(junk_group.rvz_packed_size.get(), (4 + 4 + 0x7000) as u32);
    }

    #[test]
    fn test_progress_and_abort() {
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::None,
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        let image = gc_image(0x20000);
        let reader = IsoReader::new(Box::new(Cursor::new(image.clone()))).unwrap();
        let mut out = Cursor::new(Vec::new());
        let mut calls = 0;
        let result = convert(
            Box::new(reader),
            &[],
            &mut out,
            &options,
            &ProcessOptions::default(),
            |progress| {
                calls += 1;
                assert_eq!(progress.total_groups, 4);
                progress.groups_written < 2
            },
        );
        assert!(matches!(result, Err(Error::CallbackAborted)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_variant_gating() {
        let image = gc_image(0x8000);
        let reader = IsoReader::new(Box::new(Cursor::new(image))).unwrap();
        let mut out = Cursor::new(Vec::new());
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::Purge,
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        let result = convert(
            Box::new(reader),
            &[],
            &mut out,
            &options,
            &ProcessOptions::default(),
            |_| true,
        );
        assert!(matches!(result, Err(Error::UnsupportedCompression(_))));
    }

    // --- Wii partition scenarios ---

    struct WiiImage {
        image: Vec<u8>,
        views: Vec<PartitionView>,
        payload: Vec<u8>,
    }

    const WII_KEY: KeyBytes = [7u8; 16];
    const PART_START_SECTOR: u32 = 64;

    /// Builds an image with one encrypted partition of a single hash group
    /// (64 sectors), preceded and followed by raw regions. `tweak` may
    /// modify the hash blocks before encryption to force stored exceptions.
    fn wii_image(
        payload_fn: impl Fn(usize, &mut [u8]),
        tweak: impl FnOnce(&mut [HashBlock; BLOCKS_PER_GROUP]),
    ) -> WiiImage {
        let image_len = 0x500000;
        let mut image = vec![0u8; image_len];
        fill_pattern(&mut image[..0x200000], 0x21);
        image[..6].copy_from_slice(b"RWIE01");
        image[6] = 0;
        image[0x18..0x1C].copy_from_slice(&[0x5D, 0x1C, 0x9E, 0xA3]);
        fill_pattern(&mut image[0x400000..], 0x42);

        let mut payload = vec![0u8; BLOCKS_PER_GROUP * SECTOR_DATA_SIZE];
        for sector in 0..BLOCKS_PER_GROUP {
            payload_fn(
                sector,
                &mut payload[sector * SECTOR_DATA_SIZE..(sector + 1) * SECTOR_DATA_SIZE],
            );
        }
        let mut hash_blocks = <[HashBlock; BLOCKS_PER_GROUP]>::new_box_zeroed().unwrap();
        compute_group_hashes(&payload, &mut hash_blocks);
        tweak(&mut hash_blocks);
        let partition_start = PART_START_SECTOR as usize * SECTOR_SIZE;
        for sector in 0..BLOCKS_PER_GROUP {
            encrypt_sector(
                &hash_blocks[sector],
                array_ref![payload, sector * SECTOR_DATA_SIZE, SECTOR_DATA_SIZE],
                &WII_KEY,
                array_ref_mut![image, partition_start + sector * SECTOR_SIZE, SECTOR_SIZE],
            );
        }

        let views = vec![PartitionView {
            key: WII_KEY,
            data_start_sector: PART_START_SECTOR,
            management_end_sector: PART_START_SECTOR + BLOCKS_PER_GROUP as u32,
            data_end_sector: PART_START_SECTOR + BLOCKS_PER_GROUP as u32,
        }];
        WiiImage { image, views, payload }
    }

    fn wii_options() -> FormatOptions {
        FormatOptions {
            format: Format::Rvz,
            compression: Compression::None,
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        }
    }

    #[test]
    fn test_wii_partition_round_trip() {
        let wii = wii_image(
            |sector, data| match sector {
                3 | 10 => data.fill(0x55),
                5 => data.fill(0),
                _ => fill_pattern(data, sector as u8),
            },
            |_| {},
        );
        let mut reader = assert_round_trip(&wii.image, &wii.views, &wii_options(), 0);
        assert!(reader.supports_read_wii_decrypted());

        // Decrypted payload reads, including a cross-chunk slice.
        let partition_data_offset = PART_START_SECTOR as u64 * SECTOR_SIZE as u64;
        let mut payload = vec![0u8; wii.payload.len()];
        reader.read_wii_decrypted(0, &mut payload, partition_data_offset).unwrap();
        assert_eq!(payload, wii.payload);
        let mut slice = [0u8; 64];
        reader
            .read_wii_decrypted(SECTOR_DATA_SIZE as u64 - 32, &mut slice, partition_data_offset)
            .unwrap();
        assert_eq!(slice[..], wii.payload[SECTOR_DATA_SIZE - 32..SECTOR_DATA_SIZE + 32]);

        let groups = reader.group_entries();
        let partition = &reader.partitions()[0];
        let first_group = partition.partition_data[0].group_index.get() as usize;
        // The all-zero sector stores nothing.
        assert_eq!(groups[first_group + 5].data_size(), 0);
        // The two identical constant sectors share one group entry.
        assert_eq!(groups[first_group + 3], groups[first_group + 10]);
    }

    #[test]
    fn test_wii_reuse_avoids_second_payload() {
        let constant = wii_image(
            |sector, data| match sector {
                3 | 10 => data.fill(0x55),
                _ => fill_pattern(data, sector as u8),
            },
            |_| {},
        );
        let distinct = wii_image(
            |sector, data| match sector {
                3 => data.fill(0x55),
                10 => data.fill(0x66),
                _ => fill_pattern(data, sector as u8),
            },
            |_| {},
        );
        let (file_a, _) = run_convert(&constant.image, &constant.views, &wii_options(), 0);
        let (file_b, _) = run_convert(&distinct.image, &distinct.views, &wii_options(), 0);
        assert!(file_a.len() < file_b.len());
    }

    #[test]
    fn test_wii_hash_exceptions_round_trip() {
        // A source whose stored hashes differ from the recomputed ones: the
        // writer must emit exceptions and the reader must reapply them.
        let wii = wii_image(
            |sector, data| fill_pattern(data, sector as u8),
            |hash_blocks| {
                hash_blocks[7].h1[2] = [0xA5; 20];
                hash_blocks[63].h2[0] = [0x5A; 20];
            },
        );
        assert_round_trip(&wii.image, &wii.views, &wii_options(), 0);
        assert_round_trip(&wii.image, &wii.views, &wii_options(), 2);
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_wii_partition_zstd_round_trip() {
        let wii = wii_image(
            |sector, data| match sector {
                9 => data.fill(0),
                _ => fill_pattern(data, sector as u8),
            },
            |_| {},
        );
        let options = FormatOptions {
            format: Format::Rvz,
            compression: Compression::Zstandard(1),
            chunk_size: 0x8000,
            allow_junk_reuse: true,
        };
        let mut reader = assert_round_trip(&wii.image, &wii.views, &options, 2);
        // The zero sector decodes to zeroes with no exceptions applied.
        let partition_data_offset = PART_START_SECTOR as u64 * SECTOR_SIZE as u64;
        let mut sector = vec![0u8; SECTOR_DATA_SIZE];
        reader
            .read_wii_decrypted(9 * SECTOR_DATA_SIZE as u64, &mut sector, partition_data_offset)
            .unwrap();
        assert!(sector.iter().all(|&b| b == 0));
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_wii_partition_wia_round_trip() {
        let wii = wii_image(
            |sector, data| fill_pattern(data, sector as u8),
            |hash_blocks| {
                hash_blocks[0].h0[0] = [0xEE; 20];
            },
        );
        let options = FormatOptions {
            format: Format::Wia,
            compression: Compression::Lzma(1),
            chunk_size: 0x200000,
            allow_junk_reuse: true,
        };
        assert_round_trip(&wii.image, &wii.views, &options, 0);
    }
}

//! The per-chunk decode engine.
//!
//! A [`Chunk`] owns the buffered compressed input and decoded output for one
//! group of the container. Input is pulled from the file lazily in capped
//! slabs, the codec runs incrementally, and any hash-exception lists are
//! extracted from their position before the payload. Reads with
//! nondecreasing offsets never re-decompress; a failed decode poisons the
//! chunk and every later call fails fast.

use std::{
    io,
    io::{Seek, SeekFrom},
    mem::size_of,
};

use tracing::instrument;
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    format::{ExceptionList, HashException},
    pack::PackDecompressor,
    read::DiscStream,
    util::{
        align_up_64, align_up_usize,
        compress::{DecompressionBuffer, DecompressionKind, Decompressor},
    },
    wii::{BLOCKS_PER_GROUP, HASHES_SIZE, SECTOR_SIZE},
};

/// Upper bound on entries in one exception list: enough to override every
/// hash and all padding of a full group.
const MAX_EXCEPTIONS_PER_LIST: usize =
    (HASHES_SIZE / size_of::<crate::common::HashBytes>() + 1) * BLOCKS_PER_GROUP;

/// The decoder stack: the codec alone, or the codec feeding the pack
/// transform.
enum ChunkDecoder {
    Plain(Decompressor),
    Packed(PackDecompressor),
}

impl ChunkDecoder {
    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        match self {
            ChunkDecoder::Plain(d) => d.decompress(in_buf, out, in_bytes_read),
            ChunkDecoder::Packed(d) => d.decompress(in_buf, out, in_bytes_read),
        }
    }

    /// The raw codec, bypassing the pack transform. Exception lists decode
    /// through this: they precede the packed data and are not packed.
    fn codec_mut(&mut self) -> &mut Decompressor {
        match self {
            ChunkDecoder::Plain(d) => d,
            ChunkDecoder::Packed(d) => d.inner_mut(),
        }
    }
}

/// Decode state for one chunk of the container.
pub struct Chunk {
    in_buf: DecompressionBuffer,
    out: DecompressionBuffer,
    in_bytes_read: usize,
    decoder: ChunkDecoder,
    /// Next file offset to fill `in_buf` from.
    file_offset: u64,
    num_exception_lists: usize,
    compressed_exception_lists: bool,
    exceptions: Vec<ExceptionList>,
    /// Scratch output for decoding compressed exception lists; grown to the
    /// exact byte the parser needs next so no payload lands here.
    exc_buf: DecompressionBuffer,
    /// Start of the list currently being parsed, within `exc_buf` or (for
    /// uncompressed lists) within `in_buf`.
    exc_cursor: usize,
    exceptions_done: bool,
    poisoned: bool,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: &DecompressionKind,
        file_offset: u64,
        compressed_size: u32,
        decompressed_size: u32,
        num_exception_lists: u32,
        compressed_exception_lists: bool,
        rvz_packed_size: u32,
        data_offset: u64,
        junk_id: [u8; 4],
        junk_disc_num: u8,
    ) -> io::Result<Self> {
        let codec = kind.create(decompressed_size as usize)?;
        let decoder = if rvz_packed_size > 0 {
            ChunkDecoder::Packed(PackDecompressor::new(
                codec,
                rvz_packed_size as usize,
                data_offset,
                junk_id,
                junk_disc_num,
            ))
        } else {
            ChunkDecoder::Plain(codec)
        };
        Ok(Self {
            in_buf: DecompressionBuffer::new(compressed_size as usize),
            out: DecompressionBuffer::new(decompressed_size as usize),
            in_bytes_read: 0,
            decoder,
            file_offset,
            num_exception_lists: num_exception_lists as usize,
            compressed_exception_lists,
            exceptions: Vec::new(),
            exc_buf: DecompressionBuffer::new(0),
            exc_cursor: 0,
            exceptions_done: num_exception_lists == 0,
            poisoned: false,
        })
    }

    /// The decoded size of this chunk's payload.
    #[inline]
    pub fn decompressed_size(&self) -> usize { self.out.data.len() }

    /// Copies `[offset, offset + out.len())` of the decoded payload into
    /// `out`, decoding further as needed.
    #[instrument(name = "Chunk::read", skip_all)]
    pub fn read(
        &mut self,
        stream: &mut dyn DiscStream,
        offset: usize,
        out: &mut [u8],
    ) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Chunk poisoned by a previous decode failure",
            ));
        }
        let end = offset + out.len();
        if end > self.out.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Chunk read {:#X}..{:#X} beyond size {:#X}", offset, end, self.out.data.len()),
            ));
        }
        match self.decode_to(stream, end) {
            Ok(()) => {
                out.copy_from_slice(&self.out.data[offset..end]);
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Decodes the whole chunk and returns its payload. Used for the
    /// raw-data and group tables, which are stored as a single chunk.
    pub fn read_all(&mut self, stream: &mut dyn DiscStream) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.out.data.len()];
        self.read(stream, 0, &mut buf)?;
        Ok(buf)
    }

    /// Returns the parsed entries of one exception list with `offset` added
    /// to each entry, for mapping chunk-relative offsets to group-relative
    /// ones. Lists are available once at least one byte of payload has been
    /// read.
    pub fn hash_exceptions(
        &self,
        list_index: usize,
        additional_offset: u16,
    ) -> io::Result<Vec<HashException>> {
        if !self.exceptions_done {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Chunk exception lists have not been decoded",
            ));
        }
        let list = self.exceptions.get(list_index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Chunk exception list {} out of range", list_index),
            )
        })?;
        list.iter()
            .map(|e| {
                let offset = e.offset.get().checked_add(additional_offset).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Hash exception offset {:#X} out of range", e.offset.get()),
                    )
                })?;
                Ok(HashException { offset: offset.into(), hash: e.hash })
            })
            .collect()
    }

    fn decode_to(&mut self, stream: &mut dyn DiscStream, end: usize) -> io::Result<()> {
        while !self.exceptions_done || self.out.bytes_written < end {
            let before =
                (self.in_bytes_read, self.out.bytes_written, self.exc_buf.bytes_written, self.exc_cursor);

            self.parse_exceptions()?;
            if self.exceptions_done && self.out.bytes_written < end {
                self.decoder.decompress(&self.in_buf, &mut self.out, &mut self.in_bytes_read)?;
            }

            if self.exceptions_done && self.out.bytes_written >= end {
                break;
            }
            let after =
                (self.in_bytes_read, self.out.bytes_written, self.exc_buf.bytes_written, self.exc_cursor);
            if after == before && !self.fill_input(stream, end)? {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Premature end of chunk data",
                ));
            }
        }
        Ok(())
    }

    /// Pulls the next slab of compressed data from the file. Returns `false`
    /// when the chunk's stored bytes are exhausted.
    fn fill_input(&mut self, stream: &mut dyn DiscStream, end: usize) -> io::Result<bool> {
        let remaining = self.in_buf.data.len() - self.in_buf.bytes_written;
        if remaining == 0 {
            return Ok(false);
        }
        let bytes_to_read = if end == self.out.data.len() {
            // Read all the remaining data.
            remaining
        } else {
            // The compressed data is probably not much bigger than the
            // decompressed data. Add some slack for compression overhead and
            // exception lists, and align the file access to the sector size.
            let rough = (end - self.out.bytes_written.min(end)) as u64 + 0x100;
            let aligned =
                align_up_64(self.file_offset + rough, SECTOR_SIZE as u64) - self.file_offset;
            (aligned as usize).min(remaining)
        };
        stream.seek(SeekFrom::Start(self.file_offset))?;
        let pos = self.in_buf.bytes_written;
        stream.read_exact(&mut self.in_buf.data[pos..pos + bytes_to_read])?;
        self.in_buf.bytes_written += bytes_to_read;
        self.file_offset += bytes_to_read as u64;
        Ok(true)
    }

    fn parse_exceptions(&mut self) -> io::Result<()> {
        if self.exceptions_done {
            return Ok(());
        }
        if self.compressed_exception_lists {
            self.parse_exceptions_compressed()
        } else {
            self.parse_exceptions_uncompressed()
        }
    }

    /// Uncompressed lists are read straight from the input stream, bypassing
    /// the codec. The cursor is aligned to 4 bytes before the payload.
    fn parse_exceptions_uncompressed(&mut self) -> io::Result<()> {
        let data = &self.in_buf.data[..self.in_buf.bytes_written];
        while self.exceptions.len() < self.num_exception_lists {
            let Some((list, end)) = try_parse_list(data, self.exc_cursor)? else {
                return Ok(()); // need more input
            };
            self.exceptions.push(list);
            self.exc_cursor = end;
        }
        let aligned = align_up_usize(self.exc_cursor, 4);
        if self.in_buf.bytes_written < aligned {
            return Ok(()); // the alignment padding is still unread
        }
        self.in_bytes_read = aligned;
        self.exceptions_done = true;
        Ok(())
    }

    /// Compressed lists are the head of the codec's output stream, with no
    /// alignment. They decode into a scratch buffer that is grown to exactly
    /// the next byte the parser needs, so the payload proper starts cleanly
    /// at `out` position zero.
    fn parse_exceptions_compressed(&mut self) -> io::Result<()> {
        while self.exceptions.len() < self.num_exception_lists {
            let count_end = self.exc_cursor + size_of::<u16>();
            if !self.decode_exc_to(count_end)? {
                return Ok(());
            }
            let count = u16::from_be_bytes(
                self.exc_buf.data[self.exc_cursor..count_end].try_into().unwrap(),
            ) as usize;
            if count > MAX_EXCEPTIONS_PER_LIST {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Chunk exception list too long: {}", count),
                ));
            }
            let list_end = count_end + count * size_of::<HashException>();
            if !self.decode_exc_to(list_end)? {
                return Ok(());
            }
            let list = parse_entries(&self.exc_buf.data[count_end..list_end], count)?;
            self.exceptions.push(list);
            self.exc_cursor = list_end;
        }
        self.exceptions_done = true;
        Ok(())
    }

    /// Decodes the exception stream up to `target` bytes. Returns whether
    /// the target was reached.
    fn decode_exc_to(&mut self, target: usize) -> io::Result<bool> {
        if self.exc_buf.data.len() < target {
            self.exc_buf.data.resize(target, 0);
        }
        while self.exc_buf.bytes_written < target {
            let before = self.exc_buf.bytes_written;
            self.decoder.codec_mut().decompress(
                &self.in_buf,
                &mut self.exc_buf,
                &mut self.in_bytes_read,
            )?;
            if self.exc_buf.bytes_written == before {
                return Ok(false); // need more input
            }
        }
        Ok(true)
    }
}

/// Parses one `{u16 count, entries}` list starting at `offset`, returning
/// the list and the end offset, or `None` if the data is still incomplete.
fn try_parse_list(data: &[u8], offset: usize) -> io::Result<Option<(ExceptionList, usize)>> {
    if data.len() < offset + size_of::<u16>() {
        return Ok(None);
    }
    let count =
        u16::from_be_bytes(data[offset..offset + size_of::<u16>()].try_into().unwrap()) as usize;
    if count > MAX_EXCEPTIONS_PER_LIST {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Chunk exception list too long: {}", count),
        ));
    }
    let entries_start = offset + size_of::<u16>();
    let end = entries_start + count * size_of::<HashException>();
    if data.len() < end {
        return Ok(None);
    }
    Ok(Some((parse_entries(&data[entries_start..end], count)?, end)))
}

fn parse_entries(data: &[u8], count: usize) -> io::Result<ExceptionList> {
    let mut list = <[HashException]>::new_box_zeroed_with_elems(count)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    list.as_mut_bytes().copy_from_slice(data);
    Ok(list)
}

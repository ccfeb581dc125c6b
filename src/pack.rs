//! RVZ pack transform.
//!
//! Inside a packed chunk, the plaintext is stored as a sequence of segments,
//! each prefixed by a big-endian `u32` whose top bit distinguishes junk from
//! raw. A raw segment is followed by its literal bytes. A junk segment
//! carries no payload at all: its bytes are regenerated by seeding a fresh
//! Lagged Fibonacci generator from the disc identity at the current logical
//! data offset, reseeding at every 32 KiB boundary of the offset space.
//! Segments never span chunk boundaries.

use std::{io, mem::size_of};

use crate::{
    util::{
        compress::{DecompressionBuffer, Decompressor},
        lfg::LaggedFibonacci,
    },
    wii::SECTOR_SIZE,
};

const JUNK_FLAG: u32 = 0x8000_0000;

/// Smallest junk run worth tagging: anything shorter costs more in segment
/// words than the bytes it drops.
pub const MIN_JUNK_SIZE: usize = 2 * size_of::<u32>();

/// Incremental decoder for the pack transform, layered over the chunk's
/// codec. The inner decoder produces the packed stream into an intermediate
/// buffer sized from the group entry's packed size; segments are interpreted
/// from there into the caller's output, with junk regenerated from the disc
/// identity and the output position.
pub struct PackDecompressor {
    inner: Decompressor,
    decompressed: DecompressionBuffer,
    decompressed_bytes_read: usize,
    data_offset: u64,
    junk_id: [u8; 4],
    disc_num: u8,
    size: u32,
    junk: bool,
    lfg: LaggedFibonacci,
    done: bool,
}

impl PackDecompressor {
    pub fn new(
        inner: Decompressor,
        rvz_packed_size: usize,
        data_offset: u64,
        junk_id: [u8; 4],
        disc_num: u8,
    ) -> Self {
        Self {
            inner,
            decompressed: DecompressionBuffer::new(rvz_packed_size),
            decompressed_bytes_read: 0,
            data_offset,
            junk_id,
            disc_num,
            size: 0,
            junk: false,
            lfg: LaggedFibonacci::default(),
            done: false,
        }
    }

    #[inline]
    pub fn done(&self) -> bool { self.done }

    /// The wrapped codec. The chunk engine decodes exception lists through
    /// it directly, since they precede the packed data unpacked.
    #[inline]
    pub(crate) fn inner_mut(&mut self) -> &mut Decompressor { &mut self.inner }

    /// Packed bytes decoded but not yet consumed.
    #[inline]
    fn available(&self) -> usize { self.decompressed.bytes_written - self.decompressed_bytes_read }

    /// Drives the inner decoder to produce more of the packed stream.
    /// Returns whether any progress was made; no progress means the caller
    /// has to supply more input first.
    fn pull(&mut self, in_buf: &DecompressionBuffer, in_bytes_read: &mut usize) -> io::Result<bool> {
        if self.decompressed.available() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "RVZ packed segment exceeds the packed size",
            ));
        }
        if self.inner.done() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "RVZ packed stream truncated"));
        }
        let before = self.decompressed.bytes_written;
        self.inner.decompress(in_buf, &mut self.decompressed, in_bytes_read)?;
        Ok(self.decompressed.bytes_written > before)
    }

    /// Same contract as [`Decompressor::decompress`]. `out.bytes_written` is
    /// the position within the chunk's unpacked data, which junk seeding
    /// depends on.
    pub fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        loop {
            if self.done || out.available() == 0 {
                return Ok(());
            }

            if self.size == 0 {
                if self.decompressed_bytes_read == self.decompressed.data.len() {
                    self.done = true;
                    return Ok(());
                }
                if self.available() < size_of::<u32>() {
                    if !self.pull(in_buf, in_bytes_read)? {
                        return Ok(());
                    }
                    continue;
                }
                let word = u32::from_be_bytes(
                    self.decompressed.data
                        [self.decompressed_bytes_read..self.decompressed_bytes_read + 4]
                        .try_into()
                        .unwrap(),
                );
                self.junk = word & JUNK_FLAG != 0;
                self.size = word & !JUNK_FLAG;
                self.decompressed_bytes_read += size_of::<u32>();
                continue;
            }

            if self.junk {
                let len = (self.size as usize).min(out.available());
                let pos = out.bytes_written;
                self.lfg.fill_sector_chunked(
                    &mut out.data[pos..pos + len],
                    self.junk_id,
                    self.disc_num,
                    self.data_offset + pos as u64,
                );
                out.bytes_written += len;
                self.size -= len as u32;
            } else {
                let len = (self.size as usize).min(out.available()).min(self.available());
                if len == 0 {
                    if !self.pull(in_buf, in_bytes_read)? {
                        return Ok(());
                    }
                    continue;
                }
                let pos = out.bytes_written;
                out.data[pos..pos + len].copy_from_slice(
                    &self.decompressed.data
                        [self.decompressed_bytes_read..self.decompressed_bytes_read + len],
                );
                self.decompressed_bytes_read += len;
                out.bytes_written += len;
                self.size -= len as u32;
            }
        }
    }
}

/// The packed form of one chunk.
pub struct PackResult {
    pub data: Vec<u8>,
    /// Whether any junk segment was emitted.
    pub has_junk: bool,
}

/// Packs one chunk of plaintext, tagging runs that match the junk generator
/// at their position.
///
/// `data_offset` is the chunk's offset within its region stream (disc
/// offsets for raw data, payload-stream offsets for partition data); junk
/// detection follows the generator's 32 KiB reseed windows in that offset
/// space, so junk segments never cross a reseed boundary. Runs shorter than
/// [`MIN_JUNK_SIZE`] stay literal.
pub fn pack_chunk(
    data: &[u8],
    data_offset: u64,
    junk_id: [u8; 4],
    disc_num: u8,
    lfg: &mut LaggedFibonacci,
) -> PackResult {
    let mut out = Vec::with_capacity(data.len() + size_of::<u32>());
    let mut has_junk = false;
    let mut pos = 0usize;
    let mut literal_start = 0usize;
    while pos < data.len() {
        let abs = data_offset + pos as u64;
        let matched = lfg.check(&data[pos..], junk_id, disc_num, abs);
        if matched >= MIN_JUNK_SIZE {
            if literal_start < pos {
                push_raw(&mut out, &data[literal_start..pos]);
            }
            out.extend_from_slice(&(matched as u32 | JUNK_FLAG).to_be_bytes());
            has_junk = true;
            pos += matched;
            literal_start = pos;
        } else {
            // No junk here; skip ahead to the next reseed boundary.
            let next = (abs / SECTOR_SIZE as u64 + 1) * SECTOR_SIZE as u64 - data_offset;
            pos = (next as usize).min(data.len());
        }
    }
    if literal_start < data.len() {
        push_raw(&mut out, &data[literal_start..]);
    }
    PackResult { data: out, has_junk }
}

fn push_raw(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::compress::DecompressionKind;

    const JUNK_ID: [u8; 4] = *b"RPTE";

    fn unpack(packed: &[u8], unpacked_size: usize, data_offset: u64) -> Vec<u8> {
        let inner = DecompressionKind::None.create(packed.len()).unwrap();
        let mut decoder = PackDecompressor::new(inner, packed.len(), data_offset, JUNK_ID, 0);
        let in_buf = DecompressionBuffer {
            bytes_written: packed.len(),
            data: packed.to_vec(),
        };
        let mut out = DecompressionBuffer::new(unpacked_size);
        let mut in_bytes_read = 0;
        while !decoder.done() {
            decoder.decompress(&in_buf, &mut out, &mut in_bytes_read).unwrap();
        }
        assert_eq!(out.bytes_written, unpacked_size);
        out.data
    }

    #[test]
    fn test_junk_region_packs_to_single_segment() {
        let offset = 0x20000u64;
        let mut data = vec![0u8; 0x1000];
        let mut lfg = LaggedFibonacci::default();
        lfg.init_with_seed(JUNK_ID, 0, offset);
        lfg.fill(&mut data);

        let result = pack_chunk(&data, offset, JUNK_ID, 0, &mut lfg);
        assert!(result.has_junk);
        // A single junk segment: the tag word alone, no payload bytes.
        assert_eq!(result.data.len(), size_of::<u32>());
        assert_eq!(unpack(&result.data, data.len(), offset), data);
    }

    #[test]
    fn test_mixed_chunk_round_trip() {
        let offset = 0x8000u64;
        let mut data = vec![0u8; 0x10000];
        // First sector: file-like data. Second sector: junk.
        for (i, b) in data[..SECTOR_SIZE].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7);
        }
        let mut lfg = LaggedFibonacci::default();
        lfg.init_with_seed(JUNK_ID, 0, offset + SECTOR_SIZE as u64);
        lfg.fill(&mut data[SECTOR_SIZE..]);

        let result = pack_chunk(&data, offset, JUNK_ID, 0, &mut lfg);
        assert!(result.has_junk);
        // A raw segment for the first sector, a bare tag word for the junk.
        assert_eq!(result.data.len(), 2 * size_of::<u32>() + SECTOR_SIZE);
        assert_eq!(unpack(&result.data, data.len(), offset), data);
    }

    #[test]
    fn test_junk_spanning_reseed_boundaries() {
        // Two adjacent all-junk sectors become two segments, one per reseed
        // window, and regenerate from position alone.
        let offset = 0x10000u64;
        let mut data = vec![0u8; 2 * SECTOR_SIZE];
        let mut lfg = LaggedFibonacci::default();
        lfg.fill_sector_chunked(&mut data, JUNK_ID, 0, offset);

        let result = pack_chunk(&data, offset, JUNK_ID, 0, &mut lfg);
        assert!(result.has_junk);
        assert_eq!(result.data.len(), 2 * size_of::<u32>());
        assert_eq!(unpack(&result.data, data.len(), offset), data);
    }

    #[test]
    fn test_non_junk_stays_literal() {
        let data = vec![0x5Au8; 0x4000];
        let mut lfg = LaggedFibonacci::default();
        let result = pack_chunk(&data, 0, JUNK_ID, 0, &mut lfg);
        assert!(!result.has_junk);
        assert_eq!(result.data.len(), data.len() + size_of::<u32>());
        assert_eq!(unpack(&result.data, data.len(), 0), data);
    }

    #[test]
    fn test_short_junk_stays_literal() {
        let mut data = vec![0xA5u8; 0x200];
        let mut lfg = LaggedFibonacci::default();
        lfg.init_with_seed(JUNK_ID, 0, 0);
        // Less than MIN_JUNK_SIZE bytes of junk at the start.
        lfg.fill(&mut data[..4]);

        let result = pack_chunk(&data, 0, JUNK_ID, 0, &mut lfg);
        assert!(!result.has_junk);
        assert_eq!(unpack(&result.data, data.len(), 0), data);
    }
}

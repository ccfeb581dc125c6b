use std::{io, mem::size_of};

use sha1::{Digest, Sha1};
use tracing::instrument;
use zerocopy::IntoBytes;

use crate::{
    common::{Compression, HashBytes},
    format::{CompressionType, DiscInfo, PurgeSegment},
    Error, Result,
};

/// An incrementally filled buffer shared between the chunk engine and the
/// codec adapters. `data` is allocated to its final size up front;
/// `bytes_written` tracks how much of it holds valid bytes so far.
pub struct DecompressionBuffer {
    pub data: Vec<u8>,
    pub bytes_written: usize,
}

impl DecompressionBuffer {
    pub fn new(size: usize) -> Self { Self { data: vec![0u8; size], bytes_written: 0 } }

    /// Remaining capacity.
    #[inline]
    pub fn available(&self) -> usize { self.data.len() - self.bytes_written }
}

/// The container's decompression configuration, cheap to clone per chunk.
#[derive(Debug, Clone)]
pub enum DecompressionKind {
    None,
    Purge,
    #[cfg(feature = "compress-bzip2")]
    Bzip2,
    #[cfg(feature = "compress-lzma")]
    Lzma(Box<[u8]>),
    #[cfg(feature = "compress-lzma")]
    Lzma2(Box<[u8]>),
    #[cfg(feature = "compress-zstd")]
    Zstandard,
}

impl DecompressionKind {
    pub fn from_disc_info(disc: &DiscInfo) -> Result<Self> {
        let _data = disc.compr_data();
        match disc.compression() {
            CompressionType::None => Ok(Self::None),
            CompressionType::Purge => Ok(Self::Purge),
            #[cfg(feature = "compress-bzip2")]
            CompressionType::Bzip2 => Ok(Self::Bzip2),
            #[cfg(feature = "compress-lzma")]
            CompressionType::Lzma => Ok(Self::Lzma(Box::from(_data))),
            #[cfg(feature = "compress-lzma")]
            CompressionType::Lzma2 => Ok(Self::Lzma2(Box::from(_data))),
            #[cfg(feature = "compress-zstd")]
            CompressionType::Zstandard => Ok(Self::Zstandard),
            #[allow(unreachable_patterns)] // if compression features are disabled
            comp => Err(Error::UnsupportedCompression(format!(
                "WIA/RVZ compression: {:?}",
                comp
            ))),
        }
    }

    /// Creates a decoder for one chunk. `decompressed_size` is the expected
    /// codec output size, needed by Purge to place its trailing zero fill.
    pub fn create(&self, decompressed_size: usize) -> io::Result<Decompressor> {
        Ok(match self {
            DecompressionKind::None => Decompressor::None(NoneDecompressor::default()),
            DecompressionKind::Purge => {
                Decompressor::Purge(Box::new(PurgeDecompressor::new(decompressed_size)))
            }
            #[cfg(feature = "compress-bzip2")]
            DecompressionKind::Bzip2 => Decompressor::Bzip2(Bzip2Decompressor::new()),
            #[cfg(feature = "compress-lzma")]
            DecompressionKind::Lzma(data) => {
                let options = lzma_util::lzma_props_decode(data)?;
                Decompressor::Lzma(LzmaDecompressor::new_lzma(&options)?)
            }
            #[cfg(feature = "compress-lzma")]
            DecompressionKind::Lzma2(data) => {
                let options = lzma_util::lzma2_props_decode(data)?;
                Decompressor::Lzma(LzmaDecompressor::new_lzma2(&options)?)
            }
            #[cfg(feature = "compress-zstd")]
            DecompressionKind::Zstandard => Decompressor::Zstandard(ZstdDecompressor::new()),
        })
    }
}

/// An incremental, resumable decoder for one chunk.
///
/// The uniform contract: [`decompress`](Self::decompress) consumes up to
/// `in_buf.bytes_written - *in_bytes_read` input bytes, writes up to
/// [`DecompressionBuffer::available`] output bytes, advances both cursors,
/// and makes forward progress whenever at least one byte of input is
/// available and output capacity remains. [`done`](Self::done) reports that
/// the logical end of the stream has been reached. A decoder error is
/// terminal: the owning chunk is poisoned and fails all further reads.
pub enum Decompressor {
    None(NoneDecompressor),
    Purge(Box<PurgeDecompressor>),
    #[cfg(feature = "compress-bzip2")]
    Bzip2(Bzip2Decompressor),
    #[cfg(feature = "compress-lzma")]
    Lzma(LzmaDecompressor),
    #[cfg(feature = "compress-zstd")]
    Zstandard(ZstdDecompressor),
}

impl Decompressor {
    #[instrument(name = "Decompressor::decompress", skip_all)]
    pub fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        match self {
            Decompressor::None(d) => d.decompress(in_buf, out, in_bytes_read),
            Decompressor::Purge(d) => d.decompress(in_buf, out, in_bytes_read),
            #[cfg(feature = "compress-bzip2")]
            Decompressor::Bzip2(d) => d.decompress(in_buf, out, in_bytes_read),
            #[cfg(feature = "compress-lzma")]
            Decompressor::Lzma(d) => d.decompress(in_buf, out, in_bytes_read),
            #[cfg(feature = "compress-zstd")]
            Decompressor::Zstandard(d) => d.decompress(in_buf, out, in_bytes_read),
        }
    }

    pub fn done(&self) -> bool {
        match self {
            Decompressor::None(d) => d.done,
            Decompressor::Purge(d) => d.done,
            #[cfg(feature = "compress-bzip2")]
            Decompressor::Bzip2(d) => d.done,
            #[cfg(feature = "compress-lzma")]
            Decompressor::Lzma(d) => d.done,
            #[cfg(feature = "compress-zstd")]
            Decompressor::Zstandard(d) => d.done,
        }
    }
}

/// Identity codec. The output length is known from the chunk, so the stream
/// ends when all input has been consumed.
#[derive(Default)]
pub struct NoneDecompressor {
    done: bool,
}

impl NoneDecompressor {
    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        let len = (in_buf.bytes_written - *in_bytes_read).min(out.available());
        let offset = out.bytes_written;
        out.data[offset..offset + len].copy_from_slice(&in_buf.data[*in_bytes_read..*in_bytes_read + len]);
        *in_bytes_read += len;
        out.bytes_written += len;
        self.done = *in_bytes_read == in_buf.data.len();
        Ok(())
    }
}

/// Purge codec: a sequence of `{offset, size, bytes}` segments over an
/// otherwise zero chunk, terminated by a SHA-1 of the chunk's uncompressed
/// exception lists (consumed from the input before the first segment)
/// followed by the segment stream itself.
pub struct PurgeDecompressor {
    decompressed_size: usize,
    segment: PurgeSegment,
    segment_bytes_written: usize,
    out_bytes_written: usize,
    hasher: Sha1,
    started: bool,
    done: bool,
}

impl PurgeDecompressor {
    fn new(decompressed_size: usize) -> Self {
        Self {
            decompressed_size,
            segment: PurgeSegment { offset: 0.into(), size: 0.into() },
            segment_bytes_written: 0,
            out_bytes_written: 0,
            hasher: Sha1::new(),
            started: false,
            done: false,
        }
    }

    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        if !self.started {
            if in_buf.data.len() < *in_bytes_read + size_of::<HashBytes>() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "Purge stream too short"));
            }
            // The exception lists are stored uncompressed before the first
            // segment and are included in the hash. The caller has already
            // advanced the cursor past them.
            self.hasher.update(&in_buf.data[..*in_bytes_read]);
            self.started = true;
        }

        while !self.done
            && in_buf.bytes_written != *in_bytes_read
            && (self.segment_bytes_written < size_of::<PurgeSegment>() || out.available() != 0)
        {
            if self.segment_bytes_written == 0
                && *in_bytes_read == in_buf.data.len() - size_of::<HashBytes>()
            {
                // Every segment has been consumed; the rest of the output is
                // zero and the input ends with the stream hash.
                let zeroes = (self.decompressed_size - self.out_bytes_written).min(out.available());
                let offset = out.bytes_written;
                out.data[offset..offset + zeroes].fill(0);
                out.bytes_written += zeroes;
                self.out_bytes_written += zeroes;

                if self.out_bytes_written == self.decompressed_size
                    && in_buf.bytes_written == in_buf.data.len()
                {
                    let actual: HashBytes = self.hasher.clone().finalize().into();
                    let stored = &in_buf.data[*in_bytes_read..*in_bytes_read + size_of::<HashBytes>()];
                    *in_bytes_read += size_of::<HashBytes>();
                    self.done = true;
                    if actual.as_slice() != stored {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "Purge stream hash mismatch",
                        ));
                    }
                }
                return Ok(());
            }

            if self.segment_bytes_written < size_of::<PurgeSegment>() {
                let len = (in_buf.bytes_written - *in_bytes_read)
                    .min(size_of::<PurgeSegment>() - self.segment_bytes_written);
                let src = &in_buf.data[*in_bytes_read..*in_bytes_read + len];
                self.segment.as_mut_bytes()
                    [self.segment_bytes_written..self.segment_bytes_written + len]
                    .copy_from_slice(src);
                self.hasher.update(src);
                *in_bytes_read += len;
                self.segment_bytes_written += len;
                if self.segment_bytes_written < size_of::<PurgeSegment>() {
                    return Ok(());
                }
                // Validate each segment once, as its header completes.
                let offset = self.segment.offset.get() as usize;
                let size = self.segment.size.get() as usize;
                if offset + size > self.decompressed_size || offset < self.out_bytes_written {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Purge segment out of range",
                    ));
                }
            }

            let offset = self.segment.offset.get() as usize;
            let size = self.segment.size.get() as usize;

            if self.out_bytes_written < offset {
                let zeroes = (offset - self.out_bytes_written).min(out.available());
                let pos = out.bytes_written;
                out.data[pos..pos + zeroes].fill(0);
                out.bytes_written += zeroes;
                self.out_bytes_written += zeroes;
            }

            if self.out_bytes_written >= offset && self.out_bytes_written < offset + size {
                let len = (offset + size - self.out_bytes_written)
                    .min(out.available())
                    .min(in_buf.bytes_written - *in_bytes_read);
                let src = &in_buf.data[*in_bytes_read..*in_bytes_read + len];
                let pos = out.bytes_written;
                out.data[pos..pos + len].copy_from_slice(src);
                self.hasher.update(src);
                *in_bytes_read += len;
                out.bytes_written += len;
                self.out_bytes_written += len;
            }

            if self.out_bytes_written >= offset + size {
                self.segment_bytes_written = 0;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "compress-bzip2")]
pub struct Bzip2Decompressor {
    stream: bzip2::Decompress,
    done: bool,
}

#[cfg(feature = "compress-bzip2")]
impl Bzip2Decompressor {
    fn new() -> Self { Self { stream: bzip2::Decompress::new(false), done: false } }

    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        let input = &in_buf.data[*in_bytes_read..in_buf.bytes_written];
        if input.is_empty() || out.available() == 0 || self.done {
            return Ok(());
        }
        let in_before = self.stream.total_in();
        let out_before = self.stream.total_out();
        let offset = out.bytes_written;
        let status = self
            .stream
            .decompress(input, &mut out.data[offset..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        *in_bytes_read += (self.stream.total_in() - in_before) as usize;
        out.bytes_written += (self.stream.total_out() - out_before) as usize;
        match status {
            bzip2::Status::StreamEnd => self.done = true,
            bzip2::Status::Ok | bzip2::Status::RunOk | bzip2::Status::FlushOk
            | bzip2::Status::FinishOk => {}
            status => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Bzip2 decompression status {:?}", status),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(feature = "compress-lzma")]
pub struct LzmaDecompressor {
    stream: liblzma::stream::Stream,
    done: bool,
}

#[cfg(feature = "compress-lzma")]
impl LzmaDecompressor {
    fn new_lzma(options: &liblzma::stream::LzmaOptions) -> io::Result<Self> {
        Ok(Self { stream: lzma_util::new_lzma_decoder(options)?, done: false })
    }

    fn new_lzma2(options: &liblzma::stream::LzmaOptions) -> io::Result<Self> {
        Ok(Self { stream: lzma_util::new_lzma2_decoder(options)?, done: false })
    }

    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        let input = &in_buf.data[*in_bytes_read..in_buf.bytes_written];
        if (input.is_empty() && out.available() == 0) || self.done {
            return Ok(());
        }
        let in_before = self.stream.total_in();
        let out_before = self.stream.total_out();
        let offset = out.bytes_written;
        let status =
            self.stream.process(input, &mut out.data[offset..], liblzma::stream::Action::Run)?;
        *in_bytes_read += (self.stream.total_in() - in_before) as usize;
        out.bytes_written += (self.stream.total_out() - out_before) as usize;
        if status == liblzma::stream::Status::StreamEnd {
            self.done = true;
        }
        Ok(())
    }
}

#[cfg(feature = "compress-zstd")]
pub struct ZstdDecompressor {
    ctx: zstd_safe::DCtx<'static>,
    done: bool,
}

#[cfg(feature = "compress-zstd")]
impl ZstdDecompressor {
    fn new() -> Self { Self { ctx: zstd_safe::DCtx::create(), done: false } }

    fn decompress(
        &mut self,
        in_buf: &DecompressionBuffer,
        out: &mut DecompressionBuffer,
        in_bytes_read: &mut usize,
    ) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        let mut input = zstd_safe::InBuffer::around(&in_buf.data[*in_bytes_read..in_buf.bytes_written]);
        let mut output = zstd_safe::OutBuffer::around_pos(out.data.as_mut_slice(), out.bytes_written);
        let hint =
            self.ctx.decompress_stream(&mut output, &mut input).map_err(zstd_util::map_error_code)?;
        *in_bytes_read += input.pos;
        out.bytes_written = output.pos();
        if hint == 0 {
            // The frame is complete; it may lack a known content size, so
            // this is the only end-of-stream signal.
            self.done = true;
        }
        Ok(())
    }
}

/// The compression half of the codec adapters. Compresses a whole chunk into
/// an internal buffer whose capacity is never extended; a result of `false`
/// means the output did not fit (RVZ then stores the chunk uncompressed).
pub struct Compressor {
    pub kind: Compression,
    pub cache: CompressorCache,
    pub buffer: Vec<u8>,
}

impl Clone for Compressor {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            cache: CompressorCache::default(),
            buffer: Vec::with_capacity(self.buffer.capacity()),
        }
    }
}

/// Compressor state reused across chunks where the codec supports it.
#[derive(Default)]
pub enum CompressorCache {
    #[default]
    None,
    #[cfg(feature = "compress-zstd")]
    Zstandard(zstd_safe::CCtx<'static>),
}

impl Compressor {
    pub fn new(kind: Compression, buffer_size: usize) -> Self {
        Self { kind, cache: CompressorCache::default(), buffer: Vec::with_capacity(buffer_size) }
    }

    /// Compresses the given buffer. Returns `false` if the compressed data
    /// did not fit the buffer's capacity.
    #[instrument(name = "Compressor::compress", skip_all)]
    pub fn compress(&mut self, buf: &[u8]) -> io::Result<bool> {
        self.compress_purge(&[], buf)
    }

    /// Same as [`compress`](Self::compress), with preceding bytes that the
    /// Purge codec folds into its stream hash without storing them. Other
    /// codecs ignore `preceding`; their callers compress the exception lists
    /// together with the payload instead.
    pub fn compress_purge(&mut self, preceding: &[u8], buf: &[u8]) -> io::Result<bool> {
        self.buffer.clear();
        match self.kind {
            Compression::None => {
                if self.buffer.capacity() >= buf.len() {
                    self.buffer.extend_from_slice(buf);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Compression::Purge => {
                let mut hasher = Sha1::new();
                hasher.update(preceding);
                let mut bytes_read = 0usize;
                loop {
                    let Some(first) = buf[bytes_read..].iter().position(|&x| x != 0) else {
                        break;
                    };
                    let start = bytes_read + first;
                    // Only break the segment for zero runs longer than a
                    // segment header, otherwise the header costs more than
                    // the zeroes it skips.
                    let mut end = start;
                    let mut zero_run = 0usize;
                    for (i, &x) in buf.iter().enumerate().skip(start) {
                        if x == 0 {
                            zero_run += 1;
                        } else {
                            zero_run = 0;
                            end = i + 1;
                        }
                        if zero_run > size_of::<PurgeSegment>() {
                            break;
                        }
                    }
                    let segment = PurgeSegment {
                        offset: (start as u32).into(),
                        size: ((end - start) as u32).into(),
                    };
                    if self.buffer.len() + size_of::<PurgeSegment>() + (end - start)
                        > self.buffer.capacity()
                    {
                        return Ok(false);
                    }
                    self.buffer.extend_from_slice(segment.as_bytes());
                    self.buffer.extend_from_slice(&buf[start..end]);
                    bytes_read = end;
                }
                hasher.update(&self.buffer);
                if self.buffer.len() + size_of::<HashBytes>() > self.buffer.capacity() {
                    return Ok(false);
                }
                let hash: HashBytes = hasher.finalize().into();
                self.buffer.extend_from_slice(&hash);
                Ok(true)
            }
            #[cfg(feature = "compress-bzip2")]
            Compression::Bzip2(level) => {
                let compression = bzip2::Compression::new(level as u32);
                let mut compress = bzip2::Compress::new(compression, 30);
                let status = compress.compress_vec(buf, &mut self.buffer, bzip2::Action::Finish)?;
                Ok(status == bzip2::Status::StreamEnd)
            }
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma(level) => {
                let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
                let mut encoder = lzma_util::new_lzma_encoder(&options)?;
                let status =
                    encoder.process_vec(buf, &mut self.buffer, liblzma::stream::Action::Finish)?;
                Ok(status == liblzma::stream::Status::StreamEnd)
            }
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma2(level) => {
                let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
                let mut encoder = lzma_util::new_lzma2_encoder(&options)?;
                let status =
                    encoder.process_vec(buf, &mut self.buffer, liblzma::stream::Action::Finish)?;
                Ok(status == liblzma::stream::Status::StreamEnd)
            }
            #[cfg(feature = "compress-zstd")]
            Compression::Zstandard(level) => {
                let ctx = match &mut self.cache {
                    CompressorCache::Zstandard(compressor) => compressor,
                    _ => {
                        let mut ctx = zstd_safe::CCtx::create();
                        ctx.init(level as i32).map_err(zstd_util::map_error_code)?;
                        ctx.set_parameter(zstd_safe::CParameter::ContentSizeFlag(true))
                            .map_err(zstd_util::map_error_code)?;
                        self.cache = CompressorCache::Zstandard(ctx);
                        match &mut self.cache {
                            CompressorCache::Zstandard(compressor) => compressor,
                            _ => unreachable!(),
                        }
                    }
                };
                match ctx.compress2(&mut self.buffer, buf) {
                    Ok(_) => Ok(true),
                    // dstSize_tooSmall
                    Err(e) if e == -70isize as usize => Ok(false),
                    Err(e) => Err(zstd_util::map_error_code(e)),
                }
            }
            #[allow(unreachable_patterns)] // if compression features are disabled
            _ => Err(io::Error::other(format!("Unsupported compression: {:?}", self.kind))),
        }
    }
}

/// Worst-case compressed size for a chunk of `size` bytes.
pub fn compress_bound(compression: Compression, size: usize) -> usize {
    match compression {
        Compression::None => size,
        Compression::Purge => size + size_of::<PurgeSegment>() + size_of::<HashBytes>(),
        Compression::Bzip2(_) => {
            // 1.25 * size
            size.div_ceil(4) + size
        }
        Compression::Lzma(_) => {
            // 1.1 * size + 64 KiB
            size.div_ceil(10) + size + 64000
        }
        Compression::Lzma2(_) => {
            // 1.001 * size + 1 KiB
            size.div_ceil(1000) + size + 1000
        }
        #[cfg(feature = "compress-zstd")]
        Compression::Zstandard(_) => zstd_safe::compress_bound(size),
        #[allow(unreachable_patterns)]
        _ => unimplemented!("compress_bound {:?}", compression),
    }
}

#[cfg(feature = "compress-lzma")]
pub mod lzma_util {
    use std::{
        cmp::Ordering,
        io::{Error, ErrorKind, Result},
    };

    use liblzma::stream::{Filters, LzmaOptions, Stream};

    use crate::util::{array_ref, array_ref_mut, static_assert};

    /// Decodes the LZMA Properties byte (lc/lp/pb).
    /// See `lzma_lzma_lclppb_decode` in `liblzma/lzma/lzma_decoder.c`.
    pub fn lzma_lclppb_decode(options: &mut LzmaOptions, byte: u8) -> Result<()> {
        let mut d = byte as u32;
        if d >= (9 * 5 * 5) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid LZMA props byte: {}", d),
            ));
        }
        options.literal_context_bits(d % 9);
        d /= 9;
        options.position_bits(d / 5);
        options.literal_position_bits(d % 5);
        Ok(())
    }

    /// Encodes the LZMA Properties byte (lc/lp/pb).
    /// See `lzma_lzma_lclppb_encode` in `liblzma/lzma/lzma_encoder.c`.
    pub fn lzma_lclppb_encode(options: &LzmaOptions) -> Result<u8> {
        let options = get_options_sys(options);
        let byte = (options.pb * 5 + options.lp) * 9 + options.lc;
        if byte >= (9 * 5 * 5) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid LZMA props byte: {}", byte),
            ));
        }
        Ok(byte as u8)
    }

    /// Decodes LZMA properties.
    /// See `lzma_lzma_props_decode` in `liblzma/lzma/lzma_decoder.c`.
    pub fn lzma_props_decode(props: &[u8]) -> Result<LzmaOptions> {
        if props.len() != 5 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid LZMA props length: {}", props.len()),
            ));
        }
        let mut options = LzmaOptions::new();
        lzma_lclppb_decode(&mut options, props[0])?;
        options.dict_size(u32::from_le_bytes(*array_ref![props, 1, 4]));
        Ok(options)
    }

    /// Encodes LZMA properties.
    /// See `lzma_lzma_props_encode` in `liblzma/lzma/lzma_encoder.c`.
    pub fn lzma_props_encode(options: &LzmaOptions) -> Result<[u8; 5]> {
        let mut props = [0u8; 5];
        props[0] = lzma_lclppb_encode(options)?;
        *array_ref_mut![props, 1, 4] = get_options_sys(options).dict_size.to_le_bytes();
        Ok(props)
    }

    /// Decodes LZMA2 properties: a single byte `p` encoding the dictionary
    /// size as `(2 | (p & 1)) << (p / 2 + 11)`, with `p == 40` meaning the
    /// maximum dictionary size and anything above 40 invalid.
    /// See `lzma_lzma2_props_decode` in `liblzma/lzma/lzma2_decoder.c`.
    pub fn lzma2_props_decode(props: &[u8]) -> Result<LzmaOptions> {
        if props.len() != 1 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid LZMA2 props length: {}", props.len()),
            ));
        }
        let d = props[0] as u32;
        let mut options = LzmaOptions::new();
        options.dict_size(match d.cmp(&40) {
            Ordering::Greater => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Invalid LZMA2 props byte: {}", d),
                ));
            }
            Ordering::Equal => u32::MAX,
            Ordering::Less => (2 | (d & 1)) << (d / 2 + 11),
        });
        Ok(options)
    }

    /// Encodes LZMA2 properties.
    /// See `lzma_lzma2_props_encode` in `liblzma/lzma/lzma2_encoder.c`.
    pub fn lzma2_props_encode(options: &LzmaOptions) -> Result<[u8; 1]> {
        let options = get_options_sys(options);
        let mut d = options.dict_size.max(liblzma_sys::LZMA_DICT_SIZE_MIN);

        // Round up to the next 2^n - 1 or 2^n + 2^(n - 1) - 1 depending
        // on which one is the next:
        d -= 1;
        d |= d >> 2;
        d |= d >> 3;
        d |= d >> 4;
        d |= d >> 8;
        d |= d >> 16;

        // Get the highest two bits using the proper encoding:
        if d == u32::MAX {
            d = 40;
        } else {
            d = get_dist_slot(d + 1) - 24;
        }

        Ok([d as u8])
    }

    /// Creates a new raw LZMA decoder with the given options.
    pub fn new_lzma_decoder(options: &LzmaOptions) -> Result<Stream> {
        let mut filters = Filters::new();
        filters.lzma1(options);
        Stream::new_raw_decoder(&filters).map_err(Error::from)
    }

    /// Creates a new raw LZMA encoder with the given options.
    pub fn new_lzma_encoder(options: &LzmaOptions) -> Result<Stream> {
        let mut filters = Filters::new();
        filters.lzma1(options);
        Stream::new_raw_encoder(&filters).map_err(Error::from)
    }

    /// Creates a new raw LZMA2 decoder with the given options.
    pub fn new_lzma2_decoder(options: &LzmaOptions) -> Result<Stream> {
        let mut filters = Filters::new();
        filters.lzma2(options);
        Stream::new_raw_decoder(&filters).map_err(Error::from)
    }

    /// Creates a new raw LZMA2 encoder with the given options.
    pub fn new_lzma2_encoder(options: &LzmaOptions) -> Result<Stream> {
        let mut filters = Filters::new();
        filters.lzma2(options);
        Stream::new_raw_encoder(&filters).map_err(Error::from)
    }

    /// liblzma does not expose any accessors for `LzmaOptions`, so we have to
    /// cast it into the internal `lzma_options_lzma` struct.
    #[inline]
    fn get_options_sys(options: &LzmaOptions) -> &liblzma_sys::lzma_options_lzma {
        static_assert!(size_of::<LzmaOptions>() == size_of::<liblzma_sys::lzma_options_lzma>());
        unsafe { &*(options as *const LzmaOptions as *const liblzma_sys::lzma_options_lzma) }
    }

    /// See `get_dist_slot` in `liblzma/lzma/fastpos.h`.
    fn get_dist_slot(dist: u32) -> u32 {
        if dist <= 4 {
            dist
        } else {
            let i = dist.leading_zeros() ^ 31;
            (i + i) + ((dist >> (i - 1)) & 1)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_lzma2_dict_size_decode() {
            fn dict_size(p: u8) -> u32 {
                let options = lzma2_props_decode(&[p]).unwrap();
                unsafe {
                    (*(&options as *const LzmaOptions as *const liblzma_sys::lzma_options_lzma))
                        .dict_size
                }
            }
            assert_eq!(dict_size(0), 0x1000);
            assert_eq!(dict_size(1), 0x1800);
            assert_eq!(dict_size(2), 0x2000);
            assert_eq!(dict_size(40), u32::MAX);
            assert!(lzma2_props_decode(&[41]).is_err());
        }

        #[test]
        fn test_lzma2_props_round_trip() {
            for p in [0u8, 5, 19, 24, 40] {
                let options = lzma2_props_decode(&[p]).unwrap();
                assert_eq!(lzma2_props_encode(&options).unwrap(), [p]);
            }
        }
    }
}

#[cfg(feature = "compress-zstd")]
pub mod zstd_util {
    use std::io;

    pub fn map_error_code(code: usize) -> io::Error {
        io::Error::other(zstd_safe::get_error_name(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_payload(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for (i, b) in data.iter_mut().enumerate() {
            // Compressible but not trivial
            *b = ((i / 7) as u8).wrapping_mul(31) ^ (i as u8 & 0x0F);
        }
        data
    }

    /// Drip-feeds the compressed stream one byte at a time to exercise the
    /// partial-input paths of the incremental decoders.
    fn drip_decode(kind: &DecompressionKind, compressed: &[u8], decompressed_size: usize) -> Vec<u8> {
        let mut decompressor = kind.create(decompressed_size).unwrap();
        let mut in_buf = DecompressionBuffer::new(compressed.len());
        let mut out = DecompressionBuffer::new(decompressed_size);
        let mut in_bytes_read = 0;
        let mut stalled = 0;
        while !decompressor.done() {
            if in_buf.bytes_written < compressed.len() {
                in_buf.data[in_buf.bytes_written] = compressed[in_buf.bytes_written];
                in_buf.bytes_written += 1;
            }
            let before = (in_bytes_read, out.bytes_written);
            decompressor.decompress(&in_buf, &mut out, &mut in_bytes_read).unwrap();
            if (in_bytes_read, out.bytes_written) == before
                && in_buf.bytes_written == compressed.len()
            {
                stalled += 1;
                assert!(stalled < 3, "decoder stalled");
            } else {
                stalled = 0;
            }
        }
        out.data.truncate(out.bytes_written);
        out.data
    }

    fn compress(kind: Compression, data: &[u8]) -> Vec<u8> {
        let mut compressor = Compressor::new(kind, compress_bound(kind, data.len()));
        assert!(compressor.compress(data).unwrap());
        compressor.buffer.clone()
    }

    #[test]
    fn test_none_round_trip() {
        let data = test_payload(0x4000);
        assert_eq!(drip_decode(&DecompressionKind::None, &data, data.len()), data);
    }

    #[test]
    fn test_purge_round_trip() {
        let mut data = vec![0u8; 0x8000];
        data[100..104].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let compressed = compress(Compression::Purge, &data);
        // One segment header, four payload bytes, and the stream hash.
        assert_eq!(compressed.len(), 8 + 4 + 20);
        assert_eq!(drip_decode(&DecompressionKind::Purge, &compressed, data.len()), data);
    }

    #[test]
    fn test_purge_hash_mismatch() {
        let mut data = vec![0u8; 0x8000];
        data[100..104].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut compressed = compress(Compression::Purge, &data);
        let last = compressed.len() - 1;
        compressed[last] ^= 1;

        let mut decompressor = DecompressionKind::Purge.create(data.len()).unwrap();
        let in_buf =
            DecompressionBuffer { bytes_written: compressed.len(), data: compressed };
        let mut out = DecompressionBuffer::new(data.len());
        let mut in_bytes_read = 0;
        let mut result = Ok(());
        while !decompressor.done() {
            result = decompressor.decompress(&in_buf, &mut out, &mut in_bytes_read);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_purge_zero_run_policy() {
        // A short zero run stays inside one segment; a long one splits.
        let mut data = vec![0u8; 0x1000];
        data[0] = 1;
        data[5] = 1; // 4 zeroes between: same segment
        data[100] = 1; // 94 zeroes between: new segment
        let compressed = compress(Compression::Purge, &data);
        assert_eq!(compressed.len(), (8 + 6) + (8 + 1) + 20);
        assert_eq!(drip_decode(&DecompressionKind::Purge, &compressed, data.len()), data);
    }

    #[cfg(feature = "compress-bzip2")]
    #[test]
    fn test_bzip2_round_trip() {
        let data = test_payload(0x8000);
        let compressed = compress(Compression::Bzip2(9), &data);
        assert_eq!(drip_decode(&DecompressionKind::Bzip2, &compressed, data.len()), data);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_lzma_round_trip() {
        let data = test_payload(0x8000);
        let compressed = compress(Compression::Lzma(6), &data);
        let options = liblzma::stream::LzmaOptions::new_preset(6).unwrap();
        let props = lzma_util::lzma_props_encode(&options).unwrap();
        let kind = DecompressionKind::Lzma(Box::from(props.as_slice()));
        assert_eq!(drip_decode(&kind, &compressed, data.len()), data);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_lzma2_round_trip() {
        let data = test_payload(0x8000);
        let compressed = compress(Compression::Lzma2(6), &data);
        let options = liblzma::stream::LzmaOptions::new_preset(6).unwrap();
        let props = lzma_util::lzma2_props_encode(&options).unwrap();
        let kind = DecompressionKind::Lzma2(Box::from(props.as_slice()));
        assert_eq!(drip_decode(&kind, &compressed, data.len()), data);
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_zstd_round_trip() {
        let data = test_payload(0x8000);
        let compressed = compress(Compression::Zstandard(19), &data);
        assert_eq!(drip_decode(&DecompressionKind::Zstandard, &compressed, data.len()), data);
    }
}

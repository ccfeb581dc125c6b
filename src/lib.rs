#![warn(missing_docs)]
//! Library for reading & writing WIA and RVZ compressed GameCube/Wii disc
//! images.
//!
//! Both container formats store the logical disc image divided into
//! fixed-size chunks, each independently compressed with one of several
//! codecs. Wii partition data is stored decrypted with its hash blocks
//! stripped; the reader recomputes the hashes on the fly and applies the
//! stored hash exceptions to reproduce the original image bit-for-bit. The
//! RVZ variant additionally "packs" chunk data, replacing deterministic junk
//! padding with a small seed from which it can be regenerated.
//!
//! # Examples
//!
//! Reading from an RVZ file:
//!
//! ```no_run
//! use wiarvz::read::{BlobReader, WiaRvzReader};
//!
//! let mut reader =
//!     WiaRvzReader::open("path/to/file.rvz").expect("Failed to open image");
//! let mut buf = vec![0u8; 0x8000];
//! reader.read(0, &mut buf).expect("Failed to read first sector");
//! ```
//!
//! Converting an ISO to RVZ:
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufWriter;
//!
//! use wiarvz::common::Format;
//! use wiarvz::read::open_iso;
//! use wiarvz::write::{convert, FormatOptions, ProcessOptions};
//!
//! let reader = open_iso("path/to/file.iso").expect("Failed to open ISO");
//! let mut out = BufWriter::new(File::create("output.rvz").expect("Failed to create file"));
//! let options = FormatOptions::new(Format::Rvz);
//! // GameCube discs have no partitions; for Wii discs, pass the volume's
//! // partition views so their data is stored decrypted and hash-stripped.
//! let summary = convert(reader, &[], &mut out, &options, &ProcessOptions::default(), |progress| {
//!     println!("{}/{} groups", progress.groups_written, progress.total_groups);
//!     true
//! })
//! .expect("Conversion failed");
//! println!("CRC32: {:08X?}", summary.crc32);
//! ```

pub(crate) mod chunk;
pub mod common;
pub mod format;
pub(crate) mod pack;
pub mod read;
pub mod util;
pub mod wii;
pub mod write;

/// Error types for wiarvz.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A general I/O error.
    #[error("{0}")]
    Io(String, #[source] std::io::Error),
    /// The container headers are malformed: bad magic, version, size, or
    /// integrity hash.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    /// A chunk failed to decode: codec error, exception-list overrun, or
    /// embedded hash mismatch. The chunk is poisoned and further reads from
    /// it fail.
    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),
    /// The container uses a compression method this build does not support,
    /// or carries invalid compressor parameters.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),
    /// The container's data ranges overlap.
    #[error("data overlap: {0}")]
    DataOverlap(String),
    /// A conversion failed: codec initialization, source read, or output
    /// write. The partial output file is invalid.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// The progress callback requested an abort. The partial output file is
    /// invalid.
    #[error("conversion aborted by callback")]
    CallbackAborted,
}

impl From<zerocopy::AllocError> for Error {
    #[inline]
    fn from(_: zerocopy::AllocError) -> Error {
        Error::Io(
            "allocation failed".to_string(),
            std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        )
    }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for std::io::Error {
    #[inline]
    fn context(self, context: impl Into<String>) -> Error { Error::Io(context.into(), self) }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}

pub(crate) trait IoErrorContext {
    fn io_context(self, context: impl Into<String>) -> std::io::Error;
}

impl IoErrorContext for std::io::Error {
    #[inline]
    fn io_context(self, context: impl Into<String>) -> std::io::Error {
        std::io::Error::new(self.kind(), self.context(context))
    }
}

pub(crate) trait IoResultContext<T> {
    fn io_context(self, context: impl Into<String>) -> std::io::Result<T>;

    fn io_with_context<F>(self, f: F) -> std::io::Result<T>
    where F: FnOnce() -> String;
}

impl<T> IoResultContext<T> for std::io::Result<T> {
    #[inline]
    fn io_context(self, context: impl Into<String>) -> std::io::Result<T> {
        self.map_err(|e| e.io_context(context))
    }

    #[inline]
    fn io_with_context<F>(self, f: F) -> std::io::Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.io_context(f()))
    }
}

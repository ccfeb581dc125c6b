//! Common types.

use std::{fmt, str::FromStr};

use crate::{Error, Result};

/// SHA-1 hash bytes
pub type HashBytes = [u8; 20];

/// AES key bytes
pub type KeyBytes = [u8; 16];

/// Magic bytes
pub type MagicBytes = [u8; 4];

/// The container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// WIA
    Wia,
    /// RVZ
    #[default]
    Rvz,
}

impl Format {
    /// Returns the default chunk size for the format.
    pub fn default_chunk_size(self) -> u32 {
        match self {
            Format::Wia => crate::write::WIA_DEFAULT_CHUNK_SIZE,
            Format::Rvz => crate::write::RVZ_DEFAULT_CHUNK_SIZE,
        }
    }

    /// Returns the default compression algorithm for the format.
    pub fn default_compression(self) -> Compression {
        match self {
            Format::Wia => crate::write::WIA_DEFAULT_COMPRESSION,
            Format::Rvz => crate::write::RVZ_DEFAULT_COMPRESSION,
        }
    }
}

impl fmt::Display for Format {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Wia => write!(f, "WIA"),
            Format::Rvz => write!(f, "RVZ"),
        }
    }
}

/// The disc kind stored in the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscKind {
    /// GameCube disc
    GameCube,
    /// Wii disc
    Wii,
}

impl From<DiscKind> for u32 {
    fn from(value: DiscKind) -> Self {
        match value {
            DiscKind::GameCube => 1,
            DiscKind::Wii => 2,
        }
    }
}

impl TryFrom<u32> for DiscKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::GameCube),
            2 => Ok(Self::Wii),
            v => Err(Error::CorruptHeader(format!("Invalid disc type {}", v))),
        }
    }
}

/// A compression algorithm with its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression
    #[default]
    None,
    /// Purge (WIA only): zero-suppressing segment encoding
    Purge,
    /// BZIP2
    Bzip2(u8),
    /// LZMA
    Lzma(u8),
    /// LZMA2
    Lzma2(u8),
    /// Zstandard (RVZ only)
    Zstandard(i8),
}

impl Compression {
    /// Validates the compression level. Sets the default level if the level is 0.
    pub fn validate_level(&mut self) -> Result<()> {
        match self {
            Compression::Bzip2(level) => {
                if *level == 0 {
                    *level = 9;
                }
                if *level > 9 {
                    return Err(Error::UnsupportedCompression(format!(
                        "Invalid BZIP2 compression level: {level} (expected 1-9)"
                    )));
                }
            }
            Compression::Lzma(level) | Compression::Lzma2(level) => {
                if *level == 0 {
                    *level = 6;
                }
                if *level > 9 {
                    return Err(Error::UnsupportedCompression(format!(
                        "Invalid LZMA compression level: {level} (expected 1-9)"
                    )));
                }
            }
            Compression::Zstandard(level) => {
                if *level == 0 {
                    *level = 19;
                }
                if *level < -22 || *level > 22 {
                    return Err(Error::UnsupportedCompression(format!(
                        "Invalid Zstandard compression level: {level} (expected -22 to 22)"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "None"),
            Compression::Purge => write!(f, "Purge"),
            Compression::Bzip2(level) => {
                if *level == 0 {
                    write!(f, "BZIP2")
                } else {
                    write!(f, "BZIP2 ({level})")
                }
            }
            Compression::Lzma(level) => {
                if *level == 0 {
                    write!(f, "LZMA")
                } else {
                    write!(f, "LZMA ({level})")
                }
            }
            Compression::Lzma2(level) => {
                if *level == 0 {
                    write!(f, "LZMA2")
                } else {
                    write!(f, "LZMA2 ({level})")
                }
            }
            Compression::Zstandard(level) => {
                if *level == 0 {
                    write!(f, "Zstandard")
                } else {
                    write!(f, "Zstandard ({level})")
                }
            }
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (format, level) =
            if let Some((format, level_str)) = s.split_once(':').or_else(|| s.split_once('.')) {
                let level = level_str
                    .parse::<i32>()
                    .map_err(|_| format!("Failed to parse compression level: {level_str:?}"))?;
                (format, level)
            } else {
                (s, 0)
            };
        match format.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "purge" => Ok(Compression::Purge),
            "bz2" | "bzip2" => Ok(Compression::Bzip2(level as u8)),
            "lzma" => Ok(Compression::Lzma(level as u8)),
            "lzma2" | "xz" => Ok(Compression::Lzma2(level as u8)),
            "zst" | "zstd" | "zstandard" => Ok(Compression::Zstandard(level as i8)),
            _ => Err(format!("Unknown compression type: {format:?}")),
        }
    }
}

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

mod checksum;
mod frame;
mod software;

pub use checksum::StreamChecksum;
pub use frame::{
    BLOCK_HEADER_LEN, BLOCK_MAGIC, BLOCK_VERSION, BlockHeader, BlockKind, max_block_len,
    max_payload_len,
};
pub use software::{BlockProgress, SoftwareStream, decode_stream_on_cpu, encode_stream_on_cpu};

pub const MIN_LEVEL: u32 = 1;
pub const MAX_LEVEL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Deflate,
    Zlib,
}

impl Algorithm {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Deflate => 0,
            Self::Zlib => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Deflate),
            1 => Ok(Self::Zlib),
            _ => Err(CodecError::InvalidHeader("unknown algorithm id")),
        }
    }

    fn zlib_header(self) -> bool {
        self == Self::Zlib
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deflate => f.write_str("deflate"),
            Self::Zlib => f.write_str("zlib"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deflate" | "raw" => Ok(Self::Deflate),
            "zlib" => Ok(Self::Zlib),
            other => Err(CodecError::UnknownAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid compression level: {0}")]
    InvalidLevel(u32),
    #[error("invalid block header: {0}")]
    InvalidHeader(&'static str),
    #[error("corrupt block: {0}")]
    Corrupt(&'static str),
    #[error("output buffer too small")]
    OutputTooSmall,
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("data too large")]
    DataTooLarge,
}

pub fn validate_level(level: u32) -> Result<(), CodecError> {
    if (MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        Ok(())
    } else {
        Err(CodecError::InvalidLevel(level))
    }
}

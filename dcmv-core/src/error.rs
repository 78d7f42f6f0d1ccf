//! Error types for the DCMV engine.
//!
//! Container and config errors are fatal at startup. Decode errors only ever
//! cost a single frame.

use thiserror::Error;

/// Errors raised while loading the container header and index.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Malformed container: {0}")]
    Malformed(String),
    #[error("Truncated container: {what} runs past end of file at offset {offset}")]
    Truncated { what: &'static str, offset: u64 },
    #[error("Container I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-frame decode failures. Recoverable: the slot goes back to EMPTY.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Blank compressed block for unique frame {0}")]
    BlankBlock(u32),
    #[error("Compressed block of {size} bytes exceeds declared maximum {max}")]
    BlockTooLarge { size: usize, max: usize },
    #[error("Decoded {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
    #[error("LZ4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
    #[error("Zstd decompression failed: {0}")]
    Zstd(String),
    #[error("Block read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Misuse of the control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Invalid audio channel {0} (expected 1 or 2)")]
    InvalidChannel(u8),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Startup errors for [`crate::engine::Engine::open`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to create frame decoder: {0}")]
    Decoder(#[from] DecodeError),
    #[error("Failed to start decode worker: {0}")]
    Worker(std::io::Error),
}

//! Crate-wide error currency.
//!
//! The engine fans work out across disks with `rayon`, so every fallible
//! path has to be `Send + Sync` to cross that boundary. `EngineError`
//! threads `Box<dyn std::error::Error + Send + Sync>` everywhere, not just
//! at the parallel edges, so one error type works whether a call happens
//! to be on the parallel path today or not.

use std::fmt;

pub type EngineError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type EngineResult<T> = Result<T, EngineError>;

/// Configuration-time errors. Fatal: the engine never starts disk I/O once
/// one of these is raised.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse { line: usize, message: String },
    MissingParity(u8),
    MissingContent,
    BadBlockSize(u64),
    BadParityLevel(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config: {e}"),
            ConfigError::Parse { line, message } => {
                write!(f, "config: line {line}: {message}")
            }
            ConfigError::MissingParity(level) => {
                write!(f, "config: missing {level}-parity path")
            }
            ConfigError::MissingContent => write!(f, "config: at least one `content` path required"),
            ConfigError::BadBlockSize(size) => {
                write!(f, "config: block size {size} is not a power of two in [1KiB, 64MiB]")
            }
            ConfigError::BadParityLevel(level) => {
                write!(f, "config: parity level {level} outside 1..=6")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Content-index errors. `Signature` is the one variant callers should
/// treat as fatal-by-default; it is downgradable with `skip_sign`.
#[derive(Debug)]
pub enum IndexError {
    Io(std::io::Error),
    BadMagic,
    Truncated,
    UnknownTag(u8),
    Signature,
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Io(e) => write!(f, "content index: {e}"),
            IndexError::BadMagic => write!(f, "content index: bad magic header"),
            IndexError::Truncated => write!(f, "content index: truncated record"),
            IndexError::UnknownTag(t) => write!(f, "content index: unknown record tag {t}"),
            IndexError::Signature => write!(f, "content index: signature mismatch"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Io(e)
    }
}

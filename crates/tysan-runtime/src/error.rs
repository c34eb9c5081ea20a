//! Error types for runtime initialization, flag parsing and descriptor
//! construction.
//!
//! None of these ever reach instrumented application code: the ABI layer
//! prints them and either continues with defaults or terminates the process.

use thiserror::Error;

/// Problems found while resolving `TYSAN_OPTIONS`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlagError {
    #[error("unrecognized flag '{0}'")]
    Unrecognized(String),
    #[error("invalid value '{value}' for flag '{name}'")]
    InvalidValue { name: String, value: String },
}

/// Fatal conditions raised by [`crate::runtime::initialize`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error("TypeSanitizer not supported for this platform")]
    UnsupportedPlatform,
    #[error("unsupported VMA range\nFATAL: Found {found} - Supported {supported}")]
    UnsupportedVma { found: u32, supported: &'static str },
    #[error("failed to reserve {len:#x} bytes of shadow memory at {addr:#x} (errno {errno})")]
    ShadowReservation { addr: usize, len: usize, errno: i32 },
    #[error("invalid shadow window of {0} bits")]
    InvalidWindow(u32),
    #[error("strict flag parsing failed: {0}")]
    Flags(#[from] FlagError),
    #[error("reentrant runtime initialization")]
    Reentrant,
}

/// Rejected arena requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("member {index} at offset {offset} precedes the previous member offset {previous}")]
    UnorderedMembers {
        index: usize,
        offset: usize,
        previous: usize,
    },
    #[error("type name contains an interior NUL byte")]
    NulInName,
}

/*!
 * Error types for the folder sync engine
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

/// The wire-observable error space (spec §7): round-trips through a small
/// numeric code so a network layer can carry it across the wire without
/// this crate knowing anything about framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorCode {
    NoError = 0,
    Generic = 1,
    NoSuchFile = 2,
    Invalid = 3,
}

impl SyncErrorCode {
    /// Unknown wire codes default to `Generic`, never panic.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoError,
            2 => Self::NoSuchFile,
            3 => Self::Invalid,
            _ => Self::Generic,
        }
    }

    pub fn to_code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// A block or file's content hash did not match what was expected.
    ChecksumMismatch { expected: String, actual: String },

    /// `availability()` returned no candidates, or every candidate was
    /// exhausted without a successful fetch (spec §7, internal-only).
    NoDevice,

    /// The peer, or the index, reported a wire-observable failure.
    Remote(SyncErrorCode, String),

    /// I/O error performing a filesystem operation; `op` names the failing
    /// operation the way spec §7 does ("dst write", "pull", "save", "final",
    /// "shortcut").
    Io { op: &'static str, source: io::Error },

    /// A path supplied by the index was invalid (absolute, empty, escapes
    /// the folder root, ...).
    InvalidPath(PathBuf),

    /// Symbolic link creation or resolution failed.
    Symlink(String),

    /// Configuration is internally inconsistent.
    Config(String),

    /// Generic/uncategorized failure with a message.
    Other(String),
}

impl SyncError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Per spec §7: directory/metadata-only failures log and continue; block
    /// failures are sticky. This classifies whether a failure is terminal
    /// for the owning file versus safe to retry against another candidate.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::ChecksumMismatch { .. } => false,
            SyncError::NoDevice => true,
            SyncError::Remote(_, _) => false,
            SyncError::Io { .. } => true,
            SyncError::InvalidPath(_) => true,
            SyncError::Symlink(_) => false,
            SyncError::Config(_) => true,
            SyncError::Other(_) => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::ChecksumMismatch { .. } => ErrorCategory::Integrity,
            SyncError::NoDevice => ErrorCategory::Network,
            SyncError::Remote(_, _) => ErrorCategory::Network,
            SyncError::Io { .. } => ErrorCategory::IoError,
            SyncError::InvalidPath(_) => ErrorCategory::Validation,
            SyncError::Symlink(_) => ErrorCategory::Filesystem,
            SyncError::Config(_) => ErrorCategory::Configuration,
            SyncError::Other(_) => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    IoError,
    Configuration,
    Integrity,
    Filesystem,
    Network,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Filesystem => write!(f, "filesystem"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            SyncError::NoDevice => write!(f, "no device available to serve this block"),
            SyncError::Remote(code, msg) => write!(f, "remote error {}: {msg}", code.to_code()),
            SyncError::Io { op, source } => write!(f, "{op}: {source}"),
            SyncError::InvalidPath(path) => write!(f, "invalid path: {}", path.display()),
            SyncError::Symlink(msg) => write!(f, "symlink error: {msg}"),
            SyncError::Config(msg) => write!(f, "configuration error: {msg}"),
            SyncError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

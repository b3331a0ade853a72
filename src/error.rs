use std::path::PathBuf;

use thiserror::Error;

/// Main error type for index operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Index not found in {}", .0.display())]
    IndexNotFound(PathBuf),

    #[error("Index already exists in {}", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("Index is closed")]
    NotOpen,

    #[error("Corrupt file {}: {detail}", .path.display())]
    Corruption { path: PathBuf, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of disk space")]
    OutOfSpace,

    #[error("Search deadline exceeded")]
    Timeout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, Error>;

/// ENOSPC, which `std::io` does not expose a stable `ErrorKind` for.
const ENOSPC: i32 = 28;

impl Error {
    /// Wrap an IO error, promoting exhausted disk space to `OutOfSpace`.
    pub fn from_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            Error::OutOfSpace
        } else {
            Error::Io(err)
        }
    }

    /// Build a corruption error for a specific file.
    pub fn corruption(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Error::Corruption {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::OutOfSpace | Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("/tmp/segment_1_0.dat", "bad magic");
        assert_eq!(
            err.to_string(),
            "Corrupt file /tmp/segment_1_0.dat: bad magic"
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(Error::Timeout.is_retriable());
        assert!(Error::OutOfSpace.is_retriable());
        assert!(!Error::NotOpen.is_retriable());
        assert!(!Error::InvalidArgument("x".to_string()).is_retriable());
    }

    #[test]
    fn test_enospc_mapping() {
        let io = std::io::Error::from_raw_os_error(28);
        assert!(matches!(Error::from_io(io), Error::OutOfSpace));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from_io(io), Error::Io(_)));
    }
}

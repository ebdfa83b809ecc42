use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: String, reason: String },

    #[error("Unsupported log version {version} in {segment} (supported {min}..={max})")]
    UnsupportedVersion {
        segment: String,
        version: u16,
        min: u16,
        max: u16,
    },

    #[error("Segment ordering error in drive {drive}: {detail}")]
    SegmentOrdering { drive: String, detail: String },

    #[error("Incomplete drive {drive}: missing segments {missing:?}")]
    IncompleteDrive { drive: String, missing: Vec<u32> },

    #[error("Vehicle profile config error ({path}): {reason}")]
    ProfileConfig { path: String, reason: String },

    #[error("Database write failed for {}: {source}", path.display())]
    DatabaseWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not read segment {}: {source}", path.display())]
    SegmentRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Stable error category used in per-drive reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    CorruptSegment,
    UnsupportedVersion,
    SignalDecode,
    SegmentOrdering,
    IncompleteDrive,
    ProfileConfig,
    DatabaseWrite,
    SegmentRead,
    /// Drive processing panicked
    Panic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CorruptSegment => "CorruptSegment",
            ErrorKind::UnsupportedVersion => "UnsupportedVersion",
            ErrorKind::SignalDecode => "SignalDecodeError",
            ErrorKind::SegmentOrdering => "SegmentOrderingError",
            ErrorKind::IncompleteDrive => "IncompleteDriveError",
            ErrorKind::ProfileConfig => "ProfileConfigError",
            ErrorKind::DatabaseWrite => "DatabaseWriteError",
            ErrorKind::SegmentRead => "SegmentReadError",
            ErrorKind::Panic => "DrivePanic",
        };
        f.write_str(name)
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CorruptSegment { .. } => ErrorKind::CorruptSegment,
            EngineError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            EngineError::SegmentOrdering { .. } => ErrorKind::SegmentOrdering,
            EngineError::IncompleteDrive { .. } => ErrorKind::IncompleteDrive,
            EngineError::ProfileConfig { .. } => ErrorKind::ProfileConfig,
            EngineError::DatabaseWrite { .. } => ErrorKind::DatabaseWrite,
            EngineError::SegmentRead { .. } => ErrorKind::SegmentRead,
        }
    }

    /// Errors that leave the drive unprocessed so the next run retries it
    pub fn is_per_drive(&self) -> bool {
        !matches!(
            self,
            EngineError::ProfileConfig { .. } | EngineError::DatabaseWrite { .. }
        )
    }

    pub(crate) fn corrupt(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::CorruptSegment {
            segment: segment.into(),
            reason: reason.into(),
        }
    }
}

/// A single CAN frame matched a profile signal but could not be decoded.
///
/// Always recovered locally: the frame is skipped and the drive continues.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Signal {signal} (bus {bus}, address {address:#x}): {reason}")]
pub struct SignalDecodeError {
    pub signal: String,
    pub bus: u8,
    pub address: u32,
    pub reason: String,
}

impl SignalDecodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SignalDecode
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = EngineError::corrupt("dev/drive--0", "bad magic");
        assert_eq!(err.kind(), ErrorKind::CorruptSegment);
        assert!(err.is_per_drive());

        let err = EngineError::DatabaseWrite {
            path: PathBuf::from("db.json"),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(err.kind(), ErrorKind::DatabaseWrite);
        assert!(!err.is_per_drive());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::UnsupportedVersion {
            segment: "abc/2025-07-10--10-00-00--3".to_string(),
            version: 9,
            min: 1,
            max: 1,
        };
        let text = err.to_string();
        assert!(text.contains("version 9"));
        assert!(text.contains("1..=1"));
        assert_eq!(ErrorKind::IncompleteDrive.to_string(), "IncompleteDriveError");
    }
}

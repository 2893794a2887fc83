//! Job failure taxonomy.
//!
//! Every variant is fatal to the job that raised it and to nothing else; the
//! pool counts it, closes the socket and frees the slot.

use crate::protocols::rpc::DecodeError;
use std::io;

/// The server sent something the client refuses to accept.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("record without last-fragment marker")]
    Fragmented,
    #[error("short record from server ({0} bytes)")]
    ShortRecord(u32),
    #[error("oversized record from server ({0} bytes)")]
    LongRecord(u32),
    #[error("cannot decode reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("reply xid doesn't match (expected {expected:#010x}, got {got:#010x})")]
    XidMismatch { expected: u32, got: u32 },
    #[error("call denied by server (reject status {0})")]
    Denied(u32),
    #[error("remote rpc error {0}")]
    Rejected(u32),
    #[error("reply has wrong sum (expected {expected}, got {got})")]
    ChecksumMismatch { expected: u32, got: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("error condition reported on socket")]
    Socket,
    #[error("remote closed connection")]
    Hangup,
    #[error("unexpected end of file on socket")]
    Eof,
    #[error("timed out while waiting for reply")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl JobError {
    /// Whether this failure is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout)
    }

    /// Whether this failure is a protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self, JobError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = JobError::from(ProtocolError::XidMismatch {
            expected: 0x1234abcd,
            got: 0x1234abce,
        });
        assert_eq!(
            err.to_string(),
            "reply xid doesn't match (expected 0x1234abcd, got 0x1234abce)"
        );
        assert!(err.is_protocol());
        assert!(!err.is_timeout());

        let err = JobError::from(ProtocolError::from(DecodeError::Truncated));
        assert_eq!(err.to_string(), "cannot decode reply: message truncated");
    }

    #[test]
    fn test_io_error_conversion() {
        let err = JobError::from(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(matches!(err, JobError::Io(_)));
        assert!(JobError::Timeout.is_timeout());
    }
}

//! Error conditions raised while talking to the command ring.

use crate::layout::CommandId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The supplied block is smaller than the structure being encoded or decoded.
    #[error("buffer is {actual} bytes, structure needs at least {required}")]
    InvalidBufferSize { required: usize, actual: usize },
    /// Every slot of the ring holds an entry the kernel hasn't answered yet.
    ///
    /// Retryable once a poll frees a slot.
    #[error("command ring is full ({capacity} slots in flight)")]
    RingFull { capacity: u32 },
    /// No response arrived for the command before its deadline.
    #[error("command {0} timed out")]
    Timeout(CommandId),
    /// The wait for a command was abandoned locally.
    ///
    /// The entry itself can't be retracted once it's on the ring.
    #[error("command {0} was cancelled")]
    Cancelled(CommandId),
    /// The shared mailbox holds values the kernel contract doesn't allow.
    ///
    /// Nothing read from the mapping can be trusted after this.
    #[error("mailbox is corrupt: {0}")]
    CorruptMailbox(String),
    #[error("request carries {count} iovecs, a slot holds at most {max}")]
    TooManyIovecs { count: usize, max: usize },
    #[error("CDB is {len} bytes, a slot holds at most {max}")]
    CdbTooLong { len: usize, max: usize },
    #[error("invalid CDB: {0}")]
    InvalidCdb(String),
    #[error("{0} commands are still outstanding")]
    CommandsOutstanding(usize),
    #[error("{0} is not a tcm-user device")]
    NotTcmuDevice(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the same call may succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RingFull { .. } | Error::Timeout(_))
    }

    /// Whether the mapping has to be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CorruptMailbox(_))
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptMailbox(reason.into())
    }
}

/// Ensures `buf` holds at least `required` bytes.
pub(crate) fn ensure_len(buf: &[u8], required: usize) -> Result<()> {
    if buf.len() < required {
        return Err(Error::InvalidBufferSize {
            required,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(Error::RingFull { capacity: 4 }.is_retryable());
        assert!(Error::Timeout(3).is_retryable());
        assert!(!Error::Cancelled(3).is_retryable());
        assert!(Error::corrupt("head past tail").is_fatal());
        assert!(!Error::RingFull { capacity: 4 }.is_fatal());
    }

    #[test]
    fn short_buffer_reports_both_sizes() {
        let e = ensure_len(&[0; 3], 8).expect_err("3 bytes can't hold 8");
        assert!(matches!(
            e,
            Error::InvalidBufferSize {
                required: 8,
                actual: 3
            }
        ));
        assert!(ensure_len(&[0; 8], 8).is_ok());
    }
}

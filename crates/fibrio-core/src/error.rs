//! Error types for the fibrio runtime

use core::fmt;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the runtime and its I/O operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A read (or write) returned 0 bytes
    EndOfFile,

    /// ECONNRESET on a stream read
    ConnectionReset,

    /// The fiber was cancelled; carries no further detail
    Cancelled,

    /// A timed operation ran out of time
    TimedOut,

    /// Operation on a file descriptor that was already closed
    ClosedFd,

    /// Non-waiting fixed-buffer allocation found no free block
    NoBufferSpace,

    /// io_uring is not available on this kernel (ENOSYS at setup)
    Unsupported(String),

    /// Rejected runtime configuration
    InvalidConfig(String),

    /// Any other kernel error, as a positive errno value
    Os(i32),
}

impl Error {
    /// Map a negative CQE result (or a positive errno) to an error.
    ///
    /// Callers pass the raw CQE value; the sign is normalised here so the
    /// completion dispatcher does not have to.
    pub fn from_errno(raw: i32) -> Error {
        let errno = raw.abs();
        match errno {
            libc::ECANCELED => Error::Cancelled,
            _ => Error::Os(errno),
        }
    }

    /// Errno from a negative CQE result that should be retried by the
    /// submission layer rather than surfaced (EINTR, EAGAIN, and a spurious
    /// ECANCELED for a fiber that was not actually cancelled).
    pub fn errno_is_retry(raw: i32) -> bool {
        let errno = raw.abs();
        errno == libc::EINTR || errno == libc::EAGAIN || errno == libc::ECANCELED
    }

    /// True for the kernel's "you were too late" answers to an async-cancel:
    /// the target either already completed (ENOENT) or is already being
    /// cancelled (EALREADY). Both are ignored.
    pub fn cancel_result_is_benign(raw: i32) -> bool {
        raw == 0 || raw == -libc::ENOENT || raw == -libc::EALREADY
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EndOfFile => write!(f, "end of file"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::Cancelled => write!(f, "fiber cancelled"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::ClosedFd => write!(f, "file descriptor already closed"),
            Error::NoBufferSpace => write!(f, "no free fixed-buffer block"),
            Error::Unsupported(msg) => write!(f, "io_uring unavailable: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Os(errno) => {
                write!(f, "{}", std::io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::EndOfFile => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e),
            Error::ConnectionReset => {
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, e)
            }
            Error::TimedOut => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            Error::Os(errno) => std::io::Error::from_raw_os_error(errno),
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::EndOfFile), "end of file");
        assert_eq!(format!("{}", Error::Cancelled), "fiber cancelled");
        let msg = format!("{}", Error::Os(libc::EBADF));
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_from_errno_sign_normalised() {
        assert_eq!(Error::from_errno(-libc::EBADF), Error::Os(libc::EBADF));
        assert_eq!(Error::from_errno(libc::EBADF), Error::Os(libc::EBADF));
        assert_eq!(Error::from_errno(-libc::ECANCELED), Error::Cancelled);
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::errno_is_retry(-libc::EINTR));
        assert!(Error::errno_is_retry(-libc::EAGAIN));
        assert!(Error::errno_is_retry(-libc::ECANCELED));
        assert!(!Error::errno_is_retry(-libc::EBADF));
    }

    #[test]
    fn test_cancel_result_classification() {
        assert!(Error::cancel_result_is_benign(0));
        assert!(Error::cancel_result_is_benign(-libc::ENOENT));
        assert!(Error::cancel_result_is_benign(-libc::EALREADY));
        assert!(!Error::cancel_result_is_benign(-libc::EINVAL));
    }
}

//! Typed error kinds for the job-container core.
//!
//! Every public operation returns [`Error`] directly rather than an opaque
//! `Box<dyn Error>` — callers match on [`ErrorKind`] to decide whether to
//! retry, escalate, or propagate. See spec §7 for the recovery policy per
//! kind.

use std::fmt;

/// Discriminates the cause of an [`Error`] without requiring callers to
/// string-match messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted on a job/queue/process/container that was already closed.
    AlreadyClosed,
    /// Notification poll on a job created without notifications enabled.
    NotRegistered,
    /// File binding attempted on a job that is not a silo.
    NotSupported,
    /// Zero PID, out-of-range CPU value, unknown property shape, unknown signal name,
    /// or a rootfs path that is not a volume-GUID path.
    InvalidArgument,
    /// Executable could not be resolved, or a PID no longer exists.
    NotFound,
    /// An operation that may run at most once (wait, start) was called again.
    InvalidState,
    /// A bounded wait (e.g. graceful shutdown) elapsed before completion.
    Timeout,
    /// A kernel call failed unexpectedly; the OS error code is attached when known.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AlreadyClosed => "already_closed",
            ErrorKind::NotRegistered => "not_registered",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's single error type. Carries a [`ErrorKind`] for programmatic
/// dispatch, a human-readable message, and — when the failure originated
/// from a Win32/NT call — the OS error code.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub os_code: Option<i32>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            os_code: None,
        }
    }

    pub fn with_os_code(kind: ErrorKind, message: impl Into<String>, os_code: i32) -> Self {
        Error {
            kind,
            message: message.into(),
            os_code: Some(os_code),
        }
    }

    pub fn already_closed(what: &str) -> Self {
        Error::new(ErrorKind::AlreadyClosed, format!("{what} is already closed"))
    }

    pub fn not_registered(what: &str) -> Self {
        Error::new(
            ErrorKind::NotRegistered,
            format!("{what} was created without notifications enabled"),
        )
    }

    pub fn not_supported(what: &str) -> Self {
        Error::new(ErrorKind::NotSupported, what.to_string())
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, what.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, what.into())
    }

    pub fn invalid_state(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, what.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, what.into())
    }

    /// Wrap the last Win32 error code under `context`.
    #[cfg(windows)]
    pub fn from_win32(context: &str) -> Self {
        let err = std::io::Error::last_os_error();
        let code = err.raw_os_error().unwrap_or(-1);
        Error::with_os_code(ErrorKind::Internal, format!("{context}: {err}"), code)
    }

    #[cfg(windows)]
    pub fn from_windows_error(context: &str, e: &::windows::core::Error) -> Self {
        Error::with_os_code(
            ErrorKind::Internal,
            format!("{context}: {e}"),
            e.code().0,
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::not_found("pid 1234 not found");
        let s = format!("{e}");
        assert!(s.contains("not_found"));
        assert!(s.contains("pid 1234"));
    }

    #[test]
    fn kind_round_trips_through_matches() {
        let e = Error::invalid_state("wait called twice");
        assert!(matches!(e.kind, ErrorKind::InvalidState));
    }
}

//! Error classification for accept failures and finished pipes.
//!
//! Structured causes are checked first. The text fallback matches what the
//! transport only reports as a message; it is fragile by nature and only
//! decides log severity.

use std::io::{self, ErrorKind};

use crate::error::{PipeError, ResolveError};

const IGNORED_ERROR_TEXT: [&str; 3] = [
    "connection reset by peer",
    "disconnect, reason 11",
    "unknown client:",
];

#[cfg(unix)]
const RESOURCE_EXHAUSTION_ERRNOS: [i32; 3] = [
    12, // ENOMEM
    23, // ENFILE
    24, // EMFILE
];

/// Whether a pipe error is expected traffic noise (logged at debug).
pub fn is_ignored_error(err: &PipeError) -> bool {
    match err {
        PipeError::Resolve(ResolveError::UnknownClient(_)) => true,
        PipeError::IoError(err) => is_ignored_io_error(err),
        PipeError::SshError(russh::Error::Disconnect | russh::Error::HUP) => true,
        PipeError::SshError(russh::Error::IO(err)) => is_ignored_io_error(err),
        other => matches_ignored_text(&other.to_string()),
    }
}

fn is_ignored_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
    ) || matches_ignored_text(&err.to_string())
}

/// Case-insensitive substring match against the known benign messages.
pub fn matches_ignored_text(text: &str) -> bool {
    let text = text.to_lowercase();
    IGNORED_ERROR_TEXT.iter().any(|pattern| text.contains(pattern))
}

/// Whether an accept failure is worth retrying after a backoff.
pub fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || is_resource_exhaustion(err)
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.raw_os_error()
        .map(|code| RESOURCE_EXHAUSTION_ERRNOS.contains(&code))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_is_ignored() {
        let err = PipeError::from(ResolveError::UnknownClient("xyz".to_string()));
        assert!(is_ignored_error(&err));
    }

    #[test]
    fn test_end_of_stream_and_reset_are_ignored() {
        let eof = PipeError::from(io::Error::from(ErrorKind::UnexpectedEof));
        assert!(is_ignored_error(&eof));

        let reset = PipeError::from(io::Error::from(ErrorKind::ConnectionReset));
        assert!(is_ignored_error(&reset));

        let wrapped = PipeError::from(russh::Error::IO(io::Error::from(ErrorKind::UnexpectedEof)));
        assert!(is_ignored_error(&wrapped));
    }

    #[test]
    fn test_ssh_disconnect_is_ignored() {
        assert!(is_ignored_error(&PipeError::from(russh::Error::Disconnect)));
        assert!(is_ignored_error(&PipeError::from(russh::Error::HUP)));
    }

    #[test]
    fn test_text_fallback() {
        assert!(matches_ignored_text("read tcp: read: connection reset by peer"));
        assert!(matches_ignored_text("Connection reset by peer (os error 104)"));
        assert!(matches_ignored_text("ssh: disconnect, reason 11: too many connections"));
        assert!(matches_ignored_text("pipe: unknown client: abc"));
        assert!(!matches_ignored_text("permission denied"));

        let io_with_text = PipeError::from(io::Error::new(
            ErrorKind::Other,
            "ssh: disconnect, reason 11: policy",
        ));
        assert!(is_ignored_error(&io_with_text));
    }

    #[test]
    fn test_unexpected_errors_are_not_ignored() {
        let unavailable = PipeError::from(ResolveError::Unavailable {
            session: "abc".to_string(),
            reason: "channel open failed".to_string(),
        });
        assert!(!is_ignored_error(&unavailable));
        assert!(!is_ignored_error(&PipeError::UpstreamAuthRejected("abc".to_string())));
        assert!(!is_ignored_error(&PipeError::from(io::Error::from(
            ErrorKind::PermissionDenied
        ))));
    }

    #[test]
    fn test_temporary_accept_errors() {
        assert!(is_temporary_accept_error(&io::Error::from(ErrorKind::ConnectionAborted)));
        assert!(is_temporary_accept_error(&io::Error::from(ErrorKind::Interrupted)));
        assert!(!is_temporary_accept_error(&io::Error::from(ErrorKind::Other)));
        assert!(!is_temporary_accept_error(&io::Error::from(ErrorKind::NotConnected)));
    }

    #[cfg(unix)]
    #[test]
    fn test_too_many_open_files_is_temporary() {
        assert!(is_temporary_accept_error(&io::Error::from_raw_os_error(24)));
    }
}

//! Error taxonomy shared by every layer of the runtime.
//!
//! Every fallible operation returns [`RpcError`] directly. The thread-local
//! last-error slot exists as a convenience accessor for callers that lose the
//! error value across an FFI-style boundary (notably `unpack`, which reports a
//! count); it is never load-bearing for correctness.

use std::cell::RefCell;
use std::fmt;

/// Classification of a runtime failure.
///
/// The wire representation of a kind is its kebab-case name, carried inside
/// the `extra` dictionary of an error object so that peers can reconstruct
/// the kind across a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown path, interface or method.
    NotFound,
    /// Unpack type mismatch or schema validation failure.
    InvalidArguments,
    /// Object accessor used against the wrong tag.
    TypeMismatch,
    /// Send or receive on a shut-down transport.
    TransportClosed,
    /// Descriptor or shared memory payload over a transport without
    /// descriptor passing.
    UnsupportedByTransport,
    /// Serializer refuses a tag.
    UnsupportedType,
    /// Deadline elapsed on a wait.
    Timeout,
    /// Peer or local abort.
    Aborted,
    /// Container mutated during iteration.
    ConcurrentMutation,
    /// Invariant violated; should be unreachable.
    Internal,
}

impl ErrorKind {
    /// The canonical kebab-case name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidArguments => "invalid-arguments",
            ErrorKind::TypeMismatch => "type-mismatch",
            ErrorKind::TransportClosed => "transport-closed",
            ErrorKind::UnsupportedByTransport => "unsupported-by-transport",
            ErrorKind::UnsupportedType => "unsupported-type",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::ConcurrentMutation => "concurrent-mutation",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse a kebab-case kind name back into an [`ErrorKind`].
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "not-found" => ErrorKind::NotFound,
            "invalid-arguments" => ErrorKind::InvalidArguments,
            "type-mismatch" => ErrorKind::TypeMismatch,
            "transport-closed" => ErrorKind::TransportClosed,
            "unsupported-by-transport" => ErrorKind::UnsupportedByTransport,
            "unsupported-type" => ErrorKind::UnsupportedType,
            "timeout" => ErrorKind::Timeout,
            "aborted" => ErrorKind::Aborted,
            "concurrent-mutation" => ErrorKind::ConcurrentMutation,
            "internal" => ErrorKind::Internal,
            _ => return None,
        })
    }

    /// An errno-flavoured numeric code used when a kind crosses the wire
    /// inside an error object. Handler-supplied codes pass through verbatim;
    /// these values only cover failures originated by the runtime itself.
    pub fn wire_code(self) -> i64 {
        match self {
            ErrorKind::NotFound => libc::ENOENT as i64,
            ErrorKind::InvalidArguments => libc::EINVAL as i64,
            ErrorKind::TypeMismatch => libc::EINVAL as i64,
            ErrorKind::TransportClosed => libc::EPIPE as i64,
            ErrorKind::UnsupportedByTransport => libc::EOPNOTSUPP as i64,
            ErrorKind::UnsupportedType => libc::ENOTSUP as i64,
            ErrorKind::Timeout => libc::ETIMEDOUT as i64,
            ErrorKind::Aborted => libc::ECANCELED as i64,
            ErrorKind::ConcurrentMutation => libc::EBUSY as i64,
            ErrorKind::Internal => libc::EIO as i64,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime failure: a kind plus a human-readable message.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportClosed, message)
    }

    pub fn unsupported_by_transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedByTransport, message)
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedType, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn concurrent_mutation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConcurrentMutation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Result alias used throughout the crate.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

thread_local! {
    static LAST_ERROR: RefCell<Option<RpcError>> = const { RefCell::new(None) };
}

/// Record `err` in the calling thread's last-error slot.
pub(crate) fn set_last_error(err: RpcError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

/// The most recent error recorded on the calling thread, if any.
pub fn last_error() -> Option<RpcError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clear the calling thread's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_name_roundtrip() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::InvalidArguments,
            ErrorKind::TypeMismatch,
            ErrorKind::TransportClosed,
            ErrorKind::UnsupportedByTransport,
            ErrorKind::UnsupportedType,
            ErrorKind::Timeout,
            ErrorKind::Aborted,
            ErrorKind::ConcurrentMutation,
            ErrorKind::Internal,
        ];

        for kind in kinds {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }

        assert_eq!(ErrorKind::parse("no-such-kind"), None);
    }

    #[test]
    fn display_contains_kind_and_message() {
        let err = RpcError::not_found("unknown method frobnicate");
        let s = err.to_string();
        assert!(s.contains("not-found"));
        assert!(s.contains("frobnicate"));
    }

    #[test]
    fn last_error_slot() {
        clear_last_error();
        assert!(last_error().is_none());

        set_last_error(RpcError::timeout("deadline elapsed"));
        let err = last_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        clear_last_error();
        assert!(last_error().is_none());
    }
}

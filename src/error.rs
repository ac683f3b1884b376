//! Error handling for `meshlink`.
//!
//! Every fallible operation in this crate returns the local [`Result`]
//! alias. Errors carry an [`ErrorKind`] discriminant (the taxonomy from
//! the protocol design) plus, optionally, the underlying error that
//! triggered them.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `meshlink::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait drops the underlying
/// error type, which is useful when it doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { inner: ErrorInner::Simple(kind) }
    }

    /// Wraps an arbitrary error, tagging it with `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error { inner: ErrorInner::Wrapped(kind, e.into()) }
    }

    /// Returns a copy of this error's `ErrorKind`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this error, keeping any wrapped source.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }

    /// Does this error warrant tearing down the connection it occurred on?
    ///
    /// Every kind in this taxonomy is connection-fatal except for the two
    /// that explicitly leave the connection alone per the error handling
    /// design (`AcceptFailed` re-arms the accept loop; `HeartbeatTimerError`
    /// stops the pulse but not the connection).
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::AcceptFailed | ErrorKind::HeartbeatTimerError)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Io, e)
    }
}

impl error::Error for Error {}

/// The taxonomy of recoverable failures this crate's endpoints can hit.
///
/// Every variant is handled locally by the endpoint that produced it
/// (close + reconnect, or close + unregister); none of them are meant to
/// escape to a user's `OnMessageReceived`-style handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// DNS/host resolution failed (client-side; triggers reconnect).
    ResolveFailed,
    /// TCP connect failed (client-side; triggers reconnect).
    ConnectFailed,
    /// TLS handshake failed on either side.
    HandshakeFailed,
    /// A framed read failed or the frame was malformed.
    ReadFailed,
    /// A framed write failed.
    WriteFailed,
    /// A header declared an unreasonable body length, or a `pop` underflowed.
    MalformedFrame,
    /// Server-side: `OnClientConnect` returned `false`.
    AdmissionDenied,
    /// Server-side: the accept loop itself errored; it stays alive.
    AcceptFailed,
    /// Client-side: the heartbeat timer errored; the pulse stops quietly.
    HeartbeatTimerError,
    /// Catch-all for I/O errors without a more specific kind.
    Io,
    /// Catch-all for everything else.
    Error,
}

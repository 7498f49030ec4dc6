//! `postq` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io};

use crate::{
    connection::ParseError,
    copy::CopyError,
    postgres::{DatabaseError, ProtocolError, sasl::SaslError},
    types::{DecodeError, EncodeError},
};

/// A specialized [`Result`] type for `postq` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postq` library.
pub struct Error {
    context: Cow<'static, str>,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach the driver operation that originated the error.
    pub(crate) fn context(mut self, context: impl Into<Cow<'static, str>>) -> Self {
        self.context = context.into();
        self
    }

    /// The server reported error, if this is one.
    pub fn as_database_error(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Server(err) => Some(err),
            _ => None,
        }
    }

    /// Machine readable SQLSTATE, when the server reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        self.as_database_error().map(|e| e.code())
    }

    /// Returns `true` when retrying the operation on the same connection
    /// can possibly succeed.
    ///
    /// Protocol errors and io errors poison the connection; everything else
    /// leaves the wire position known.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::Io(_))
    }
}

/// All possible error kind from `postq` library.
pub enum ErrorKind {
    /// Connection string or option rejected.
    Config(ParseError),
    /// Frame or response sequence violation. Fatal to the connection.
    Protocol(ProtocolError),
    /// `ErrorResponse` from the server.
    Server(DatabaseError),
    /// Authentication failed before the server accepted the session.
    Auth(AuthError),
    /// Transport level failure: connect, read, write, TLS, timeout.
    Io(io::Error),
    /// A parameter value the target type codec cannot accept.
    Encode(EncodeError),
    /// A column value that does not match its declared type.
    Decode(DecodeError),
    /// Operation issued in the wrong connection state.
    State(StateError),
    /// COPY producer or receiver fault.
    Copy(CopyError),
}

/// Authentication failure, client side.
///
/// Credential rejection by the server arrives as an ordinary
/// [`DatabaseError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unsupported authentication mechanism: {mechanism}")]
    Unsupported { mechanism: Cow<'static, str> },
    #[error("password required but not provided")]
    MissingPassword,
    #[error(transparent)]
    Sasl(#[from] SaslError),
}

/// Operation issued in a state that cannot serve it.
///
/// State errors are raised locally, without a network round trip.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedBlock,
    #[error("cannot commit a failed transaction block")]
    FailedBlockOnExit,
    #[error("connection is terminated")]
    Closed,
    #[error("statement is closed")]
    StatementClosed,
    #[error("empty query string")]
    EmptyQuery,
    #[error("savepoint was already released or rolled back")]
    SavepointGone,
    #[error("expected connection in {expected} state, but it is {actual}")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: Cow::Borrowed(""), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Server(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<StateError>e => ErrorKind::State(e));
from!(<CopyError>e => ErrorKind::Copy(e));

impl From<SaslError> for Error {
    fn from(err: SaslError) -> Self {
        AuthError::from(err).into()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Config(e) => Some(e),
            ErrorKind::Protocol(e) => Some(e),
            ErrorKind::Server(e) => Some(e),
            ErrorKind::Auth(e) => Some(e),
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Encode(e) => Some(e),
            ErrorKind::Decode(e) => Some(e),
            ErrorKind::State(e) => Some(e),
            ErrorKind::Copy(e) => Some(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
            Self::Copy(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

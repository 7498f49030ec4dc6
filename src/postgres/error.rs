//! Protocol and server reported errors.
use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// An error when translating buffer from postgres.
///
/// Any `ProtocolError` is fatal to the connection: the byte stream position
/// can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message {}{}",
        DisplayMsgType(*found),
        match expect {
            Some((name, t)) => format!(", expected {name} ({})", DisplayMsgType(*t)),
            None => String::new(),
        }
    )]
    Unexpected {
        expect: Option<(&'static str, u8)>,
        found: u8,
    },
    #[error("unexpected message {} during {phase}", DisplayMsgType(*found))]
    UnexpectedPhase {
        found: u8,
        phase: &'static str,
    },
    #[error("unknown authentication request: {auth}")]
    UnknownAuth {
        auth: i32,
    },
    #[error("invalid frame header: length {len} < 4")]
    InvalidHeader {
        len: i32,
    },
    #[error("unknown transaction status: {status}")]
    UnknownTxStatus {
        status: u8,
    },
    #[error("message field is not nul terminated")]
    MissingNul,
    #[error("postgres sent non utf8 string: {0}")]
    NonUtf8(std::str::Utf8Error),
    #[error("message body ended early: need {need} more bytes")]
    Truncated {
        need: usize,
    },
    #[error("DataRow carries {got} columns, RowDescription declared {expected}")]
    ColumnCount {
        expected: usize,
        got: usize,
    },
    #[error("unsupported by this client: {what}")]
    Unsupported {
        what: &'static str,
    },
}

struct DisplayMsgType(u8);

impl std::fmt::Display for DisplayMsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.is_ascii_graphic() {
            true => write!(f, "'{}'", self.0 as char),
            false => write!(f, "0x{:02x}", self.0),
        }
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found }
    }

    pub(crate) fn unexpected(expect: &'static str, expect_type: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some((expect, expect_type)), found }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::UnexpectedPhase { found, phase }
    }

    pub(crate) fn unknown_auth(auth: i32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn invalid_header(len: i32) -> ProtocolError {
        Self::InvalidHeader { len }
    }

    pub(crate) fn unknown_tx_status(status: u8) -> ProtocolError {
        Self::UnknownTxStatus { status }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8(err: std::str::Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }

    pub(crate) fn truncated(need: usize) -> ProtocolError {
        Self::Truncated { need }
    }
}

/// Fields shared by `ErrorResponse` and `NoticeResponse`.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator. Fields can appear in any order.
///
/// <https://www.postgresql.org/docs/17/protocol-error-fields.html>
#[derive(Debug, Clone, Default)]
pub struct MessageFields {
    /// `S`: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, or LOG.
    pub severity: ByteStr,
    /// `C`: the SQLSTATE code, five characters, machine readable.
    pub code: ByteStr,
    /// `M`: the primary human-readable message.
    pub message: ByteStr,
    /// `D`: secondary message carrying more detail.
    pub detail: Option<ByteStr>,
    /// `H`: suggestion what to do about the problem.
    pub hint: Option<ByteStr>,
    /// `P`: error cursor position as an index into the original query string.
    pub position: Option<ByteStr>,
    /// `p`: position of an internally generated command.
    pub internal_position: Option<ByteStr>,
    /// `q`: text of the internally generated command.
    pub internal_query: Option<ByteStr>,
    /// `W`: call stack traceback of the active procedural language.
    pub context: Option<ByteStr>,
    /// `s`, `t`, `c`, `d`, `n`: object the error is about.
    pub schema: Option<ByteStr>,
    pub table: Option<ByteStr>,
    pub column: Option<ByteStr>,
    pub datatype: Option<ByteStr>,
    pub constraint: Option<ByteStr>,
    /// `F`, `L`, `R`: reporting source location in the server.
    pub file: Option<ByteStr>,
    pub line: Option<ByteStr>,
    pub routine: Option<ByteStr>,
}

impl MessageFields {
    pub(crate) fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        use crate::ext::BytesExt;

        let mut fields = Self::default();

        loop {
            if !body.has_remaining() {
                return Err(ProtocolError::missing_nul());
            }
            let key = body.get_u8();
            if key == 0 {
                break;
            }
            let value = body.get_nul_bytestr()?;
            match key {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = Some(value),
                b'p' => fields.internal_position = Some(value),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.context = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.datatype = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = Some(value),
                b'R' => fields.routine = Some(value),
                // frontends should silently ignore fields of unrecognized type
                _ => {}
            }
        }

        Ok(fields)
    }
}

/// An error reported by the server via `ErrorResponse`.
#[derive(Debug, Clone)]
pub struct DatabaseError {
    fields: MessageFields,
}

impl DatabaseError {
    pub(crate) fn new(fields: MessageFields) -> Self {
        Self { fields }
    }

    /// The SQLSTATE code, five characters, machine readable.
    pub fn code(&self) -> &str {
        &self.fields.code
    }

    /// The primary human-readable message.
    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.fields.hint.as_deref()
    }

    /// Error cursor position within the original query, if reported.
    pub fn position(&self) -> Option<&str> {
        self.fields.position.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.fields.context.as_deref()
    }

    /// Every reported field.
    pub fn fields(&self) -> &MessageFields {
        &self.fields
    }
}

impl std::error::Error for DatabaseError { }

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fields.message)?;
        if !self.fields.code.is_empty() {
            write!(f, " (sqlstate {})", self.fields.code)?;
        }
        if let Some(detail) = &self.fields.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// A warning reported by the server via `NoticeResponse`.
///
/// Notices are not errors; they flow through the notice hook chain.
#[derive(Debug, Clone)]
pub struct Notice {
    pub fields: MessageFields,
}

impl Notice {
    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn code(&self) -> &str {
        &self.fields.code
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.fields.severity, self.fields.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;

    fn field(buf: &mut Vec<u8>, key: u8, value: &str) {
        buf.put_u8(key);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn parse_error_response_fields() {
        let mut buf = Vec::new();
        field(&mut buf, b'S', "ERROR");
        field(&mut buf, b'C', "22012");
        field(&mut buf, b'M', "division by zero");
        field(&mut buf, b'F', "int.c");
        // unknown field must be skipped
        field(&mut buf, b'Y', "future");
        buf.put_u8(0);

        let fields = MessageFields::parse(buf.into()).unwrap();
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "22012");
        assert_eq!(fields.message, "division by zero");
        assert_eq!(fields.file.as_deref(), Some("int.c"));
        assert!(fields.detail.is_none());
    }

    #[test]
    fn parse_unterminated_fields() {
        let buf = vec![b'S', b'E', b'R'];
        assert!(MessageFields::parse(buf.into()).is_err());
    }
}

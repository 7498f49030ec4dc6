//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, Bytes, BytesMut};

use super::pg_format::PgFormat;
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// write a frontend message to `buf`
///
/// multiple messages written back to back share one buffer and are
/// flushed with a single write syscall
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
///
/// Thus, [`Startup`], [`CancelRequest`] and [`SslRequest`] do not implement
/// [`FrontendProtocol`]
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// The protocol version number: major 3, minor 0.
const PROTOCOL_VERSION: i32 = 196608;
/// The cancel request code: 1234 in the most significant 16 bits, 5678 in the rest.
const CANCEL_REQUEST_CODE: i32 = 80877102;
/// The SSL request code: 1234 in the most significant 16 bits, 5679 in the rest.
const SSL_REQUEST_CODE: i32 = 80877103;

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Additional run-time parameters applied at backend start, acting as
    /// session defaults.
    pub settings: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        for (name, value) in self.settings {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(0);

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_i32(written_buf.len().to_i32());
    }
}

/// Cancellation request, sent over a *fresh* connection, never the live one.
///
/// The server makes no reply to this message; it goes and cancels, or it does not.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Request to switch the connection to TLS.
///
/// The server responds with a single byte: `S` to proceed with the handshake,
/// `N` to stay in plaintext.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Password response, used for cleartext and md5 authentication.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.password.as_bytes());
        buf.put_u8(0);
    }
}

/// Initial SASL response, carrying the selected mechanism name.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Client Response".
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.mechanism.nul_string_len() + 4 + self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.mechanism.as_bytes());
        buf.put_u8(0);
        buf.put_i32(self.data.len().to_i32());
        buf.put_slice(self.data);
    }
}

/// SASL continuation response.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.sql.as_bytes());
        buf.put_u8(0);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a, I> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// The number of parameter data types specified (can be zero).
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    pub oids_len: i16,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: I,
}

impl<I> FrontendProtocol for Parse<'_, I>
where
    I: IntoIterator<Item = super::Oid>,
{
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + (self.oids_len as i32 * 4)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.prepare_name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.sql.as_bytes());
        buf.put_u8(0);
        buf.put_i16(self.oids_len);
        for oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter format codes.
    ///
    /// This can be empty to indicate that there are no parameters or that the
    /// parameters all use the default format (text); or one, in which case the
    /// specified format code is applied to all parameters; or it can equal the
    /// actual number of parameters.
    pub param_formats: &'a [PgFormat],
    /// Encoded parameter values; `None` is the NULL parameter, sent as
    /// length `-1` with no value bytes following.
    pub params: &'a [Option<Bytes>],
    /// The result-column format codes, same cardinality rule as
    /// `param_formats`.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + (self.param_formats.len().to_i32() * 2)
            + 2
            + self
                .params
                .iter()
                .fold(0i32, |acc, p| acc + 4 + p.as_ref().map_or(0, |b| b.len().to_i32()))
            + 2
            + (self.result_formats.len().to_i32() * 2)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.portal_name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.stmt_name.as_bytes());
        buf.put_u8(0);

        buf.put_u16(self.param_formats.len().to_u16());
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value);
                }
            }
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(0);
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.portal_name.as_bytes());
        buf.put_u8(0);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(0);
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// COPY data transfer, frontend to backend direction.
///
/// Data that forms part of a COPY data stream. Messages sent from the backend
/// will always correspond to single data rows, but messages sent by frontends
/// might divide the data stream arbitrarily.
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY-complete indicator.
pub struct CopyDone;

impl FrontendProtocol for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a COPY-failure indicator.
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub reason: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> i32 {
        self.reason.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.reason.as_bytes());
        buf.put_u8(0);
    }
}

/// Identifies the message as a termination.
///
/// Sent best-effort before closing the transport; the server also detects
/// abrupt closes on its next write.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn startup_frame_layout() {
        let mut buf = BytesMut::new();
        Startup { user: "u", database: Some("db"), settings: &[] }.write(&mut buf);

        // len(4) + version(4) + "user\0u\0database\0db\0" + terminator
        let len = i32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len());
        assert_eq!(&buf[4..8], PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0u\0database\0db\0\0");
    }

    #[test]
    fn batched_messages_share_buffer() {
        let mut buf = BytesMut::new();
        write(Query { sql: "SELECT 1" }, &mut buf);
        write(Sync, &mut buf);

        assert_eq!(buf[0], b'Q');
        let qlen = i32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        assert_eq!(buf[1 + qlen], b'S');
        assert_eq!(buf.len(), 1 + qlen + 1 + 4);
    }

    #[test]
    fn bind_null_parameter() {
        let mut buf = BytesMut::new();
        write(
            Bind {
                portal_name: "",
                stmt_name: "s1",
                param_formats: &[PgFormat::Binary],
                params: &[None],
                result_formats: &[PgFormat::Binary],
            },
            &mut buf,
        );
        // portal(1) + stmt(3) + fmts(2+2) + params(2) + null(-1:4) + rfmts(2+2)
        let len = i32::from_be_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(len, 4 + 1 + 3 + 4 + 2 + 4 + 4);
        // the NULL parameter is length -1 with no bytes following
        assert_eq!(&buf[buf.len() - 8..buf.len() - 4], (-1i32).to_be_bytes());
    }
}

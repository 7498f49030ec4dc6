//! Postgres Backend Messages
use bytes::{Buf, Bytes};

use super::{
    TransactionStatus,
    error::{DatabaseError, MessageFields, Notice, ProtocolError},
    pg_format::PgFormat,
    pg_type::Oid,
};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    FunctionCallResponse(FunctionCallResponse),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyBothResponse,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Error for a message that does not belong to the current phase.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($self:ident,$typ:ident) => {
        if $self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(stringify!($self), $self::MSGTYPE, $typ))
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Int32(0) Specifies that the authentication was successful.
    Ok,
    /// Int32(2) Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Int32(3) Specifies that a clear-text password is required.
    CleartextPassword,
    /// Int32(5) Specifies that an MD5-encrypted password is required.
    /// Byte4 The salt to use when encrypting the password.
    MD5Password {
        salt: [u8; 4],
    },
    /// Int32(7) Specifies that GSSAPI authentication is required.
    GSS,
    /// Int32(9) Specifies that SSPI authentication is required.
    SSPI,
    /// Int32(10) Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms,
    /// in the server's order of preference, nul terminated each, with
    /// an empty name terminating the list.
    SASL {
        mechanisms: Vec<ByteStr>,
    },
    /// Int32(11) A SASL challenge; the body is mechanism specific.
    SASLContinue {
        data: Bytes,
    },
    /// Int32(12) SASL authentication has completed; the body carries
    /// mechanism specific "additional data".
    SASLFinal {
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Authentication, msgtype);
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::truncated(4 - body.remaining()));
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::MD5Password { salt }
            }
            7 => Authentication::GSS,
            9 => Authentication::SSPI,
            10 => {
                let mut mechanisms = Vec::new();
                while body.first().is_some_and(|b| *b != 0) {
                    mechanisms.push(body.get_nul_bytestr()?);
                }
                Authentication::SASL { mechanisms }
            }
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(BackendKeyData, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report
///
/// Reported at startup for every parameter the server considers interesting,
/// and again whenever one of them changes.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterStatus, msgtype);
        Ok(Self {
            name: body.get_nul_bytestr()?,
            value: body.get_nul_bytestr()?,
        })
    }
}

/// A warning message. Routed through the notice hook chain, never an error.
#[derive(Debug)]
pub struct NoticeResponse {
    pub notice: Notice,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NoticeResponse, msgtype);
        Ok(Self { notice: Notice { fields: MessageFields::parse(body)? } })
    }
}

/// Identifies the message as an error.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: DatabaseError,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ErrorResponse, msgtype);
        Ok(Self { error: DatabaseError::new(MessageFields::parse(body)?) })
    }
}

/// Identifies the message as an asynchronous notification.
///
/// Delivered in response to `LISTEN`/`NOTIFY`.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub pid: i32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NotificationResponse, msgtype);
        Ok(Self {
            pid: body.get_i32(),
            channel: body.get_nul_bytestr()?,
            payload: body.get_nul_bytestr()?,
        })
    }
}

/// One field of a [`RowDescription`].
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see pg_type.typlen).
    /// Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see pg_attribute.atttypmod).
    pub type_modifier: i32,
    /// The format code being used for the field.
    ///
    /// In a RowDescription returned from the statement variant of Describe,
    /// the format code is not yet known and will always be zero.
    pub format: PgFormat,
}

/// Identifies the message as a row description.
///
/// Indicates that rows are about to be returned; the contents describe the
/// column layout of those rows.
#[derive(Debug, Clone)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(RowDescription, msgtype);
        let field_len = body.get_i16();
        let mut fields = Vec::with_capacity(field_len.max(0) as usize);
        for _ in 0..field_len {
            let name = body.get_nul_bytestr()?;
            if body.remaining() < 18 {
                return Err(ProtocolError::truncated(18 - body.remaining()));
            }
            fields.push(FieldDescription {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: PgFormat::from_code(body.get_u16()),
            });
        }
        Ok(Self { fields })
    }
}

/// Identifies the message as a data row.
///
/// Column values are kept as the raw wire body and split lazily.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub columns: i16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Split the body into per-column byte slices; `None` is NULL.
    pub fn split(mut self) -> Result<Vec<Option<Bytes>>, ProtocolError> {
        let mut values = Vec::with_capacity(self.columns.max(0) as usize);
        for _ in 0..self.columns {
            if self.body.remaining() < 4 {
                return Err(ProtocolError::truncated(4 - self.body.remaining()));
            }
            let len = self.body.get_i32();
            if len < 0 {
                values.push(None);
                continue;
            }
            let len = len as usize;
            if self.body.remaining() < len {
                return Err(ProtocolError::truncated(len - self.body.remaining()));
            }
            values.push(Some(self.body.split_to(len)));
        }
        Ok(values)
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(DataRow, msgtype);
        Ok(Self { columns: body.get_i16(), body })
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// The leading command word: `SELECT`, `INSERT`, `FETCH`, ...
    pub fn command(&self) -> &str {
        self.tag.split_whitespace().next().unwrap_or_default()
    }

    /// Number of rows affected by the completed command.
    ///
    /// For an INSERT command, the tag is `INSERT oid rows`; oid is always 0
    /// since OID system columns are not supported anymore.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CommandComplete, msgtype);
        Ok(Self { tag: body.get_nul_bytestr()? })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type, in parameter order.
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterDescription, msgtype);
        let len = body.get_i16();
        let mut oids = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            if body.remaining() < 4 {
                return Err(ProtocolError::truncated(4 - body.remaining()));
            }
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ReadyForQuery, msgtype);
        Ok(Self { status: TransactionStatus::from_u8(body.get_u8())? })
    }
}

/// COPY data transfer, backend to frontend direction.
///
/// Messages sent from the backend will always correspond to single data rows.
#[derive(Debug)]
pub struct CopyData {
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CopyData, msgtype);
        Ok(Self { data: body })
    }
}

macro_rules! copy_response {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// 0 indicates the overall COPY format is textual (rows separated
            /// by newlines, columns separated by separator characters, etc.).
            /// 1 indicates the overall copy format is binary.
            pub format: PgFormat,
            /// The format codes to be used for each column.
            ///
            /// All must be zero if the overall copy format is textual.
            pub column_formats: Vec<PgFormat>,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                let format = PgFormat::from_code(body.get_i8() as u16);
                let columns = body.get_i16();
                let mut column_formats = Vec::with_capacity(columns.max(0) as usize);
                for _ in 0..columns {
                    if body.remaining() < 2 {
                        return Err(ProtocolError::truncated(2 - body.remaining()));
                    }
                    column_formats.push(PgFormat::from_code(body.get_u16()));
                }
                Ok(Self { format, column_formats })
            }
        }
    )*};
}

copy_response! {
    /// The frontend must now send copy-in data; it is obliged to send either
    /// a `CopyDone` or `CopyFail` message to end the copy.
    struct CopyInResponse, b'G';

    /// Copy-out data will follow as `CopyData` messages terminated by
    /// `CopyDone`, then `CommandComplete`.
    struct CopyOutResponse, b'H';

    /// Used only for streaming replication; treated symmetrically to the
    /// in and out variants.
    struct CopyBothResponse, b'W';
}

/// Result of a function call.
///
/// The function call sub-protocol is considered legacy; the response is
/// decoded for completeness of the message set.
#[derive(Debug)]
pub struct FunctionCallResponse {
    /// The function result value, `None` for NULL.
    pub value: Option<Bytes>,
}

impl FunctionCallResponse {
    pub const MSGTYPE: u8 = b'V';
}

impl BackendProtocol for FunctionCallResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(FunctionCallResponse, msgtype);
        let len = body.get_i32();
        Ok(Self {
            value: (len >= 0).then(|| body.split_to(len as usize)),
        })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(stringify!($name), $name::MSGTYPE, msgtype))
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn command_complete_rows() {
        let tag = |s: &'static str| CommandComplete { tag: s.into() };
        assert_eq!(tag("INSERT 0 3").rows_affected(), 3);
        assert_eq!(tag("SELECT 42").rows_affected(), 42);
        assert_eq!(tag("FETCH 5").rows_affected(), 5);
        assert_eq!(tag("MOVE 100").rows_affected(), 100);
        assert_eq!(tag("CREATE TABLE").rows_affected(), 0);
        assert_eq!(tag("BEGIN").rows_affected(), 0);
        assert_eq!(tag("SELECT 42").command(), "SELECT");
    }

    #[test]
    fn data_row_split_nulls() {
        let mut body = BytesMut::new();
        body.put_i16(3);
        body.put_i32(2);
        body.put_slice(b"ab");
        body.put_i32(-1);
        body.put_i32(0);

        let row = DataRow::decode(b'D', body.freeze()).unwrap();
        let values = row.split().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].as_deref(), Some(&b"ab"[..]));
        assert!(values[1].is_none());
        assert_eq!(values[2].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn sasl_mechanism_list() {
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_slice(b"SCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0");

        let auth = Authentication::decode(b'R', body.freeze()).unwrap();
        let Authentication::SASL { mechanisms } = auth else {
            panic!("expected SASL")
        };
        assert_eq!(mechanisms.len(), 2);
        assert_eq!(mechanisms[0], "SCRAM-SHA-256");
    }

    #[test]
    fn ready_for_query_status() {
        let r = ReadyForQuery::decode(b'Z', Bytes::from_static(b"E")).unwrap();
        assert_eq!(r.status, TransactionStatus::FailedBlock);
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"x")).is_err());
    }
}

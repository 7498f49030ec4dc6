//! Postgres Frontend and Backend Protocol
//!
//! docs here mostly quoted from the official postgres documentation
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>
//!
//! # Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a message identifies the message type,
//! and the next four bytes specify the length of the rest of the message (this length count includes itself,
//! but not the message-type byte). The remaining contents of the message are determined by the message type.
//!
//! ```text
//! | u8 |        i32        | body
//! |----|-------------------|-----
//! | 43 | 00 | 00 | 00 | 32 |  ..
//!
//! Message Type -> length -> body
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte. The same applies to `CancelRequest` and `SSLRequest`.
//!
//! # Extended Query Overview
//!
//! In the extended-query protocol, overall execution cycle consists of a:
//!
//! - Parse step, which creates a prepared statement from a textual query string
//! - Bind step, which creates a portal given a prepared statement and values for any needed parameters;
//! - Execute step, that runs a portal's query.
//!
//! # Formats and Format Codes
//!
//! Data of a particular data type might be transmitted in any of several different formats.
//! As of PostgreSQL 7.4 the only supported formats are “text” and “binary”.
//!
//! | format | format code |
//! |--------|-------------|
//! |  text  |      0      |
//! | binary |      1      |
//!
//! Clients can specify a format code for each transmitted parameter value and for each column of a query result.

pub mod frontend;
pub mod backend;
pub mod framer;
pub mod error;
pub mod sasl;

mod pg_format;
mod pg_type;

pub use backend::{BackendMessage, BackendProtocol};
pub use error::{DatabaseError, Notice, ProtocolError};
pub use framer::{CopyFrame, Frame, Framer};
pub use frontend::FrontendProtocol;
pub use pg_format::PgFormat;
pub use pg_type::{Oid, oid};

/// Transaction status reported by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`: not in a transaction block.
    Idle,
    /// `T`: inside a transaction block.
    InBlock,
    /// `E`: inside a *failed* transaction block.
    ///
    /// Queries will be rejected until block is ended.
    FailedBlock,
}

impl TransactionStatus {
    pub(crate) fn from_u8(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InBlock),
            b'E' => Ok(Self::FailedBlock),
            _ => Err(ProtocolError::unknown_tx_status(status)),
        }
    }
}

//! Prepared statements and server side object names.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};

use crate::{
    Result,
    common::ByteStr,
    connection::Connection,
    cursor::Cursor,
    postgres::{Oid, PgFormat, backend::CommandComplete, frontend},
    query::{ChunkStream, ColumnStream, RowStream},
    row::{Row, RowSchema},
    transport::{PgTransport, PgTransportExt},
    types::{Codec, EncodeError},
    value::Value,
};

type AtomicId = std::sync::atomic::AtomicU16;

/// A generated server side object name.
///
/// Six bytes: a kind prefix and a zero padded counter.
#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 6]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 6])
    }

    pub(crate) fn next(prefix: u8, atomic: &AtomicId) -> Self {
        let id = atomic.fetch_add(1, Ordering::SeqCst);
        let mut buf = [prefix, b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            pub(crate) fn next() -> Self {
                static ID: AtomicId = AtomicId::new(0);
                Self(Id::next($prefix, &ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName, b's');
delegate!(PortalName, b'p');
delegate!(CursorName, b'c');

/// Immutable parse product shared between statement handles.
#[derive(Debug)]
pub(crate) struct StatementInner {
    pub name: StatementName,
    /// Cache key within the owning connection.
    pub sqlid: u64,
    pub sql: ByteStr,
    pub param_oids: Vec<Oid>,
    pub param_codecs: Vec<Arc<Codec>>,
    pub schema: RowSchema,
    /// `RowDescription` was returned, as opposed to `NoData`.
    pub returns_rows: bool,
    /// The statement is `COPY ... FROM STDIN` / `COPY ... TO STDOUT`.
    pub copy: Option<CopyDirection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyDirection {
    In,
    Out,
}

impl StatementInner {
    pub(crate) fn param_formats(&self) -> Vec<PgFormat> {
        self.param_codecs.iter().map(|c| c.format()).collect()
    }

    /// Marshal positional arguments against the declared parameter types.
    pub(crate) fn encode_params(&self, params: &[Value]) -> Result<Vec<Option<Bytes>>> {
        if params.len() != self.param_codecs.len() {
            return Err(EncodeError::Arity {
                expected: self.param_codecs.len(),
                got: params.len(),
            }
            .into());
        }

        let mut encoded = Vec::with_capacity(params.len());
        for (index, (value, codec)) in params.iter().zip(&self.param_codecs).enumerate() {
            if value.is_null() {
                encoded.push(None);
                continue;
            }
            let mut buf = BytesMut::new();
            codec
                .encode(value, &mut buf)
                .map_err(|e| e.at_parameter(index + 1))?;
            encoded.push(Some(buf.freeze()));
        }
        Ok(encoded)
    }
}

/// A server side prepared statement.
///
/// Created by [`Connection::prepare`]; usable only with the connection that
/// created it. Dropping the handle leaves the server side object to session
/// teardown; [`close`][Statement::close] releases it eagerly.
#[derive(Debug)]
pub struct Statement {
    pub(crate) inner: Arc<StatementInner>,
    closed: bool,
}

/// Result of [`Statement::first`].
#[derive(Debug)]
pub enum First {
    /// Single column, single row: the bare value.
    Value(Value),
    /// At least one row: the first one.
    Row(Row),
    /// No row producing statement: command tag and affected count.
    Command { tag: ByteStr, count: u64 },
    /// A row producing statement that yielded nothing.
    Empty,
}

impl Statement {
    pub(crate) fn new(inner: Arc<StatementInner>) -> Self {
        Self { inner, closed: false }
    }

    /// The statement text as sent to the server.
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Declared parameter type oids, from `ParameterDescription`.
    pub fn param_oids(&self) -> &[Oid] {
        &self.inner.param_oids
    }

    /// Output shape, empty when the statement returns no rows.
    pub fn schema(&self) -> &RowSchema {
        &self.inner.schema
    }

    /// Execute and collect every row. The portal is closed before return.
    pub async fn fetch_all(&self, conn: &mut Connection, params: &[Value]) -> Result<Vec<Row>> {
        self.guard()?;
        let out = conn.execute_prepared(&self.inner, params, 0).await?;
        Ok(out.rows)
    }

    /// Execute a statement that returns no rows; the affected row count.
    pub async fn execute(&self, conn: &mut Connection, params: &[Value]) -> Result<u64> {
        self.guard()?;
        let out = conn.execute_prepared(&self.inner, params, 0).await?;
        Ok(out.tag.map(|t| t.rows_affected()).unwrap_or_default())
    }

    /// Execute and reduce the result in the manner of the original `first`:
    /// a scalar for one row one column, the first row otherwise, the
    /// command tag for row-less statements.
    pub async fn first(&self, conn: &mut Connection, params: &[Value]) -> Result<First> {
        self.guard()?;
        let out = conn.execute_prepared(&self.inner, params, 0).await?;

        if !self.inner.returns_rows {
            let tag = out.tag.map(|t| (t.tag.clone(), t.rows_affected())).unwrap_or_default();
            return Ok(First::Command { tag: tag.0, count: tag.1 });
        }

        let mut rows = out.rows;
        match rows.len() {
            0 => Ok(First::Empty),
            _ => {
                let row = rows.swap_remove(0);
                match self.inner.schema.len() {
                    1 => Ok(First::Value(row.into_values().swap_remove(0))),
                    _ => Ok(First::Row(row)),
                }
            }
        }
    }

    /// Execute and stream rows on demand.
    ///
    /// Inside a transaction block the portal is read in server side chunks;
    /// otherwise the whole result streams behind one `Execute`.
    pub async fn rows<'c>(
        &self,
        conn: &'c mut Connection,
        params: &[Value],
    ) -> Result<RowStream<'c>> {
        self.guard()?;
        crate::query::fetch(conn, &self.inner, params).await
    }

    /// Like [`rows`][Statement::rows], batched at server chunk boundaries.
    pub async fn chunks<'c>(
        &self,
        conn: &'c mut Connection,
        params: &[Value],
    ) -> Result<ChunkStream<'c>> {
        self.guard()?;
        Ok(crate::query::fetch(conn, &self.inner, params).await?.chunks())
    }

    /// Like [`rows`][Statement::rows], yielding only the first column.
    pub async fn column<'c>(
        &self,
        conn: &'c mut Connection,
        params: &[Value],
    ) -> Result<ColumnStream<'c>> {
        self.guard()?;
        Ok(crate::query::fetch(conn, &self.inner, params).await?.column())
    }

    /// Declare a scrollable WITH HOLD cursor over this statement.
    pub async fn declare(&self, conn: &mut Connection, params: &[Value]) -> Result<Cursor> {
        self.guard()?;
        Cursor::declare(conn, &self.inner, params).await
    }

    /// Run the statement once per parameter vector, pipelined.
    ///
    /// For `COPY ... FROM STDIN` each item must be a single pre-formatted
    /// COPY line. Returns the total affected row count.
    pub async fn load_rows<I>(&self, conn: &mut Connection, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        self.guard()?;
        if self.inner.copy == Some(CopyDirection::In) {
            return conn
                .load_copy_lines(&self.inner, rows.into_iter().flatten())
                .await;
        }
        conn.load_rows_chunk(&self.inner, rows.into_iter()).await
    }

    /// Like [`load_rows`][Statement::load_rows] but pipelines whole chunks
    /// before reading their acknowledgements.
    pub async fn load_chunks<I, C>(&self, conn: &mut Connection, chunks: I) -> Result<u64>
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = Vec<Value>>,
    {
        self.guard()?;
        if self.inner.copy == Some(CopyDirection::In) {
            let lines = chunks.into_iter().flat_map(|c| c.into_iter()).flatten();
            return conn.load_copy_lines(&self.inner, lines).await;
        }

        let mut total = 0;
        for chunk in chunks {
            total += conn.load_rows_chunk(&self.inner, chunk.into_iter()).await?;
        }
        Ok(total)
    }

    /// Close the server side statement. Idempotent.
    ///
    /// Inside a failed block, or once the connection is gone, the handle
    /// is marked closed locally; the server reclaims the object at
    /// rollback or session teardown.
    pub async fn close(&mut self, conn: &mut Connection) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        conn.forget_statement(self.inner.sqlid);

        if conn.ensure_ready(None).is_err() {
            return Ok(());
        }
        conn.stream.send(frontend::Close { variant: b'S', name: self.inner.name.as_str() });
        conn.stream.send(frontend::Sync);
        conn.stream.flush().await?;
        conn.recv_expect::<crate::postgres::backend::CloseComplete>().await?;
        conn.recv_expect::<crate::postgres::backend::ReadyForQuery>().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn guard(&self) -> Result<()> {
        if self.closed {
            return Err(crate::error::StateError::StatementClosed.into());
        }
        Ok(())
    }
}

/// Output of one extended query execution.
#[derive(Debug, Default)]
pub(crate) struct ExecOutcome {
    pub rows: Vec<Row>,
    pub tag: Option<CommandComplete>,
    pub suspended: bool,
}

//! Postgres connection and its state machine.
//!
//! One [`Connection`] owns one transport exclusively. Exactly one
//! operation is in flight at a time: every public operation runs to the
//! terminating `ReadyForQuery` (or resynchronizes to it on error) before
//! returning.
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::{
    Error, Result,
    common::ByteStr,
    error::{ErrorKind, StateError},
    net::{Socket, SslMode, TlsAttempt},
    notify::Notification,
    postgres::{
        BackendMessage, TransactionStatus,
        backend::{self, BackendKeyData, CommandComplete, RowDescription},
        frontend,
    },
    registry::TypeRegistry,
    row::{ColumnInfo, Row, RowSchema},
    statement::{CopyDirection, Statement, StatementInner, StatementName},
    stream::{NoticeHook, PgStream},
    transport::{PgTransport, PgTransportExt},
    types::Codec,
    value::Value,
};

mod config;
mod startup;

pub use config::{Config, ParseError};

/// Connection state outside of an operation.
///
/// The `negotiating` and `authenticating` phases exist only inside
/// [`Connection::connect`]; a constructed connection starts at `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Ready,
    CopyIn,
    CopyOut,
    CopyBoth,
    Terminated,
}

impl ConnState {
    fn name(self) -> &'static str {
        match self {
            ConnState::Ready => "ready",
            ConnState::CopyIn => "copy-in",
            ConnState::CopyOut => "copy-out",
            ConnState::CopyBoth => "copy-both",
            ConnState::Terminated => "terminated",
        }
    }
}

/// A single postgres session.
pub struct Connection {
    pub(crate) stream: PgStream,
    config: Config,
    key_data: BackendKeyData,
    pub(crate) registry: TypeRegistry,
    pub(crate) state: ConnState,
    /// Transaction nesting depth maintained by the transaction layer.
    pub(crate) tx_depth: u32,
    stmt_cache: HashMap<u64, Arc<StatementInner>>,
}

/// Result of one statement inside a simple query.
#[derive(Debug)]
pub struct QueryResult {
    /// The command tag, e.g. `SELECT 3`.
    pub tag: ByteStr,
    pub rows_affected: u64,
    pub rows: Vec<Row>,
}

impl Connection {
    /// Connect using a `pq://` connection string.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using environment configuration.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect using an explicit [`Config`].
    pub async fn connect_with(config: Config) -> Result<Connection> {
        let attempt = async {
            match Self::establish(&config).await {
                // `allow` starts in plaintext and retries secured when the
                // server turned the plaintext session away
                Err(err)
                    if config.tls.mode == SslMode::Allow
                        && matches!(err.kind(), ErrorKind::Server(_)) =>
                {
                    let mut secured = config.clone();
                    secured.tls.mode = SslMode::Require;
                    Self::establish(&secured).await
                }
                other => other,
            }
        };

        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| {
                    Error::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timeout expired",
                    ))
                })?,
            None => attempt.await,
        }
    }

    async fn establish(config: &Config) -> Result<Connection> {
        let socket = match &config.unix {
            Some(path) => Socket::connect_unix(path).await?,
            None => Socket::connect_tcp(&config.host, config.port).await?,
        };

        let socket = match config.tls.mode {
            SslMode::Disable | SslMode::Allow => socket,
            SslMode::Prefer | SslMode::Require => {
                match socket.request_tls(&config.tls, &config.host).await? {
                    TlsAttempt::Secured(socket) => socket,
                    TlsAttempt::Refused(socket) if config.tls.mode == SslMode::Prefer => socket,
                    TlsAttempt::Refused(_) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "server refused TLS but sslmode requires it",
                        )
                        .into());
                    }
                }
            }
        };

        let mut stream = PgStream::new(socket);
        let outcome = startup::startup(&mut stream, config).await?;

        Ok(Connection {
            stream,
            config: config.clone(),
            key_data: outcome.key_data,
            registry: TypeRegistry::bootstrap(),
            state: ConnState::Ready,
            tx_depth: 0,
            stmt_cache: HashMap::new(),
        })
    }

    /// Backend process id, used by [`cancel`][Connection::cancel] and
    /// reported in notifications.
    pub fn pid(&self) -> i32 {
        self.key_data.process_id
    }

    /// Transaction status from the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.stream.transaction_status()
    }

    /// Last reported value of a server parameter setting, mirrored from
    /// `ParameterStatus` messages.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.stream.parameter(name).map(|v| v.as_str())
    }

    /// Register a notice hook. Hooks run in registration order; the first
    /// one returning `true` stops the walk.
    pub fn on_notice(&mut self, hook: NoticeHook) {
        self.stream.push_hook(hook);
    }

    /// Register a codec for a type oid, overriding catalog resolution.
    pub fn register_codec(&mut self, oid: crate::postgres::Oid, codec: Codec) {
        self.registry.insert(oid, Arc::new(codec));
    }

    /// Take the notifications received so far.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.stream.notifies.drain(..).collect()
    }

    /// Drop a closed statement from the prepared statement cache.
    pub(crate) fn forget_statement(&mut self, sqlid: u64) {
        self.stmt_cache.remove(&sqlid);
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Terminated
    }

    /// Send `Terminate` and mark the connection closed. Idempotent; the
    /// transport itself is released on drop.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnState::Terminated {
            return Ok(());
        }
        self.state = ConnState::Terminated;
        self.stream.send(frontend::Terminate);
        // best effort: the server also detects an abrupt close
        let _ = self.stream.flush().await;
        Ok(())
    }

    /// Ask the server to interrupt whatever this connection is running.
    ///
    /// Sent over a fresh transport, never the live one. Best effort: no
    /// confirmation exists; the running query fails with a server error
    /// if the cancel took effect.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match &self.config.unix {
            Some(path) => Socket::connect_unix(path).await?,
            None => Socket::connect_tcp(&self.config.host, self.config.port).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.key_data.process_id,
            secret_key: self.key_data.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.shutdown().await?;
        Ok(())
    }

    // ===== gating =====

    /// Refuse operations the current state cannot serve, locally.
    ///
    /// Inside a failed transaction block everything except rollback is
    /// rejected here, before any byte is written.
    pub(crate) fn ensure_ready(&self, sql: Option<&str>) -> Result<()> {
        match self.state {
            ConnState::Ready => {}
            ConnState::Terminated => return Err(StateError::Closed.into()),
            other => {
                return Err(StateError::WrongState {
                    expected: ConnState::Ready.name(),
                    actual: other.name(),
                }
                .into());
            }
        }

        if self.stream.transaction_status() == TransactionStatus::FailedBlock
            && !sql.is_some_and(is_rollback)
        {
            return Err(StateError::InFailedBlock.into());
        }

        Ok(())
    }

    /// Receive, resynchronizing to `ReadyForQuery` when the server reports
    /// an error so the cached transaction status stays truthful.
    pub(crate) async fn recv_expect<B: crate::postgres::BackendProtocol>(&mut self) -> Result<B> {
        match self.stream.recv::<B>().await {
            Err(e) if matches!(e.kind(), ErrorKind::Server(_)) => {
                if self.stream.resync().await.is_err() {
                    self.state = ConnState::Terminated;
                }
                Err(e)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.state = ConnState::Terminated;
                }
                Err(e)
            }
            ok => ok,
        }
    }

    /// Abandon the current reply cycle after a local failure.
    pub(crate) async fn fail_resync<T>(&mut self, err: Error) -> Result<T> {
        if self.stream.resync().await.is_err() {
            self.state = ConnState::Terminated;
        }
        Err(err)
    }

    // ===== simple query =====

    /// Run one simple `Query` message, which may contain several
    /// statements. Rows come back in text format.
    pub async fn query_simple(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.ensure_ready(Some(sql))?;
        self.stream.send(frontend::Query { sql });
        self.stream.flush().await?;

        let mut results = Vec::new();
        let mut schema: Option<RowSchema> = None;
        let mut rows = Vec::new();

        loop {
            use BackendMessage::*;
            match self.recv_expect().await? {
                RowDescription(rd) => {
                    schema = Some(text_schema(&rd));
                    rows.clear();
                }
                DataRow(dr) => {
                    let Some(schema) = &schema else {
                        let err = crate::postgres::ProtocolError::unexpected_phase(
                            backend::DataRow::MSGTYPE,
                            "simple query without row description",
                        );
                        return self.fail_resync(err.into()).await;
                    };
                    match schema.decode_row(dr) {
                        Ok(row) => rows.push(row),
                        Err(err) => return self.fail_resync(err).await,
                    }
                }
                CommandComplete(tag) => {
                    results.push(QueryResult {
                        rows_affected: tag.rows_affected(),
                        tag: tag.tag,
                        rows: std::mem::take(&mut rows),
                    });
                    schema = None;
                }
                EmptyQueryResponse(_) => {}
                CopyInResponse(_) => {
                    self.stream.send(frontend::CopyFail { reason: "COPY via simple query API" });
                    let err: Error = StateError::WrongState {
                        expected: "copy_in",
                        actual: "query_simple",
                    }
                    .into();
                    return self.fail_resync(err).await;
                }
                CopyOutResponse(_) | CopyBothResponse(_) => {
                    let err: Error = StateError::WrongState {
                        expected: "copy_out",
                        actual: "query_simple",
                    }
                    .into();
                    return self.fail_resync(err).await;
                }
                ReadyForQuery(_) => break,
                f => return self.fail_resync(f.unexpected("simple query").into()).await,
            }
        }

        Ok(results)
    }

    /// Run a simple query and return the affected row count of its last
    /// statement.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let results = self.query_simple(sql).await?;
        Ok(results.last().map(|r| r.rows_affected).unwrap_or_default())
    }

    /// Empty query round trip: collects pending asynchronous messages.
    ///
    /// Succeeds even inside a failed transaction block, which makes it the
    /// polling vehicle of the notification manager.
    pub(crate) async fn pump(&mut self) -> Result<()> {
        if self.state == ConnState::Terminated {
            return Err(StateError::Closed.into());
        }
        self.stream.send(frontend::Query { sql: "" });
        self.stream.flush().await?;
        loop {
            use BackendMessage::*;
            match self.recv_expect().await? {
                EmptyQueryResponse(_) => {}
                ReadyForQuery(_) => return Ok(()),
                f => return self.fail_resync(f.unexpected("idle pump").into()).await,
            }
        }
    }

    // ===== extended query =====

    /// Parse a statement, describe it, and resolve codecs for its
    /// parameters and columns.
    pub async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.ensure_ready(Some(sql))?;

        let sqlid = {
            let mut hasher = DefaultHasher::new();
            sql.trim().hash(&mut hasher);
            hasher.finish()
        };
        if let Some(inner) = self.stmt_cache.get(&sqlid) {
            return Ok(Statement::new(inner.clone()));
        }

        let name = StatementName::next();
        self.stream.send(frontend::Parse {
            prepare_name: name.as_str(),
            sql,
            oids_len: 0,
            oids: std::iter::empty(),
        });
        self.stream.send(frontend::Describe { kind: b'S', name: name.as_str() });
        self.stream.send(frontend::Sync);
        self.stream.flush().await?;

        self.recv_expect::<backend::ParseComplete>().await?;
        let params = self.recv_expect::<backend::ParameterDescription>().await?;

        let mut described: Option<RowDescription> = None;
        loop {
            use BackendMessage::*;
            match self.recv_expect().await? {
                RowDescription(rd) => described = Some(rd),
                NoData(_) => {}
                ReadyForQuery(_) => break,
                f => return self.fail_resync(f.unexpected("describe statement").into()).await,
            }
        }

        // connection is ready again; catalog lookups may run now
        let mut param_codecs = Vec::with_capacity(params.oids.len());
        for oid in &params.oids {
            param_codecs.push(self.resolve_codec(*oid).await?);
        }

        let (schema, returns_rows) = match &described {
            None => (RowSchema::empty(), false),
            Some(rd) => {
                let mut columns = Vec::with_capacity(rd.fields.len());
                for field in &rd.fields {
                    let codec = self.resolve_codec(field.type_oid).await?;
                    columns.push(ColumnInfo {
                        name: field.name.clone(),
                        oid: field.type_oid,
                        format: codec.format(),
                        codec,
                    });
                }
                (RowSchema::new(columns), true)
            }
        };

        let inner = Arc::new(StatementInner {
            name,
            sqlid,
            sql: ByteStr::copy_from_str(sql),
            param_oids: params.oids,
            param_codecs,
            schema,
            returns_rows,
            copy: copy_direction(sql),
        });
        self.stmt_cache.insert(sqlid, inner.clone());

        Ok(Statement::new(inner))
    }

    /// One Bind/Execute/Sync cycle over a prepared statement.
    pub(crate) async fn execute_prepared(
        &mut self,
        inner: &StatementInner,
        params: &[Value],
        max_row: u32,
    ) -> Result<crate::statement::ExecOutcome> {
        self.ensure_ready(Some(&inner.sql))?;
        if inner.copy.is_some() {
            return Err(StateError::WrongState {
                expected: "copy transfer api",
                actual: "extended fetch",
            }
            .into());
        }

        let encoded = inner.encode_params(params)?;
        self.stream.send(frontend::Bind {
            portal_name: "",
            stmt_name: inner.name.as_str(),
            param_formats: &inner.param_formats(),
            params: &encoded,
            result_formats: &inner.schema.result_formats(),
        });
        self.stream.send(frontend::Execute { portal_name: "", max_row });
        self.stream.send(frontend::Sync);
        self.stream.flush().await?;

        self.recv_expect::<backend::BindComplete>().await?;

        let mut out = crate::statement::ExecOutcome::default();
        let mut empty = false;

        loop {
            use BackendMessage::*;
            match self.recv_expect().await? {
                DataRow(dr) => match inner.schema.decode_row(dr) {
                    Ok(row) => out.rows.push(row),
                    Err(err) => return self.fail_resync(err).await,
                },
                CommandComplete(tag) => out.tag = Some(tag),
                PortalSuspended(_) => out.suspended = true,
                EmptyQueryResponse(_) => empty = true,
                ReadyForQuery(_) => break,
                f => return self.fail_resync(f.unexpected("extended query").into()).await,
            }
        }

        if empty {
            return Err(StateError::EmptyQuery.into());
        }
        Ok(out)
    }

    /// Pipelined bulk execution: one Bind/Execute per parameter vector,
    /// one Sync per chunk.
    pub(crate) async fn load_rows_chunk(
        &mut self,
        inner: &StatementInner,
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<u64> {
        self.ensure_ready(Some(&inner.sql))?;

        const BATCH: usize = 256;
        let mut total = 0u64;
        let mut rows = rows.peekable();

        while rows.peek().is_some() {
            let mut pending = 0usize;
            for params in rows.by_ref().take(BATCH) {
                let encoded = inner.encode_params(&params)?;
                self.stream.send(frontend::Bind {
                    portal_name: "",
                    stmt_name: inner.name.as_str(),
                    param_formats: &inner.param_formats(),
                    params: &encoded,
                    result_formats: &inner.schema.result_formats(),
                });
                self.stream.send(frontend::Execute { portal_name: "", max_row: 0 });
                pending += 1;
            }
            self.stream.send(frontend::Sync);
            self.stream.flush().await?;

            for _ in 0..pending {
                self.recv_expect::<backend::BindComplete>().await?;
                loop {
                    use BackendMessage::*;
                    match self.recv_expect().await? {
                        DataRow(_) => {}
                        CommandComplete(tag) => {
                            total += tag.rows_affected();
                            break;
                        }
                        EmptyQueryResponse(_) => break,
                        f => {
                            return self.fail_resync(f.unexpected("pipelined execute").into()).await;
                        }
                    }
                }
            }
            self.recv_expect::<backend::ReadyForQuery>().await?;
        }

        Ok(total)
    }

    /// `COPY ... FROM STDIN` through a prepared statement: every item is
    /// one pre-formatted COPY line.
    pub(crate) async fn load_copy_lines(
        &mut self,
        inner: &StatementInner,
        lines: impl Iterator<Item = Value>,
    ) -> Result<u64> {
        self.ensure_ready(Some(&inner.sql))?;

        let encoded = inner.encode_params(&[])?;
        self.stream.send(frontend::Bind {
            portal_name: "",
            stmt_name: inner.name.as_str(),
            param_formats: &[],
            params: &encoded,
            result_formats: &[],
        });
        self.stream.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.stream.send(frontend::Flush);
        self.stream.flush().await?;

        self.recv_expect::<backend::BindComplete>().await?;
        self.recv_expect::<backend::CopyInResponse>().await?;
        self.state = ConnState::CopyIn;

        for line in lines {
            let data = match &line {
                Value::Text(text) => bytes::Bytes::copy_from_slice(text.as_bytes()),
                Value::Bytea(bytes) => bytes.clone(),
                other => {
                    let rendered = match crate::types::text::render(other) {
                        Ok(rendered) => rendered,
                        Err(err) => {
                            self.stream.send(frontend::CopyFail { reason: "bad copy line" });
                            self.stream.send(frontend::Sync);
                            self.state = ConnState::Ready;
                            return self.fail_resync(err.into()).await;
                        }
                    };
                    bytes::Bytes::from(rendered.into_bytes())
                }
            };
            self.stream.send(frontend::CopyData { data: &data });
        }

        self.stream.send(frontend::CopyDone);
        self.stream.send(frontend::Sync);
        self.stream.flush().await?;
        self.state = ConnState::Ready;

        let tag = self.recv_expect::<backend::CommandComplete>().await?;
        self.recv_expect::<backend::ReadyForQuery>().await?;
        Ok(tag.rows_affected())
    }

    /// Unnamed-statement text command carrying no parameters, decoding
    /// rows against a known schema. The vehicle for cursor FETCH/MOVE.
    pub(crate) async fn extended_text_command(
        &mut self,
        sql: &str,
        schema: &RowSchema,
    ) -> Result<(Vec<Row>, Option<CommandComplete>)> {
        self.ensure_ready(Some(sql))?;

        self.stream.send(frontend::Parse {
            prepare_name: "",
            sql,
            oids_len: 0,
            oids: std::iter::empty(),
        });
        self.stream.send(frontend::Bind {
            portal_name: "",
            stmt_name: "",
            param_formats: &[],
            params: &[],
            result_formats: &schema.result_formats(),
        });
        self.stream.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.stream.send(frontend::Sync);
        self.stream.flush().await?;

        self.recv_expect::<backend::ParseComplete>().await?;
        self.recv_expect::<backend::BindComplete>().await?;

        let mut rows = Vec::new();
        let mut tag = None;
        loop {
            use BackendMessage::*;
            match self.recv_expect().await? {
                DataRow(dr) => match schema.decode_row(dr) {
                    Ok(row) => rows.push(row),
                    Err(err) => return self.fail_resync(err).await,
                },
                CommandComplete(complete) => tag = Some(complete),
                ReadyForQuery(_) => break,
                f => return self.fail_resync(f.unexpected("cursor command").into()).await,
            }
        }

        Ok((rows, tag))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pid", &self.key_data.process_id)
            .field("state", &self.state.name())
            .field("tx_status", &self.stream.transaction_status())
            .finish()
    }
}

/// Schema for simple-query results: every column arrives in text format.
fn text_schema(rd: &RowDescription) -> RowSchema {
    let codec = Arc::new(Codec::TextFallback);
    RowSchema::new(
        rd.fields
            .iter()
            .map(|field| ColumnInfo {
                name: field.name.clone(),
                oid: field.type_oid,
                format: crate::postgres::PgFormat::Text,
                codec: codec.clone(),
            })
            .collect(),
    )
}

/// Commands allowed inside a failed transaction block.
pub(crate) fn is_rollback(sql: &str) -> bool {
    let head = sql.trim_start();
    let word = head
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or_default();
    word.eq_ignore_ascii_case("rollback") || word.eq_ignore_ascii_case("abort")
}

/// Best effort COPY detection for the statement bulk loading path.
fn copy_direction(sql: &str) -> Option<CopyDirection> {
    let head = sql.trim_start();
    if !head.get(..4).is_some_and(|w| w.eq_ignore_ascii_case("copy")) {
        return None;
    }
    let upper = head.to_ascii_uppercase();
    if upper.contains("FROM STDIN") {
        return Some(CopyDirection::In);
    }
    if upper.contains("TO STDOUT") {
        return Some(CopyDirection::Out);
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rollback_detection() {
        assert!(is_rollback("ROLLBACK"));
        assert!(is_rollback("  rollback to savepoint s1;"));
        assert!(is_rollback("ABORT"));
        assert!(!is_rollback("SELECT 1"));
        assert!(!is_rollback("ROLLBACKX"));
    }

    #[test]
    fn copy_statement_detection() {
        assert_eq!(copy_direction("COPY t FROM STDIN"), Some(CopyDirection::In));
        assert_eq!(
            copy_direction("copy (select 1) to stdout"),
            Some(CopyDirection::Out)
        );
        assert_eq!(copy_direction("COPY t TO '/tmp/f'"), None);
        assert_eq!(copy_direction("SELECT 'COPY'"), None);
    }
}

//! Lazy result streaming over an executed portal.
//!
//! Outside a transaction block the whole result streams behind a single
//! `Execute`. Inside a block a named portal is read in server side chunks,
//! resumed with further `Execute` messages after each `PortalSuspended`.
//!
//! Dropping a stream mid way closes the underlying portal best effort:
//! the close is buffered and the frames of the abandoned reply cycle are
//! skipped on the next operation.
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_core::Stream;

use crate::{
    Error, Result,
    connection::{ConnState, Connection},
    error::{ErrorKind, StateError},
    postgres::{BackendMessage, TransactionStatus, backend::CommandComplete, frontend},
    row::{Row, RowSchema},
    statement::{PortalName, StatementInner},
    transport::{PgTransport, PgTransportExt},
    value::Value,
};

/// Rows per `Execute` when reading a named portal inside a block.
const CHUNK_ROWS: u32 = 256;

/// Bind a portal and start streaming it.
pub(crate) async fn fetch<'c>(
    conn: &'c mut Connection,
    inner: &StatementInner,
    params: &[Value],
) -> Result<RowStream<'c>> {
    conn.ensure_ready(Some(&inner.sql))?;
    if inner.copy.is_some() {
        return Err(StateError::WrongState {
            expected: "copy transfer api",
            actual: "streaming fetch",
        }
        .into());
    }

    let in_block = conn.transaction_status() == TransactionStatus::InBlock;
    let (portal, chunk) = match in_block {
        // a named portal survives Sync within its transaction
        true => (PortalName::next(), CHUNK_ROWS),
        false => (PortalName::unnamed(), 0),
    };

    let encoded = inner.encode_params(params)?;
    conn.stream.send(frontend::Bind {
        portal_name: portal.as_str(),
        stmt_name: inner.name.as_str(),
        param_formats: &inner.param_formats(),
        params: &encoded,
        result_formats: &inner.schema.result_formats(),
    });
    conn.stream.send(frontend::Execute { portal_name: portal.as_str(), max_row: chunk });
    conn.stream.send(frontend::Sync);
    conn.stream.flush().await?;

    conn.recv_expect::<crate::postgres::backend::BindComplete>().await?;

    Ok(RowStream {
        conn,
        schema: inner.schema.clone(),
        portal,
        chunk,
        phase: Phase::Rows,
        tag: None,
        empty: false,
    })
}

#[derive(Debug)]
enum Phase {
    /// Reading `DataRow`s of the current execute cycle.
    Rows,
    /// Reading the `ReadyForQuery` that ends a cycle; `resume` means a
    /// further `Execute` follows.
    AwaitReady { resume: bool },
    /// Closing the named portal after exhaustion.
    CloseComplete,
    CloseReady,
    /// Skipping to `ReadyForQuery` after an error, which is then returned.
    Resync { err: Option<Error> },
    Done,
}

/// Internal stream event; chunk boundaries are visible to [`ChunkStream`].
enum RowEvent {
    Row(Row),
    ChunkEnd,
    Done,
}

/// A lazy sequence of rows. Single pass, non restartable.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<'c> {
    conn: &'c mut Connection,
    schema: RowSchema,
    portal: PortalName,
    chunk: u32,
    phase: Phase,
    tag: Option<CommandComplete>,
    empty: bool,
}

impl<'c> RowStream<'c> {
    /// Batch rows at server chunk boundaries.
    pub fn chunks(self) -> ChunkStream<'c> {
        ChunkStream { inner: self, buf: Vec::new() }
    }

    /// Stream only the first column of every row.
    pub fn column(self) -> ColumnStream<'c> {
        ColumnStream { inner: self }
    }

    /// Command tag, available after the stream is exhausted.
    pub fn tag(&self) -> Option<&CommandComplete> {
        self.tag.as_ref()
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<RowEvent>> {
        loop {
            match &mut self.phase {
                Phase::Rows => {
                    let msg = match ready!(self.conn.stream.poll_recv::<BackendMessage>(cx)) {
                        Ok(msg) => msg,
                        Err(err) if matches!(err.kind(), ErrorKind::Server(_)) => {
                            self.phase = Phase::Resync { err: Some(err) };
                            continue;
                        }
                        Err(err) => {
                            self.phase = Phase::Done;
                            return Poll::Ready(Err(err));
                        }
                    };
                    use BackendMessage::*;
                    match msg {
                        DataRow(dr) => match self.schema.decode_row(dr) {
                            Ok(row) => return Poll::Ready(Ok(RowEvent::Row(row))),
                            Err(err) => {
                                self.phase = Phase::Resync { err: Some(err) };
                                continue;
                            }
                        },
                        PortalSuspended(_) => self.phase = Phase::AwaitReady { resume: true },
                        CommandComplete(tag) => {
                            self.tag = Some(tag);
                            self.phase = Phase::AwaitReady { resume: false };
                        }
                        EmptyQueryResponse(_) => {
                            self.empty = true;
                            self.phase = Phase::AwaitReady { resume: false };
                        }
                        f => {
                            let err: Error = f.unexpected("streaming fetch").into();
                            self.phase = Phase::Resync { err: Some(err) };
                        }
                    }
                }
                Phase::AwaitReady { resume } => {
                    let resume = *resume;
                    match ready!(self.conn.stream.poll_recv::<BackendMessage>(cx))? {
                        BackendMessage::ReadyForQuery(_) => {}
                        f => {
                            // skip the rest of the cycle before surfacing
                            self.phase =
                                Phase::Resync { err: Some(f.unexpected("streaming fetch").into()) };
                            continue;
                        }
                    }

                    if resume {
                        self.conn.stream.send(frontend::Execute {
                            portal_name: self.portal.as_str(),
                            max_row: self.chunk,
                        });
                        self.conn.stream.send(frontend::Sync);
                        self.phase = Phase::Rows;
                        return Poll::Ready(Ok(RowEvent::ChunkEnd));
                    }

                    if self.empty {
                        self.phase = Phase::Done;
                        return Poll::Ready(Err(StateError::EmptyQuery.into()));
                    }

                    if self.portal.is_unnamed() {
                        self.phase = Phase::Done;
                        return Poll::Ready(Ok(RowEvent::Done));
                    }
                    // release the named portal eagerly
                    self.conn.stream.send(frontend::Close {
                        variant: b'P',
                        name: self.portal.as_str(),
                    });
                    self.conn.stream.send(frontend::Sync);
                    self.phase = Phase::CloseComplete;
                }
                Phase::CloseComplete => {
                    match ready!(self.conn.stream.poll_recv::<BackendMessage>(cx))? {
                        BackendMessage::CloseComplete(_) => self.phase = Phase::CloseReady,
                        f => {
                            self.phase =
                                Phase::Resync { err: Some(f.unexpected("portal close").into()) };
                        }
                    }
                }
                Phase::CloseReady => {
                    match ready!(self.conn.stream.poll_recv::<BackendMessage>(cx))? {
                        BackendMessage::ReadyForQuery(_) => {
                            self.phase = Phase::Done;
                            return Poll::Ready(Ok(RowEvent::Done));
                        }
                        f => {
                            self.phase =
                                Phase::Resync { err: Some(f.unexpected("portal close").into()) };
                        }
                    }
                }
                Phase::Resync { err } => {
                    let msg = ready!(self.conn.stream.poll_recv::<BackendMessage>(cx));
                    match msg {
                        Ok(BackendMessage::ReadyForQuery(_)) => {
                            let err = err.take().expect("resync holds the error");
                            self.phase = Phase::Done;
                            return Poll::Ready(Err(err));
                        }
                        Ok(_) => {}
                        Err(e) if matches!(e.kind(), ErrorKind::Server(_)) => {}
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                Phase::Done => return Poll::Ready(Ok(RowEvent::Done)),
            }
        }
    }
}

impl Stream for RowStream<'_> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            match ready!(me.poll_event(cx)) {
                Ok(RowEvent::Row(row)) => return Poll::Ready(Some(Ok(row))),
                Ok(RowEvent::ChunkEnd) => continue,
                Ok(RowEvent::Done) => return Poll::Ready(None),
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Done) {
            return;
        }
        // abandon the reply cycle; the skip happens on the next operation
        if !self.portal.is_unnamed() && self.conn.state == ConnState::Ready {
            self.conn.stream.send(frontend::Close {
                variant: b'P',
                name: self.portal.as_str(),
            });
            self.conn.stream.send(frontend::Sync);
            self.conn.stream.ready_request();
        }
        self.conn.stream.ready_request();
    }
}

/// Row batches aligned with server `DataRow` groups.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct ChunkStream<'c> {
    inner: RowStream<'c>,
    buf: Vec<Row>,
}

impl Stream for ChunkStream<'_> {
    type Item = Result<Vec<Row>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            match ready!(me.inner.poll_event(cx)) {
                Ok(RowEvent::Row(row)) => me.buf.push(row),
                Ok(RowEvent::ChunkEnd) => {
                    if !me.buf.is_empty() {
                        return Poll::Ready(Some(Ok(std::mem::take(&mut me.buf))));
                    }
                }
                Ok(RowEvent::Done) => {
                    if !me.buf.is_empty() {
                        return Poll::Ready(Some(Ok(std::mem::take(&mut me.buf))));
                    }
                    return Poll::Ready(None);
                }
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }
    }
}

/// The first column of every row.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct ColumnStream<'c> {
    inner: RowStream<'c>,
}

impl Stream for ColumnStream<'_> {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            match ready!(me.inner.poll_event(cx)) {
                Ok(RowEvent::Row(row)) => {
                    let mut values = row.into_values();
                    let value = match values.is_empty() {
                        true => Value::Null,
                        false => values.swap_remove(0),
                    };
                    return Poll::Ready(Some(Ok(value)));
                }
                Ok(RowEvent::ChunkEnd) => continue,
                Ok(RowEvent::Done) => return Poll::Ready(None),
                Err(err) => return Poll::Ready(Some(Err(err))),
            }
        }
    }
}

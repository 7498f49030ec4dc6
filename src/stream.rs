//! Buffered postgres wire io.
//!
//! [`PgStream`] owns the transport, the read side framer and the write side
//! send queue. Asynchronous messages (`NoticeResponse`,
//! `NotificationResponse`, `ParameterStatus`) are absorbed here and never
//! surface to protocol code.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::task::{Context, Poll, ready};

use bytes::BytesMut;

use crate::{
    Error, Result,
    common::ByteStr,
    error::ErrorKind,
    net::Socket,
    notify::Notification,
    postgres::{
        BackendProtocol, CopyFrame, Framer, FrontendProtocol, Notice, TransactionStatus, backend,
        frontend,
    },
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// A notice callback; returning `true` stops propagation down the chain.
pub type NoticeHook = Box<dyn Fn(&Notice) -> bool + Send + Sync>;

/// Buffered connection to postgres.
pub struct PgStream {
    socket: Socket,
    framer: Framer,
    write_buf: BytesMut,
    /// Messages to skip until `ReadyForQuery`, requested by drop paths.
    ready_requests: u32,
    /// Mirror of every `ParameterStatus` reported by the server.
    parameters: HashMap<ByteStr, ByteStr>,
    /// Notifications received and not yet consumed.
    pub(crate) notifies: VecDeque<Notification>,
    /// Notice hook chain: statement, connection, driver. First hook
    /// returning `true` ends the walk.
    hooks: Vec<NoticeHook>,
    /// Transaction status from the last `ReadyForQuery` seen on the wire.
    tx_status: TransactionStatus,
}

impl PgStream {
    pub(crate) fn new(socket: Socket) -> Self {
        Self {
            socket,
            framer: Framer::new(),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            ready_requests: 0,
            parameters: HashMap::new(),
            notifies: VecDeque::new(),
            hooks: Vec::new(),
            tx_status: TransactionStatus::Idle,
        }
    }

    /// Transaction status as of the last `ReadyForQuery`.
    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Last reported value of a server parameter setting.
    pub(crate) fn parameter(&self, name: &str) -> Option<&ByteStr> {
        self.parameters.get(name)
    }

    pub(crate) fn push_hook(&mut self, hook: NoticeHook) {
        self.hooks.push(hook);
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Bytes buffered on the send queue.
    pub(crate) fn write_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Absorb an asynchronous message. Returns `true` if the frame was one.
    fn absorb_async(&mut self, kind: u8, body: bytes::Bytes) -> Result<bool> {
        match kind {
            backend::NoticeResponse::MSGTYPE => {
                let msg = backend::NoticeResponse::decode(kind, body)?;
                let handled = self.hooks.iter().any(|hook| hook(&msg.notice));
                if !handled {
                    tracing::warn!(
                        severity = msg.notice.severity(),
                        code = msg.notice.code(),
                        "{}",
                        msg.notice.message(),
                    );
                }
                Ok(true)
            }
            backend::NotificationResponse::MSGTYPE => {
                let msg = backend::NotificationResponse::decode(kind, body)?;
                self.notifies.push_back(Notification {
                    channel: msg.channel,
                    payload: msg.payload,
                    pid: msg.pid,
                });
                Ok(true)
            }
            backend::ParameterStatus::MSGTYPE => {
                let msg = backend::ParameterStatus::decode(kind, body)?;
                tracing::trace!("parameter status: {} = {}", msg.name, msg.value);
                self.parameters.insert(msg.name, msg.value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drain frames that are already buffered without touching the socket.
    ///
    /// Only asynchronous messages and `ReadyForQuery` markers are expected
    /// while the connection is idle; anything else stays buffered.
    pub(crate) fn drain_buffered(&mut self) -> Result<()> {
        loop {
            let Some(frame) = self.framer.next_frame()? else {
                return Ok(());
            };
            if self.absorb_async(frame.kind, frame.body.clone())? {
                continue;
            }
            if frame.kind == backend::ReadyForQuery::MSGTYPE {
                let ready = backend::ReadyForQuery::decode(frame.kind, frame.body)?;
                self.tx_status = ready.status;
                self.ready_requests = self.ready_requests.saturating_sub(1);
                continue;
            }
            // not ours to consume here
            return Err(crate::postgres::ProtocolError::unexpected_phase(frame.kind, "idle").into())
        }
    }

    /// Read whatever the socket holds right now, without blocking.
    ///
    /// Returns `true` when the peer closed the stream.
    pub(crate) fn fill_nonblocking(&mut self, cx: &mut Context) -> io::Result<bool> {
        self.framer.buffer_mut().reserve(DEFAULT_BUF_CAPACITY);
        match crate::io::poll_read(&mut self.socket, self.framer.buffer_mut(), cx) {
            Poll::Ready(Ok(0)) => Ok(true),
            Poll::Ready(Ok(_)) => Ok(false),
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(false),
        }
    }

    /// Receive the next COPY frame while in copy-out mode.
    pub(crate) fn poll_recv_copy(&mut self, cx: &mut Context) -> Poll<Result<CopyFrame>> {
        loop {
            if !self.write_buf.is_empty() {
                ready!(self.poll_flush(cx))?;
            }

            match self.framer.next_copy_frame()? {
                Some(CopyFrame::Data(data)) => return Poll::Ready(Ok(CopyFrame::Data(data))),
                Some(CopyFrame::Final(frame)) => {
                    // async messages may interleave with copy data
                    if self.absorb_async(frame.kind, frame.body.clone())? {
                        continue;
                    }
                    if frame.kind == backend::ErrorResponse::MSGTYPE {
                        let err = backend::ErrorResponse::decode(frame.kind, frame.body)?;
                        return Poll::Ready(Err(err.error.into()));
                    }
                    return Poll::Ready(Ok(CopyFrame::Final(frame)));
                }
                None => {
                    ready!(self.poll_fill(cx))?;
                }
            }
        }
    }

    fn poll_fill(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.framer.buffer_mut().reserve(DEFAULT_BUF_CAPACITY);
        let read = ready!(crate::io::poll_read(
            &mut self.socket,
            self.framer.buffer_mut(),
            cx
        ))?;
        if read == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        Poll::Ready(Ok(()))
    }

    /// Read and discard until `ReadyForQuery`, swallowing server errors.
    ///
    /// Used after an `ErrorResponse` to resynchronize: the server skips to
    /// the next `Sync` and reports readiness with the transaction status,
    /// which [`drain_buffered`][1] and `poll_recv` mirror into
    /// [`transaction_status`][2].
    ///
    /// [1]: PgStream::drain_buffered
    /// [2]: PgStream::transaction_status
    pub(crate) async fn resync(&mut self) -> Result<()> {
        use crate::transport::PgTransportExt;
        loop {
            match self.recv::<backend::BackendMessage>().await {
                Ok(backend::BackendMessage::ReadyForQuery(_)) => return Ok(()),
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::Server(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            if !self.write_buf.is_empty() {
                ready!(self.poll_flush(cx))?;
            }

            let Some(frame) = self.framer.next_frame()? else {
                ready!(self.poll_fill(cx))?;
                continue;
            };

            if self.absorb_async(frame.kind, frame.body.clone())? {
                continue;
            }

            if frame.kind == backend::ReadyForQuery::MSGTYPE {
                let ready = backend::ReadyForQuery::decode(frame.kind, frame.body.clone())?;
                self.tx_status = ready.status;
                if self.ready_requests > 0 {
                    self.ready_requests -= 1;
                    continue;
                }
                return Poll::Ready(B::decode(frame.kind, frame.body).map_err(Error::from));
            }

            if self.ready_requests > 0 {
                // draining towards ReadyForQuery; errors included
                continue;
            }

            if frame.kind == backend::ErrorResponse::MSGTYPE {
                let err = backend::ErrorResponse::decode(frame.kind, frame.body)?;
                return Poll::Ready(Err(err.error.into()));
            }

            return Poll::Ready(B::decode(frame.kind, frame.body).map_err(Error::from));
        }
    }

    fn ready_request(&mut self) {
        self.ready_requests += 1;
    }

    fn send<F: FrontendProtocol>(&mut self, msg: F) {
        frontend::write(msg, &mut self.write_buf);
    }

    fn send_startup(&mut self, msg: frontend::Startup) {
        msg.write(&mut self.write_buf);
    }
}

impl std::fmt::Debug for PgStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStream")
            .field("socket", &self.socket)
            .field("tx_status", &self.tx_status)
            .field("pending_notifies", &self.notifies.len())
            .finish()
    }
}

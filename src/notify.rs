//! Asynchronous notification management.
//!
//! `NotificationResponse` frames are appended to their connection's list
//! as they arrive, whatever operation was in flight. The
//! [`NotificationManager`] turns the lists of a set of connections into an
//! event loop with idle ticks.
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::{common::ByteStr, connection::Connection};

/// One `NOTIFY` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The channel the notification was raised on.
    pub channel: ByteStr,
    /// The payload string; empty when none was given.
    pub payload: ByteStr,
    /// Process id of the notifying backend.
    pub pid: i32,
}

/// Event produced by [`NotificationManager::next`].
#[derive(Debug)]
pub enum NotifyEvent {
    /// Notifications drained from the connection at `connection`
    /// (an index into the managed set).
    Notified {
        connection: usize,
        notifications: Vec<Notification>,
    },
    /// The timeout elapsed with nothing to deliver. The only safe point
    /// to break the loop.
    Idle,
}

/// Event loop over the notifications of a set of connections.
///
/// Timeout semantics:
/// - `None` blocks until a connection delivers;
/// - zero polls: pending notifications are emitted, then the loop ends;
/// - positive yields [`NotifyEvent::Idle`] at roughly that interval.
///
/// Connections that fail while being polled move to the `garbage` set and
/// the loop continues without them.
pub struct NotificationManager<'c> {
    connections: Vec<Option<&'c mut Connection>>,
    garbage: Vec<usize>,
    timeout: Option<Duration>,
    pending: VecDeque<NotifyEvent>,
}

impl<'c> NotificationManager<'c> {
    pub fn new(
        connections: impl IntoIterator<Item = &'c mut Connection>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            connections: connections.into_iter().map(Some).collect(),
            garbage: Vec::new(),
            timeout,
            pending: VecDeque::new(),
        }
    }

    /// Change the idle timeout for subsequent waits.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Indices of connections that failed and were removed from the set.
    pub fn garbage(&self) -> &[usize] {
        &self.garbage
    }

    /// Move a connection to the garbage set.
    fn trash(&mut self, index: usize) {
        if self.connections[index].take().is_some() {
            self.garbage.push(index);
        }
    }

    fn live(&self) -> Vec<usize> {
        self.connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.is_some().then_some(i))
            .collect()
    }

    /// Collect already received notifications into the pending queue.
    fn pull_from_connections(&mut self) {
        let noop = std::task::Waker::noop();
        let mut cx = Context::from_waker(noop);

        let mut broken = Vec::new();
        for (index, slot) in self.connections.iter_mut().enumerate() {
            let Some(conn) = slot else { continue };
            if conn.is_closed() {
                broken.push(index);
                continue;
            }
            // read what the socket holds, then split whatever frames are
            // complete; never blocks
            let eof = match conn.stream.fill_nonblocking(&mut cx) {
                Ok(eof) => eof,
                Err(_) => true,
            };
            if eof || conn.stream.drain_buffered().is_err() {
                broken.push(index);
                continue;
            }
            let notifications = conn.take_notifications();
            if !notifications.is_empty() {
                self.pending.push_back(NotifyEvent::Notified { connection: index, notifications });
            }
        }
        for index in broken {
            self.trash(index);
        }
    }

    /// Next event, or `None` when the loop is over (zero timeout drained,
    /// or every connection is garbage).
    pub async fn next(&mut self) -> Option<NotifyEvent> {
        loop {
            self.pull_from_connections();
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            // a zero timeout never waits: it is a snapshot of what was
            // already pending
            if self.timeout == Some(Duration::ZERO) {
                return None;
            }

            let live = self.live();
            if live.is_empty() {
                return None;
            }

            let readable = self.wait_readable(&live);
            let index = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, readable).await {
                    Ok(index) => index,
                    Err(_) => return Some(NotifyEvent::Idle),
                },
                None => readable.await,
            };

            // collect the pending events of the readable connection; the
            // empty query succeeds even inside a failed transaction block
            let conn = self.connections[index].as_mut().expect("readable index is live");
            if conn.pump().await.is_err() {
                self.trash(index);
            }
        }
    }

    /// Resolve to the index of the first connection whose socket turns
    /// readable.
    async fn wait_readable(&self, live: &[usize]) -> usize {
        let mut waits: Vec<(usize, Pin<Box<dyn Future<Output = ()> + '_>>)> = live
            .iter()
            .map(|&index| {
                let conn: &Connection = self.connections[index].as_deref().expect("live index");
                let fut: Pin<Box<dyn Future<Output = ()> + '_>> =
                    Box::pin(conn.socket_readable());
                (index, fut)
            })
            .collect();

        std::future::poll_fn(move |cx: &mut Context| {
            for (index, wait) in waits.iter_mut() {
                if wait.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(*index);
                }
            }
            Poll::Pending
        })
        .await
    }
}

impl Connection {
    /// Resolves when the transport has bytes to read, or on transport
    /// failure (the subsequent read reports the error).
    pub(crate) async fn socket_readable(&self) {
        let _ = self.stream.socket().readable().await;
    }

    /// Event loop over this connection's notifications.
    pub fn iter_notifications(&mut self, timeout: Option<Duration>) -> NotificationManager<'_> {
        NotificationManager::new([self], timeout)
    }
}

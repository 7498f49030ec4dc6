//! COPY sub-protocol endpoints and the transfer manager.
//!
//! A [`CopyManager`] pumps chunks from one producer into any number of
//! receivers. Receiver faults deactivate the offending receiver and are
//! reported without stopping the transfer; the caller may repair and
//! [`reconcile`][CopyManager::reconcile] it before the next cycle.
//! Producer faults carry no state change.
use bytes::Bytes;

use crate::{
    Error, Result,
    connection::{ConnState, Connection},
    error::{ErrorKind, StateError},
    postgres::{BackendMessage, BackendProtocol, CopyFrame, backend, frontend},
    transport::{PgTransport, PgTransportExt},
};

/// Flush threshold for buffered outgoing `CopyData`.
const COPY_BUFFER: usize = 10 * 1024;

/// Source of COPY payload chunks.
pub trait CopyProducer {
    /// The next chunk; `None` ends the transfer.
    fn pull(&mut self) -> impl Future<Output = Result<Option<Bytes>>>;

    /// Called exactly once when the transfer ends. `completed` is `false`
    /// on abort.
    fn finish(&mut self, completed: bool) -> impl Future<Output = Result<()>>;
}

/// Sink for COPY payload chunks.
pub trait CopyReceiver {
    fn push(&mut self, data: &Bytes) -> impl Future<Output = Result<()>>;

    /// Called exactly once when the transfer ends. `completed` is `false`
    /// on abort.
    fn finish(&mut self, completed: bool) -> impl Future<Output = Result<()>>;
}

/// COPY transfer failure.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// The producer failed. Usually fatal to the transfer.
    #[error("copy producer fault: {source}")]
    Producer { source: Box<Error> },
    /// One or more receivers failed this cycle; they are deactivated
    /// until reconciled.
    #[error("{} copy receiver fault(s)", faults.len())]
    Receivers { faults: Vec<(usize, Error)> },
    /// The transfer was aborted; the exit errors of every party.
    #[error("copy aborted: {reason}")]
    Aborted { reason: String, errors: Vec<Error> },
}

/// Transfer progress counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStats {
    /// Chunks pulled from the producer.
    pub chunks: u64,
    /// Payload bytes transferred.
    pub bytes: u64,
}

struct Slot<R> {
    receiver: R,
    active: bool,
}

/// Coordinates one producer and a set of receivers.
pub struct CopyManager<P, R> {
    producer: P,
    receivers: Vec<Slot<R>>,
    stats: CopyStats,
    exhausted: bool,
}

impl<P: CopyProducer, R: CopyReceiver> CopyManager<P, R> {
    pub fn new(producer: P, receivers: impl IntoIterator<Item = R>) -> Self {
        Self {
            producer,
            receivers: receivers
                .into_iter()
                .map(|receiver| Slot { receiver, active: true })
                .collect(),
            stats: CopyStats::default(),
            exhausted: false,
        }
    }

    pub fn stats(&self) -> CopyStats {
        self.stats
    }

    /// Indices of receivers currently deactivated by a fault.
    pub fn faulted(&self) -> Vec<usize> {
        self.receivers
            .iter()
            .enumerate()
            .filter_map(|(i, s)| (!s.active).then_some(i))
            .collect()
    }

    /// Readmit a repaired receiver before the next cycle.
    pub fn reconcile(&mut self, index: usize) -> bool {
        match self.receivers.get_mut(index) {
            Some(slot) => {
                slot.active = true;
                true
            }
            None => false,
        }
    }

    /// One transfer cycle: pull a chunk, push it to every active
    /// receiver. Returns `false` once the producer is exhausted.
    pub async fn cycle(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }

        let chunk = match self.producer.pull().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                self.exhausted = true;
                return Ok(false);
            }
            Err(source) => {
                return Err(CopyError::Producer { source: Box::new(source) }.into());
            }
        };

        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;

        let mut faults = Vec::new();
        for (index, slot) in self.receivers.iter_mut().enumerate() {
            if !slot.active {
                continue;
            }
            if let Err(err) = slot.receiver.push(&chunk).await {
                slot.active = false;
                faults.push((index, err));
            }
        }

        if !faults.is_empty() {
            return Err(CopyError::Receivers { faults }.into());
        }
        Ok(true)
    }

    /// Pump cycles until the producer is exhausted.
    pub async fn run(&mut self) -> Result<()> {
        while self.cycle().await? { }
        Ok(())
    }

    /// Finalize every party after a completed run.
    pub async fn finish(mut self) -> Result<CopyStats> {
        let mut errors = Vec::new();

        if let Err(err) = self.producer.finish(self.exhausted).await {
            errors.push(err);
        }
        for slot in &mut self.receivers {
            if let Err(err) = slot.receiver.finish(slot.active).await {
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(CopyError::Aborted { reason: "finalization failed".into(), errors }.into());
        }
        Ok(self.stats)
    }

    /// Abort the transfer: `CopyFail` goes upstream to every still-active
    /// receiver and every exit error is aggregated.
    pub async fn abort(mut self, reason: &str) -> Error {
        let mut errors = Vec::new();

        if let Err(err) = self.producer.finish(false).await {
            errors.push(err);
        }
        for slot in &mut self.receivers {
            if let Err(err) = slot.receiver.finish(false).await {
                errors.push(err);
            }
        }

        CopyError::Aborted { reason: reason.into(), errors }.into()
    }
}

/// Run a whole transfer: pump until exhaustion, then finalize; on any
/// fault, abort every party.
pub async fn transfer<P: CopyProducer, R: CopyReceiver>(
    producer: P,
    receivers: impl IntoIterator<Item = R>,
) -> Result<CopyStats> {
    let mut manager = CopyManager::new(producer, receivers);
    match manager.run().await {
        Ok(()) => manager.finish().await,
        Err(err) => {
            let aborted = manager.abort("transfer fault").await;
            // the original fault names the offender; the aggregate is
            // secondary
            tracing::debug!("{aborted}");
            Err(err)
        }
    }
}

// ===== connection endpoints =====

impl Connection {
    /// Run `COPY ... TO STDOUT` and expose the stream as a producer.
    pub async fn copy_out(&mut self, sql: &str) -> Result<CopyOut<'_>> {
        self.ensure_ready(Some(sql))?;
        self.stream.send(frontend::Query { sql });
        self.stream.flush().await?;

        match self.recv_expect().await? {
            BackendMessage::CopyOutResponse(_) => {}
            f => return self.fail_resync(f.unexpected("copy out").into()).await,
        }
        self.state = ConnState::CopyOut;

        Ok(CopyOut { conn: self, rows: 0, done: false })
    }

    /// Run `COPY ... FROM STDIN` and expose the connection as a receiver.
    pub async fn copy_in(&mut self, sql: &str) -> Result<CopyIn<'_>> {
        self.ensure_ready(Some(sql))?;
        self.stream.send(frontend::Query { sql });
        self.stream.flush().await?;

        match self.recv_expect().await? {
            BackendMessage::CopyInResponse(_) => {}
            f => return self.fail_resync(f.unexpected("copy in").into()).await,
        }
        self.state = ConnState::CopyIn;

        Ok(CopyIn { conn: self, rows: 0, done: false })
    }
}

/// A statement in copy-out state: a [`CopyProducer`] of data messages.
///
/// Each pulled chunk is one `CopyData` body; the server sends one message
/// per row.
pub struct CopyOut<'c> {
    conn: &'c mut Connection,
    rows: u64,
    done: bool,
}

impl CopyOut<'_> {
    /// Rows (COPY data messages) pulled so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl CopyProducer for CopyOut<'_> {
    async fn pull(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        let frame = std::future::poll_fn(|cx| self.conn.stream.poll_recv_copy(cx)).await;
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                self.done = true;
                self.conn.state = ConnState::Ready;
                if matches!(err.kind(), ErrorKind::Server(_)) {
                    let _ = self.conn.stream.resync().await;
                }
                return Err(err);
            }
        };

        match frame {
            CopyFrame::Data(data) => {
                self.rows += 1;
                Ok(Some(data))
            }
            CopyFrame::Final(frame) => {
                self.done = true;
                match BackendMessage::decode(frame.kind, frame.body)? {
                    BackendMessage::CopyDone(_) => {}
                    f => {
                        self.conn.state = ConnState::Ready;
                        return self.conn.fail_resync(f.unexpected("copy out end").into()).await;
                    }
                }
                self.conn.state = ConnState::Ready;
                self.conn.recv_expect::<backend::CommandComplete>().await?;
                self.conn.recv_expect::<backend::ReadyForQuery>().await?;
                Ok(None)
            }
        }
    }

    async fn finish(&mut self, _completed: bool) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        // abandoned mid stream: skip the remaining copy data
        self.conn.state = ConnState::Ready;
        self.conn.stream.resync().await
    }
}

/// A statement in copy-in state: a [`CopyReceiver`] for data messages.
pub struct CopyIn<'c> {
    conn: &'c mut Connection,
    rows: u64,
    done: bool,
}

impl CopyIn<'_> {
    /// Row count the server reported at completion.
    pub fn rows_loaded(&self) -> u64 {
        self.rows
    }
}

impl CopyReceiver for CopyIn<'_> {
    async fn push(&mut self, data: &Bytes) -> Result<()> {
        if self.done {
            return Err(StateError::WrongState { expected: "copy-in", actual: "finished" }.into());
        }
        self.conn.stream.send(frontend::CopyData { data });
        if self.conn.stream.write_len() >= COPY_BUFFER {
            self.conn.stream.flush().await?;
        }
        Ok(())
    }

    async fn finish(&mut self, completed: bool) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.conn.state = ConnState::Ready;

        if completed {
            self.conn.stream.send(frontend::CopyDone);
            self.conn.stream.flush().await?;
            let tag = self.conn.recv_expect::<backend::CommandComplete>().await?;
            self.rows = tag.rows_affected();
            self.conn.recv_expect::<backend::ReadyForQuery>().await?;
            return Ok(());
        }

        self.conn.stream.send(frontend::CopyFail { reason: "copy aborted by client" });
        self.conn.stream.flush().await?;
        // the server answers the failure with an ErrorResponse
        self.conn.stream.resync().await
    }
}

// ===== arbitrary endpoints =====

/// Adapter: any chunk iterator as a producer.
pub struct IterProducer<I>(pub I);

impl<I> CopyProducer for IterProducer<I>
where
    I: Iterator<Item = Bytes> + Unpin,
{
    async fn pull(&mut self) -> Result<Option<Bytes>> {
        Ok(self.0.next())
    }

    async fn finish(&mut self, _completed: bool) -> Result<()> {
        Ok(())
    }
}

/// Adapter: any callable as a receiver.
pub struct FnReceiver<F>(pub F);

impl<F> CopyReceiver for FnReceiver<F>
where
    F: FnMut(&Bytes) -> Result<()> + Unpin,
{
    async fn push(&mut self, data: &Bytes) -> Result<()> {
        (self.0)(data)
    }

    async fn finish(&mut self, _completed: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn chunks(items: &[&'static [u8]]) -> IterProducer<std::vec::IntoIter<Bytes>> {
        IterProducer(
            items
                .iter()
                .map(|i| Bytes::from_static(i))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    struct CountingReceiver {
        chunks: Vec<Bytes>,
        finished: Rc<Cell<u32>>,
        fail_on: Option<usize>,
    }

    impl CopyReceiver for CountingReceiver {
        async fn push(&mut self, data: &Bytes) -> Result<()> {
            if self.fail_on == Some(self.chunks.len()) {
                return Err(StateError::Closed.into());
            }
            self.chunks.push(data.clone());
            Ok(())
        }

        async fn finish(&mut self, _completed: bool) -> Result<()> {
            self.finished.set(self.finished.get() + 1);
            Ok(())
        }
    }

    fn receiver(finished: &Rc<Cell<u32>>, fail_on: Option<usize>) -> CountingReceiver {
        CountingReceiver { chunks: Vec::new(), finished: finished.clone(), fail_on }
    }

    #[tokio::test]
    async fn pump_delivers_everything_once() {
        let finished = Rc::new(Cell::new(0));
        let mut manager = CopyManager::new(
            chunks(&[b"1\n", b"2\n", b"3\n"]),
            vec![receiver(&finished, None), receiver(&finished, None)],
        );

        manager.run().await.unwrap();
        assert_eq!(manager.receivers[0].receiver.chunks.len(), 3);
        assert_eq!(manager.receivers[1].receiver.chunks.len(), 3);

        let stats = manager.finish().await.unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.bytes, 6);
        // every receiver finalized exactly once
        assert_eq!(finished.get(), 2);
    }

    #[tokio::test]
    async fn receiver_fault_isolates_and_reconciles() {
        let finished = Rc::new(Cell::new(0));
        let mut manager = CopyManager::new(
            chunks(&[b"a", b"b", b"c"]),
            vec![receiver(&finished, Some(1)), receiver(&finished, None)],
        );

        // first cycle is clean
        assert!(manager.cycle().await.unwrap());

        // second cycle faults receiver 0, receiver 1 keeps going
        let err = manager.cycle().await.unwrap_err();
        let ErrorKind::Copy(CopyError::Receivers { faults }) = err.kind() else {
            panic!("expected receiver fault, got {err:?}");
        };
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, 0);
        assert_eq!(manager.faulted(), vec![0]);

        // third cycle without reconciliation: only receiver 1 gets data
        assert!(manager.cycle().await.unwrap());
        assert!(!manager.cycle().await.unwrap());
        assert_eq!(manager.receivers[0].receiver.chunks.len(), 1);
        assert_eq!(manager.receivers[1].receiver.chunks.len(), 3);

        // reconciliation readmits
        assert!(manager.reconcile(0));
        assert!(manager.faulted().is_empty());
        assert!(!manager.reconcile(9));

        manager.finish().await.unwrap();
        assert_eq!(finished.get(), 2);
    }

    #[tokio::test]
    async fn producer_fault_keeps_receiver_state() {
        struct FailingProducer;
        impl CopyProducer for FailingProducer {
            async fn pull(&mut self) -> Result<Option<Bytes>> {
                Err(StateError::Closed.into())
            }
            async fn finish(&mut self, _: bool) -> Result<()> {
                Ok(())
            }
        }

        let finished = Rc::new(Cell::new(0));
        let mut manager =
            CopyManager::new(FailingProducer, vec![receiver(&finished, None)]);

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Copy(CopyError::Producer { .. })));
        // no receiver was deactivated
        assert!(manager.faulted().is_empty());
    }
}

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::client::call_with_retries;
use super::protocol::{NewBatchesEvent, NoMoreBatchesEvent, SequenceId, SourceAddress};
use super::ExchangeResources;
use crate::batch::RowBatch;
use crate::ids::{Endpoint, FragmentInstanceId, QueryId};
use crate::signal::{Signal, SignalFuture};

/// Push side of an exchange.
pub trait ExchangeSink: Debug + Sync + Send {
    fn local_instance_id(&self) -> FragmentInstanceId;

    /// Total retained size of batches not yet acknowledged downstream.
    fn buffered_bytes(&self) -> u64;

    /// Future that's done once the sink can accept more batches.
    fn is_full(&self) -> Result<SignalFuture>;

    /// Buffer batches for the downstream source.
    ///
    /// Ignored once no more data has been set, which happens with queries
    /// that stop early (LIMIT).
    fn send(&self, batches: Vec<RowBatch>) -> Result<()>;

    /// Send to a specific partition.
    fn send_to_partition(&self, partition: usize, batches: Vec<RowBatch>) -> Result<()>;

    /// No more batches will be sent. Further sends are ignored.
    fn set_no_more_data(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn is_aborted(&self) -> bool;

    /// No more data and everything sent was acknowledged downstream.
    fn is_finished(&self) -> bool;

    /// Stop accepting batches. Buffered batches are kept until they're
    /// acknowledged.
    fn close(&self) -> Result<()>;

    /// Discard everything buffered and cancel the `is_full` future.
    fn abort(&self);
}

/// Receives lifecycle events of a sink handle.
///
/// Never called while the sink's internal lock is held.
pub trait SinkListener: Debug + Sync + Send {
    /// No more data and every batch was acknowledged.
    fn on_finished(&self, sink: &SinkHandle);

    fn on_closed(&self, sink: &SinkHandle);

    fn on_aborted(&self, sink: &SinkHandle);

    fn on_failure(&self, sink: &SinkHandle, error: MppError);
}

/// Where a sink pushes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub local_instance_id: FragmentInstanceId,
    pub remote_endpoint: Endpoint,
    /// The source pulling from this sink.
    pub remote: SourceAddress,
}

#[derive(Debug)]
struct SinkState {
    /// Unacknowledged batches with the bytes each accounts for.
    buffer: BTreeMap<SequenceId, (RowBatch, u64)>,
    next_sequence_id: SequenceId,
    buffered_bytes: u64,
    /// Bytes granted by the pool and not yet freed.
    reserved_bytes: u64,
    /// Bytes of an outstanding reservation not granted yet.
    pending_bytes: u64,
    /// Bytes released (acknowledged or discarded) before their reservation
    /// was granted. Freed as soon as the grant comes in.
    owed_bytes: u64,
    /// Done iff no reservation is outstanding.
    full: Signal,
    no_more_data: bool,
    finished_notified: bool,
    closed: bool,
    aborted: bool,
}

impl SinkState {
    /// Release accounting for `bytes` worth of batches, returning how much
    /// can be freed from the pool right now.
    fn release(&mut self, bytes: u64) -> u64 {
        let now = bytes.min(self.reserved_bytes);
        self.reserved_bytes -= now;
        self.owed_bytes += bytes - now;
        now
    }

    fn finished(&self) -> bool {
        self.no_more_data && self.buffer.is_empty()
    }
}

/// Sink for a single downstream source.
///
/// Each batch gets the next sequence id and is announced to the source with
/// its size. The source then pulls it with `GetRowBatches` and releases it
/// with `AcknowledgeRowBatches`.
#[derive(Debug)]
pub struct SinkHandle {
    descriptor: SinkDescriptor,
    resources: ExchangeResources,
    listener: Arc<dyn SinkListener>,
    state: Mutex<SinkState>,
    this: Weak<SinkHandle>,
}

impl SinkHandle {
    pub fn new(
        descriptor: SinkDescriptor,
        resources: ExchangeResources,
        listener: Arc<dyn SinkListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| SinkHandle {
            descriptor,
            resources,
            listener,
            state: Mutex::new(SinkState {
                buffer: BTreeMap::new(),
                next_sequence_id: 0,
                buffered_bytes: 0,
                reserved_bytes: 0,
                pending_bytes: 0,
                owed_bytes: 0,
                full: Signal::completed(),
                no_more_data: false,
                finished_notified: false,
                closed: false,
                aborted: false,
            }),
            this: this.clone(),
        })
    }

    pub fn descriptor(&self) -> &SinkDescriptor {
        &self.descriptor
    }

    fn query_id(&self) -> QueryId {
        self.descriptor.local_instance_id.query_id
    }

    /// Serve batches `[start, end)` to the downstream source.
    pub fn get_row_batches(&self, start: SequenceId, end: SequenceId) -> Result<Vec<RowBatch>> {
        let state = self.state.lock();
        if state.aborted {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                "Sink handle is aborted",
            ));
        }
        (start..end)
            .map(|seq| match state.buffer.get(&seq) {
                Some((batch, _)) => Ok(batch.clone()),
                None => Err(MppError::with_kind(
                    ErrorKind::InvalidArgument,
                    format!("Batch {seq} is not buffered by sink {}", self.descriptor.local_instance_id),
                )),
            })
            .collect()
    }

    /// The source stored `[start, end)`, release them.
    pub fn acknowledge_row_batches(&self, start: SequenceId, end: SequenceId) -> Result<()> {
        let notify_finished = {
            let mut state = self.state.lock();
            if state.aborted {
                return Ok(());
            }

            let mut released = 0;
            for seq in start..end {
                if let Some((batch, bytes)) = state.buffer.remove(&seq) {
                    state.buffered_bytes -= batch.retained_size();
                    released += bytes;
                }
            }
            let to_free = state.release(released);
            if to_free > 0 {
                self.resources.memory_pool.free(self.query_id(), to_free)?;
            }
            trace!(sink = %self, %start, %end, "batches acknowledged");

            let notify = state.finished() && !state.finished_notified;
            state.finished_notified |= notify;
            notify
        };

        if notify_finished {
            debug!(sink = %self, "sink finished");
            self.listener.on_finished(self);
        }
        Ok(())
    }

    fn on_reservation_granted(&self, bytes: u64, fut: &SignalFuture) {
        let mut state = self.state.lock();
        state.pending_bytes = 0;
        if fut.is_cancelled() {
            return;
        }

        state.reserved_bytes += bytes;
        let settle = state.owed_bytes.min(state.reserved_bytes);
        state.owed_bytes -= settle;
        state.reserved_bytes -= settle;
        if settle > 0 {
            if let Err(e) = self.resources.memory_pool.free(self.query_id(), settle) {
                error!(sink = %self, %e, "failed to free settled memory");
            }
        }
        state.full.set();
    }

    fn spawn_notify_new_batches(&self, start: SequenceId, sizes: Vec<u64>) {
        let sink = match self.this.upgrade() {
            Some(sink) => sink,
            None => return,
        };
        self.resources.executor.spawn(Box::new(move || {
            let event = NewBatchesEvent {
                target: sink.descriptor.remote.clone(),
                sink_instance_id: sink.descriptor.local_instance_id,
                start_sequence_id: start,
                batch_sizes: sizes,
            };
            let result = call_with_retries(
                sink.resources.clients.as_ref(),
                &sink.descriptor.remote_endpoint,
                sink.resources.max_attempts,
                "NotifyNewBatches",
                |client| client.notify_new_batches(&event),
            );
            if let Err(e) = result {
                error!(sink = %sink, %e, "failed to announce new batches");
                sink.listener.on_failure(&sink, e);
            }
        }));
    }

    fn spawn_notify_no_more_batches(&self, last_sequence_id: SequenceId) {
        let sink = match self.this.upgrade() {
            Some(sink) => sink,
            None => return,
        };
        self.resources.executor.spawn(Box::new(move || {
            let event = NoMoreBatchesEvent {
                target: sink.descriptor.remote.clone(),
                sink_instance_id: sink.descriptor.local_instance_id,
                last_sequence_id,
            };
            let result = call_with_retries(
                sink.resources.clients.as_ref(),
                &sink.descriptor.remote_endpoint,
                sink.resources.max_attempts,
                "NotifyNoMoreBatches",
                |client| client.notify_no_more_batches(&event),
            );
            if let Err(e) = result {
                error!(sink = %sink, %e, "failed to announce end of batches");
                sink.listener.on_failure(&sink, e);
            }
        }));
    }

    /// Mark no more data under the lock. Returns the last sequence id to
    /// announce, or None if it was already announced.
    fn mark_no_more_data(state: &mut SinkState) -> Option<SequenceId> {
        if state.no_more_data {
            return None;
        }
        state.no_more_data = true;
        Some(state.next_sequence_id - 1)
    }
}

impl ExchangeSink for SinkHandle {
    fn local_instance_id(&self) -> FragmentInstanceId {
        self.descriptor.local_instance_id
    }

    fn buffered_bytes(&self) -> u64 {
        self.state.lock().buffered_bytes
    }

    fn is_full(&self) -> Result<SignalFuture> {
        let state = self.state.lock();
        if state.closed || state.aborted {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                "Sink handle is closed",
            ));
        }
        Ok(state.full.future())
    }

    fn send(&self, batches: Vec<RowBatch>) -> Result<()> {
        let (start, sizes) = {
            let mut state = self.state.lock();
            if state.closed || state.aborted {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidState,
                    "Sink handle is closed",
                ));
            }
            if state.no_more_data || batches.is_empty() {
                return Ok(());
            }
            if !state.full.is_done() {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidState,
                    "Sink handle is full",
                ));
            }

            let sizes: Vec<u64> = batches.iter().map(|b| b.retained_size()).collect();
            let total: u64 = sizes.iter().sum();
            if total > 0 {
                let fut = self.resources.memory_pool.reserve(self.query_id(), total)?;
                if fut.is_done() {
                    state.reserved_bytes += total;
                } else {
                    state.pending_bytes = total;
                    state.full = Signal::new();
                    let this = self.this.clone();
                    let granted = fut.clone();
                    fut.add_listener(self.resources.executor.clone(), move || {
                        if let Some(sink) = this.upgrade() {
                            sink.on_reservation_granted(total, &granted);
                        }
                    });
                }
            }

            let start = state.next_sequence_id;
            for (batch, size) in batches.into_iter().zip(&sizes) {
                let seq = state.next_sequence_id;
                state.next_sequence_id += 1;
                state.buffered_bytes += batch.retained_size();
                state.buffer.insert(seq, (batch, *size));
            }
            trace!(sink = %self, %start, num_batches = %sizes.len(), "buffered batches");

            (start, sizes)
        };

        self.spawn_notify_new_batches(start, sizes);
        Ok(())
    }

    fn send_to_partition(&self, partition: usize, batches: Vec<RowBatch>) -> Result<()> {
        if partition != 0 {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!("Sink handle only has partition 0, got {partition}"),
            ));
        }
        self.send(batches)
    }

    fn set_no_more_data(&self) -> Result<()> {
        let (last, notify_finished) = {
            let mut state = self.state.lock();
            if state.aborted {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidState,
                    "Sink handle is aborted",
                ));
            }
            let last = Self::mark_no_more_data(&mut state);
            let notify = state.finished() && !state.finished_notified;
            state.finished_notified |= notify;
            (last, notify)
        };

        if let Some(last) = last {
            debug!(sink = %self, %last, "no more data");
            self.spawn_notify_no_more_batches(last);
        }
        if notify_finished {
            self.listener.on_finished(self);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished()
    }

    fn close(&self) -> Result<()> {
        let (last, notify_finished) = {
            let mut state = self.state.lock();
            if state.closed || state.aborted {
                return Ok(());
            }
            state.closed = true;
            let last = Self::mark_no_more_data(&mut state);
            let notify = state.finished() && !state.finished_notified;
            state.finished_notified |= notify;
            (last, notify)
        };

        debug!(sink = %self, "closed sink handle");
        if let Some(last) = last {
            self.spawn_notify_no_more_batches(last);
        }
        self.listener.on_closed(self);
        if notify_finished {
            self.listener.on_finished(self);
        }
        Ok(())
    }

    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.full.cancel();

            let discarded: u64 = state.buffer.values().map(|(_, bytes)| bytes).sum();
            state.buffer.clear();
            state.buffered_bytes = 0;
            let to_free = state.release(discarded);
            if to_free > 0 {
                if let Err(e) = self.resources.memory_pool.free(self.query_id(), to_free) {
                    error!(sink = %self, %e, "failed to free memory on abort");
                }
            }
            debug!(sink = %self, freed = %to_free, "aborted sink handle");
        }

        self.listener.on_aborted(self);
    }
}

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{}@{}",
            self.descriptor.local_instance_id,
            self.descriptor.remote.fragment_instance_id,
            self.descriptor.remote.plan_node_id,
            self.descriptor.remote_endpoint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::client::ClientPool;
    use crate::memory::MemoryPool;
    use crate::testutil::{
        instance_id, test_batch, CountingSinkListener, ManualExecutor, MockClientFactory, MockPeer,
    };

    struct Harness {
        sink: Arc<SinkHandle>,
        pool: Arc<MemoryPool>,
        executor: Arc<ManualExecutor>,
        peer: MockPeer,
        listener: Arc<CountingSinkListener>,
    }

    impl Harness {
        fn new(max_bytes_per_query: u64) -> Self {
            let pool = Arc::new(MemoryPool::new(10_000, max_bytes_per_query));
            let executor = Arc::new(ManualExecutor::default());
            let peer = MockPeer::new();
            let listener = Arc::new(CountingSinkListener::default());
            let resources = ExchangeResources {
                memory_pool: pool.clone(),
                executor: executor.clone(),
                clients: Arc::new(ClientPool::new(
                    Arc::new(MockClientFactory::new(peer.clone())),
                    2,
                )),
                max_attempts: 3,
            };
            let descriptor = SinkDescriptor {
                local_instance_id: instance_id(1, 0),
                remote_endpoint: Endpoint::new("downstream", 6667),
                remote: SourceAddress {
                    fragment_instance_id: instance_id(1, 1),
                    plan_node_id: "exchange_0".into(),
                },
            };
            let sink = SinkHandle::new(descriptor, resources, listener.clone());
            Harness {
                sink,
                pool,
                executor,
                peer,
                listener,
            }
        }

        fn query_reserved(&self) -> u64 {
            self.pool.query_reserved_bytes(&instance_id(1, 0).query_id)
        }
    }

    #[test]
    fn send_serve_ack() {
        let h = Harness::new(1000);
        h.sink
            .send(vec![test_batch(0, 100), test_batch(1, 50)])
            .unwrap();
        assert_eq!(150, h.sink.buffered_bytes());
        assert_eq!(150, h.query_reserved());
        assert!(h.sink.is_full().unwrap().is_done());

        h.executor.run_all();
        assert_eq!(vec![(0, vec![100, 50])], h.peer.new_batches());

        let batches = h.sink.get_row_batches(0, 2).unwrap();
        assert_eq!(vec![test_batch(0, 100), test_batch(1, 50)], batches);

        h.sink.acknowledge_row_batches(0, 1).unwrap();
        assert_eq!(50, h.sink.buffered_bytes());
        assert_eq!(50, h.query_reserved());

        h.sink.set_no_more_data().unwrap();
        assert!(!h.sink.is_finished());
        h.sink.acknowledge_row_batches(1, 2).unwrap();
        assert!(h.sink.is_finished());
        assert_eq!(1, h.listener.finished());
        assert_eq!(0, h.query_reserved());

        h.executor.run_all();
        assert_eq!(vec![1], h.peer.no_more_batches());
    }

    #[test]
    fn full_until_reservation_granted() {
        let h = Harness::new(100);
        h.sink.send(vec![test_batch(0, 80)]).unwrap();
        h.sink.send(vec![test_batch(1, 80)]).unwrap();

        let full = h.sink.is_full().unwrap();
        assert!(!full.is_done());
        let err = h.sink.send(vec![test_batch(2, 10)]).unwrap_err();
        assert_eq!(ErrorKind::InvalidState, err.kind());

        // Acknowledging the first batch makes room for the second.
        h.sink.acknowledge_row_batches(0, 1).unwrap();
        h.executor.run_all();
        assert!(full.is_done());
        assert_eq!(80, h.query_reserved());

        h.sink.acknowledge_row_batches(1, 2).unwrap();
        assert_eq!(0, h.query_reserved());
    }

    #[test]
    fn ack_before_grant_is_settled_later() {
        let h = Harness::new(100);
        h.sink.send(vec![test_batch(0, 80)]).unwrap();
        h.sink.send(vec![test_batch(1, 80)]).unwrap();

        // Second batch is acknowledged while its reservation is still queued.
        h.sink.acknowledge_row_batches(1, 2).unwrap();
        assert_eq!(80, h.query_reserved());

        h.sink.acknowledge_row_batches(0, 1).unwrap();
        h.executor.run_all();
        assert_eq!(0, h.query_reserved());
        let stats = h.pool.stats();
        assert_eq!(stats.allocated, stats.deallocated);
    }

    #[test]
    fn send_after_no_more_data_is_ignored() {
        let h = Harness::new(1000);
        h.sink.set_no_more_data().unwrap();
        assert!(h.sink.is_finished());
        assert_eq!(1, h.listener.finished());

        h.sink.send(vec![test_batch(0, 10)]).unwrap();
        assert_eq!(0, h.sink.buffered_bytes());

        h.executor.run_all();
        assert_eq!(vec![-1], h.peer.no_more_batches());
        assert!(h.peer.new_batches().is_empty());
    }

    #[test]
    fn send_while_full_after_no_more_data_is_ignored() {
        let h = Harness::new(100);
        h.sink.send(vec![test_batch(0, 80)]).unwrap();
        h.sink.send(vec![test_batch(1, 80)]).unwrap();
        assert!(!h.sink.is_full().unwrap().is_done());

        h.sink.set_no_more_data().unwrap();
        h.sink.send(vec![test_batch(2, 10)]).unwrap();
        assert_eq!(160, h.sink.buffered_bytes());

        h.executor.run_all();
        assert_eq!(vec![1], h.peer.no_more_batches());
    }

    #[test]
    fn non_zero_partition_rejected() {
        let h = Harness::new(1000);
        let err = h
            .sink
            .send_to_partition(1, vec![test_batch(0, 10)])
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
        h.sink.send_to_partition(0, vec![test_batch(0, 10)]).unwrap();
        assert_eq!(10, h.sink.buffered_bytes());
    }

    #[test]
    fn close_is_lazy() {
        let h = Harness::new(1000);
        h.sink.send(vec![test_batch(0, 10)]).unwrap();
        h.sink.close().unwrap();

        assert!(h.sink.is_closed());
        assert_eq!(1, h.listener.closed());
        assert!(!h.sink.is_finished());
        assert_eq!(1, h.sink.get_row_batches(0, 1).unwrap().len());

        h.sink.acknowledge_row_batches(0, 1).unwrap();
        assert!(h.sink.is_finished());
        assert_eq!(1, h.listener.finished());

        h.executor.run_all();
        assert_eq!(vec![0], h.peer.no_more_batches());
    }

    #[test]
    fn abort_discards_and_cancels() {
        let h = Harness::new(100);
        h.sink.send(vec![test_batch(0, 80)]).unwrap();
        h.sink.send(vec![test_batch(1, 80)]).unwrap();
        let full = h.sink.is_full().unwrap();

        h.sink.abort();
        h.sink.abort();
        assert!(full.is_cancelled());
        assert_eq!(1, h.listener.aborted());
        assert_eq!(0, h.sink.buffered_bytes());
        assert!(h.sink.get_row_batches(0, 1).is_err());

        // Queued reservation got granted by the abort's free, and is settled
        // once its continuation runs.
        h.executor.run_all();
        assert_eq!(0, h.query_reserved());
        let stats = h.pool.stats();
        assert_eq!(stats.allocated, stats.deallocated);
    }

    #[test]
    fn failed_announcement_reports_failure() {
        let h = Harness::new(1000);
        h.peer.fail_next_new_batches(3);
        h.sink.send(vec![test_batch(0, 10)]).unwrap();
        h.executor.run_all();
        assert_eq!(vec![ErrorKind::Transport], h.listener.failures());
    }
}

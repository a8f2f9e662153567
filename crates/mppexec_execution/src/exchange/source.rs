use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::client::call_with_retries;
use super::protocol::{AcknowledgeRowBatchesEvent, GetRowBatchesRequest, SequenceId, SourceAddress};
use super::ExchangeResources;
use crate::batch::RowBatch;
use crate::ids::{Endpoint, FragmentInstanceId, QueryId};
use crate::signal::{Signal, SignalFuture};

/// Receives lifecycle events of an exchange source.
///
/// Never called while the source's internal lock is held.
pub trait SourceListener: Debug + Sync + Send {
    /// Every batch up to the last one announced by the sink was received.
    fn on_finished(&self, source: &ExchangeSource);

    fn on_closed(&self, source: &ExchangeSource);

    /// Fetching or acknowledging failed for good. The owning fragment
    /// instance can't make progress anymore.
    fn on_failure(&self, source: &ExchangeSource, error: MppError);
}

/// Where a source pulls from and who it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub local: SourceAddress,
    pub remote_endpoint: Endpoint,
    /// Fragment instance owning the upstream sink.
    pub remote_instance_id: FragmentInstanceId,
}

/// Contiguous run of batches fetched with a single request, along with the
/// bytes reserved for each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchRange {
    start: SequenceId,
    sizes: Vec<u64>,
}

impl FetchRange {
    pub(crate) fn new(start: SequenceId, end: SequenceId, sizes: Vec<u64>) -> Result<Self> {
        if start < 0 {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!("Start sequence id must not be negative, got {start}"),
            ));
        }
        if end <= start {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!("End sequence id {end} must be greater than start sequence id {start}"),
            ));
        }
        if sizes.len() != (end - start) as usize {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!(
                    "Range [{start}, {end}) needs {} sizes, got {}",
                    end - start,
                    sizes.len()
                ),
            ));
        }
        Ok(FetchRange { start, sizes })
    }

    fn end(&self) -> SequenceId {
        self.start + self.sizes.len() as SequenceId
    }

    fn reserved_bytes(&self) -> u64 {
        self.sizes.iter().sum()
    }
}

#[derive(Debug)]
struct SourceState {
    /// Fetched batches along with the bytes reserved for each.
    batches: BTreeMap<SequenceId, (RowBatch, u64)>,
    /// Sizes of announced batches with no reservation yet.
    pending_sizes: HashMap<SequenceId, u64>,
    /// Sum of retained sizes of `batches`.
    buffered_bytes: u64,
    /// Bytes reserved for batches currently being fetched.
    in_flight_bytes: u64,
    /// Done iff a batch can be received or everything was consumed.
    blocked: Signal,
    /// Next id handed out by `receive`.
    sequence_id: SequenceId,
    /// Next id to reserve memory for.
    next_sequence_id: SequenceId,
    /// Inclusive. `SequenceId::MAX` until the sink says there's nothing more.
    last_sequence_id: SequenceId,
    /// The reservation for `next_sequence_id - 1` is queued in the pool.
    reservation_pending: bool,
    finished_notified: bool,
    closed: bool,
}

impl SourceState {
    fn consumed_up(&self) -> bool {
        self.sequence_id - 1 == self.last_sequence_id
    }

    /// Bytes this source holds in the memory pool.
    fn pool_bytes(&self) -> u64 {
        self.batches.values().map(|(_, reserved)| reserved).sum::<u64>() + self.in_flight_bytes
    }
}

/// Pull side of an exchange.
///
/// Batches are announced by the upstream sink with their sizes. Memory is
/// reserved for each announced batch in sequence order, and batches are only
/// fetched once their memory is reserved. A reservation that can't be
/// granted right away stops the scan until the pool has room again.
///
/// None of the methods block on the network. Fetches and acknowledgements run
/// on the shared executor and report back through the readiness future.
#[derive(Debug)]
pub struct ExchangeSource {
    descriptor: SourceDescriptor,
    resources: ExchangeResources,
    listener: Arc<dyn SourceListener>,
    state: Mutex<SourceState>,
    this: Weak<ExchangeSource>,
}

impl ExchangeSource {
    pub fn new(
        descriptor: SourceDescriptor,
        resources: ExchangeResources,
        listener: Arc<dyn SourceListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| ExchangeSource {
            descriptor,
            resources,
            listener,
            state: Mutex::new(SourceState {
                batches: BTreeMap::new(),
                pending_sizes: HashMap::new(),
                buffered_bytes: 0,
                in_flight_bytes: 0,
                blocked: Signal::new(),
                sequence_id: 0,
                next_sequence_id: 0,
                last_sequence_id: SequenceId::MAX,
                reservation_pending: false,
                finished_notified: false,
                closed: false,
            }),
            this: this.clone(),
        })
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn local_address(&self) -> &SourceAddress {
        &self.descriptor.local
    }

    fn query_id(&self) -> QueryId {
        self.descriptor.local.fragment_instance_id.query_id
    }

    /// Take the next batch in sequence order.
    ///
    /// Only valid once the future returned by `is_blocked` is done.
    pub fn receive(&self) -> Result<RowBatch> {
        let (batch, notify_finished) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidState,
                    "Exchange source is closed",
                ));
            }
            if !state.blocked.is_done() {
                return Err(MppError::with_kind(
                    ErrorKind::InvalidState,
                    "Exchange source is blocked",
                ));
            }

            let seq = state.sequence_id;
            let (batch, reserved) = match state.batches.remove(&seq) {
                Some(entry) => entry,
                None => {
                    return Err(MppError::with_kind(
                        ErrorKind::InvalidState,
                        format!("No batch buffered for sequence id {seq}"),
                    ))
                }
            };
            state.sequence_id += 1;
            state.buffered_bytes -= batch.retained_size();
            if reserved > 0 {
                self.resources.memory_pool.free(self.query_id(), reserved)?;
            }

            let finished = state.consumed_up();
            if !finished && !state.batches.contains_key(&state.sequence_id) {
                state.blocked = Signal::new();
            }
            let notify = finished && !state.finished_notified;
            state.finished_notified |= notify;
            trace!(source = %self, %seq, buffered_bytes = %state.buffered_bytes, "received batch");

            (batch, notify)
        };

        if notify_finished {
            self.listener.on_finished(self);
        }
        self.try_fetch();

        Ok(batch)
    }

    /// Future that's done once `receive` can be called, or once everything
    /// was received.
    pub fn is_blocked(&self) -> Result<SignalFuture> {
        let state = self.state.lock();
        if state.closed {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                "Exchange source is closed",
            ));
        }
        Ok(state.blocked.future())
    }

    /// Whether the sink declared its last batch and every batch up to it was
    /// received.
    pub fn is_finished(&self) -> bool {
        self.state.lock().consumed_up()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sum of retained sizes of fetched but not yet received batches.
    pub fn buffered_bytes(&self) -> u64 {
        self.state.lock().buffered_bytes
    }

    /// Bytes reserved for batches still being fetched.
    pub fn in_flight_bytes(&self) -> u64 {
        self.state.lock().in_flight_bytes
    }

    /// Record batches announced by the sink and start fetching what fits.
    pub fn update_pending_info(&self, start_sequence_id: SequenceId, sizes: &[u64]) -> Result<()> {
        if start_sequence_id < 0 {
            return Err(MppError::with_kind(
                ErrorKind::InvalidArgument,
                format!("Start sequence id must not be negative, got {start_sequence_id}"),
            ));
        }

        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            for (idx, size) in sizes.iter().enumerate() {
                let seq = start_sequence_id + idx as SequenceId;
                // Ids before the cursor are already reserved (or fetched).
                if seq >= state.next_sequence_id {
                    state.pending_sizes.insert(seq, *size);
                }
            }
            trace!(source = %self, %start_sequence_id, num_batches = %sizes.len(), "pending batches announced");
        }

        self.try_fetch();
        Ok(())
    }

    /// The sink won't produce anything past `last_sequence_id` (inclusive).
    pub fn set_no_more_batches(&self, last_sequence_id: SequenceId) {
        let notify_finished = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.last_sequence_id = last_sequence_id;
            debug!(source = %self, %last_sequence_id, "no more batches");

            if state.consumed_up() {
                if !state.blocked.is_done() {
                    state.blocked.set();
                }
                let notify = !state.finished_notified;
                state.finished_notified = true;
                notify
            } else {
                false
            }
        };

        if notify_finished {
            self.listener.on_finished(self);
        }
    }

    /// Drop everything buffered and give back all reserved memory.
    ///
    /// Idempotent. Fetches still in flight are discarded when they complete.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.blocked.cancel();
            state.pending_sizes.clear();

            let to_free = state.pool_bytes();
            state.batches.clear();
            state.buffered_bytes = 0;
            state.in_flight_bytes = 0;
            if to_free > 0 {
                if let Err(e) = self.resources.memory_pool.free(self.query_id(), to_free) {
                    error!(source = %self, %e, "failed to free memory on close");
                }
            }
            debug!(source = %self, freed = %to_free, "closed exchange source");
        }

        self.listener.on_closed(self);
    }

    /// Reserve memory for announced batches in sequence order, and issue
    /// fetches for everything that was reserved.
    fn try_fetch(&self) {
        let failure = {
            let mut state = self.state.lock();
            if state.closed || state.reservation_pending {
                return;
            }

            let start = state.next_sequence_id;
            let mut end = start;
            let mut sizes = Vec::new();
            let mut deferred = None;
            let mut failure = None;

            while let Some(&size) = state.pending_sizes.get(&end) {
                if size == 0 {
                    state.pending_sizes.remove(&end);
                    sizes.push(0);
                    end += 1;
                    continue;
                }
                match self.resources.memory_pool.reserve(self.query_id(), size) {
                    Ok(fut) if fut.is_done() => {
                        state.pending_sizes.remove(&end);
                        sizes.push(size);
                        end += 1;
                    }
                    Ok(fut) => {
                        state.pending_sizes.remove(&end);
                        deferred = Some((end, size, fut));
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if !sizes.is_empty() {
                state.in_flight_bytes += sizes.iter().sum::<u64>();
                match FetchRange::new(start, end, sizes) {
                    Ok(range) => self.spawn_fetch(range),
                    Err(e) => failure = Some(e),
                }
            }
            state.next_sequence_id = end;

            if let Some((seq, size, fut)) = deferred {
                trace!(source = %self, %seq, %size, "memory reservation deferred");
                state.next_sequence_id = seq + 1;
                state.reservation_pending = true;

                let this = self.this.clone();
                let granted = fut.clone();
                fut.add_listener(self.resources.executor.clone(), move || {
                    if let Some(source) = this.upgrade() {
                        source.on_reservation_done(seq, size, &granted);
                    }
                });
            }

            failure
        };

        if let Some(e) = failure {
            error!(source = %self, %e, "failed to reserve memory for pending batches");
            self.listener.on_failure(self, e);
        }
    }

    fn on_reservation_done(&self, seq: SequenceId, size: u64, fut: &SignalFuture) {
        {
            let mut state = self.state.lock();
            state.reservation_pending = false;
            if fut.is_cancelled() {
                return;
            }
            if state.closed {
                // Granted after close, nobody else will free it.
                if let Err(e) = self.resources.memory_pool.free(self.query_id(), size) {
                    error!(source = %self, %e, "failed to free late memory reservation");
                }
                return;
            }

            state.in_flight_bytes += size;
            match FetchRange::new(seq, seq + 1, vec![size]) {
                Ok(range) => self.spawn_fetch(range),
                Err(e) => {
                    error!(source = %self, %e, "invalid deferred fetch range");
                    return;
                }
            }
        }

        self.try_fetch();
    }

    fn spawn_fetch(&self, range: FetchRange) {
        if let Some(source) = self.this.upgrade() {
            self.resources
                .executor
                .spawn(Box::new(move || source.fetch(range)));
        }
    }

    /// Pull a range of batches from the sink, retrying on failure.
    fn fetch(&self, range: FetchRange) {
        debug!(source = %self, start = %range.start, end = %range.end(), "fetching batches");

        let req = GetRowBatchesRequest {
            sink_instance_id: self.descriptor.remote_instance_id,
            start_sequence_id: range.start,
            end_sequence_id: range.end(),
        };
        let expected = range.sizes.len();
        let result = call_with_retries(
            self.resources.clients.as_ref(),
            &self.descriptor.remote_endpoint,
            self.resources.max_attempts,
            "GetRowBatches",
            |client| {
                let resp = client.get_row_batches(&req)?;
                if resp.batches.len() != expected {
                    return Err(MppError::new(format!(
                        "Expected {expected} batches, got {}",
                        resp.batches.len()
                    )));
                }
                Ok(resp.batches)
            },
        );

        match result {
            Ok(batches) => self.store(range, batches),
            Err(e) => {
                error!(source = %self, start = %range.start, end = %range.end(), %e, "failed to fetch batches");
                self.fail_fetch(range, e);
            }
        }
    }

    fn store(&self, range: FetchRange, batches: Vec<RowBatch>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                // Reservation was already freed by close.
                return;
            }

            for ((offset, batch), reserved) in batches.into_iter().enumerate().zip(&range.sizes) {
                state.buffered_bytes += batch.retained_size();
                state
                    .batches
                    .insert(range.start + offset as SequenceId, (batch, *reserved));
            }
            state.in_flight_bytes -= range.reserved_bytes();
            // Later ranges may land before the one holding the next batch.
            if state.batches.contains_key(&state.sequence_id) && !state.blocked.is_done() {
                state.blocked.set();
            }
        }

        if let Some(source) = self.this.upgrade() {
            self.resources
                .executor
                .spawn(Box::new(move || source.acknowledge(range.start, range.end())));
        }
    }

    fn fail_fetch(&self, range: FetchRange, e: MppError) {
        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                let reserved = range.reserved_bytes();
                state.in_flight_bytes -= reserved;
                if reserved > 0 {
                    if let Err(e) = self.resources.memory_pool.free(self.query_id(), reserved) {
                        error!(source = %self, %e, "failed to free memory of failed fetch");
                    }
                }
            }
            state.closed
        };

        if !closed {
            self.listener.on_failure(self, e);
        }
    }

    /// Tell the sink it can release `[start, end)`.
    fn acknowledge(&self, start: SequenceId, end: SequenceId) {
        debug!(source = %self, %start, %end, "acknowledging batches");
        let event = AcknowledgeRowBatchesEvent {
            sink_instance_id: self.descriptor.remote_instance_id,
            start_sequence_id: start,
            end_sequence_id: end,
        };
        let result = call_with_retries(
            self.resources.clients.as_ref(),
            &self.descriptor.remote_endpoint,
            self.resources.max_attempts,
            "AcknowledgeRowBatches",
            |client| client.acknowledge_row_batches(&event),
        );

        if let Err(e) = result {
            error!(source = %self, %start, %end, %e, "failed to acknowledge batches");
            if !self.is_closed() {
                self.listener.on_failure(self, e);
            }
        }
    }
}

impl std::fmt::Display for ExchangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} <- {}@{}",
            self.descriptor.local.fragment_instance_id,
            self.descriptor.local.plan_node_id,
            self.descriptor.remote_instance_id,
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
        instance_id, test_batch, CountingSourceListener, ManualExecutor, MockClientFactory, MockPeer,
    };

    struct Harness {
        source: Arc<ExchangeSource>,
        pool: Arc<MemoryPool>,
        executor: Arc<ManualExecutor>,
        peer: MockPeer,
        listener: Arc<CountingSourceListener>,
    }

    impl Harness {
        fn new(max_bytes_per_query: u64) -> Self {
            let pool = Arc::new(MemoryPool::new(10_000, max_bytes_per_query));
            let executor = Arc::new(ManualExecutor::default());
            let peer = MockPeer::new();
            let listener = Arc::new(CountingSourceListener::default());
            let resources = ExchangeResources {
                memory_pool: pool.clone(),
                executor: executor.clone(),
                clients: Arc::new(ClientPool::new(
                    Arc::new(MockClientFactory::new(peer.clone())),
                    2,
                )),
                max_attempts: 3,
            };
            let descriptor = SourceDescriptor {
                local: SourceAddress {
                    fragment_instance_id: instance_id(1, 1),
                    plan_node_id: "exchange_0".into(),
                },
                remote_endpoint: Endpoint::new("upstream", 6667),
                remote_instance_id: instance_id(1, 0),
            };
            let source = ExchangeSource::new(descriptor, resources, listener.clone());

            Harness {
                source,
                pool,
                executor,
                peer,
                listener,
            }
        }

        fn query_reserved(&self) -> u64 {
            self.pool.query_reserved_bytes(&instance_id(1, 1).query_id)
        }
    }

    #[test]
    fn happy_path() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.put_batch(1, test_batch(1, 100));

        h.source.update_pending_info(0, &[100, 100]).unwrap();
        assert_eq!(200, h.query_reserved());
        assert_eq!(200, h.source.in_flight_bytes());
        assert!(!h.source.is_blocked().unwrap().is_done());

        h.executor.run_all();
        assert_eq!(vec![(0, 2)], h.peer.get_ranges());
        assert_eq!(vec![(0, 2)], h.peer.ack_ranges());
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(200, h.source.buffered_bytes());
        assert_eq!(0, h.source.in_flight_bytes());

        h.source.set_no_more_batches(1);
        assert!(!h.source.is_finished());

        assert_eq!(test_batch(0, 100), h.source.receive().unwrap());
        assert_eq!(100, h.source.buffered_bytes());
        assert_eq!(100, h.query_reserved());
        assert_eq!(0, h.listener.finished());

        assert_eq!(test_batch(1, 100), h.source.receive().unwrap());
        assert_eq!(0, h.source.buffered_bytes());
        assert!(h.source.is_finished());
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(1, h.listener.finished());
        assert_eq!(0, h.query_reserved());
    }

    #[test]
    fn out_of_order_fetches_wait_for_next_batch() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.put_batch(1, test_batch(1, 100));

        h.source.update_pending_info(0, &[100]).unwrap();
        h.source.update_pending_info(1, &[100]).unwrap();
        assert_eq!(2, h.executor.pending());

        // Fetch of [1, 2) completes first.
        assert!(h.executor.run_last());
        assert_eq!(100, h.source.buffered_bytes());
        assert!(!h.source.is_blocked().unwrap().is_done());
        assert_eq!(
            ErrorKind::InvalidState,
            h.source.receive().unwrap_err().kind()
        );

        h.executor.run_all();
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(test_batch(0, 100), h.source.receive().unwrap());
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(test_batch(1, 100), h.source.receive().unwrap());
        assert!(!h.source.is_blocked().unwrap().is_done());
    }

    #[test]
    fn receive_blocks_on_gap_in_buffer() {
        let h = Harness::new(1000);
        for seq in 0..3 {
            h.peer.put_batch(seq, test_batch(seq as u8, 100));
            h.source.update_pending_info(seq, &[100]).unwrap();
        }
        assert_eq!(3, h.executor.pending());

        // [2, 3) lands, then [0, 1). [1, 2) is still in flight.
        assert!(h.executor.run_last());
        assert!(!h.source.is_blocked().unwrap().is_done());
        assert!(h.executor.run_first());
        assert!(h.source.is_blocked().unwrap().is_done());

        assert_eq!(test_batch(0, 100), h.source.receive().unwrap());
        assert!(!h.source.is_blocked().unwrap().is_done());
        assert_eq!(100, h.source.in_flight_bytes());

        h.executor.run_all();
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(test_batch(1, 100), h.source.receive().unwrap());
        assert_eq!(test_batch(2, 100), h.source.receive().unwrap());
    }

    #[test]
    fn deferred_reservation() {
        let h = Harness::new(150);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.put_batch(1, test_batch(1, 100));

        h.source.update_pending_info(0, &[100, 100]).unwrap();
        assert_eq!(100, h.query_reserved());

        h.executor.run_all();
        assert_eq!(vec![(0, 1)], h.peer.get_ranges());

        // Receiving frees room for the deferred reservation.
        h.source.receive().unwrap();
        assert!(!h.source.is_blocked().unwrap().is_done());
        assert_eq!(vec![(0, 1)], h.peer.get_ranges());

        h.executor.run_all();
        assert_eq!(vec![(0, 1), (1, 2)], h.peer.get_ranges());
        assert_eq!(test_batch(1, 100), h.source.receive().unwrap());
        assert_eq!(0, h.query_reserved());
    }

    #[test]
    fn retry_exhaustion_frees_reservation() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.fail_next_gets(3);

        h.source.update_pending_info(0, &[100]).unwrap();
        h.executor.run_all();

        assert_eq!(3, h.peer.get_ranges().len());
        assert_eq!(1, h.listener.failures().len());
        assert_eq!(ErrorKind::Transport, h.listener.failures()[0]);
        assert_eq!(0, h.query_reserved());
        assert_eq!(0, h.source.in_flight_bytes());
        assert_eq!(0, h.source.buffered_bytes());
        assert!(!h.source.is_blocked().unwrap().is_done());
        assert!(h.peer.ack_ranges().is_empty());
    }

    #[test]
    fn retry_then_succeed() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.fail_next_gets(2);

        h.source.update_pending_info(0, &[100]).unwrap();
        h.executor.run_all();

        assert_eq!(3, h.peer.get_ranges().len());
        assert!(h.listener.failures().is_empty());
        assert_eq!(100, h.source.buffered_bytes());
    }

    #[test]
    fn ack_failure_keeps_data() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.fail_next_acks(3);

        h.source.update_pending_info(0, &[100]).unwrap();
        h.executor.run_all();

        assert_eq!(1, h.listener.failures().len());
        assert_eq!(test_batch(0, 100), h.source.receive().unwrap());
        assert_eq!(0, h.query_reserved());
    }

    #[test]
    fn close_is_idempotent() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.peer.put_batch(1, test_batch(1, 100));
        h.peer.put_batch(2, test_batch(2, 300));
        h.source.update_pending_info(0, &[100, 100, 300]).unwrap();
        h.executor.run_all();
        assert_eq!(500, h.query_reserved());

        h.source.close();
        h.source.close();

        assert_eq!(1, h.listener.closed());
        assert_eq!(0, h.query_reserved());
        let stats = h.pool.stats();
        assert_eq!(stats.allocated, stats.deallocated);
        assert_eq!(0, h.source.buffered_bytes());

        assert_eq!(
            ErrorKind::InvalidState,
            h.source.receive().unwrap_err().kind()
        );
        assert_eq!(
            ErrorKind::InvalidState,
            h.source.is_blocked().unwrap_err().kind()
        );
    }

    #[test]
    fn close_cancels_readiness() {
        let h = Harness::new(1000);
        let fut = h.source.is_blocked().unwrap();
        h.source.close();
        assert!(fut.is_cancelled());
    }

    #[test]
    fn fetch_completing_after_close_is_discarded() {
        let h = Harness::new(1000);
        h.peer.put_batch(0, test_batch(0, 100));
        h.source.update_pending_info(0, &[100]).unwrap();

        h.source.close();
        assert_eq!(0, h.query_reserved());

        h.executor.run_all();
        assert_eq!(0, h.query_reserved());
        assert!(h.peer.ack_ranges().is_empty());
        assert!(h.listener.failures().is_empty());
        let stats = h.pool.stats();
        assert_eq!(stats.allocated, stats.deallocated);
    }

    #[test]
    fn deferred_reservation_granted_after_close_is_freed() {
        let h = Harness::new(100);
        h.source.update_pending_info(0, &[100, 100]).unwrap();
        assert_eq!(1, h.pool.stats().pending);

        // Frees the first reservation, which grants the queued one.
        h.source.close();
        assert_eq!(100, h.query_reserved());

        h.executor.run_all();
        assert_eq!(0, h.query_reserved());
        let stats = h.pool.stats();
        assert_eq!(stats.allocated, stats.deallocated);
    }

    #[test]
    fn failed_fetch_while_closed_is_not_double_freed() {
        let h = Harness::new(1000);
        h.peer.fail_next_gets(3);
        h.source.update_pending_info(0, &[100]).unwrap();
        h.source.close();
        h.executor.run_all();

        let stats = h.pool.stats();
        assert_eq!(100, stats.allocated);
        assert_eq!(100, stats.deallocated);
        assert!(h.listener.failures().is_empty());
    }

    #[test]
    fn receive_while_blocked() {
        let h = Harness::new(1000);
        let err = h.source.receive().unwrap_err();
        assert_eq!(ErrorKind::InvalidState, err.kind());
    }

    #[test]
    fn sequence_is_monotonic_across_announcements() {
        let h = Harness::new(250);
        let sizes = [40_u64, 120, 10, 90, 60];
        for (seq, size) in sizes.iter().enumerate() {
            h.peer.put_batch(seq as SequenceId, test_batch(seq as u8, *size as usize));
        }

        h.source.update_pending_info(0, &sizes[..2]).unwrap();
        h.source.update_pending_info(2, &sizes[2..]).unwrap();
        h.source.set_no_more_batches(4);

        let mut received = Vec::new();
        while !h.source.is_finished() {
            h.executor.run_all();
            while h.source.is_blocked().unwrap().is_done() && !h.source.is_finished() {
                let batch = h.source.receive().unwrap();
                received.push(batch.payload()[0]);
            }
        }

        assert_eq!(vec![0, 1, 2, 3, 4], received);
        assert_eq!(0, h.query_reserved());
        assert_eq!(1, h.listener.finished());
    }

    #[test]
    fn buffered_bytes_tracks_remaining_batches() {
        let h = Harness::new(1000);
        let sizes = [30_u64, 50, 70];
        for (seq, size) in sizes.iter().enumerate() {
            h.peer.put_batch(seq as SequenceId, test_batch(seq as u8, *size as usize));
        }
        h.source.update_pending_info(0, &sizes).unwrap();
        h.executor.run_all();

        for idx in 0..sizes.len() {
            let expected: u64 = sizes[idx..].iter().sum();
            assert_eq!(expected, h.source.buffered_bytes());
            let batch = h.source.receive().unwrap();
            assert_eq!(idx as u8, batch.payload()[0]);
        }
        assert_eq!(0, h.source.buffered_bytes());
    }

    #[test]
    fn empty_sink_finishes_immediately() {
        let h = Harness::new(1000);
        h.source.set_no_more_batches(-1);
        assert!(h.source.is_finished());
        assert!(h.source.is_blocked().unwrap().is_done());
        assert_eq!(1, h.listener.finished());
    }

    #[test]
    fn oversized_batch_reports_failure() {
        let h = Harness::new(100);
        h.source.update_pending_info(0, &[101]).unwrap();
        assert_eq!(vec![ErrorKind::InvalidArgument], h.listener.failures());
        assert_eq!(0, h.query_reserved());
    }

    #[test]
    fn invalid_ranges() {
        let h = Harness::new(100);
        let err = h.source.update_pending_info(-1, &[10]).unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());

        assert!(FetchRange::new(-1, 1, vec![1, 1]).is_err());
        assert!(FetchRange::new(2, 2, vec![]).is_err());
        assert!(FetchRange::new(0, 2, vec![1]).is_err());
        let range = FetchRange::new(3, 5, vec![10, 20]).unwrap();
        assert_eq!(5, range.end());
        assert_eq!(30, range.reserved_bytes());
    }
}

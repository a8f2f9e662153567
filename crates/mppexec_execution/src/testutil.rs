//! Utilities for testing schedulers and exchanges without real drivers or
//! networking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::batch::RowBatch;
use crate::driver::{Driver, DriverProgress};
use crate::exchange::client::{ClientFactory, ExchangeClient};
use crate::exchange::manager::ExchangeFailureHandler;
use crate::exchange::protocol::{
    AcknowledgeRowBatchesEvent, GetRowBatchesRequest, GetRowBatchesResponse, NewBatchesEvent,
    NoMoreBatchesEvent, SequenceId,
};
use crate::exchange::sink::{SinkHandle, SinkListener};
use crate::exchange::source::{ExchangeSource, SourceListener};
use crate::ids::{Endpoint, FragmentInstanceId, QueryId};
use crate::runtime::{Executor, Job};
use crate::scheduler::task_scheduler::FragmentInstanceRegistry;
use crate::signal::SignalFuture;

/// Fragment instance `instance` of fragment 0 of query `query`.
pub fn instance_id(query: u128, instance: u32) -> FragmentInstanceId {
    FragmentInstanceId::new(QueryId(Uuid::from_u128(query)), 0, instance)
}

/// Batch of `size` bytes, each set to `seq`.
pub fn test_batch(seq: u8, size: usize) -> RowBatch {
    RowBatch::new(vec![seq; size], 1)
}

/// Poll `f` until it returns true, giving up after a few seconds.
pub fn wait_for(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    f()
}

/// Executor that only queues jobs. Tests run them explicitly.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    /// Run queued jobs, including those queued by the jobs themselves, until
    /// nothing is left. Returns the number of jobs run.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Run the oldest queued job. Returns false if nothing was queued.
    pub fn run_first(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        job.map(|job| job()).is_some()
    }

    /// Run the most recently queued job, simulating jobs finishing out of
    /// order.
    pub fn run_last(&self) -> bool {
        let job = self.jobs.lock().pop_back();
        job.map(|job| job()).is_some()
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Executor for ManualExecutor {
    fn spawn(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

impl std::fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

/// What a [`MockDriver`] does on its next slice.
#[derive(Debug)]
pub enum MockStep {
    Yield,
    Finish,
    Block(SignalFuture),
    Fail(&'static str),
    Panic,
}

/// Driver playing back scripted steps. Finishes once the script runs out.
#[derive(Debug)]
pub struct MockDriver {
    id: FragmentInstanceId,
    steps: Mutex<VecDeque<MockStep>>,
    process_count: AtomicUsize,
    close_causes: Mutex<Vec<ErrorKind>>,
}

impl MockDriver {
    pub fn new(id: FragmentInstanceId) -> Self {
        Self::with_steps(id, Vec::new())
    }

    pub fn with_steps(id: FragmentInstanceId, steps: Vec<MockStep>) -> Self {
        MockDriver {
            id,
            steps: Mutex::new(steps.into()),
            process_count: AtomicUsize::new(0),
            close_causes: Mutex::new(Vec::new()),
        }
    }

    pub fn process_count(&self) -> usize {
        self.process_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_causes.lock().len()
    }

    /// Kinds of the errors passed to every `close` call.
    pub fn close_causes(&self) -> Vec<ErrorKind> {
        self.close_causes.lock().clone()
    }
}

impl Driver for MockDriver {
    fn info(&self) -> FragmentInstanceId {
        self.id
    }

    fn process_for(&self, _time_slice: Duration) -> Result<DriverProgress> {
        self.process_count.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();
        match step {
            Some(MockStep::Yield) => Ok(DriverProgress::Yield),
            Some(MockStep::Finish) | None => Ok(DriverProgress::Finished),
            Some(MockStep::Block(fut)) => Ok(DriverProgress::Blocked(fut)),
            Some(MockStep::Fail(msg)) => Err(MppError::new(msg)),
            Some(MockStep::Panic) => panic!("mock driver panicked"),
        }
    }

    fn close(&self, cause: &MppError) {
        self.close_causes.lock().push(cause.kind());
    }
}

/// Registry counting deregistrations.
#[derive(Debug, Default)]
pub struct CountingRegistry {
    deregistered: Mutex<Vec<FragmentInstanceId>>,
}

impl CountingRegistry {
    pub fn count(&self) -> usize {
        self.deregistered.lock().len()
    }

    pub fn deregistered(&self) -> Vec<FragmentInstanceId> {
        self.deregistered.lock().clone()
    }
}

impl FragmentInstanceRegistry for CountingRegistry {
    fn force_deregister_fragment_instance(&self, instance_id: &FragmentInstanceId) {
        self.deregistered.lock().push(*instance_id);
    }
}

#[derive(Debug, Default)]
struct PeerState {
    batches: HashMap<SequenceId, RowBatch>,
    fail_gets: usize,
    fail_acks: usize,
    fail_new_batches: usize,
    get_ranges: Vec<(SequenceId, SequenceId)>,
    ack_ranges: Vec<(SequenceId, SequenceId)>,
    ack_calls: usize,
    new_batches: Vec<(SequenceId, Vec<u64>)>,
    no_more_batches: Vec<SequenceId>,
}

/// Scriptable remote end of an exchange, shared by every client connected
/// to it.
#[derive(Debug, Clone, Default)]
pub struct MockPeer {
    state: Arc<Mutex<PeerState>>,
}

fn transport_error(op: &str) -> MppError {
    MppError::with_kind(ErrorKind::Transport, format!("Injected {op} failure"))
}

impl MockPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a batch available to `GetRowBatches`.
    pub fn put_batch(&self, seq: SequenceId, batch: RowBatch) {
        self.state.lock().batches.insert(seq, batch);
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.state.lock().fail_gets = n;
    }

    pub fn fail_next_acks(&self, n: usize) {
        self.state.lock().fail_acks = n;
    }

    pub fn fail_next_new_batches(&self, n: usize) {
        self.state.lock().fail_new_batches = n;
    }

    /// Ranges of every `GetRowBatches` call, failed ones included.
    pub fn get_ranges(&self) -> Vec<(SequenceId, SequenceId)> {
        self.state.lock().get_ranges.clone()
    }

    /// Ranges of successful `AcknowledgeRowBatches` calls.
    pub fn ack_ranges(&self) -> Vec<(SequenceId, SequenceId)> {
        self.state.lock().ack_ranges.clone()
    }

    /// Number of `AcknowledgeRowBatches` calls, failed ones included.
    pub fn ack_calls(&self) -> usize {
        self.state.lock().ack_calls
    }

    /// Start sequence and sizes of successful `NotifyNewBatches` calls.
    pub fn new_batches(&self) -> Vec<(SequenceId, Vec<u64>)> {
        self.state.lock().new_batches.clone()
    }

    /// Last sequence ids of `NotifyNoMoreBatches` calls.
    pub fn no_more_batches(&self) -> Vec<SequenceId> {
        self.state.lock().no_more_batches.clone()
    }
}

/// Client talking to a [`MockPeer`].
#[derive(Debug)]
pub struct MockExchangeClient {
    peer: MockPeer,
}

impl MockExchangeClient {
    pub fn new(peer: MockPeer) -> Self {
        MockExchangeClient { peer }
    }
}

impl ExchangeClient for MockExchangeClient {
    fn get_row_batches(&mut self, req: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse> {
        let mut state = self.peer.state.lock();
        state
            .get_ranges
            .push((req.start_sequence_id, req.end_sequence_id));
        if state.fail_gets > 0 {
            state.fail_gets -= 1;
            return Err(transport_error("GetRowBatches"));
        }

        let batches = (req.start_sequence_id..req.end_sequence_id)
            .map(|seq| {
                state.batches.get(&seq).cloned().ok_or_else(|| {
                    MppError::with_kind(
                        ErrorKind::InvalidArgument,
                        format!("Peer has no batch {seq}"),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GetRowBatchesResponse { batches })
    }

    fn acknowledge_row_batches(&mut self, event: &AcknowledgeRowBatchesEvent) -> Result<()> {
        let mut state = self.peer.state.lock();
        state.ack_calls += 1;
        if state.fail_acks > 0 {
            state.fail_acks -= 1;
            return Err(transport_error("AcknowledgeRowBatches"));
        }
        state
            .ack_ranges
            .push((event.start_sequence_id, event.end_sequence_id));
        Ok(())
    }

    fn notify_new_batches(&mut self, event: &NewBatchesEvent) -> Result<()> {
        let mut state = self.peer.state.lock();
        if state.fail_new_batches > 0 {
            state.fail_new_batches -= 1;
            return Err(transport_error("NotifyNewBatches"));
        }
        state
            .new_batches
            .push((event.start_sequence_id, event.batch_sizes.clone()));
        Ok(())
    }

    fn notify_no_more_batches(&mut self, event: &NoMoreBatchesEvent) -> Result<()> {
        self.peer
            .state
            .lock()
            .no_more_batches
            .push(event.last_sequence_id);
        Ok(())
    }
}

/// Factory connecting every endpoint to the same [`MockPeer`].
#[derive(Debug)]
pub struct MockClientFactory {
    peer: MockPeer,
    fail_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl MockClientFactory {
    pub fn new(peer: MockPeer) -> Self {
        MockClientFactory {
            peer,
            fail_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MockClientFactory {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ExchangeClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MppError::with_kind(
                ErrorKind::Transport,
                format!("Injected connect failure to {endpoint}"),
            ));
        }
        Ok(Box::new(MockExchangeClient::new(self.peer.clone())))
    }
}

#[derive(Debug, Default)]
pub struct CountingSourceListener {
    finished: AtomicUsize,
    closed: AtomicUsize,
    failures: Mutex<Vec<ErrorKind>>,
}

impl CountingSourceListener {
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<ErrorKind> {
        self.failures.lock().clone()
    }
}

impl SourceListener for CountingSourceListener {
    fn on_finished(&self, _source: &ExchangeSource) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _source: &ExchangeSource) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _source: &ExchangeSource, error: MppError) {
        self.failures.lock().push(error.kind());
    }
}

#[derive(Debug, Default)]
pub struct CountingSinkListener {
    finished: AtomicUsize,
    closed: AtomicUsize,
    aborted: AtomicUsize,
    failures: Mutex<Vec<ErrorKind>>,
}

impl CountingSinkListener {
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<ErrorKind> {
        self.failures.lock().clone()
    }
}

impl SinkListener for CountingSinkListener {
    fn on_finished(&self, _sink: &SinkHandle) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _sink: &SinkHandle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_aborted(&self, _sink: &SinkHandle) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _sink: &SinkHandle, error: MppError) {
        self.failures.lock().push(error.kind());
    }
}

/// Failure handler recording which instances failed and how.
#[derive(Debug, Default)]
pub struct CountingFailureHandler {
    failures: Mutex<Vec<(FragmentInstanceId, ErrorKind)>>,
}

impl CountingFailureHandler {
    pub fn failures(&self) -> Vec<ErrorKind> {
        self.failures.lock().iter().map(|(_, kind)| *kind).collect()
    }

    pub fn instances(&self) -> Vec<FragmentInstanceId> {
        self.failures.lock().iter().map(|(id, _)| *id).collect()
    }
}

impl ExchangeFailureHandler for CountingFailureHandler {
    fn on_exchange_failure(&self, instance_id: FragmentInstanceId, error: MppError) {
        self.failures.lock().push((instance_id, error.kind()));
    }
}

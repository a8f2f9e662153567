use std::fmt::Debug;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::client::ClientPool;
use super::local::LocalClientFactory;
use super::protocol::{
    AcknowledgeRowBatchesEvent, GetRowBatchesRequest, GetRowBatchesResponse, NewBatchesEvent,
    NoMoreBatchesEvent, SourceAddress,
};
use super::sink::{ExchangeSink, SinkDescriptor, SinkHandle, SinkListener};
use super::source::{ExchangeSource, SourceDescriptor, SourceListener};
use super::ExchangeResources;
use crate::ids::{Endpoint, FragmentInstanceId, PlanNodeId};
use crate::memory::MemoryPool;
use crate::runtime::Executor;
use crate::scheduler::task_scheduler::FragmentInstanceRegistry;

/// Told about exchange failures that should fail a fragment instance.
pub trait ExchangeFailureHandler: Debug + Sync + Send {
    fn on_exchange_failure(&self, instance_id: FragmentInstanceId, error: MppError);
}

type SourceMap = HashMap<FragmentInstanceId, HashMap<PlanNodeId, Arc<ExchangeSource>>>;

/// Registry of every exchange handle on a node.
///
/// Inbound protocol messages are routed to the handle they're addressed to.
/// Handles are dropped from the registry once they're done: a source once
/// it's finished or closed, a sink once it's finished or aborted.
#[derive(Debug)]
pub struct ExchangeManager {
    resources: ExchangeResources,
    sources: Mutex<SourceMap>,
    sinks: Mutex<HashMap<FragmentInstanceId, Arc<SinkHandle>>>,
    this: Weak<ExchangeManager>,
}

impl ExchangeManager {
    pub fn new(resources: ExchangeResources) -> Arc<Self> {
        Arc::new_cyclic(|this| ExchangeManager {
            resources,
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Create a manager whose outbound calls are served by itself.
    ///
    /// Every endpoint resolves to this manager, which is what a single node
    /// deployment needs.
    pub fn new_local(
        memory_pool: Arc<MemoryPool>,
        executor: Arc<dyn Executor>,
        max_attempts: usize,
        max_idle_clients: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let factory = Arc::new(LocalClientFactory::new(this.clone()));
            ExchangeManager {
                resources: ExchangeResources {
                    memory_pool,
                    executor,
                    clients: Arc::new(ClientPool::new(factory, max_idle_clients)),
                    max_attempts,
                },
                sources: Mutex::new(HashMap::new()),
                sinks: Mutex::new(HashMap::new()),
                this: this.clone(),
            }
        })
    }

    pub fn resources(&self) -> &ExchangeResources {
        &self.resources
    }

    /// Create and register a source pulling from `remote_instance_id`.
    ///
    /// Errors if a source is already registered at `local`.
    pub fn create_source(
        &self,
        local: SourceAddress,
        remote_endpoint: Endpoint,
        remote_instance_id: FragmentInstanceId,
        failure: Arc<dyn ExchangeFailureHandler>,
    ) -> Result<Arc<ExchangeSource>> {
        let mut sources = self.sources.lock();
        let by_node = sources.entry(local.fragment_instance_id).or_default();
        if by_node.contains_key(&local.plan_node_id) {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                format!(
                    "Source already registered for {}/{}",
                    local.fragment_instance_id, local.plan_node_id
                ),
            ));
        }

        let listener = Arc::new(SourceEvents {
            manager: self.this.clone(),
            failure,
        });
        let source = ExchangeSource::new(
            SourceDescriptor {
                local: local.clone(),
                remote_endpoint,
                remote_instance_id,
            },
            self.resources.clone(),
            listener,
        );
        by_node.insert(local.plan_node_id, source.clone());
        debug!(%source, "registered exchange source");

        Ok(source)
    }

    /// Create and register the sink of `local_instance_id`.
    ///
    /// Errors if the instance already has a sink.
    pub fn create_sink(
        &self,
        local_instance_id: FragmentInstanceId,
        remote_endpoint: Endpoint,
        remote: SourceAddress,
        failure: Arc<dyn ExchangeFailureHandler>,
    ) -> Result<Arc<SinkHandle>> {
        let mut sinks = self.sinks.lock();
        if sinks.contains_key(&local_instance_id) {
            return Err(MppError::with_kind(
                ErrorKind::InvalidState,
                format!("Sink already registered for {local_instance_id}"),
            ));
        }

        let listener = Arc::new(SinkEvents {
            manager: self.this.clone(),
            failure,
        });
        let sink = SinkHandle::new(
            SinkDescriptor {
                local_instance_id,
                remote_endpoint,
                remote,
            },
            self.resources.clone(),
            listener,
        );
        sinks.insert(local_instance_id, sink.clone());
        debug!(%sink, "registered exchange sink");

        Ok(sink)
    }

    pub fn source(&self, address: &SourceAddress) -> Option<Arc<ExchangeSource>> {
        self.sources
            .lock()
            .get(&address.fragment_instance_id)
            .and_then(|by_node| by_node.get(&address.plan_node_id))
            .cloned()
    }

    pub fn sink(&self, instance_id: &FragmentInstanceId) -> Option<Arc<SinkHandle>> {
        self.sinks.lock().get(instance_id).cloned()
    }

    pub fn num_sources(&self) -> usize {
        self.sources.lock().values().map(|by_node| by_node.len()).sum()
    }

    pub fn num_sinks(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Serve a fetch from one of our sinks.
    pub fn get_row_batches(&self, req: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse> {
        let sink = self.sink(&req.sink_instance_id).ok_or_else(|| {
            MppError::with_kind(
                ErrorKind::InvalidState,
                format!("No sink registered for {}", req.sink_instance_id),
            )
        })?;
        let batches = sink.get_row_batches(req.start_sequence_id, req.end_sequence_id)?;
        Ok(GetRowBatchesResponse { batches })
    }

    pub fn acknowledge_row_batches(&self, event: &AcknowledgeRowBatchesEvent) -> Result<()> {
        match self.sink(&event.sink_instance_id) {
            Some(sink) => sink.acknowledge_row_batches(event.start_sequence_id, event.end_sequence_id),
            None => {
                trace!(sink = %event.sink_instance_id, "ack for unknown sink");
                Ok(())
            }
        }
    }

    pub fn notify_new_batches(&self, event: &NewBatchesEvent) -> Result<()> {
        match self.source(&event.target) {
            Some(source) => source.update_pending_info(event.start_sequence_id, &event.batch_sizes),
            None => {
                // Source already went away, e.g. because a limit was reached
                // downstream.
                debug!(
                    instance = %event.target.fragment_instance_id,
                    node = %event.target.plan_node_id,
                    "dropping new batches for unknown source"
                );
                Ok(())
            }
        }
    }

    pub fn notify_no_more_batches(&self, event: &NoMoreBatchesEvent) -> Result<()> {
        match self.source(&event.target) {
            Some(source) => {
                source.set_no_more_batches(event.last_sequence_id);
                Ok(())
            }
            None => {
                debug!(
                    instance = %event.target.fragment_instance_id,
                    node = %event.target.plan_node_id,
                    "dropping end of batches for unknown source"
                );
                Ok(())
            }
        }
    }

    fn deregister_source(&self, source: &ExchangeSource) {
        let address = source.local_address();
        let mut sources = self.sources.lock();
        if let Some(by_node) = sources.get_mut(&address.fragment_instance_id) {
            let registered = by_node
                .get(&address.plan_node_id)
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), source));
            if registered {
                by_node.remove(&address.plan_node_id);
                trace!(%source, "deregistered exchange source");
            }
            if by_node.is_empty() {
                sources.remove(&address.fragment_instance_id);
            }
        }
    }

    fn deregister_sink(&self, sink: &SinkHandle) {
        let id = sink.local_instance_id();
        let mut sinks = self.sinks.lock();
        let registered = sinks
            .get(&id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), sink));
        if registered {
            sinks.remove(&id);
            trace!(%sink, "deregistered exchange sink");
        }
    }
}

impl FragmentInstanceRegistry for ExchangeManager {
    /// Close every source and abort the sink of a failed instance.
    fn force_deregister_fragment_instance(&self, instance_id: &FragmentInstanceId) {
        let sources = self.sources.lock().remove(instance_id);
        let sink = self.sinks.lock().remove(instance_id);

        let num_sources = sources.as_ref().map(|s| s.len()).unwrap_or(0);
        for source in sources.into_iter().flat_map(|by_node| by_node.into_values()) {
            source.close();
        }
        let had_sink = sink.is_some();
        if let Some(sink) = sink {
            sink.abort();
        }

        debug!(%instance_id, %num_sources, %had_sink, "force deregistered fragment instance");
    }
}

#[derive(Debug)]
struct SourceEvents {
    manager: Weak<ExchangeManager>,
    failure: Arc<dyn ExchangeFailureHandler>,
}

impl SourceListener for SourceEvents {
    fn on_finished(&self, source: &ExchangeSource) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister_source(source);
        }
    }

    fn on_closed(&self, source: &ExchangeSource) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister_source(source);
        }
    }

    fn on_failure(&self, source: &ExchangeSource, error: MppError) {
        warn!(%source, %error, "exchange source failed");
        self.failure
            .on_exchange_failure(source.local_address().fragment_instance_id, error);
    }
}

#[derive(Debug)]
struct SinkEvents {
    manager: Weak<ExchangeManager>,
    failure: Arc<dyn ExchangeFailureHandler>,
}

impl SinkListener for SinkEvents {
    fn on_finished(&self, sink: &SinkHandle) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister_sink(sink);
        }
    }

    // Closed sinks are kept around until everything was fetched.
    fn on_closed(&self, _sink: &SinkHandle) {}

    fn on_aborted(&self, sink: &SinkHandle) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister_sink(sink);
        }
    }

    fn on_failure(&self, sink: &SinkHandle, error: MppError) {
        warn!(%sink, %error, "exchange sink failed");
        self.failure
            .on_exchange_failure(sink.local_instance_id(), error);
    }
}

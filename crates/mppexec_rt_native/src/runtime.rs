use std::path::Path;
use std::sync::Arc;

use mppexec_error::{ErrorKind, MppError, Result, ResultExt};
use mppexec_execution::config::ExecutionConfig;
use mppexec_execution::driver::Driver;
use mppexec_execution::exchange::client::{ClientFactory, ClientPool};
use mppexec_execution::exchange::manager::ExchangeManager;
use mppexec_execution::exchange::protocol::SourceAddress;
use mppexec_execution::exchange::sink::SinkHandle;
use mppexec_execution::exchange::source::ExchangeSource;
use mppexec_execution::exchange::ExchangeResources;
use mppexec_execution::ids::{Endpoint, FragmentInstanceId, QueryId};
use mppexec_execution::memory::MemoryPool;
use mppexec_execution::runtime::Executor;
use mppexec_execution::scheduler::task::DriverTask;
use mppexec_execution::scheduler::DriverScheduler;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;

/// Idle connections kept around per peer.
const MAX_IDLE_CLIENTS_PER_ENDPOINT: usize = 8;

/// Execution runtime backed by native threads.
///
/// Owns the memory pool, the exchange manager, the thread pool running
/// exchange calls and signal continuations, and the driver scheduler with
/// its worker threads.
#[derive(Debug)]
pub struct NativeExecutionRuntime {
    config: ExecutionConfig,
    memory_pool: Arc<MemoryPool>,
    exchange: Arc<ExchangeManager>,
    scheduler: DriverScheduler,
    /// Dropped after the scheduler so that continuations queued during
    /// shutdown still have somewhere to run.
    io_pool: Arc<ThreadPool>,
    shut_down: Mutex<bool>,
}

impl NativeExecutionRuntime {
    /// Create a runtime whose exchanges only talk to fragment instances in
    /// this process.
    pub fn try_new(config: ExecutionConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a runtime reaching remote peers through `factory`.
    pub fn with_client_factory(
        config: ExecutionConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        Self::build(config, Some(factory))
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::try_new(ExecutionConfig::load_from_file(path)?)
    }

    fn build(config: ExecutionConfig, factory: Option<Arc<dyn ClientFactory>>) -> Result<Self> {
        config.validate()?;
        configure_logging(&config)?;

        let memory_pool = Arc::new(MemoryPool::new(
            config.memory.max_bytes,
            config.memory.max_bytes_per_query(),
        ));

        let io_pool = Arc::new(
            ThreadPoolBuilder::new()
                .thread_name(|idx| format!("mppexec_io_{idx}"))
                .num_threads(config.exchange.io_threads)
                .build()
                .context("Failed to build exchange thread pool")?,
        );
        let executor: Arc<dyn Executor> = io_pool.clone();

        let exchange = match factory {
            Some(factory) => ExchangeManager::new(ExchangeResources {
                memory_pool: memory_pool.clone(),
                executor: executor.clone(),
                clients: Arc::new(ClientPool::new(factory, MAX_IDLE_CLIENTS_PER_ENDPOINT)),
                max_attempts: config.exchange.max_attempts,
            }),
            None => ExchangeManager::new_local(
                memory_pool.clone(),
                executor.clone(),
                config.exchange.max_attempts,
                MAX_IDLE_CLIENTS_PER_ENDPOINT,
            ),
        };

        let scheduler = DriverScheduler::new(&config.scheduler, exchange.clone(), executor)?;

        info!(
            worker_threads = %config.scheduler.worker_threads,
            io_threads = %config.exchange.io_threads,
            memory_max_bytes = %config.memory.max_bytes,
            "started native execution runtime"
        );

        Ok(NativeExecutionRuntime {
            config,
            memory_pool,
            exchange,
            scheduler,
            io_pool,
            shut_down: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    pub fn exchange(&self) -> &Arc<ExchangeManager> {
        &self.exchange
    }

    pub fn scheduler(&self) -> &DriverScheduler {
        &self.scheduler
    }

    /// Create a source for the exchange node at `local`.
    ///
    /// A failing source fails the task of its fragment instance.
    pub fn create_source(
        &self,
        local: SourceAddress,
        remote_endpoint: Endpoint,
        remote_instance_id: FragmentInstanceId,
    ) -> Result<Arc<ExchangeSource>> {
        self.exchange.create_source(
            local,
            remote_endpoint,
            remote_instance_id,
            self.scheduler.failure_handler(),
        )
    }

    /// Create the sink of a fragment instance.
    ///
    /// A failing sink fails the task of its fragment instance.
    pub fn create_sink(
        &self,
        local_instance_id: FragmentInstanceId,
        remote_endpoint: Endpoint,
        remote: SourceAddress,
    ) -> Result<Arc<SinkHandle>> {
        self.exchange.create_sink(
            local_instance_id,
            remote_endpoint,
            remote,
            self.scheduler.failure_handler(),
        )
    }

    pub fn submit_drivers(
        &self,
        drivers: impl IntoIterator<Item = Arc<dyn Driver>>,
    ) -> Result<Vec<Arc<DriverTask>>> {
        self.scheduler.submit_drivers(drivers)
    }

    pub fn abort_query(&self, query_id: &QueryId) -> bool {
        self.scheduler.abort_query(query_id)
    }

    /// Stop the scheduler, aborting whatever is still running.
    pub fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock();
        if *shut_down {
            return;
        }
        *shut_down = true;

        self.scheduler.shutdown();
        info!(
            reserved_bytes = %self.memory_pool.reserved_bytes(),
            io_threads = %self.io_pool.current_num_threads(),
            "shut down native execution runtime"
        );
    }
}

impl Drop for NativeExecutionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn configure_logging(config: &ExecutionConfig) -> Result<()> {
    let format: logutil::LogFormat = config
        .log_format
        .parse()
        .map_err(|e: String| MppError::with_kind(ErrorKind::InvalidArgument, e))?;
    logutil::configure_global_logger(logutil::parse_level(&config.log_level), format);
    Ok(())
}

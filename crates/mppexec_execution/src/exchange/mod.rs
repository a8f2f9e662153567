//! Moving row batches between fragment instances.
//!
//! A sink buffers what its fragment instance produces and announces it to
//! the downstream source. The source reserves memory for announced batches
//! before pulling them, which is what keeps a slow consumer from buffering
//! unbounded amounts of data.

pub mod client;
pub mod local;
pub mod manager;
pub mod protocol;
pub mod sink;
pub mod source;

use std::sync::Arc;

use crate::memory::MemoryPool;
use crate::runtime::Executor;

use self::client::ClientManager;

/// Everything exchange handles on a node share.
#[derive(Debug, Clone)]
pub struct ExchangeResources {
    pub memory_pool: Arc<MemoryPool>,
    /// Runs network calls and reservation continuations.
    pub executor: Arc<dyn Executor>,
    pub clients: Arc<dyn ClientManager>,
    /// Attempts per remote call.
    pub max_attempts: usize,
}

use std::fmt::Debug;
use std::sync::Arc;

use hashbrown::HashMap;
use mppexec_error::{ErrorKind, MppError, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::protocol::{
    AcknowledgeRowBatchesEvent, GetRowBatchesRequest, GetRowBatchesResponse, NewBatchesEvent,
    NoMoreBatchesEvent,
};
use crate::ids::Endpoint;

/// Synchronous request/response connection to a peer node's exchange
/// service.
///
/// Errors of kind `Transport` mean the connection itself is broken, anything
/// else is an error reported by the peer.
pub trait ExchangeClient: Debug + Send {
    fn get_row_batches(&mut self, req: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse>;

    fn acknowledge_row_batches(&mut self, event: &AcknowledgeRowBatchesEvent) -> Result<()>;

    fn notify_new_batches(&mut self, event: &NewBatchesEvent) -> Result<()>;

    fn notify_no_more_batches(&mut self, event: &NoMoreBatchesEvent) -> Result<()>;
}

/// Opens new connections to peers.
pub trait ClientFactory: Debug + Sync + Send {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ExchangeClient>>;
}

/// Hands out clients for remote endpoints.
pub trait ClientManager: Debug + Sync + Send {
    /// Borrow a client for `endpoint`. The client is handed back when the
    /// returned guard is dropped.
    fn borrow(&self, endpoint: &Endpoint) -> Result<PooledClient>;
}

type IdleClients = Mutex<HashMap<Endpoint, Vec<Box<dyn ExchangeClient>>>>;

/// Client manager keeping idle connections around per endpoint.
#[derive(Debug)]
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    idle: Arc<IdleClients>,
    max_idle_per_endpoint: usize,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, max_idle_per_endpoint: usize) -> Self {
        ClientPool {
            factory,
            idle: Arc::new(Mutex::new(HashMap::new())),
            max_idle_per_endpoint,
        }
    }

    /// Number of idle clients for an endpoint.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.idle.lock().get(endpoint).map(|c| c.len()).unwrap_or(0)
    }
}

impl ClientManager for ClientPool {
    fn borrow(&self, endpoint: &Endpoint) -> Result<PooledClient> {
        let idle = self.idle.lock().get_mut(endpoint).and_then(|c| c.pop());
        let client = match idle {
            Some(client) => client,
            None => {
                trace!(%endpoint, "opening new exchange client");
                self.factory.connect(endpoint)?
            }
        };

        Ok(PooledClient {
            endpoint: endpoint.clone(),
            client: Some(client),
            pool: Some(ReturnTo {
                idle: self.idle.clone(),
                max_idle: self.max_idle_per_endpoint,
            }),
        })
    }
}

#[derive(Debug)]
struct ReturnTo {
    idle: Arc<IdleClients>,
    max_idle: usize,
}

/// A borrowed client.
///
/// Returned to its pool on drop, unless a call failed with a transport error
/// in which case the connection is dropped instead.
#[derive(Debug)]
pub struct PooledClient {
    endpoint: Endpoint,
    client: Option<Box<dyn ExchangeClient>>,
    pool: Option<ReturnTo>,
}

impl PooledClient {
    /// Wrap a client that doesn't belong to any pool.
    pub fn unpooled(endpoint: Endpoint, client: Box<dyn ExchangeClient>) -> Self {
        PooledClient {
            endpoint,
            client: Some(client),
            pool: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn get_row_batches(&mut self, req: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse> {
        self.call(|c| c.get_row_batches(req))
    }

    pub fn acknowledge_row_batches(&mut self, event: &AcknowledgeRowBatchesEvent) -> Result<()> {
        self.call(|c| c.acknowledge_row_batches(event))
    }

    pub fn notify_new_batches(&mut self, event: &NewBatchesEvent) -> Result<()> {
        self.call(|c| c.notify_new_batches(event))
    }

    pub fn notify_no_more_batches(&mut self, event: &NoMoreBatchesEvent) -> Result<()> {
        self.call(|c| c.notify_no_more_batches(event))
    }

    /// Close the underlying connection instead of returning it to the pool.
    pub fn invalidate(&mut self) {
        if self.client.take().is_some() {
            debug!(endpoint = %self.endpoint, "invalidated exchange client");
        }
    }

    fn call<T>(&mut self, f: impl FnOnce(&mut dyn ExchangeClient) -> Result<T>) -> Result<T> {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => {
                return Err(MppError::with_kind(
                    ErrorKind::Transport,
                    format!("Client for {} has been invalidated", self.endpoint),
                ))
            }
        };

        let result = f(client.as_mut());
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Transport {
                self.invalidate();
            }
        }
        result
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let (client, pool) = match (self.client.take(), self.pool.take()) {
            (Some(client), Some(pool)) => (client, pool),
            _ => return,
        };

        let mut idle = pool.idle.lock();
        let clients = idle.entry(self.endpoint.clone()).or_default();
        if clients.len() < pool.max_idle {
            clients.push(client);
        }
    }
}

/// Run `f` against a client for `endpoint`, making up to `max_attempts`
/// attempts.
///
/// Failing to borrow a client counts as a failed attempt. The returned error
/// is always of kind `Transport` and carries the last failure as its source.
pub fn call_with_retries<T>(
    clients: &dyn ClientManager,
    endpoint: &Endpoint,
    max_attempts: usize,
    op: &str,
    mut f: impl FnMut(&mut PooledClient) -> Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match clients.borrow(endpoint).and_then(|mut client| f(&mut client)) {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(%endpoint, %attempt, %e, "{op} failed");
                last_err = Some(e);
            }
        }
    }

    let msg = format!("{op} to {endpoint} failed after {max_attempts} attempts");
    Err(match last_err {
        Some(e) => MppError::with_source(msg, Box::new(e)).kind_of(ErrorKind::Transport),
        None => MppError::with_kind(ErrorKind::Transport, msg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FragmentInstanceId;
    use crate::testutil::{instance_id, MockExchangeClient, MockClientFactory, MockPeer};

    fn ack(sink: FragmentInstanceId) -> AcknowledgeRowBatchesEvent {
        AcknowledgeRowBatchesEvent {
            sink_instance_id: sink,
            start_sequence_id: 0,
            end_sequence_id: 1,
        }
    }

    #[test]
    fn returned_on_drop_and_reused() {
        let peer = MockPeer::new();
        let factory = Arc::new(MockClientFactory::new(peer.clone()));
        let pool = ClientPool::new(factory.clone(), 4);
        let endpoint = Endpoint::new("node1", 6667);

        {
            let mut client = pool.borrow(&endpoint).unwrap();
            client.acknowledge_row_batches(&ack(instance_id(1, 0))).unwrap();
        }
        assert_eq!(1, pool.idle_count(&endpoint));

        let _client = pool.borrow(&endpoint).unwrap();
        assert_eq!(0, pool.idle_count(&endpoint));
        assert_eq!(1, factory.connect_count());
    }

    #[test]
    fn transport_error_invalidates() {
        let peer = MockPeer::new();
        peer.fail_next_acks(1);
        let factory = Arc::new(MockClientFactory::new(peer.clone()));
        let pool = ClientPool::new(factory, 4);
        let endpoint = Endpoint::new("node1", 6667);

        {
            let mut client = pool.borrow(&endpoint).unwrap();
            let err = client
                .acknowledge_row_batches(&ack(instance_id(1, 0)))
                .unwrap_err();
            assert_eq!(ErrorKind::Transport, err.kind());

            // Further calls on the same guard fail without reaching the peer.
            let err = client
                .acknowledge_row_batches(&ack(instance_id(1, 0)))
                .unwrap_err();
            assert_eq!(ErrorKind::Transport, err.kind());
        }
        assert_eq!(0, pool.idle_count(&endpoint));
        assert_eq!(1, peer.ack_calls());
    }

    #[test]
    fn non_transport_error_keeps_client() {
        #[derive(Debug)]
        struct Rejecting;

        impl ExchangeClient for Rejecting {
            fn get_row_batches(&mut self, _: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse> {
                Err(MppError::new("unknown sink"))
            }
            fn acknowledge_row_batches(&mut self, _: &AcknowledgeRowBatchesEvent) -> Result<()> {
                Err(MppError::new("unknown sink"))
            }
            fn notify_new_batches(&mut self, _: &NewBatchesEvent) -> Result<()> {
                Ok(())
            }
            fn notify_no_more_batches(&mut self, _: &NoMoreBatchesEvent) -> Result<()> {
                Ok(())
            }
        }

        let mut client = PooledClient::unpooled(Endpoint::new("a", 1), Box::new(Rejecting));
        assert!(client.acknowledge_row_batches(&ack(instance_id(1, 0))).is_err());
        assert!(client.acknowledge_row_batches(&ack(instance_id(1, 0))).is_err());
        assert!(client.notify_no_more_batches(&NoMoreBatchesEvent {
            target: crate::exchange::protocol::SourceAddress {
                fragment_instance_id: instance_id(1, 1),
                plan_node_id: "exchange_1".into(),
            },
            sink_instance_id: instance_id(1, 0),
            last_sequence_id: -1,
        })
        .is_ok());
    }

    #[test]
    fn retries_until_success() {
        let peer = MockPeer::new();
        peer.fail_next_acks(2);
        let pool = ClientPool::new(Arc::new(MockClientFactory::new(peer.clone())), 4);
        let endpoint = Endpoint::new("node1", 6667);

        call_with_retries(&pool, &endpoint, 3, "ack", |c| {
            c.acknowledge_row_batches(&ack(instance_id(1, 0)))
        })
        .unwrap();
        assert_eq!(3, peer.ack_calls());
    }

    #[test]
    fn borrow_failure_counts_as_attempt() {
        let peer = MockPeer::new();
        let factory = Arc::new(MockClientFactory::new(peer.clone()));
        factory.fail_next_connects(3);
        let pool = ClientPool::new(factory.clone(), 4);
        let endpoint = Endpoint::new("node1", 6667);

        let err = call_with_retries(&pool, &endpoint, 3, "ack", |c| {
            c.acknowledge_row_batches(&ack(instance_id(1, 0)))
        })
        .unwrap_err();
        assert_eq!(ErrorKind::Transport, err.kind());
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(0, peer.ack_calls());
        assert_eq!(3, factory.connect_count());
    }

    #[test]
    fn unpooled_mock_client() {
        let peer = MockPeer::new();
        let mut client = PooledClient::unpooled(
            Endpoint::new("a", 1),
            Box::new(MockExchangeClient::new(peer.clone())),
        );
        client.acknowledge_row_batches(&ack(instance_id(2, 0))).unwrap();
        assert_eq!(1, peer.ack_calls());
    }
}

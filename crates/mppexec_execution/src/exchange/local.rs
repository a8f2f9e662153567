//! In-process exchange transport.
//!
//! Calls go straight to an [`ExchangeManager`] on the same node, so sinks and
//! sources of co-located fragment instances talk to each other without any
//! networking.

use std::sync::{Arc, Weak};

use mppexec_error::{ErrorKind, MppError, Result};

use super::client::{ClientFactory, ExchangeClient};
use super::manager::ExchangeManager;
use super::protocol::{
    AcknowledgeRowBatchesEvent, GetRowBatchesRequest, GetRowBatchesResponse, NewBatchesEvent,
    NoMoreBatchesEvent,
};
use crate::ids::Endpoint;

#[derive(Debug, Clone)]
pub struct LocalClientFactory {
    manager: Weak<ExchangeManager>,
}

impl LocalClientFactory {
    pub fn new(manager: Weak<ExchangeManager>) -> Self {
        LocalClientFactory { manager }
    }
}

impl ClientFactory for LocalClientFactory {
    fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn ExchangeClient>> {
        Ok(Box::new(LocalExchangeClient {
            manager: self.manager.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LocalExchangeClient {
    manager: Weak<ExchangeManager>,
}

impl LocalExchangeClient {
    fn manager(&self) -> Result<Arc<ExchangeManager>> {
        self.manager.upgrade().ok_or_else(|| {
            MppError::with_kind(ErrorKind::Transport, "Exchange manager has shut down")
        })
    }
}

impl ExchangeClient for LocalExchangeClient {
    fn get_row_batches(&mut self, req: &GetRowBatchesRequest) -> Result<GetRowBatchesResponse> {
        self.manager()?.get_row_batches(req)
    }

    fn acknowledge_row_batches(&mut self, event: &AcknowledgeRowBatchesEvent) -> Result<()> {
        self.manager()?.acknowledge_row_batches(event)
    }

    fn notify_new_batches(&mut self, event: &NewBatchesEvent) -> Result<()> {
        self.manager()?.notify_new_batches(event)
    }

    fn notify_no_more_batches(&mut self, event: &NoMoreBatchesEvent) -> Result<()> {
        self.manager()?.notify_no_more_batches(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::instance_id;

    #[test]
    fn dropped_manager_is_transport_error() {
        let factory = LocalClientFactory::new(Weak::new());
        let mut client = factory.connect(&Endpoint::new("localhost", 1)).unwrap();
        let err = client
            .get_row_batches(&GetRowBatchesRequest {
                sink_instance_id: instance_id(1, 0),
                start_sequence_id: 0,
                end_sequence_id: 1,
            })
            .unwrap_err();
        assert_eq!(ErrorKind::Transport, err.kind());
    }
}

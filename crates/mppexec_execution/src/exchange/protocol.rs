//! Messages exchanged between a sink and the source pulling from it.
//!
//! Sequence ids are per sink, start at zero, and are contiguous. Ranges are
//! half open, `[start, end)`.

use serde::{Deserialize, Serialize};

use crate::batch::RowBatch;
use crate::ids::{FragmentInstanceId, PlanNodeId};

pub type SequenceId = i32;

/// Where a message for a source should be routed on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceAddress {
    /// Fragment instance owning the source.
    pub fragment_instance_id: FragmentInstanceId,
    /// Exchange node in that fragment instance.
    pub plan_node_id: PlanNodeId,
}

/// Source -> sink. Fetch batches `[start, end)`.
///
/// Safe to retry, the sink keeps batches until they're acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRowBatchesRequest {
    /// Fragment instance owning the sink.
    pub sink_instance_id: FragmentInstanceId,
    pub start_sequence_id: SequenceId,
    pub end_sequence_id: SequenceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRowBatchesResponse {
    pub batches: Vec<RowBatch>,
}

/// Source -> sink. Batches `[start, end)` have been stored by the source and
/// may be released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeRowBatchesEvent {
    pub sink_instance_id: FragmentInstanceId,
    pub start_sequence_id: SequenceId,
    pub end_sequence_id: SequenceId,
}

/// Sink -> source. Batches starting at `start_sequence_id` are available
/// with the given sizes in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatchesEvent {
    pub target: SourceAddress,
    pub sink_instance_id: FragmentInstanceId,
    pub start_sequence_id: SequenceId,
    pub batch_sizes: Vec<u64>,
}

/// Sink -> source. The sink won't produce anything past `last_sequence_id`.
///
/// `last_sequence_id` is inclusive, and -1 for a sink that never produced
/// anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoMoreBatchesEvent {
    pub target: SourceAddress,
    pub sink_instance_id: FragmentInstanceId,
    pub last_sequence_id: SequenceId,
}

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a distributed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new_random() -> Self {
        QueryId(Uuid::new_v4())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one node-local execution of a fragment of a query plan.
///
/// This is also the identity of the driver task wrapping that execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentInstanceId {
    pub query_id: QueryId,
    /// Fragment within the query plan.
    pub fragment_id: u32,
    /// Instance of the fragment. Unique within the fragment.
    pub instance_id: u32,
}

impl FragmentInstanceId {
    pub fn new(query_id: QueryId, fragment_id: u32, instance_id: u32) -> Self {
        FragmentInstanceId {
            query_id,
            fragment_id,
            instance_id,
        }
    }
}

impl fmt::Display for FragmentInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.query_id, self.fragment_id, self.instance_id)
    }
}

/// Plan node within a fragment that owns an exchange source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PlanNodeId {
    fn from(value: &str) -> Self {
        PlanNodeId(value.to_string())
    }
}

/// Network address of a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

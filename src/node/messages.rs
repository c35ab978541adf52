//! Storage node command and reply message types.

use std::fmt;
use std::str::FromStr;

use crate::utils::SplitfsError;

use serde::{Deserialize, Serialize};

/// Address of a storage node as it announced itself. Hostnames are kept
/// as-is and resolved only when connecting.
#[derive(
    Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Serialize, Deserialize,
)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl ToString, port: u16) -> Self {
        NodeAddr {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = SplitfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            SplitfsError::MalformedCommand(format!("bad address '{}'", s))
        })?;
        if host.is_empty() {
            return Err(SplitfsError::MalformedCommand(format!(
                "empty host in address '{}'",
                s
            )));
        }
        let port = port.parse::<u16>().map_err(|e| {
            SplitfsError::MalformedCommand(format!(
                "bad port in '{}': {}",
                s, e
            ))
        })?;
        Ok(NodeAddr::new(host, port))
    }
}

/// Command sent to a storage node, one per connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Coordinator -> primary: store a partition, then forward one replica
    /// to a randomly chosen peer among `peers` (none if empty).
    Partition {
        file: String,
        index: usize,
        peers: Vec<NodeAddr>,
        content: String,
    },

    /// Primary -> peer: store a replica. Never replicated further and never
    /// replied to.
    RepliedPartition {
        file: String,
        index: usize,
        content: String,
    },

    /// Coordinator -> node: read a stored partition back.
    GetPartition { file: String, index: usize },

    /// Coordinator -> node: drop every partition of a file held locally.
    DeletePartition { file: String },
}

/// Reply from a storage node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum NodeReply {
    /// Partition stored locally on `node`.
    Ack {
        node: NodeAddr,
        file: String,
        index: usize,
    },

    /// Replica of the partition forwarded to `peer`.
    ReplicatedAck {
        peer: NodeAddr,
        file: String,
        index: usize,
    },

    /// Content of a requested partition.
    PartitionData { content: String },

    /// Delete request processed.
    DeleteAck,

    /// Request could not be served.
    Error { msg: String },
}

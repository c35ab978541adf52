//! Partition planner: balanced line-range layout over registered nodes.

use std::ops::Range;

use crate::master::Registration;
use crate::node::NodeAddr;
use crate::utils::SplitfsError;

/// Where one partition of an upload goes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PartitionPlan {
    /// Partition index, also the index of the primary in registration order.
    pub index: usize,

    /// Range of upload lines carried by this partition.
    pub lines: Range<usize>,

    /// Node storing the primary copy.
    pub primary: NodeAddr,

    /// Replication candidates handed to the primary: every other registered
    /// node, deduplicated, in registration order.
    pub peers: Vec<NodeAddr>,
}

/// Sizes of `num_nodes` partitions covering `num_lines` lines: the first
/// `num_lines % num_nodes` partitions get one extra line.
pub fn partition_sizes(
    num_lines: usize,
    num_nodes: usize,
) -> Result<Vec<usize>, SplitfsError> {
    if num_nodes == 0 {
        return Err(SplitfsError::NoActiveNodes);
    }
    let base = num_lines / num_nodes;
    let extra = num_lines % num_nodes;
    Ok((0..num_nodes)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect())
}

/// Lays out `num_lines` lines over the given nodes, partition `i` going to
/// node `i`.
pub fn plan_partitions(
    num_lines: usize,
    nodes: &[Registration],
) -> Result<Vec<PartitionPlan>, SplitfsError> {
    let sizes = partition_sizes(num_lines, nodes.len())?;

    let mut plans = Vec::with_capacity(nodes.len());
    let mut start = 0;
    for (index, (size, node)) in sizes.into_iter().zip(nodes).enumerate() {
        let mut peers: Vec<NodeAddr> = Vec::new();
        for other in nodes {
            if other.addr != node.addr && !peers.contains(&other.addr) {
                peers.push(other.addr.clone());
            }
        }

        plans.push(PartitionPlan {
            index,
            lines: start..start + size,
            primary: node.addr.clone(),
            peers,
        });
        start += size;
    }
    debug_assert_eq!(start, num_lines);

    Ok(plans)
}

/// Partition content as stored on nodes: every line followed by '\n', so
/// that reassembly is plain concatenation.
pub fn partition_content(lines: &[String]) -> String {
    let mut content =
        String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    content
}

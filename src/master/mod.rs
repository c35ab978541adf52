//! Splitfs master: node registry, partition planning, metadata persistence
//! and the client-facing coordinator.

mod coordinator;
mod discovery;
mod keeper;
mod masternode;
mod metadata;
mod planner;
mod reactor;
mod registry;

pub use coordinator::{Coordinator, UploadSummary};
pub use keeper::{MetaAction, MetaHub, MetaResult};
pub use masternode::{MasterConfig, MasterNode};
pub use metadata::{FileRecord, MetadataStore, Placement, UploadId};
pub use planner::{
    partition_content, partition_sizes, plan_partitions, PartitionPlan,
};
pub use reactor::{ApiReply, ApiRequest, ClientId};
pub use registry::{NodeRegistry, Registration, REGISTER_PREFIX};

pub(crate) use discovery::spawn_discovery_listener;
pub(crate) use reactor::ClientReactor;

//! Public interface to the Splitfs core library, linked by the master,
//! storage node and client executables.

#[macro_use]
mod utils;

mod client;
mod master;
mod node;

pub use utils::{
    config_text, logger_init, me_prefix, set_me, SplitfsError, ME,
};

pub use master::{
    partition_content, partition_sizes, plan_partitions, ApiReply,
    ApiRequest, ClientId, Coordinator, FileRecord, MasterConfig, MasterNode,
    MetaAction, MetaHub, MetaResult, MetadataStore, NodeRegistry,
    PartitionPlan, Placement, Registration, UploadId, UploadSummary,
    REGISTER_PREFIX,
};

pub use node::{
    validate_file_name, BlobStore, NodeAddr, NodeConfig, NodeReply,
    NodeRequest, StorageNode,
};

pub use client::{ClientApiStub, PutReceipt};

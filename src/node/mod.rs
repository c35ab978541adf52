//! Storage node: local partition blobs plus the command server in front of
//! them.

mod announce;
mod blobs;
mod handler;
mod messages;
mod storage;
mod stub;

pub use blobs::{validate_file_name, BlobStore};
pub use messages::{NodeAddr, NodeReply, NodeRequest};
pub use storage::{NodeConfig, StorageNode};

pub(crate) use announce::announce;
pub(crate) use handler::CommandHandler;
pub(crate) use stub::NodeStub;

//! Master shared-state keeper module: a single task owns the node registry
//! and the metadata store; everyone else submits actions to it.

use std::path::Path;

use crate::master::{
    FileRecord, MetadataStore, NodeRegistry, Placement, Registration, UploadId,
};
use crate::utils::SplitfsError;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Action submitted to the keeper.
#[derive(Debug)]
pub enum MetaAction {
    /// Append a storage node to the registry.
    Register(Registration),

    /// Snapshot the registry.
    Nodes,

    /// Start an upload: allocate a generation and snapshot the registry.
    BeginUpload,

    /// Record a confirmed partition placement.
    AddPlacement {
        file: String,
        upload: UploadId,
        partitions: usize,
        placement: Placement,
    },

    /// Look up one file's record.
    Lookup { file: String },

    /// List all file records.
    List,

    /// Drop one file's record.
    Remove { file: String },
}

/// Result returned by the keeper.
#[derive(Debug, PartialEq, Eq)]
pub enum MetaResult {
    Register { population: usize },
    Nodes { nodes: Vec<Registration> },
    BeginUpload {
        upload: UploadId,
        nodes: Vec<Registration>,
    },
    AddPlacement { added: bool },
    Lookup { record: Option<FileRecord> },
    List { files: Vec<(String, FileRecord)> },
    Remove { record: Option<FileRecord> },
}

type ActionTicket = (
    MetaAction,
    oneshot::Sender<Result<MetaResult, SplitfsError>>,
);

/// Cloneable handle to the keeper task.
#[derive(Clone)]
pub struct MetaHub {
    /// Sender side of the action channel.
    tx_action: mpsc::UnboundedSender<ActionTicket>,
}

// MetaHub public API implementation
impl MetaHub {
    /// Loads the metadata store from `path` and spawns the keeper task
    /// owning it together with an empty registry.
    pub async fn new_and_setup(
        path: &Path,
    ) -> Result<(Self, JoinHandle<()>), SplitfsError> {
        let store = MetadataStore::load(path).await?;
        let (tx_action, rx_action) = mpsc::unbounded_channel();

        let keeper_handle = tokio::spawn(Self::keeper_task(
            NodeRegistry::new(),
            store,
            rx_action,
        ));

        Ok((MetaHub { tx_action }, keeper_handle))
    }

    /// Submits an action and waits for its result.
    pub async fn do_action(
        &self,
        action: MetaAction,
    ) -> Result<MetaResult, SplitfsError> {
        let (tx_result, rx_result) = oneshot::channel();
        self.tx_action
            .send((action, tx_result))
            .map_err(|_| SplitfsError::msg("keeper task has exited"))?;
        rx_result.await?
    }

    pub async fn register(
        &self,
        reg: Registration,
    ) -> Result<usize, SplitfsError> {
        match self.do_action(MetaAction::Register(reg)).await? {
            MetaResult::Register { population } => Ok(population),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn nodes(&self) -> Result<Vec<Registration>, SplitfsError> {
        match self.do_action(MetaAction::Nodes).await? {
            MetaResult::Nodes { nodes } => Ok(nodes),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn begin_upload(
        &self,
    ) -> Result<(UploadId, Vec<Registration>), SplitfsError> {
        match self.do_action(MetaAction::BeginUpload).await? {
            MetaResult::BeginUpload { upload, nodes } => Ok((upload, nodes)),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn add_placement(
        &self,
        file: &str,
        upload: UploadId,
        partitions: usize,
        placement: Placement,
    ) -> Result<bool, SplitfsError> {
        match self
            .do_action(MetaAction::AddPlacement {
                file: file.into(),
                upload,
                partitions,
                placement,
            })
            .await?
        {
            MetaResult::AddPlacement { added } => Ok(added),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn lookup(
        &self,
        file: &str,
    ) -> Result<Option<FileRecord>, SplitfsError> {
        match self
            .do_action(MetaAction::Lookup { file: file.into() })
            .await?
        {
            MetaResult::Lookup { record } => Ok(record),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn list(
        &self,
    ) -> Result<Vec<(String, FileRecord)>, SplitfsError> {
        match self.do_action(MetaAction::List).await? {
            MetaResult::List { files } => Ok(files),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }

    pub async fn remove(
        &self,
        file: &str,
    ) -> Result<Option<FileRecord>, SplitfsError> {
        match self
            .do_action(MetaAction::Remove { file: file.into() })
            .await?
        {
            MetaResult::Remove { record } => Ok(record),
            res => logged_err!("unexpected keeper result {:?}", res),
        }
    }
}

// MetaHub keeper task implementation
impl MetaHub {
    /// Carries out one action against the owned state.
    async fn do_keeper_action(
        registry: &mut NodeRegistry,
        store: &mut MetadataStore,
        next_upload: &mut UploadId,
        action: MetaAction,
    ) -> Result<MetaResult, SplitfsError> {
        match action {
            MetaAction::Register(reg) => {
                let addr = reg.addr.clone();
                let population = registry.register(reg);
                pf_info!(
                    "registered node {} (population {})",
                    addr,
                    population
                );
                Ok(MetaResult::Register { population })
            }

            MetaAction::Nodes => Ok(MetaResult::Nodes {
                nodes: registry.snapshot(),
            }),

            MetaAction::BeginUpload => {
                let upload = *next_upload;
                *next_upload += 1;
                Ok(MetaResult::BeginUpload {
                    upload,
                    nodes: registry.snapshot(),
                })
            }

            MetaAction::AddPlacement {
                file,
                upload,
                partitions,
                placement,
            } => {
                let added = store
                    .add_placement(&file, upload, partitions, placement)
                    .await?;
                Ok(MetaResult::AddPlacement { added })
            }

            MetaAction::Lookup { file } => Ok(MetaResult::Lookup {
                record: store.get(&file).cloned(),
            }),

            MetaAction::List => Ok(MetaResult::List {
                files: store
                    .iter()
                    .map(|(file, record)| (file.clone(), record.clone()))
                    .collect(),
            }),

            MetaAction::Remove { file } => Ok(MetaResult::Remove {
                record: store.remove(&file).await?,
            }),
        }
    }

    /// Keeper task function. Serves actions one at a time until every
    /// handle has been dropped.
    async fn keeper_task(
        mut registry: NodeRegistry,
        mut store: MetadataStore,
        mut rx_action: mpsc::UnboundedReceiver<ActionTicket>,
    ) {
        pf_debug!("keeper task spawned");

        let mut next_upload: UploadId = 1;
        while let Some((action, tx_result)) = rx_action.recv().await {
            let result = Self::do_keeper_action(
                &mut registry,
                &mut store,
                &mut next_upload,
                action,
            )
            .await;
            if let Err(ref e) = result {
                pf_error!("keeper action failed: {}", e);
            }
            // caller may have given up waiting; nothing to do then
            let _ = tx_result.send(result);
        }

        pf_debug!("keeper task exited");
    }
}

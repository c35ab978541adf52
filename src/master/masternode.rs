//! Splitfs master process implementation.

use std::net::SocketAddr;
use std::path::Path;

use crate::master::{
    spawn_discovery_listener, ClientReactor, Coordinator, MetaHub,
};
use crate::utils::SplitfsError;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Path of the metadata persistence file.
    pub metadata_path: String,

    /// Deadline of every RPC towards storage nodes in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            metadata_path: "./register/master_data.dat".into(),
            rpc_timeout_ms: 5000,
        }
    }
}

/// Standalone master: accepts client connections on its TCP port and node
/// registrations on the UDP port of the same number.
pub struct MasterNode {
    /// Configuration parameters struct.
    _config: MasterConfig,

    /// Coordinator shared by all client responders.
    coordinator: Coordinator,

    /// Join handle of the keeper task.
    keeper_handle: JoinHandle<()>,

    /// Join handle of the discovery listener task.
    discovery_handle: JoinHandle<()>,

    /// ClientReactor module.
    _client_reactor: ClientReactor,
}

impl MasterNode {
    /// Creates a new master and sets up required functionality modules.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, SplitfsError> {
        let config = parsed_config!(config_str => MasterConfig;
                                    metadata_path, rpc_timeout_ms)?;
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }
        if config.metadata_path.is_empty() {
            return logged_err!("empty config.metadata_path");
        }

        let (meta, keeper_handle) =
            MetaHub::new_and_setup(Path::new(&config.metadata_path)).await?;
        let discovery_handle =
            spawn_discovery_listener(bind_addr, meta.clone()).await?;

        let coordinator = Coordinator::new(
            meta,
            Duration::from_millis(config.rpc_timeout_ms),
        );
        let client_reactor =
            ClientReactor::new_and_setup(bind_addr, coordinator.clone())
                .await?;

        Ok(MasterNode {
            _config: config,
            coordinator,
            keeper_handle,
            discovery_handle,
            _client_reactor: client_reactor,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Main event loop logic of the master. Breaks out of the loop only upon
    /// catching termination signals to the process.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), SplitfsError> {
        tokio::select! {
            // discovery listener never returns on its own
            res = &mut self.discovery_handle => {
                return logged_err!("discovery task exited: {:?}", res);
            }

            // receiving termination signal
            _ = rx_term.changed() => {
                pf_warn!("master caught termination signal");
            }
        }

        self.discovery_handle.abort();
        self.keeper_handle.abort();
        Ok(())
    }
}

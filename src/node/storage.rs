//! Storage node ("slave") server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::Registration;
use crate::node::{announce, BlobStore, CommandHandler, NodeAddr};
use crate::utils::{tcp_bind_with_retry, FramedConn, SplitfsError};

use serde::{Deserialize, Serialize};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host announced to the master and echoed in acknowledgments.
    pub advertise_host: String,

    /// Directory holding partition blobs.
    pub local_root: String,

    /// Where the registration datagram is sent; the broadcast address by
    /// default.
    pub discovery_addr: String,

    /// Deadline of replica forwarding RPCs in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            advertise_host: "127.0.0.1".into(),
            local_root: "./storage".into(),
            discovery_addr: "255.255.255.255".into(),
            rpc_timeout_ms: 5000,
        }
    }
}

/// Standalone storage node.
pub struct StorageNode {
    /// My announced address.
    me: NodeAddr,

    /// Configuration parameters struct.
    config: NodeConfig,

    /// Listener for commands from the master and from peers.
    listener: TcpListener,

    /// Per-connection command handler, cloned into every connection task.
    handler: CommandHandler,
}

impl StorageNode {
    /// Binds the command listener on `bind_addr`, then announces this node
    /// to the master listening on `master_port`.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        master_port: u16,
        config_str: Option<&str>,
    ) -> Result<Self, SplitfsError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    advertise_host, local_root,
                                    discovery_addr, rpc_timeout_ms)?;
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }
        if config.local_root.is_empty() {
            return logged_err!("empty config.local_root");
        }

        let me = NodeAddr::new(&config.advertise_host, bind_addr.port());
        let blobs = Arc::new(BlobStore::new(&config.local_root));
        let handler = CommandHandler::new(
            me.clone(),
            blobs,
            Duration::from_millis(config.rpc_timeout_ms),
        );

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!(
            "serving commands on '{}', blobs under '{}'",
            bind_addr,
            config.local_root
        );

        let reg = Registration {
            addr: me.clone(),
            local_root: config.local_root.clone(),
            master_port,
        };
        announce(&reg, &config.discovery_addr).await?;

        Ok(StorageNode {
            me,
            config,
            listener,
            handler,
        })
    }

    /// My announced address.
    pub fn addr(&self) -> &NodeAddr {
        &self.me
    }

    /// Main event loop: one handler task per accepted connection. Breaks out
    /// of the loop only upon catching termination signals.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), SplitfsError> {
        loop {
            tokio::select! {
                // new command connection
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let conn = match FramedConn::new(stream) {
                            Ok(conn) => conn,
                            Err(e) => {
                                pf_warn!("error setting up {}: {}", peer, e);
                                return;
                            }
                        };
                        if let Err(e) = handler.handle_conn(conn).await {
                            pf_error!("error handling command <- {}: {}",
                                      peer, e);
                        }
                    });
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("node {} caught termination signal", self.me);
                    break;
                }
            }
        }

        pf_debug!("node under '{}' stopped", self.config.local_root);
        Ok(())
    }
}

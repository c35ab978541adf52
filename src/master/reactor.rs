//! Master client-facing reactor module implementation.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::master::Coordinator;
use crate::utils::{tcp_bind_with_retry, FramedConn, SplitfsError};

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Client ID type, assigned per accepted connection.
pub type ClientId = u64;

/// Request from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Start uploading a file under the given name.
    Put { file: String },

    /// Next batch of lines of the ongoing upload.
    PutLines { lines: Vec<String> },

    /// End of the ongoing upload's content.
    PutEnd,

    /// Fetch a whole file back.
    Get { file: String },

    /// List all stored files.
    Ls,

    /// Remove a file.
    Rm { file: String },
}

/// Reply to a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Upload finished.
    Uploaded {
        file: String,
        /// Number of partitions the file was split into.
        partitions: usize,
        /// Number of confirmed copies, replicas included.
        placements: usize,
    },

    /// Fetch succeeded; `Content` frames follow, then `Eof`.
    Success,

    /// Reassembled file content.
    Content { text: String },

    /// End of fetched content.
    Eof,

    /// Listing block of one file.
    Listing { text: String },

    /// End of a listing.
    EndOfResponse,

    /// File removed.
    Removed { file: String },

    /// Request failed.
    Error { msg: String },
}

/// The client-facing reactor module. Every client connection is served by
/// its own responder task calling into the shared coordinator.
pub(crate) struct ClientReactor {
    /// Join handle of the client acceptor task.
    client_acceptor_handle: JoinHandle<()>,
}

// ClientReactor public API implementation
impl ClientReactor {
    /// Binds the client-facing listener and spawns the client acceptor task.
    pub(crate) async fn new_and_setup(
        api_addr: SocketAddr,
        coordinator: Coordinator,
    ) -> Result<Self, SplitfsError> {
        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let mut acceptor =
            ClientReactorAcceptorTask::new(client_listener, coordinator);
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ClientReactor {
            client_acceptor_handle,
        })
    }
}

impl Drop for ClientReactor {
    fn drop(&mut self) {
        self.client_acceptor_handle.abort();
    }
}

/// ClientReactor client acceptor task.
struct ClientReactorAcceptorTask {
    client_listener: TcpListener,
    coordinator: Coordinator,

    client_responder_handles: HashMap<ClientId, JoinHandle<()>>,
    next_client_id: ClientId,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientReactorAcceptorTask {
    /// Creates the client acceptor task.
    fn new(client_listener: TcpListener, coordinator: Coordinator) -> Self {
        // create an exit mpsc channel for getting notified about termination
        // of client responder tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ClientReactorAcceptorTask {
            client_listener,
            coordinator,
            client_responder_handles: HashMap::new(),
            next_client_id: 0,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection.
    fn accept_new_client(
        &mut self,
        stream: TcpStream,
        id: ClientId,
    ) -> Result<(), SplitfsError> {
        let conn = FramedConn::new(stream)?;
        pf_debug!("accepted new client {} from {}", id, conn.peer());

        let mut responder = ClientReactorResponderTask {
            id,
            conn,
            coordinator: self.coordinator.clone(),
            tx_exit: self.tx_exit.clone(),
        };
        let client_responder_handle =
            tokio::spawn(async move { responder.run().await });
        self.client_responder_handles
            .insert(id, client_responder_handle);
        Ok(())
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!("client_acceptor task spawned");

        match self.client_listener.local_addr() {
            Ok(local_addr) => {
                pf_info!("accepting clients on '{}'", local_addr)
            }
            Err(e) => pf_warn!("client listener has no local addr: {}", e),
        }

        loop {
            tokio::select! {
                // new client connection
                accepted = self.client_listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            pf_warn!("error accepting client connection: {}",
                                     e);
                            continue;
                        }
                    };
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    if let Err(e) = self.accept_new_client(stream, id) {
                        pf_error!("error accepting new client: {}", e);
                    }
                },

                // a client responder task exits
                Some(id) = self.rx_exit.recv() => {
                    if self.client_responder_handles.remove(&id).is_none() {
                        pf_error!("client {} not found among active ones", id);
                    }
                },
            }
        }
    }
}

/// ClientReactor per-client responder task.
struct ClientReactorResponderTask {
    id: ClientId,
    conn: FramedConn,
    coordinator: Coordinator,
    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientReactorResponderTask {
    /// Serves one upload: collects lines until `PutEnd`, then hands them to
    /// the coordinator.
    async fn serve_put(&mut self, file: String) -> Result<(), SplitfsError> {
        let mut lines = Vec::new();
        loop {
            match self.conn.recv::<ApiRequest>().await? {
                ApiRequest::PutLines { lines: batch } => lines.extend(batch),
                ApiRequest::PutEnd => break,
                req => {
                    return Err(SplitfsError::MalformedCommand(format!(
                        "unexpected {:?} amid upload of '{}'",
                        req, file
                    )));
                }
            }
        }

        let reply = match self.coordinator.put(&file, &lines).await {
            Ok(summary) => ApiReply::Uploaded {
                file: summary.file,
                partitions: summary.partitions,
                placements: summary.placements,
            },
            Err(e) => {
                pf_error!("upload of '{}' failed: {}", file, e);
                ApiReply::Error { msg: e.to_string() }
            }
        };
        self.conn.send(&reply).await
    }

    async fn serve_get(&mut self, file: String) -> Result<(), SplitfsError> {
        match self.coordinator.get(&file).await {
            Ok(text) => {
                self.conn.send(&ApiReply::Success).await?;
                self.conn.send(&ApiReply::Content { text }).await?;
                self.conn.send(&ApiReply::Eof).await
            }
            Err(e) => {
                self.conn.send(&ApiReply::Error { msg: e.to_string() }).await
            }
        }
    }

    async fn serve_ls(&mut self) -> Result<(), SplitfsError> {
        match self.coordinator.ls().await {
            Ok(blocks) => {
                for text in blocks {
                    self.conn.send(&ApiReply::Listing { text }).await?;
                }
                self.conn.send(&ApiReply::EndOfResponse).await
            }
            Err(e) => {
                self.conn.send(&ApiReply::Error { msg: e.to_string() }).await
            }
        }
    }

    async fn serve_rm(&mut self, file: String) -> Result<(), SplitfsError> {
        let reply = match self.coordinator.rm(&file).await {
            Ok(()) => ApiReply::Removed { file },
            Err(e) => ApiReply::Error { msg: e.to_string() },
        };
        self.conn.send(&reply).await
    }

    /// Serves one request.
    async fn serve_req(&mut self, req: ApiRequest) -> Result<(), SplitfsError> {
        pf_trace!("client {} request {:?}", self.id, req);
        match req {
            ApiRequest::Put { file } => self.serve_put(file).await,
            ApiRequest::Get { file } => self.serve_get(file).await,
            ApiRequest::Ls => self.serve_ls().await,
            ApiRequest::Rm { file } => self.serve_rm(file).await,
            req => {
                let msg = format!("unexpected {:?} outside an upload", req);
                self.conn.send(&ApiReply::Error { msg: msg.clone() }).await?;
                Err(SplitfsError::MalformedCommand(msg))
            }
        }
    }

    /// Starts a per-client responder task loop, serving requests until the
    /// client disconnects.
    async fn run(&mut self) {
        pf_debug!("client_responder task for {} spawned", self.id);

        loop {
            let req = match self.conn.recv::<ApiRequest>().await {
                Ok(req) => req,
                Err(e) => {
                    pf_debug!("client {} disconnected: {}", self.id, e);
                    break;
                }
            };
            if let Err(e) = self.serve_req(req).await {
                pf_error!("error serving client {}: {}", self.id, e);
                break;
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!("error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!("client_responder task for {} exited", self.id);
    }
}

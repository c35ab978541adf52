//! Storage node per-connection command handler.

use std::sync::Arc;

use crate::node::{BlobStore, NodeAddr, NodeReply, NodeRequest, NodeStub};
use crate::utils::{FramedConn, SplitfsError};

use rand::seq::SliceRandom;

use tokio::time::Duration;

/// Serves exactly one command per accepted connection.
#[derive(Clone)]
pub(crate) struct CommandHandler {
    /// My announced address, echoed in store acknowledgments.
    me: NodeAddr,

    /// Local partition blobs.
    blobs: Arc<BlobStore>,

    /// Deadline of replica forwarding RPCs.
    rpc_timeout: Duration,
}

impl CommandHandler {
    pub(crate) fn new(
        me: NodeAddr,
        blobs: Arc<BlobStore>,
        rpc_timeout: Duration,
    ) -> Self {
        CommandHandler {
            me,
            blobs,
            rpc_timeout,
        }
    }

    /// Reads one command off the connection and dispatches it.
    pub(crate) async fn handle_conn(
        &self,
        mut conn: FramedConn,
    ) -> Result<(), SplitfsError> {
        let req: NodeRequest = conn.recv().await.map_err(|e| {
            SplitfsError::MalformedCommand(format!(
                "unreadable command from {}: {}",
                conn.peer(),
                e
            ))
        })?;

        match req {
            NodeRequest::Partition {
                file,
                index,
                peers,
                content,
            } => {
                self.handle_partition(&mut conn, file, index, peers, content)
                    .await
            }

            NodeRequest::RepliedPartition {
                file,
                index,
                content,
            } => {
                self.blobs.store(&file, index, &content).await?;
                pf_info!("stored replica of '{}' partition {}", file, index);
                Ok(())
            }

            NodeRequest::GetPartition { file, index } => {
                let reply = match self.blobs.fetch(&file, index).await {
                    Ok(Some(content)) => NodeReply::PartitionData { content },
                    Ok(None) => NodeReply::Error {
                        msg: format!(
                            "partition {} of '{}' not found",
                            index, file
                        ),
                    },
                    Err(e) => NodeReply::Error { msg: e.to_string() },
                };
                conn.send(&reply).await
            }

            NodeRequest::DeletePartition { file } => {
                // best-effort: missing blobs are not an error
                match self.blobs.delete_file(&file).await {
                    Ok(n) => {
                        pf_info!("deleted {} partition(s) of '{}'", n, file)
                    }
                    Err(e) => {
                        pf_warn!(
                            "error deleting partitions of '{}': {}",
                            file,
                            e
                        )
                    }
                }
                conn.send(&NodeReply::DeleteAck).await
            }
        }
    }

    /// Stores a primary partition, acknowledges it, then forwards one
    /// replica to a random peer and reports where it went.
    async fn handle_partition(
        &self,
        conn: &mut FramedConn,
        file: String,
        index: usize,
        peers: Vec<NodeAddr>,
        content: String,
    ) -> Result<(), SplitfsError> {
        if let Err(e) = self.blobs.store(&file, index, &content).await {
            conn.send(&NodeReply::Error { msg: e.to_string() }).await?;
            return Err(e);
        }
        pf_info!("stored '{}' partition {}", file, index);
        conn.send(&NodeReply::Ack {
            node: self.me.clone(),
            file: file.clone(),
            index,
        })
        .await?;

        let Some(peer) = peers.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(());
        };
        let replica = NodeRequest::RepliedPartition {
            file: file.clone(),
            index,
            content,
        };
        if let Err(e) = self.forward_replica(&peer, &replica).await {
            // no retry; the attempted peer is still reported
            pf_warn!(
                "forwarding replica of '{}' partition {} -> {} failed: {}",
                file,
                index,
                peer,
                e
            );
        } else {
            pf_debug!("forwarded '{}' partition {} -> {}", file, index, peer);
        }

        conn.send(&NodeReply::ReplicatedAck { peer, file, index })
            .await
    }

    async fn forward_replica(
        &self,
        peer: &NodeAddr,
        replica: &NodeRequest,
    ) -> Result<(), SplitfsError> {
        let mut stub = NodeStub::connect(peer, self.rpc_timeout).await?;
        stub.send(replica).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tcp_bind_with_retry;
    use tokio::fs;

    async fn spawn_handler(
        port: u16,
        root: &str,
    ) -> Result<Arc<BlobStore>, SplitfsError> {
        if fs::try_exists(root).await? {
            fs::remove_dir_all(root).await?;
        }
        let blobs = Arc::new(BlobStore::new(root));
        let handler = CommandHandler::new(
            NodeAddr::new("127.0.0.1", port),
            blobs.clone(),
            Duration::from_millis(500),
        );
        let listener =
            tcp_bind_with_retry(format!("127.0.0.1:{}", port).parse()?, 3)
                .await?;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(conn) = FramedConn::new(stream) {
                        let _ = handler.handle_conn(conn).await;
                    }
                });
            }
        });
        Ok(blobs)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_without_peers() -> Result<(), SplitfsError> {
        let blobs = spawn_handler(31820, "/tmp/splitfs-test-handler-0").await?;
        let addr = NodeAddr::new("127.0.0.1", 31820);
        let mut stub = NodeStub::connect(&addr, Duration::from_secs(2)).await?;
        let reply = stub
            .call(&NodeRequest::Partition {
                file: "f.txt".into(),
                index: 2,
                peers: vec![],
                content: "x\ny\n".into(),
            })
            .await?;
        assert_eq!(
            reply,
            NodeReply::Ack {
                node: addr.clone(),
                file: "f.txt".into(),
                index: 2
            }
        );
        // no second report when nobody to replicate to
        assert!(stub.recv().await.is_err());
        assert_eq!(blobs.fetch("f.txt", 2).await?, Some("x\ny\n".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_with_replica() -> Result<(), SplitfsError> {
        let primary_blobs =
            spawn_handler(31821, "/tmp/splitfs-test-handler-1").await?;
        let peer_blobs =
            spawn_handler(31822, "/tmp/splitfs-test-handler-2").await?;
        let primary = NodeAddr::new("127.0.0.1", 31821);
        let peer = NodeAddr::new("127.0.0.1", 31822);

        let mut stub =
            NodeStub::connect(&primary, Duration::from_secs(2)).await?;
        let ack = stub
            .call(&NodeRequest::Partition {
                file: "f.txt".into(),
                index: 0,
                peers: vec![peer.clone()],
                content: "hello\n".into(),
            })
            .await?;
        assert!(matches!(ack, NodeReply::Ack { index: 0, .. }));
        assert_eq!(
            stub.recv().await?,
            NodeReply::ReplicatedAck {
                peer: peer.clone(),
                file: "f.txt".into(),
                index: 0
            }
        );
        assert_eq!(
            primary_blobs.fetch("f.txt", 0).await?,
            Some("hello\n".into())
        );

        // replica lands asynchronously on the peer
        let mut replica = None;
        for _ in 0..50 {
            replica = peer_blobs.fetch("f.txt", 0).await?;
            if replica.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(replica, Some("hello\n".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_peer_still_reported() -> Result<(), SplitfsError> {
        spawn_handler(31823, "/tmp/splitfs-test-handler-3").await?;
        let primary = NodeAddr::new("127.0.0.1", 31823);
        let dead_peer = NodeAddr::new("127.0.0.1", 31829);

        let mut stub =
            NodeStub::connect(&primary, Duration::from_secs(2)).await?;
        stub.call(&NodeRequest::Partition {
            file: "f.txt".into(),
            index: 1,
            peers: vec![dead_peer.clone()],
            content: "z\n".into(),
        })
        .await?;
        assert_eq!(
            stub.recv().await?,
            NodeReply::ReplicatedAck {
                peer: dead_peer,
                file: "f.txt".into(),
                index: 1
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_and_delete() -> Result<(), SplitfsError> {
        let blobs = spawn_handler(31824, "/tmp/splitfs-test-handler-4").await?;
        blobs.store("g.txt", 0, "a\n").await?;
        blobs.store("g.txt", 1, "b\n").await?;
        let addr = NodeAddr::new("127.0.0.1", 31824);
        let timeout = Duration::from_secs(2);

        let mut stub = NodeStub::connect(&addr, timeout).await?;
        assert_eq!(
            stub.call(&NodeRequest::GetPartition {
                file: "g.txt".into(),
                index: 1
            })
            .await?,
            NodeReply::PartitionData {
                content: "b\n".into()
            }
        );

        let mut stub = NodeStub::connect(&addr, timeout).await?;
        assert!(matches!(
            stub.call(&NodeRequest::GetPartition {
                file: "g.txt".into(),
                index: 7
            })
            .await?,
            NodeReply::Error { .. }
        ));

        let mut stub = NodeStub::connect(&addr, timeout).await?;
        assert_eq!(
            stub.call(&NodeRequest::DeletePartition {
                file: "g.txt".into()
            })
            .await?,
            NodeReply::DeleteAck
        );
        assert_eq!(blobs.fetch("g.txt", 0).await?, None);
        assert_eq!(blobs.fetch("g.txt", 1).await?, None);

        // deleting again is still acknowledged
        let mut stub = NodeStub::connect(&addr, timeout).await?;
        assert_eq!(
            stub.call(&NodeRequest::DeletePartition {
                file: "g.txt".into()
            })
            .await?,
            NodeReply::DeleteAck
        );
        Ok(())
    }
}

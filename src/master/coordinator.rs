//! Master coordinator: drives upload distribution, read-side fan-out and
//! reassembly, listing and delete fan-out on behalf of clients.

use std::collections::BTreeSet;

use crate::master::{
    partition_content, plan_partitions, FileRecord, MetaHub, PartitionPlan,
    Placement, UploadId,
};
use crate::node::{
    validate_file_name, NodeAddr, NodeReply, NodeRequest, NodeStub,
};
use crate::utils::SplitfsError;

use futures::future::join_all;

use tokio::time::Duration;

/// Multiple of the RPC deadline the coordinator waits for a primary's
/// replica report, covering the primary's connect and send to its peer.
const REPLICA_REPORT_STEPS: u32 = 3;

/// Outcome of a finished upload.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UploadSummary {
    /// Stored file name.
    pub file: String,

    /// Number of partitions the upload was split into.
    pub partitions: usize,

    /// Number of partitions with at least one confirmed copy.
    pub stored: usize,

    /// Number of confirmed placements, replicas included.
    pub placements: usize,
}

/// Request-driven coordinator logic shared by all client responders.
#[derive(Clone)]
pub struct Coordinator {
    /// Handle to the keeper owning registry and metadata.
    meta: MetaHub,

    /// Deadline of every RPC towards storage nodes.
    rpc_timeout: Duration,
}

impl Coordinator {
    pub fn new(meta: MetaHub, rpc_timeout: Duration) -> Self {
        Coordinator { meta, rpc_timeout }
    }

    pub fn meta(&self) -> &MetaHub {
        &self.meta
    }
}

// Coordinator upload path
impl Coordinator {
    /// Splits `lines` into one partition per registered node and stores each
    /// on its primary, recording every confirmed copy. A partition whose
    /// primary fails is logged and skipped; a metadata persistence failure
    /// aborts the whole upload.
    pub async fn put(
        &self,
        file: &str,
        lines: &[String],
    ) -> Result<UploadSummary, SplitfsError> {
        validate_file_name(file)?;
        let (upload, nodes) = self.meta.begin_upload().await?;
        let plans = plan_partitions(lines.len(), &nodes)?;
        let partitions = plans.len();
        pf_info!(
            "uploading '{}': {} line(s) over {} partition(s)",
            file,
            lines.len(),
            partitions
        );

        let mut stored = 0;
        let mut placements = 0;
        for plan in &plans {
            let content = partition_content(&lines[plan.lines.clone()]);
            match self
                .distribute_partition(file, upload, partitions, plan, content)
                .await
            {
                Ok(n) => {
                    stored += 1;
                    placements += n;
                }
                Err(
                    e @ (SplitfsError::NodeUnreachable(_)
                    | SplitfsError::MalformedCommand(_)),
                ) => {
                    pf_warn!(
                        "partition {} of '{}' not stored on {}: {}",
                        plan.index,
                        file,
                        plan.primary,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if stored == 0 {
            return Err(SplitfsError::NodeUnreachable(format!(
                "no partition of '{}' could be stored",
                file
            )));
        }
        if stored < partitions {
            pf_warn!(
                "'{}' stored partially: {}/{} partition(s)",
                file,
                stored,
                partitions
            );
        }
        Ok(UploadSummary {
            file: file.into(),
            partitions,
            stored,
            placements,
        })
    }

    /// Stores one partition on its primary and records the primary copy
    /// and, if reported, the replica copy. Returns the number of placements
    /// recorded.
    async fn distribute_partition(
        &self,
        file: &str,
        upload: UploadId,
        partitions: usize,
        plan: &PartitionPlan,
        content: String,
    ) -> Result<usize, SplitfsError> {
        let mut stub =
            NodeStub::connect(&plan.primary, self.rpc_timeout).await?;
        let reply = stub
            .call(&NodeRequest::Partition {
                file: file.into(),
                index: plan.index,
                peers: plan.peers.clone(),
                content,
            })
            .await?;
        match reply {
            NodeReply::Ack { index, .. } if index == plan.index => {}
            reply => return Err(unexpected_reply(&plan.primary, reply)),
        }
        self.record(file, upload, partitions, plan.index, &plan.primary)
            .await?;
        let mut recorded = 1;

        if !plan.peers.is_empty() {
            // the primary spends up to a connect plus a send on the peer
            // before reporting
            let report = stub
                .recv_within(self.rpc_timeout * REPLICA_REPORT_STEPS)
                .await;
            // the report is trusted without checking the peer
            match report {
                Ok(NodeReply::ReplicatedAck { peer, index, .. })
                    if index == plan.index =>
                {
                    if self
                        .record(file, upload, partitions, plan.index, &peer)
                        .await?
                    {
                        recorded += 1;
                    }
                }
                Ok(reply) => {
                    pf_warn!(
                        "bad replica report of '{}' partition {}: {}",
                        file,
                        plan.index,
                        unexpected_reply(&plan.primary, reply)
                    );
                }
                Err(e) => {
                    pf_warn!(
                        "no replica report of '{}' partition {}: {}",
                        file,
                        plan.index,
                        e
                    );
                }
            }
        }
        Ok(recorded)
    }

    async fn record(
        &self,
        file: &str,
        upload: UploadId,
        partitions: usize,
        index: usize,
        node: &NodeAddr,
    ) -> Result<bool, SplitfsError> {
        let placement = Placement {
            index,
            node: node.clone(),
        };
        pf_debug!("recording '{}' partition {} on {}", file, index, node);
        self.meta
            .add_placement(file, upload, partitions, placement)
            .await
    }
}

// Coordinator read path
impl Coordinator {
    /// Fetches every partition of `file` back and concatenates them in
    /// index order. Fails closed: if any index cannot be fetched from any
    /// of its placements, nothing is returned.
    pub async fn get(&self, file: &str) -> Result<String, SplitfsError> {
        let Some(record) = self.meta.lookup(file).await? else {
            return Err(SplitfsError::NotFound(file.into()));
        };

        let fetches = (0..record.partitions).map(|index| {
            let nodes: Vec<NodeAddr> = record
                .placements_of(index)
                .into_iter()
                .map(|p| p.node.clone())
                .collect();
            self.fetch_partition(file, index, nodes)
        });
        let results = join_all(fetches).await;

        let mut text = String::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(content) => text.push_str(&content),
                None => {
                    pf_error!(
                        "cannot reassemble '{}': partition {} unreachable",
                        file,
                        index
                    );
                    return Err(SplitfsError::PartialReassembly(index));
                }
            }
        }
        pf_info!(
            "reassembled '{}' from {} partition(s)",
            file,
            record.partitions
        );
        Ok(text)
    }

    /// Tries the given holders of one partition in order until one returns
    /// its content.
    async fn fetch_partition(
        &self,
        file: &str,
        index: usize,
        nodes: Vec<NodeAddr>,
    ) -> Option<String> {
        for node in &nodes {
            match self.fetch_from(file, index, node).await {
                Ok(content) => return Some(content),
                Err(e) => {
                    pf_warn!(
                        "fetching '{}' partition {} from {} failed: {}",
                        file,
                        index,
                        node,
                        e
                    );
                }
            }
        }
        None
    }

    async fn fetch_from(
        &self,
        file: &str,
        index: usize,
        node: &NodeAddr,
    ) -> Result<String, SplitfsError> {
        let mut stub = NodeStub::connect(node, self.rpc_timeout).await?;
        match stub
            .call(&NodeRequest::GetPartition {
                file: file.into(),
                index,
            })
            .await?
        {
            NodeReply::PartitionData { content } => Ok(content),
            NodeReply::Error { msg } => Err(SplitfsError::NotFound(msg)),
            reply => Err(unexpected_reply(node, reply)),
        }
    }
}

// Coordinator listing and delete paths
impl Coordinator {
    /// Human-readable summary of every stored file, one text block per file.
    pub async fn ls(&self) -> Result<Vec<String>, SplitfsError> {
        let files = self.meta.list().await?;
        if files.is_empty() {
            return Ok(vec!["No files uploaded.".into()]);
        }
        Ok(files
            .iter()
            .map(|(file, record)| render_listing(file, record))
            .collect())
    }

    /// Asks every node holding a copy of `file` to drop its blobs, then
    /// drops the metadata record regardless of how the nodes answered.
    pub async fn rm(&self, file: &str) -> Result<(), SplitfsError> {
        let Some(record) = self.meta.lookup(file).await? else {
            return Err(SplitfsError::NotFound(file.into()));
        };

        let holders: BTreeSet<&NodeAddr> =
            record.placements.iter().map(|p| &p.node).collect();
        let deletes = holders.iter().map(|&node| async move {
            if let Err(e) = self.delete_on(file, node).await {
                pf_warn!("deleting '{}' on {} failed: {}", file, node, e);
            }
        });
        join_all(deletes).await;

        match self.meta.remove(file).await? {
            Some(_) => {
                pf_info!("removed '{}' from {} node(s)", file, holders.len());
                Ok(())
            }
            None => Err(SplitfsError::NotFound(file.into())),
        }
    }

    async fn delete_on(
        &self,
        file: &str,
        node: &NodeAddr,
    ) -> Result<(), SplitfsError> {
        let mut stub = NodeStub::connect(node, self.rpc_timeout).await?;
        match stub
            .call(&NodeRequest::DeletePartition { file: file.into() })
            .await?
        {
            NodeReply::DeleteAck => Ok(()),
            reply => Err(unexpected_reply(node, reply)),
        }
    }
}

/// Renders one file's listing block.
fn render_listing(file: &str, record: &FileRecord) -> String {
    let mut text = format!("- {}: {} partitions\n", file, record.partitions);
    let mut placements: Vec<&Placement> = record.placements.iter().collect();
    placements.sort_by_key(|p| p.index);
    for p in placements {
        text.push_str(&format!("Partition {}-> {}\n", p.index, p.node));
    }
    text
}

fn unexpected_reply(node: &NodeAddr, reply: NodeReply) -> SplitfsError {
    match reply {
        NodeReply::Error { msg } => {
            SplitfsError::NodeUnreachable(format!("{} refused: {}", node, msg))
        }
        reply => SplitfsError::MalformedCommand(format!(
            "unexpected reply from {}: {:?}",
            node, reply
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{spawn_discovery_listener, Registration};
    use crate::node::StorageNode;
    use crate::utils::{tcp_bind_with_retry, FramedConn};
    use std::path::Path;
    use tokio::fs;
    use tokio::sync::watch;
    use tokio::time;

    /// Starts a keeper, a discovery listener on `master_port` and one
    /// storage node per entry of `node_ports`, then waits until all of them
    /// registered.
    async fn setup_cluster(
        tag: &str,
        master_port: u16,
        node_ports: &[u16],
    ) -> Result<(Coordinator, Vec<watch::Sender<bool>>), SplitfsError> {
        let meta_path = format!("/tmp/splitfs-test-{}/master_data.dat", tag);
        if fs::try_exists(&meta_path).await? {
            fs::remove_file(&meta_path).await?;
        }
        let (meta, _keeper) =
            MetaHub::new_and_setup(Path::new(&meta_path)).await?;
        spawn_discovery_listener(
            format!("127.0.0.1:{}", master_port).parse()?,
            meta.clone(),
        )
        .await?;

        let mut terms = Vec::new();
        for &port in node_ports {
            let root = format!("/tmp/splitfs-test-{}/node{}", tag, port);
            if fs::try_exists(&root).await? {
                fs::remove_dir_all(&root).await?;
            }
            let config = format!(
                "local_root = '{}'\ndiscovery_addr = '127.0.0.1'\n\
                 rpc_timeout_ms = 1000",
                root
            );
            let mut node = StorageNode::new_and_setup(
                format!("127.0.0.1:{}", port).parse()?,
                master_port,
                Some(&config),
            )
            .await?;
            let (tx_term, rx_term) = watch::channel(false);
            tokio::spawn(async move { node.run(rx_term).await });
            terms.push(tx_term);

            // registration order must follow node order
            let expected = terms.len();
            let mut registered = 0;
            for _ in 0..100 {
                registered = meta.nodes().await?.len();
                if registered >= expected {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(registered, expected);
        }

        Ok((Coordinator::new(meta, Duration::from_millis(1000)), terms))
    }

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|l| l.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn upload_list_fetch_remove() -> Result<(), SplitfsError> {
        let (coord, _terms) =
            setup_cluster("coord-0", 31840, &[31841, 31842]).await?;

        let upload = lines(&["one", "two", "three", "four", "five"]);
        let summary = coord.put("notes.txt", &upload).await?;
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.placements, 4);

        let record = coord
            .meta()
            .lookup("notes.txt")
            .await?
            .ok_or(SplitfsError::NotFound("notes.txt".into()))?;
        assert_eq!(
            record.placements_of(0)[0].node,
            NodeAddr::new("127.0.0.1", 31841)
        );
        assert_eq!(record.placements_of(1).len(), 2);

        let listing = coord.ls().await?;
        assert_eq!(listing.len(), 1);
        assert!(listing[0].starts_with("- notes.txt: 2 partitions\n"));
        assert!(listing[0].contains("Partition 0-> 127.0.0.1:31841"));
        assert!(listing[0].contains("Partition 1-> 127.0.0.1:31842"));

        assert_eq!(
            coord.get("notes.txt").await?,
            "one\ntwo\nthree\nfour\nfive\n"
        );

        coord.rm("notes.txt").await?;
        assert_eq!(
            coord.get("notes.txt").await,
            Err(SplitfsError::NotFound("notes.txt".into()))
        );
        assert_eq!(
            coord.rm("notes.txt").await,
            Err(SplitfsError::NotFound("notes.txt".into()))
        );
        assert_eq!(coord.ls().await?, vec!["No files uploaded.".to_string()]);
        assert!(fs::read_dir("/tmp/splitfs-test-coord-0/node31841/")
            .await?
            .next_entry()
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replica_failover_and_partial() -> Result<(), SplitfsError> {
        let (coord, terms) =
            setup_cluster("coord-1", 31850, &[31851, 31852]).await?;

        coord.put("a.log", &lines(&["x", "y", "z"])).await?;

        // single-copy file placed only on the second node
        let (upload, _) = coord.meta().begin_upload().await?;
        let mut stub = NodeStub::connect(
            &NodeAddr::new("127.0.0.1", 31852),
            Duration::from_secs(1),
        )
        .await?;
        stub.call(&NodeRequest::Partition {
            file: "b.log".into(),
            index: 0,
            peers: vec![],
            content: "only\n".into(),
        })
        .await?;
        coord
            .meta()
            .add_placement(
                "b.log",
                upload,
                1,
                Placement {
                    index: 0,
                    node: NodeAddr::new("127.0.0.1", 31852),
                },
            )
            .await?;

        // stop the second node; its listener goes away with its task
        terms[1].send(true).map_err(SplitfsError::msg)?;
        time::sleep(Duration::from_millis(200)).await;

        // every a.log index still has a copy on the first node
        assert_eq!(coord.get("a.log").await?, "x\ny\nz\n");
        assert_eq!(
            coord.get("b.log").await,
            Err(SplitfsError::PartialReassembly(0))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn edge_uploads() -> Result<(), SplitfsError> {
        let (coord, _terms) = setup_cluster("coord-2", 31860, &[31861]).await?;

        // no peers with a single node, so exactly one placement
        let summary = coord.put("empty.txt", &[]).await?;
        assert_eq!((summary.partitions, summary.placements), (1, 1));
        assert_eq!(coord.get("empty.txt").await?, "");

        coord.put("blank.txt", &lines(&[""])).await?;
        assert_eq!(coord.get("blank.txt").await?, "\n");

        // re-upload replaces the old layout
        coord.put("blank.txt", &lines(&["new", "content"])).await?;
        assert_eq!(coord.get("blank.txt").await?, "new\ncontent\n");

        assert!(matches!(
            coord.put("bad/name", &lines(&["x"])).await,
            Err(SplitfsError::MalformedCommand(_))
        ));
        Ok(())
    }

    /// Serves exactly one `Partition` command: acknowledges it, then after
    /// `delay` reports the first peer candidate as the replica holder, or
    /// stays silent if `delay` is `None`.
    async fn spawn_fake_primary(
        port: u16,
        delay: Option<Duration>,
    ) -> Result<(), SplitfsError> {
        let listener =
            tcp_bind_with_retry(format!("127.0.0.1:{}", port).parse()?, 3)
                .await?;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut conn = FramedConn::new(stream)?;
            let NodeRequest::Partition {
                file, index, peers, ..
            } = conn.recv().await?
            else {
                return Err(SplitfsError::msg("expected a partition"));
            };
            conn.send(&NodeReply::Ack {
                node: NodeAddr::new("127.0.0.1", port),
                file: file.clone(),
                index,
            })
            .await?;
            match (delay, peers.first()) {
                (Some(delay), Some(peer)) => {
                    time::sleep(delay).await;
                    conn.send(&NodeReply::ReplicatedAck {
                        peer: peer.clone(),
                        file,
                        index,
                    })
                    .await?;
                }
                _ => time::sleep(Duration::from_secs(3)).await,
            }
            Ok::<(), SplitfsError>(())
        });
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_or_missing_replica_report() -> Result<(), SplitfsError> {
        let meta_path = "/tmp/splitfs-test-coord-5/master_data.dat";
        if fs::try_exists(meta_path).await? {
            fs::remove_file(meta_path).await?;
        }
        let (meta, _keeper) =
            MetaHub::new_and_setup(Path::new(meta_path)).await?;
        for port in [31890, 31891] {
            meta.register(Registration {
                addr: NodeAddr::new("127.0.0.1", port),
                local_root: "./storage".into(),
                master_port: 31889,
            })
            .await?;
        }
        let timeout = Duration::from_millis(300);
        // reports later than one deadline, within the report deadline
        spawn_fake_primary(31890, Some(timeout * 2)).await?;
        // never reports
        spawn_fake_primary(31891, None).await?;

        let coord = Coordinator::new(meta.clone(), timeout);
        let summary = coord.put("late.txt", &lines(&["a", "b"])).await?;
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.placements, 3);

        let record = meta
            .lookup("late.txt")
            .await?
            .ok_or(SplitfsError::NotFound("late.txt".into()))?;
        assert_eq!(
            record.placements_of(0),
            vec![
                &Placement {
                    index: 0,
                    node: NodeAddr::new("127.0.0.1", 31890)
                },
                &Placement {
                    index: 0,
                    node: NodeAddr::new("127.0.0.1", 31891)
                },
            ]
        );
        assert_eq!(record.placements_of(1).len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_active_nodes() -> Result<(), SplitfsError> {
        let (coord, _terms) = setup_cluster("coord-3", 31870, &[]).await?;
        assert_eq!(
            coord.put("f.txt", &lines(&["x"])).await,
            Err(SplitfsError::NoActiveNodes)
        );
        assert_eq!(coord.meta().list().await?, vec![]);
        Ok(())
    }

    #[test]
    fn listing_block() {
        let record = FileRecord {
            partitions: 2,
            upload: 1,
            placements: vec![
                Placement {
                    index: 1,
                    node: NodeAddr::new("h", 2),
                },
                Placement {
                    index: 0,
                    node: NodeAddr::new("h", 1),
                },
            ],
        };
        assert_eq!(
            render_listing("f", &record),
            "- f: 2 partitions\nPartition 0-> h:1\nPartition 1-> h:2\n"
        );
    }
}

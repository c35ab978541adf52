//! Outgoing RPC stub towards a storage node, used by the coordinator and by
//! primaries forwarding replicas.

use std::future::Future;

use crate::node::{NodeAddr, NodeReply, NodeRequest};
use crate::utils::{tcp_connect_with_retry, FramedConn, SplitfsError};

use tokio::time::{self, Duration};

/// One connection to a storage node. Every step is bounded by the RPC
/// deadline; a missed deadline or any I/O failure surfaces as
/// `NodeUnreachable` so callers can treat dead and slow nodes alike.
pub(crate) struct NodeStub {
    /// Node on the other end.
    addr: NodeAddr,

    /// Framed connection to the node.
    conn: FramedConn,

    /// Per-step deadline.
    timeout: Duration,
}

impl NodeStub {
    /// Connects to the given node within the deadline.
    pub(crate) async fn connect(
        addr: &NodeAddr,
        timeout: Duration,
    ) -> Result<Self, SplitfsError> {
        let stream = Self::bounded(addr, timeout, async {
            tcp_connect_with_retry(&addr.host, addr.port, 0).await
        })
        .await?;
        let conn = FramedConn::new(stream)
            .map_err(|e| Self::unreachable(addr, e))?;
        pf_trace!("connected to node {}", addr);

        Ok(NodeStub {
            addr: addr.clone(),
            conn,
            timeout,
        })
    }

    /// Sends a request without expecting any reply.
    pub(crate) async fn send(
        &mut self,
        req: &NodeRequest,
    ) -> Result<(), SplitfsError> {
        let addr = &self.addr;
        let conn = &mut self.conn;
        Self::bounded(addr, self.timeout, conn.send(req)).await
    }

    /// Receives the next reply.
    pub(crate) async fn recv(&mut self) -> Result<NodeReply, SplitfsError> {
        self.recv_within(self.timeout).await
    }

    /// Receives the next reply under a deadline other than the per-step one,
    /// for replies that wait on the node's own outgoing RPCs.
    pub(crate) async fn recv_within(
        &mut self,
        timeout: Duration,
    ) -> Result<NodeReply, SplitfsError> {
        let addr = &self.addr;
        let conn = &mut self.conn;
        Self::bounded(addr, timeout, conn.recv()).await
    }

    /// Sends a request and waits for its first reply.
    pub(crate) async fn call(
        &mut self,
        req: &NodeRequest,
    ) -> Result<NodeReply, SplitfsError> {
        self.send(req).await?;
        self.recv().await
    }

    /// Runs `fut` under the deadline, turning both timeout and failure into
    /// `NodeUnreachable`.
    async fn bounded<T>(
        addr: &NodeAddr,
        timeout: Duration,
        fut: impl Future<Output = Result<T, SplitfsError>>,
    ) -> Result<T, SplitfsError> {
        match time::timeout(timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(Self::unreachable(addr, e)),
            Err(_) => Err(SplitfsError::NodeUnreachable(format!(
                "{} (no response within {} ms)",
                addr,
                timeout.as_millis()
            ))),
        }
    }

    fn unreachable(addr: &NodeAddr, e: SplitfsError) -> SplitfsError {
        match e {
            SplitfsError::NodeUnreachable(_) => e,
            e => SplitfsError::NodeUnreachable(format!("{} ({})", addr, e)),
        }
    }
}

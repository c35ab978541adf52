//! Splitfs client API communication stub implementation.

use crate::master::{ApiReply, ApiRequest};
use crate::node::NodeAddr;
use crate::utils::{tcp_connect_with_retry, FramedConn, SplitfsError};

/// Number of lines carried by each upload frame.
const PUT_BATCH_LINES: usize = 1024;

/// Result of a finished upload as reported by the master.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PutReceipt {
    pub file: String,
    pub partitions: usize,
    pub placements: usize,
}

/// Client API stub talking to the master. Every command runs over its own
/// connection.
#[derive(Debug, Clone)]
pub struct ClientApiStub {
    /// Master's client-facing address.
    master: NodeAddr,
}

impl ClientApiStub {
    pub fn new(master: NodeAddr) -> Self {
        ClientApiStub { master }
    }

    async fn connect(&self) -> Result<FramedConn, SplitfsError> {
        let stream =
            tcp_connect_with_retry(&self.master.host, self.master.port, 2)
                .await?;
        FramedConn::new(stream)
    }

    /// Uploads `lines` under the name `file`.
    pub async fn put(
        &self,
        file: &str,
        lines: &[String],
    ) -> Result<PutReceipt, SplitfsError> {
        let mut conn = self.connect().await?;
        conn.send(&ApiRequest::Put { file: file.into() }).await?;
        for batch in lines.chunks(PUT_BATCH_LINES) {
            conn.send(&ApiRequest::PutLines {
                lines: batch.to_vec(),
            })
            .await?;
        }
        conn.send(&ApiRequest::PutEnd).await?;

        match conn.recv().await? {
            ApiReply::Uploaded {
                file,
                partitions,
                placements,
            } => Ok(PutReceipt {
                file,
                partitions,
                placements,
            }),
            reply => Err(Self::failed(reply)),
        }
    }

    /// Fetches the whole content of `file`.
    pub async fn get(&self, file: &str) -> Result<String, SplitfsError> {
        let mut conn = self.connect().await?;
        conn.send(&ApiRequest::Get { file: file.into() }).await?;

        match conn.recv().await? {
            ApiReply::Success => {}
            reply => return Err(Self::failed(reply)),
        }
        let mut text = String::new();
        loop {
            match conn.recv().await? {
                ApiReply::Content { text: chunk } => text.push_str(&chunk),
                ApiReply::Eof => return Ok(text),
                reply => return Err(Self::failed(reply)),
            }
        }
    }

    /// Lists stored files, one text block per file.
    pub async fn ls(&self) -> Result<Vec<String>, SplitfsError> {
        let mut conn = self.connect().await?;
        conn.send(&ApiRequest::Ls).await?;

        let mut blocks = Vec::new();
        loop {
            match conn.recv().await? {
                ApiReply::Listing { text } => blocks.push(text),
                ApiReply::EndOfResponse => return Ok(blocks),
                reply => return Err(Self::failed(reply)),
            }
        }
    }

    /// Removes `file`.
    pub async fn rm(&self, file: &str) -> Result<(), SplitfsError> {
        let mut conn = self.connect().await?;
        conn.send(&ApiRequest::Rm { file: file.into() }).await?;

        match conn.recv().await? {
            ApiReply::Removed { .. } => Ok(()),
            reply => Err(Self::failed(reply)),
        }
    }

    fn failed(reply: ApiReply) -> SplitfsError {
        match reply {
            ApiReply::Error { msg } => SplitfsError::Msg(msg),
            reply => SplitfsError::MalformedCommand(format!(
                "unexpected reply {:?}",
                reply
            )),
        }
    }
}

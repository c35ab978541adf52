//! Safe TCP bind/connect/read/write helper functions.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::SplitfsError;

use bytes::{Bytes, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Upper bound on one frame's body, above the largest partition or upload
/// batch the system sends. Longer length prefixes are rejected before any
/// buffer space is reserved.
pub(crate) const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the read buffer is cleared
///   - `Err(err)` if any unexpected error occurs, including the peer closing
///     the connection before a whole object arrived
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function may be used as a `tokio::select!` branch (or be
/// dropped by a timeout) and those two methods are not cancellation-safe.
/// Bytes already read are kept in the read buffer and will continue to be
/// appended by future invocations until successful returning.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, SplitfsError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // obj_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SplitfsError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = usize::try_from(u64::from_be_bytes(len_bytes))
        .map_err(|_| SplitfsError::msg("frame length overflows usize"))?;
    if obj_len > MAX_FRAME_LEN {
        return Err(SplitfsError::MalformedCommand(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    // then read the obj itself
    let obj_end = 8 + obj_len;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SplitfsError::msg("connection closed mid-frame"));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`, using
/// `write_buf` as buffer storage for partial writes. Returns:
///   - `Ok(true)` if successful
///   - `Ok(false)` if socket full and may block; in this case, bytes of the
///     input object is saved in the write buffer, and the next calls must
///     give arg `obj == None` to indicate retrying (typically after awaiting
///     the socket to become writable), until the function returns success
///   - `Err(err)` if any unexpected error occurs
///
/// DEADLOCK AVOIDANCE: we avoid using `write_u64()` and `write_all()` here
/// because, in the case of TCP buffers being full, if both ends of the
/// connection are trying to write, they may both be blocking on either of
/// these two methods, resulting in a circular deadlock.
pub(crate) fn safe_tcp_write<T, Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
    obj: Option<&T>,
) -> Result<bool, SplitfsError>
where
    T: Serialize,
    Conn: AsRef<TcpStream>,
{
    // if last write was not successful, cannot send a new object
    if obj.is_some() && !write_buf.is_empty() {
        return Err(SplitfsError::msg(
            "attempting new object while should retry",
        ));
    } else if obj.is_none() && write_buf.is_empty() {
        return Err(SplitfsError::msg(
            "attempting to retry while buffer is empty",
        ));
    } else if let Some(obj) = obj {
        // sending a new object, fill write_buf
        debug_assert_eq!(*write_buf_cursor, 0);
        let write_bytes = encode_to_vec(obj)?;
        if write_bytes.len() > MAX_FRAME_LEN {
            return Err(SplitfsError::MalformedCommand(format!(
                "frame length {} exceeds limit {}",
                write_bytes.len(),
                MAX_FRAME_LEN
            )));
        }
        let write_len = write_bytes.len() as u64;
        write_buf.extend_from_slice(&write_len.to_be_bytes());
        debug_assert_eq!(write_buf.len(), 8);
        write_buf.extend_from_slice(write_bytes.as_slice());
    } else {
        // retrying last unsuccessful write
        debug_assert!(*write_buf_cursor < write_buf.len());
    }

    // try until the length + the object are all written
    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    // everything written, clear write_buf
    write_buf.clear();
    *write_buf_cursor = 0;

    Ok(true)
}

/// A request/reply TCP connection carrying length-prefixed MessagePack
/// frames. Every RPC in the system opens one of these, exchanges a few
/// frames and drops it.
pub(crate) struct FramedConn {
    /// Address of the other end.
    peer: SocketAddr,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Read buffer for cancellation safety.
    read_buf: BytesMut,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Write buffer for deadlock avoidance.
    write_buf: BytesMut,

    /// Write buffer cursor at first unwritten byte.
    write_buf_cursor: usize,
}

impl FramedConn {
    /// Wraps an established TCP stream.
    pub(crate) fn new(stream: TcpStream) -> Result<Self, SplitfsError> {
        let peer = stream.peer_addr()?;
        let (conn_read, conn_write) = stream.into_split();
        Ok(FramedConn {
            peer,
            conn_read,
            read_buf: BytesMut::with_capacity(8 + 1024),
            conn_write,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
        })
    }

    /// Address of the other end of the connection.
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one object, waiting for socket writability whenever the TCP
    /// buffer is full.
    pub(crate) async fn send<T: Serialize>(
        &mut self,
        obj: &T,
    ) -> Result<(), SplitfsError> {
        let mut done = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            Some(obj),
        )?;
        while !done {
            self.conn_write.as_ref().writable().await?;
            done = safe_tcp_write::<T, _>(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }
        Ok(())
    }

    /// Receives one object.
    pub(crate) async fn recv<T: DeserializeOwned>(
        &mut self,
    ) -> Result<T, SplitfsError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, SplitfsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.set_nodelay(true)?;

        if let Err(e) = socket.bind(bind_addr) {
            pf_error!("binding {} failed: {}", bind_addr, e);
            return Err(SplitfsError::from(e));
        }

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Resolves `host:port` (hostnames allowed) and connects to the first IPv4
/// address found, retrying the connect up to `retries` times. Failures are
/// reported as `NodeUnreachable`.
pub(crate) async fn tcp_connect_with_retry(
    host: &str,
    port: u16,
    mut retries: u8,
) -> Result<TcpStream, SplitfsError> {
    let unreachable = |e: std::io::Error| {
        SplitfsError::NodeUnreachable(format!("{}:{} ({})", host, port, e))
    };

    let conn_addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(unreachable)?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            SplitfsError::NodeUnreachable(format!(
                "{}:{} (no IPv4 address)",
                host, port
            ))
        })?;

    loop {
        let socket = TcpSocket::new_v4().map_err(unreachable)?;
        socket.set_nodelay(true).map_err(unreachable)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(unreachable(err));
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

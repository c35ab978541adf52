//! Master-side discovery listener: storage nodes announce themselves with a
//! single text datagram on the master's port.

use std::net::SocketAddr;

use crate::master::{MetaHub, Registration, REGISTER_PREFIX};
use crate::utils::SplitfsError;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Largest discovery datagram accepted.
const MAX_DATAGRAM: usize = 4096;

/// Binds the discovery socket and spawns the listener task feeding
/// registrations into the keeper.
pub(crate) async fn spawn_discovery_listener(
    bind_addr: SocketAddr,
    meta: MetaHub,
) -> Result<JoinHandle<()>, SplitfsError> {
    let socket = UdpSocket::bind(bind_addr).await?;
    pf_info!("listening for node registrations on '{}'", bind_addr);
    Ok(tokio::spawn(discovery_task(socket, meta)))
}

/// Handles one received datagram.
async fn handle_datagram(
    meta: &MetaHub,
    data: &[u8],
    src: SocketAddr,
) -> Result<(), SplitfsError> {
    let msg = String::from_utf8_lossy(data);
    if !msg.starts_with(REGISTER_PREFIX) {
        pf_debug!("ignoring datagram from {}: '{}'", src, msg.trim_end());
        return Ok(());
    }
    let reg = Registration::parse_datagram(&msg)?;
    meta.register(reg).await?;
    Ok(())
}

/// Discovery listener task function. No acknowledgment is ever sent back.
async fn discovery_task(socket: UdpSocket, meta: MetaHub) {
    pf_debug!("discovery task spawned");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if let Err(e) = handle_datagram(&meta, &buf[..len], src).await
                {
                    pf_warn!("bad registration from {}: {}", src, e);
                }
            }
            Err(e) => {
                pf_error!("error receiving discovery datagram: {}", e);
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

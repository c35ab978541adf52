//! Storage node self-announcement over UDP.

use std::net::SocketAddr;

use crate::master::Registration;
use crate::utils::SplitfsError;

use tokio::net::{lookup_host, UdpSocket};

/// Sends the registration datagram once to `discovery_addr` on the master's
/// port. Broadcast is enabled so the default broadcast address works; no
/// answer is expected.
pub(crate) async fn announce(
    reg: &Registration,
    discovery_addr: &str,
) -> Result<(), SplitfsError> {
    let target: SocketAddr = lookup_host((discovery_addr, reg.master_port))
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| {
            SplitfsError::msg(format!(
                "cannot resolve discovery address '{}'",
                discovery_addr
            ))
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let datagram = reg.to_datagram();
    socket.send_to(datagram.as_bytes(), target).await?;
    pf_info!("announced '{}' to {}", datagram, target);
    Ok(())
}

//! Datagram side of the daemon.
//!
//! One UDP socket carries every packet. The receive loop handles datagrams
//! strictly in arrival order; replies go straight back out through
//! `send_all`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use uplink_core::wire::{self, DecodeError};
use uplink_services::{Outbound, PeerDirectory, TransferManager};

/// Kernel buffer size requested for the link socket.
const SOCKET_BUFFER: usize = 1 << 20;

/// Largest datagram we accept. Bigger than any packet we build.
const MAX_DATAGRAM: usize = 2048;

/// Bind the link socket with enlarged kernel buffers.
pub fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
        tracing::warn!(error = %e, "could not enlarge receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
        tracing::warn!(error = %e, "could not enlarge send buffer");
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).with_context(|| format!("bind({addr})"))?;
    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    manager: Arc<TransferManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let own_id = manager.identity().node_id;
    tracing::info!(addr = %socket.local_addr()?, "link receiver starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("link receiver shutting down");
                return Ok(());
            }

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };

                let packet = match wire::decode(&buf[..len]) {
                    Ok(p) => p,
                    Err(e @ DecodeError::ChecksumMismatch { .. }) => {
                        tracing::trace!(%from, error = %e, "dropping corrupt packet");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(
                            %from,
                            len,
                            head = hex::encode(&buf[..len.min(8)]),
                            error = %e,
                            "dropping undecodable packet"
                        );
                        continue;
                    }
                };

                if let Some(node_id) = packet.node_id() {
                    if node_id == own_id {
                        tracing::trace!(%from, "ignoring own packet");
                        continue;
                    }
                    manager.peers().observe_addr(node_id, from);
                }
                tracing::trace!(%from, kind = ?packet.kind(), "packet received");

                // chunk writes and checkpoints hit the disk
                let replies = tokio::task::block_in_place(|| manager.handle_packet(packet, Instant::now()));
                send_all(&socket, manager.peers(), replies).await;
            }
        }
    }
}

/// Encode and send each packet to its peer. Failures are logged and the
/// packet is dropped; the transaction's own retries recover from it.
pub async fn send_all(socket: &UdpSocket, peers: &PeerDirectory, packets: Vec<Outbound>) {
    for out in packets {
        let Some(addr) = peers.addr_of(out.node_id) else {
            tracing::warn!(node_id = out.node_id, kind = ?out.packet.kind(), "no address for peer, dropping");
            continue;
        };
        let bytes = match wire::encode(&out.packet) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(node_id = out.node_id, error = %e, "failed to encode packet");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&bytes, addr).await {
            tracing::warn!(node_id = out.node_id, %addr, error = %e, "send_to failed");
        }
    }
}

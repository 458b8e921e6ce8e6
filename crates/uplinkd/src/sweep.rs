//! Timer-driven work: transaction sweep, outgoing directory scan,
//! heartbeats and status snapshots.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use uplink_core::wire::Packet;
use uplink_services::{Outbound, TransferEvent, TransferManager};

use crate::link::send_all;

const SCAN_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

pub async fn sweep_loop(
    socket: Arc<UdpSocket>,
    manager: Arc<TransferManager>,
    poll_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut scan = tokio::time::interval(SCAN_INTERVAL);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    tracing::info!(poll_ms = poll_interval.as_millis() as u64, "sweep loop starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let closed = tokio::task::block_in_place(|| manager.shutdown(Instant::now()));
                tracing::info!(closed, "sweep loop shutting down");
                return Ok(());
            }

            _ = poll.tick() => {
                let out = tokio::task::block_in_place(|| manager.poll(Instant::now()));
                if !out.is_empty() {
                    tracing::trace!(count = out.len(), "sweep produced packets");
                }
                send_all(&socket, manager.peers(), out).await;
            }

            _ = scan.tick() => {
                match tokio::task::block_in_place(|| manager.load_outgoing(Instant::now())) {
                    Ok(queued) if !queued.is_empty() => {
                        tracing::info!(count = queued.len(), "queued outgoing files");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "outgoing scan failed"),
                }
            }

            _ = heartbeat.tick() => {
                let beat = manager.heartbeat(HEARTBEAT_INTERVAL.as_secs_f32(), 0.0, unix_time());
                send_all(&socket, manager.peers(), broadcast_to_peers(&manager, beat)).await;
            }

            _ = status.tick() => {
                let snapshot = manager.snapshot();
                tracing::info!(count = snapshot.len(), "transaction table snapshot");
                for tx in &snapshot {
                    match serde_json::to_string(tx) {
                        Ok(line) => tracing::info!(tx = %line, "  transaction"),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize summary"),
                    }
                }
            }
        }
    }
}

/// Log every lifecycle event as one JSON line.
pub async fn event_logger(
    mut events: broadcast::Receiver<TransferEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),

            result = events.recv() => match result {
                Ok(TransferEvent::Progress { .. }) => {}
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => tracing::info!(event = %line, "transfer event"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn broadcast_to_peers(manager: &TransferManager, packet: Packet) -> Vec<Outbound> {
    manager
        .peers()
        .ids()
        .into_iter()
        .map(|node_id| Outbound {
            node_id,
            packet: packet.clone(),
        })
        .collect()
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_core::config::TransferConfig;
    use uplink_core::NodeName;
    use uplink_services::{LoggingAux, NodeIdentity, PeerDirectory};

    // disk work runs under block_in_place, which needs the multi-thread runtime
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_announces_files_from_the_outgoing_tree() {
        let root = std::env::temp_dir().join(format!("uplinkd-sweep-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let ground = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ground_name = NodeName::new("ground").unwrap();
        let peers = PeerDirectory::new();
        peers.insert(2, ground_name.clone(), Some(ground.local_addr().unwrap()));
        let manager = Arc::new(TransferManager::new(
            NodeIdentity {
                node_id: 1,
                node_name: NodeName::new("sat").unwrap(),
            },
            TransferConfig {
                root: root.clone(),
                ..TransferConfig::default()
            },
            peers,
            Arc::new(LoggingAux),
        ));
        let dir = manager.layout().outgoing_dir(&ground_name).join("ops");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("note.txt"), b"hello").unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(sweep_loop(
            socket,
            manager.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        let mut buf = [0u8; 2048];
        let meta = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (len, _) = ground.recv_from(&mut buf).await.unwrap();
                if let Ok(Packet::MetaShort(meta)) = uplink_core::decode(&buf[..len]) {
                    return meta;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(meta.file_name.as_str(), "note.txt");
        assert_eq!(meta.file_size, 5);
        assert_eq!(manager.len(), 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&root);
    }
}

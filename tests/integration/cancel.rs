use crate::*;

use uplink_core::wire::Data;
use uplink_core::AgentName;
use uplink_services::{Direction, TxKey};

/// Start a 4 KiB transfer and run it for two sweeps.
fn half_done(base: &Path, keep_sent: bool) -> (Node, Node, TxKey, PathBuf, Instant) {
    let sat = Node::sat(base, |s| {
        s.burst_chunks = 2;
        s.remove_sent_files = !keep_sent;
    });
    let ground = Node::ground(base, |_| {});
    let source = sat.stage("big.bin", &payload(4_096, 8));
    let mut now = Instant::now();
    let key = sat
        .manager
        .enqueue(GROUND, AgentName::new("ops").unwrap(), &source, now)
        .unwrap();
    let mut link = Link::perfect();
    for _ in 0..2 {
        step(&sat, &ground, &mut link, now);
        now += STEP;
    }
    (sat, ground, key, source, now)
}

/// The sender aborts mid-transfer: the receiver drops its partial data and
/// ignores anything that was still in flight.
#[test]
fn test_sender_cancel_discards_partial_file() {
    let base = fresh_dir("cancel-tx");
    let (mut sat, mut ground, key, source, now) = half_done(&base, true);
    let incoming = TxKey::incoming(SAT, key.tx_id);
    let temp = ground.manager.layout().temp_path(&name("sat"), key.tx_id);
    assert!(temp.exists());

    let out = sat.manager.cancel(key, now).unwrap();
    exchange(&sat, &ground, &mut Link::perfect(), out, Vec::new(), now);
    assert!(ground.manager.get(incoming).is_none());
    assert!(!temp.exists(), "partial data should be deleted");
    assert!(!ground
        .manager
        .layout()
        .checkpoint_path(&name("sat"), key.tx_id)
        .exists());
    assert!(ground
        .drain_events()
        .contains(&TransferEvent::Cancelled { key: incoming, by_peer: true }));
    assert!(sat
        .drain_events()
        .contains(&TransferEvent::Cancelled { key, by_peer: false }));

    // a chunk that was already on the wire
    let late = ground.manager.handle_packet(
        Packet::Data(Data {
            node_id: SAT,
            tx_id: key.tx_id,
            chunk_start: 3_000,
            chunk: payload(100, 9).into(),
        }),
        now,
    );
    assert!(late.is_empty());
    assert!(ground.manager.is_empty());
    assert!(!temp.exists());
    assert!(source.exists(), "source kept when remove_sent_files is off");
    let _ = std::fs::remove_dir_all(&base);
}

/// The receiver aborts: the sender stops and, by default, drops the file
/// from its outgoing queue.
#[test]
fn test_receiver_cancel_stops_sender() {
    let base = fresh_dir("cancel-rx");
    let (sat, ground, key, source, now) = half_done(&base, false);
    let incoming = TxKey::incoming(SAT, key.tx_id);

    let out = ground.manager.cancel(incoming, now).unwrap();
    exchange(&sat, &ground, &mut Link::perfect(), Vec::new(), out, now);
    assert!(sat.manager.is_empty());
    assert!(!source.exists());

    // nothing more flows in either direction
    assert!(sat.manager.poll(now + Duration::from_secs(10)).is_empty());
    assert!(ground.manager.poll(now + Duration::from_secs(10)).is_empty());
    let _ = std::fs::remove_dir_all(&base);
}

/// Purging a queue forgets transactions without telling the peer; the
/// receiver's partial data stays for a later resume.
#[test]
fn test_reset_queue_keeps_partial_data() {
    let base = fresh_dir("reset");
    let (_sat, ground, key, _source, now) = half_done(&base, true);
    assert_eq!(ground.manager.reset_queue(SAT, Direction::Incoming, now), 1);
    assert!(ground.manager.is_empty());
    assert!(ground
        .manager
        .layout()
        .temp_path(&name("sat"), key.tx_id)
        .exists());
    assert_eq!(ground.manager.resume(now).unwrap(), 1);
    let _ = std::fs::remove_dir_all(&base);
}

/// Both nodes upload to each other, and their tx ids share low bits. The
/// ground aborting its download must stop only the satellite's upload.
#[test]
fn test_cancel_with_transfers_in_both_directions() {
    let base = fresh_dir("cancel-both");
    let mut sat = Node::sat(&base, |s| s.burst_chunks = 2);
    let ground = Node::ground(&base, |s| s.burst_chunks = 2);
    let down = payload(8_192, 21);
    let up = payload(8_192, 22);
    let mut now = Instant::now();
    let sat_key = sat
        .manager
        .enqueue(GROUND, AgentName::new("ops").unwrap(), &sat.stage("down.bin", &down), now)
        .unwrap();
    let ground_key = ground
        .manager
        .enqueue(SAT, AgentName::new("ops").unwrap(), &ground.stage("up.bin", &up), now)
        .unwrap();
    assert_ne!(sat_key.tx_id, ground_key.tx_id);

    let mut link = Link::perfect();
    step(&sat, &ground, &mut link, now);
    now += STEP;
    let download = TxKey::incoming(SAT, sat_key.tx_id);
    let upload = TxKey::incoming(GROUND, ground_key.tx_id);
    assert!(ground.manager.get(download).is_some());
    assert!(sat.manager.get(upload).is_some());

    let out = ground.manager.cancel(download, now).unwrap();
    exchange(&sat, &ground, &mut link, Vec::new(), out, now);
    assert!(sat.manager.get(sat_key).is_none(), "sender should stop at once");
    assert!(sat
        .drain_events()
        .contains(&TransferEvent::Cancelled { key: sat_key, by_peer: true }));
    assert!(sat.manager.get(upload).is_some(), "unrelated download must survive");

    run_until_idle(&sat, &ground, &mut link, now, 200).expect("upload did not finish");
    let dest = sat.manager.layout().incoming_path(
        &name("ground"),
        &AgentName::new("ops").unwrap(),
        &uplink_core::FileName::new("up.bin").unwrap(),
    );
    assert_eq!(std::fs::read(dest).unwrap(), up);
    let _ = std::fs::remove_dir_all(&base);
}

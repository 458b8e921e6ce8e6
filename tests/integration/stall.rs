use crate::*;

use uplink_core::wire::MetaShort;
use uplink_core::{AgentName, FileName};
use uplink_services::{TxKey, TxState};

/// Poll one node alone, throwing away everything it sends.
fn poll_alone(node: &Node, start: Instant, steps: usize) -> Instant {
    let mut now = start;
    for _ in 0..steps {
        let _ = node.manager.poll(now);
        now += STEP;
    }
    now
}

/// A receiver whose sender vanished after the metadata gives up after
/// `max_retries` unanswered requests and says so.
#[test]
fn test_receiver_stalls_when_sender_goes_silent() {
    let base = fresh_dir("stall-rx");
    let mut ground = Node::ground(&base, |s| s.max_retries = 3);
    let start = Instant::now();
    let out = ground.manager.handle_packet(
        Packet::MetaShort(MetaShort {
            node_id: SAT,
            tx_id: 9,
            agent_name: AgentName::new("camera").unwrap(),
            file_name: FileName::new("never.jpg").unwrap(),
            file_size: 4_096,
        }),
        start,
    );
    assert_eq!(out.len(), 1, "metadata should trigger a data request");

    // three retries two seconds apart, then silence
    poll_alone(&ground, start, 50);
    let key = TxKey::incoming(SAT, 9);
    let summary = ground.manager.get(key).unwrap();
    assert_eq!(summary.state, TxState::Stalled);
    assert_eq!(summary.retries, 3);

    let stalls: Vec<TransferEvent> = ground
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, TransferEvent::Stalled { .. }))
        .collect();
    assert_eq!(stalls, vec![TransferEvent::Stalled { key, retries: 3 }]);
    assert!(ground.manager.poll(start + Duration::from_secs(60)).is_empty());
    let _ = std::fs::remove_dir_all(&base);
}

/// A sender that never hears back stalls too, and keeps its source file.
#[test]
fn test_sender_stalls_without_receiver() {
    let base = fresh_dir("stall-tx");
    let mut sat = Node::sat(&base, |s| s.max_retries = 2);
    let source = sat.stage("orphan.bin", &payload(512, 1));
    let start = Instant::now();
    let key = sat
        .manager
        .enqueue(GROUND, AgentName::new("ops").unwrap(), &source, start)
        .unwrap();

    poll_alone(&sat, start, 40);
    assert_eq!(sat.manager.get(key).unwrap().state, TxState::Stalled);
    assert!(sat
        .drain_events()
        .contains(&TransferEvent::Stalled { key, retries: 2 }));
    assert!(source.exists());
    let _ = std::fs::remove_dir_all(&base);
}

/// Once both ends are back in contact a stalled sender is revived by the
/// receiver's request for its queue.
#[test]
fn test_stalled_sender_recovers_through_queue_request() {
    let base = fresh_dir("stall-revive");
    let sat = Node::sat(&base, |s| s.max_retries = 1);
    let ground = Node::ground(&base, |_| {});
    let data = payload(900, 4);
    let start = Instant::now();
    let key = sat
        .manager
        .enqueue(
            GROUND,
            AgentName::new("ops").unwrap(),
            &sat.stage("late.bin", &data),
            start,
        )
        .unwrap();
    let now = poll_alone(&sat, start, 30);
    assert_eq!(sat.manager.get(key).unwrap().state, TxState::Stalled);

    let mut link = Link::perfect();
    let ask = ground.manager.request_queue(SAT).unwrap();
    exchange(&sat, &ground, &mut link, Vec::new(), vec![ask], now);
    run_until_idle(&sat, &ground, &mut link, now, 100).expect("transfer did not finish");
    let dest = ground.manager.layout().incoming_path(
        &name("sat"),
        &AgentName::new("ops").unwrap(),
        &FileName::new("late.bin").unwrap(),
    );
    assert_eq!(std::fs::read(dest).unwrap(), data);
    let _ = std::fs::remove_dir_all(&base);
}

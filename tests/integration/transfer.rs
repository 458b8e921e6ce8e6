use crate::*;

use uplink_core::config::MetaForm;
use uplink_core::{AgentName, FileName};
use uplink_services::{TxKey, TxState};

fn received_path(ground: &Node, agent: &str, file: &str) -> PathBuf {
    ground.manager.layout().incoming_path(
        &name("sat"),
        &AgentName::new(agent).unwrap(),
        &FileName::new(file).unwrap(),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
//  Full transfers
// ══════════════════════════════════════════════════════════════════════════════

/// Multi-chunk file over a clean link: push flow from enqueue to Complete.
#[test]
fn test_clean_link_transfer() {
    let base = fresh_dir("clean");
    let mut sat = Node::sat(&base, |_| {});
    let mut ground = Node::ground(&base, |_| {});
    let data = payload(5_000, 7);
    let source = sat.stage("frame.raw", &data);

    let start = Instant::now();
    let key = sat
        .manager
        .enqueue(GROUND, AgentName::new("camera").unwrap(), &source, start)
        .unwrap();
    let took = run_until_idle(&sat, &ground, &mut Link::perfect(), start, 100)
        .expect("transfer did not finish");
    assert!(took < Duration::from_secs(5), "clean transfer took {took:?}");

    assert_eq!(std::fs::read(received_path(&ground, "camera", "frame.raw")).unwrap(), data);
    assert!(!source.exists(), "sent file should be removed");
    assert!(sat
        .drain_events()
        .contains(&TransferEvent::Completed { key, path: source }));

    let ground_events = ground.drain_events();
    let incoming = TxKey::incoming(SAT, key.tx_id);
    assert!(ground_events.contains(&TransferEvent::MetaReceived {
        key: incoming,
        agent_name: "camera".into(),
        file_name: "frame.raw".into(),
        file_size: 5_000,
    }));
    assert!(ground_events
        .iter()
        .any(|e| matches!(e, TransferEvent::Completed { key, .. } if *key == incoming)));
    let _ = std::fs::remove_dir_all(&base);
}

/// Drops, duplicates, corruption and reordering on every packet in both
/// directions. The file must still arrive byte for byte.
#[test]
fn test_lossy_link_transfer() {
    for seed in [3, 17, 2024] {
        let base = fresh_dir(&format!("lossy-{seed}"));
        let sat = Node::sat(&base, |_| {});
        let ground = Node::ground(&base, |_| {});
        let data = payload(20_000, seed);
        let source = sat.stage("telemetry.bin", &data);

        let start = Instant::now();
        sat.manager
            .enqueue(GROUND, AgentName::new("hk").unwrap(), &source, start)
            .unwrap();
        let mut link = Link::lossy(seed);
        run_until_idle(&sat, &ground, &mut link, start, 5_000)
            .unwrap_or_else(|| panic!("seed {seed}: transfer did not finish, {:?}", ground.manager.snapshot()));

        assert!(link.lost > 0, "seed {seed}: link never misbehaved");
        let received = std::fs::read(received_path(&ground, "hk", "telemetry.bin")).unwrap();
        assert_eq!(received.len(), data.len(), "seed {seed}: size mismatch");
        assert!(received == data, "seed {seed}: content mismatch");
        let _ = std::fs::remove_dir_all(&base);
    }
}

/// Several files to one peer at once, with long-form metadata.
#[test]
fn test_concurrent_transfers_with_long_metadata() {
    let base = fresh_dir("many");
    let sat = Node::sat(&base, |s| {
        s.meta_form = MetaForm::Long;
        s.burst_chunks = 4;
    });
    let ground = Node::ground(&base, |_| {});
    let files: Vec<(String, Vec<u8>)> = (0..5u64)
        .map(|i| (format!("part{i}.dat"), payload(700 * (i as usize + 1), i + 100)))
        .collect();

    let start = Instant::now();
    for (file, bytes) in &files {
        let source = sat.stage(file, bytes);
        sat.manager
            .enqueue(GROUND, AgentName::new("logs").unwrap(), &source, start)
            .unwrap();
    }
    assert_eq!(sat.manager.len(), 5);

    run_until_idle(&sat, &ground, &mut Link::lossy(99), start, 5_000).expect("transfers did not finish");
    for (file, bytes) in &files {
        assert_eq!(&std::fs::read(received_path(&ground, "logs", file)).unwrap(), bytes);
    }
    let _ = std::fs::remove_dir_all(&base);
}

/// Pull flow: the receiver asks for the queue before the sender pushes.
#[test]
fn test_queue_discovery_drives_transfer() {
    let base = fresh_dir("discovery");
    let sat = Node::sat(&base, |_| {});
    let ground = Node::ground(&base, |_| {});
    let data = payload(1_500, 5);
    let start = Instant::now();
    let key = sat
        .manager
        .enqueue(
            GROUND,
            AgentName::new("camera").unwrap(),
            &sat.stage("thumb.jpg", &data),
            start,
        )
        .unwrap();

    let mut link = Link::perfect();
    let ask = ground.manager.request_queue(SAT).unwrap();
    exchange(&sat, &ground, &mut link, Vec::new(), vec![ask], start);

    // Queue → ReqMeta → Meta → ReqData → first burst, all without a sweep
    let summary = ground.manager.get(TxKey::incoming(SAT, key.tx_id)).unwrap();
    assert_eq!(summary.file_name.as_deref(), Some("thumb.jpg"));
    assert!(summary.bytes_done > 0);
    assert_eq!(sat.manager.get(key).unwrap().state, TxState::AwaitingComplete);

    run_until_idle(&sat, &ground, &mut link, start, 100).expect("transfer did not finish");
    assert_eq!(std::fs::read(received_path(&ground, "camera", "thumb.jpg")).unwrap(), data);
    let _ = std::fs::remove_dir_all(&base);
}

/// Files dropped into the outgoing tree are picked up by the scan.
#[test]
fn test_outgoing_directory_scan() -> anyhow::Result<()> {
    let base = fresh_dir("scan");
    let sat = Node::sat(&base, |_| {});
    let ground = Node::ground(&base, |_| {});
    let dir = sat.manager.layout().outgoing_dir(&name("ground")).join("payload");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("a.txt"), b"first")?;
    std::fs::write(dir.join("b.txt"), b"second")?;
    std::fs::write(dir.join("empty.txt"), b"")?;

    let start = Instant::now();
    assert_eq!(sat.manager.load_outgoing(start)?.len(), 3);
    let status = serde_json::to_value(sat.manager.snapshot())?;
    assert_eq!(status.as_array().map(Vec::len), Some(3));
    assert_eq!(status[0]["state"], "meta_queued");

    run_until_idle(&sat, &ground, &mut Link::perfect(), start, 100).expect("transfers did not finish");
    assert_eq!(std::fs::read(received_path(&ground, "payload", "a.txt"))?, b"first");
    assert_eq!(std::fs::read(received_path(&ground, "payload", "b.txt"))?, b"second");
    assert_eq!(std::fs::read(received_path(&ground, "payload", "empty.txt"))?, b"");
    assert!(std::fs::read_dir(&dir)?.next().is_none(), "outgoing directory should be empty");
    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

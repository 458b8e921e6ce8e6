use crate::*;

use uplink_core::{AgentName, FileName};
use uplink_services::{Checkpoint, TxKey, TxState};

// ══════════════════════════════════════════════════════════════════════════════
//  Restart: resume an incoming transfer from its checkpoint
// ══════════════════════════════════════════════════════════════════════════════

/// The receiver goes down mid-transfer. While it is away the sender keeps
/// transmitting into the void. A fresh receiver on the same storage root
/// resumes from the checkpoint and only asks for what is missing.
#[test]
fn test_resume_after_receiver_restart() {
    let base = fresh_dir("resume");
    let sat = Node::sat(&base, |s| s.burst_chunks = 4);
    let ground = Node::ground(&base, |_| {});
    let data = payload(10_000, 11);
    let source = sat.stage("science.dat", &data);

    let mut now = Instant::now();
    let key = sat
        .manager
        .enqueue(GROUND, AgentName::new("payload").unwrap(), &source, now)
        .unwrap();
    let incoming = TxKey::incoming(SAT, key.tx_id);
    let mut link = Link::perfect();
    for _ in 0..3 {
        step(&sat, &ground, &mut link, now);
        now += STEP;
    }
    let before = ground.manager.get(incoming).unwrap();
    assert_eq!(before.state, TxState::Receiving);
    assert!(before.bytes_done > 0 && before.bytes_done < 10_000);

    // crash: checkpoint and drop everything held in memory
    assert_eq!(ground.manager.shutdown(now), 1);
    drop(ground);
    let checkpoint_path = base
        .join("ground")
        .join("sat")
        .join("temp")
        .join(format!("in_{}.meta", key.tx_id));
    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert_eq!(checkpoint.file_size, 10_000);
    assert_eq!(
        checkpoint.holes.iter().map(|h| h.len()).sum::<u64>(),
        10_000 - before.bytes_done
    );

    // the sender keeps going with nobody listening
    for _ in 0..10 {
        drop(sat.manager.poll(now));
        now += STEP;
    }

    let mut ground = Node::ground(&base, |_| {});
    assert_eq!(ground.manager.resume(now).unwrap(), 1);
    let resumed = ground.manager.get(incoming).unwrap();
    assert_eq!(resumed.bytes_done, before.bytes_done);
    assert_eq!(resumed.file_name.as_deref(), Some("science.dat"));

    run_until_idle(&sat, &ground, &mut link, now, 500).expect("resumed transfer did not finish");
    let dest = ground.manager.layout().incoming_path(
        &name("sat"),
        &AgentName::new("payload").unwrap(),
        &FileName::new("science.dat").unwrap(),
    );
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!checkpoint_path.exists(), "checkpoint should be removed on completion");
    assert!(ground
        .drain_events()
        .contains(&TransferEvent::Completed { key: incoming, path: dest }));
    let _ = std::fs::remove_dir_all(&base);
}

/// A checkpoint whose data file has vanished restarts the transfer from
/// zero instead of trusting stale progress.
#[test]
fn test_resume_without_temp_file_refetches_everything() {
    let base = fresh_dir("resume-lost");
    let sat = Node::sat(&base, |s| s.burst_chunks = 2);
    let ground = Node::ground(&base, |_| {});
    let data = payload(3_000, 12);
    let mut now = Instant::now();
    let key = sat
        .manager
        .enqueue(
            GROUND,
            AgentName::new("payload").unwrap(),
            &sat.stage("lost.dat", &data),
            now,
        )
        .unwrap();
    let mut link = Link::perfect();
    for _ in 0..2 {
        step(&sat, &ground, &mut link, now);
        now += STEP;
    }
    ground.manager.shutdown(now);
    drop(ground);
    let temp = base
        .join("ground")
        .join("sat")
        .join("temp")
        .join(format!("in_{}", key.tx_id));
    std::fs::remove_file(&temp).unwrap();

    let ground = Node::ground(&base, |_| {});
    assert_eq!(ground.manager.resume(now).unwrap(), 1);
    let summary = ground.manager.get(TxKey::incoming(SAT, key.tx_id)).unwrap();
    assert_eq!(summary.bytes_done, 0);
    assert_eq!(summary.missing_bytes, 3_000);

    run_until_idle(&sat, &ground, &mut link, now, 500).expect("transfer did not finish");
    let dest = ground.manager.layout().incoming_path(
        &name("sat"),
        &AgentName::new("payload").unwrap(),
        &FileName::new("lost.dat").unwrap(),
    );
    assert_eq!(std::fs::read(dest).unwrap(), data);
    let _ = std::fs::remove_dir_all(&base);
}

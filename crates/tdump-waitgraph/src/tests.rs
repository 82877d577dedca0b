use std::sync::Arc;

use tdump_types::{
    HealthLevel, LockMention, MonitorMap, MonitorRole, ThreadDumpSnapshot, ThreadRecord,
    ThreadState, VendorFormat,
};

use crate::{FinalizeOptions, Finalizer, LockGraph, NoAdvice};

fn mention(id: &str, role: MonitorRole) -> LockMention {
    LockMention {
        monitor_id: id.to_string(),
        class_name: Some("java.lang.Object".to_string()),
        role,
        owner_hint: None,
    }
}

/// Build a snapshot and the matching monitor map from per-thread mentions.
fn make_dump(threads: Vec<(&str, Vec<LockMention>)>) -> (ThreadDumpSnapshot, MonitorMap) {
    let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
    let mut monitors = MonitorMap::new();
    for (idx, (name, mentions)) in threads.into_iter().enumerate() {
        let title = format!("\"{name}\" prio=5 tid=0x{idx:x}");
        for m in &mentions {
            monitors.record(&m.monitor_id, m.class_name.as_deref(), m.role, idx, &title);
        }
        let mut record = ThreadRecord::new(name, format!("0x{idx:x}"), title);
        record.mentions = mentions;
        snap.threads.push(record);
    }
    (snap, monitors)
}

#[test]
fn second_owner_claim_wins() {
    let (mut snap, monitors) = make_dump(vec![
        ("first", vec![mention("0x1", MonitorRole::Owner)]),
        ("second", vec![mention("0x1", MonitorRole::Owner)]),
    ]);
    let report = LockGraph::link(&mut snap, &monitors);

    assert_eq!(report.owner_conflicts, 1);
    assert_eq!(snap.lock_by_id("0x1").and_then(|l| l.owner), Some(1));
    assert!(snap.threads[0].owned_locks.is_empty());
    assert_eq!(snap.threads[1].owned_locks.len(), 1);
}

#[test]
fn blocked_on_own_lock_is_discarded() {
    let (mut snap, monitors) = make_dump(vec![(
        "reacquire",
        vec![
            mention("0x1", MonitorRole::Owner),
            mention("0x1", MonitorRole::Waiter),
        ],
    )]);
    let report = LockGraph::link(&mut snap, &monitors);

    assert_eq!(report.self_blocks_discarded, 1);
    assert_eq!(snap.threads[0].blocked_for, None);
    assert!(snap.lock_by_id("0x1").is_some_and(|l| l.blockers.is_empty()));
}

#[test]
fn lock_released_by_wait_is_not_owned() {
    let (mut snap, monitors) = make_dump(vec![(
        "waiter",
        vec![
            mention("0x1", MonitorRole::Sleeper),
            mention("0x1", MonitorRole::Owner),
        ],
    )]);
    let report = LockGraph::link(&mut snap, &monitors);

    assert_eq!(report.released_while_waiting, 1);
    assert!(snap.threads[0].owned_locks.is_empty());
    assert_eq!(snap.threads[0].sleeping_on.len(), 1);
    assert_eq!(snap.lock_by_id("0x1").map(|l| l.sleepers.clone()), Some(vec![0]));
}

#[test]
fn owner_hint_fills_unknown_owner() {
    let mut blocked = mention("java.lang.Object@1b6d3586", MonitorRole::Waiter);
    blocked.owner_hint = Some("holder".to_string());
    let (mut snap, monitors) = make_dump(vec![("worker", vec![blocked]), ("holder", vec![])]);
    let report = LockGraph::link(&mut snap, &monitors);

    assert_eq!(report.owners_from_hints, 1);
    let lock = snap.lock_by_id("java.lang.Object@1b6d3586").expect("lock");
    assert_eq!(lock.owner, Some(1));
    assert_eq!(lock.blockers, vec![0]);
    assert_eq!(snap.threads[0].state, ThreadState::Blocked);
}

#[test]
fn finalize_marks_two_thread_deadlock() {
    let (mut snap, monitors) = make_dump(vec![
        (
            "A",
            vec![
                mention("0x1", MonitorRole::Waiter),
                mention("0x2", MonitorRole::Owner),
            ],
        ),
        (
            "B",
            vec![
                mention("0x2", MonitorRole::Waiter),
                mention("0x1", MonitorRole::Owner),
            ],
        ),
        ("idle", vec![]),
    ]);
    snap.threads[2].state = ThreadState::Waiting;

    let finalizer = Finalizer::new(&FinalizeOptions::default(), Arc::new(NoAdvice));
    finalizer.finalize(&mut snap, monitors);

    let chain = snap.deadlock.as_ref().expect("deadlock");
    let mut names: Vec<&str> = chain
        .threads
        .iter()
        .map(|&t| snap.threads[t].name.as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(snap.threads[0].health, HealthLevel::Fatal);
    assert_eq!(snap.threads[1].health, HealthLevel::Fatal);
    assert_eq!(snap.threads[2].health, HealthLevel::Ignore);
    assert_eq!(snap.health, HealthLevel::Fatal);
    assert_eq!(snap.health_order, vec![0, 1, 2]);

    assert_eq!(snap.counts.total, 3);
    assert_eq!(snap.counts.blocked, 2);
    assert_eq!(snap.counts.waiting, 1);
    assert_eq!(snap.counts.locking, 2);
    assert!(!snap.blocking_tree.is_empty());

    for lock in &snap.locks {
        assert!(lock.owner.is_some());
    }
}

#[test]
fn finalize_without_contention_is_quiet() {
    let (mut snap, monitors) = make_dump(vec![
        ("main", vec![mention("0x1", MonitorRole::Owner)]),
        ("worker", vec![mention("0x2", MonitorRole::Sleeper)]),
    ]);
    let finalizer = Finalizer::new(&FinalizeOptions::default(), Arc::new(NoAdvice));
    finalizer.finalize(&mut snap, monitors);

    assert!(!snap.has_deadlock());
    assert!(snap.blocking_tree.is_empty());
    assert_eq!(snap.counts.sleeping, 1);
    assert_eq!(snap.counts.locking, 1);
    assert_eq!(snap.health, HealthLevel::Ignore);
}

#[test]
fn finalizer_clones_share_the_advisory_pool() {
    let finalizer = Finalizer::new(&FinalizeOptions::default(), Arc::new(NoAdvice));
    let copies: Vec<Finalizer> = (0..4).map(|_| finalizer.clone()).collect();
    assert!(copies.iter().all(|c| Arc::ptr_eq(&c.pool, &finalizer.pool)));
    assert_eq!(Arc::strong_count(&finalizer.pool), 5);

    let (mut snap, monitors) = make_dump(vec![("main", vec![mention("0x1", MonitorRole::Owner)])]);
    copies[3].finalize(&mut snap, monitors);
    assert_eq!(snap.counts.locking, 1);
}

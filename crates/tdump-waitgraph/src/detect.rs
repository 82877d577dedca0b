//! Deadlock detection over a linked [`LockGraph`].
//!
//! Starting from every owned lock whose owner is itself blocked, the
//! detector follows "blocked on a lock held by" links until it either runs
//! out of links or reaches a thread it already visited. A revisit is a
//! circular wait; the chain is then trimmed to the loop and every link of
//! the loop is verified before it is reported.

use tdump_types::{Advisory, DeadlockChain, LockIdx, ThreadDumpSnapshot, ThreadIdx};
use tracing::info;

use crate::LockGraph;

// ── Public API ──────────────────────────────────────────────────

/// Find the first circular wait in the graph, if any.
pub fn find_deadlock(graph: &LockGraph<'_>) -> Option<DeadlockChain> {
    let snapshot = graph.snapshot();
    (0..snapshot.locks.len()).find_map(|lock| {
        let stack = follow_from(graph, lock)?;
        let threads = sanitize_chain(graph, &stack)?;
        Some(build_chain(graph, threads))
    })
}

/// Mark every thread of `chain` fatal, attach the deadlock advisory and store
/// the chain on the snapshot.
pub fn mark_deadlock(snapshot: &mut ThreadDumpSnapshot, chain: DeadlockChain) {
    for &thread in &chain.threads {
        snapshot.threads[thread].add_advisory(Advisory::deadlock());
    }
    info!(
        dump = snapshot.index,
        threads = chain.threads.len(),
        "deadlock detected"
    );
    snapshot.deadlock = Some(chain);
}

// ── Chain walk ──────────────────────────────────────────────────

/// Walk from the owner of `lock` along blocked-for/owner links.
///
/// Returns the visited threads with the revisited thread pushed a second
/// time at the end, or `None` when the walk ends without closing a loop.
fn follow_from(graph: &LockGraph<'_>, lock: LockIdx) -> Option<Vec<ThreadIdx>> {
    let owner = graph.owner(lock)?;
    let waits_for = graph.blocked_for(owner)?;
    if waits_for == lock || graph.blockers(lock).is_empty() {
        return None;
    }

    let mut stack = vec![owner];
    let mut current = waits_for;
    loop {
        let next = graph.owner(current)?;
        let next_waits_for = graph.blocked_for(next)?;
        if graph.owned(next).is_empty() {
            return None;
        }
        // the owner is queued on its own lock: a mid-reacquire artifact
        if graph.blockers(current).contains(&next) {
            return None;
        }
        if stack.contains(&next) {
            stack.push(next);
            return Some(stack);
        }
        stack.push(next);
        current = next_waits_for;
    }
}

/// Trim a walk to its minimal loop and verify every link of it.
///
/// The walk ends with a thread that already appeared earlier; the loop starts
/// at that first appearance. Threads before it led into the loop but are not
/// part of the circular wait.
fn sanitize_chain(graph: &LockGraph<'_>, stack: &[ThreadIdx]) -> Option<Vec<ThreadIdx>> {
    let (&closing, walk) = stack.split_last()?;
    let start = walk.iter().position(|&t| t == closing)?;
    let cycle = &walk[start..];
    if cycle.len() < 2 {
        return None;
    }
    let linked = cycle
        .iter()
        .zip(cycle.iter().cycle().skip(1))
        .all(|(&from, &to)| graph.waits_on(from) == Some(to));
    linked.then(|| cycle.to_vec())
}

fn build_chain(graph: &LockGraph<'_>, threads: Vec<ThreadIdx>) -> DeadlockChain {
    let snapshot = graph.snapshot();
    let locks: Vec<LockIdx> = threads
        .iter()
        .filter_map(|&t| graph.blocked_for(t))
        .collect();

    let mut narrative = String::from("Found one Java-level deadlock:");
    for (i, (&thread, &lock)) in threads.iter().zip(&locks).enumerate() {
        let holder = threads[(i + 1) % threads.len()];
        narrative.push_str(&format!(
            "\n\"{}\" is waiting to lock {} which is held by \"{}\"",
            snapshot.threads[thread].name,
            snapshot.locks[lock].describe(),
            snapshot.threads[holder].name,
        ));
    }

    DeadlockChain {
        threads,
        locks,
        narrative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdump_types::{HealthLevel, LockRecord, ThreadRecord, ThreadState, VendorFormat};

    /// Build a linked snapshot from `(name, owns, blocked_on)` triples.
    fn make_snapshot(threads: &[(&str, &[&str], Option<&str>)]) -> ThreadDumpSnapshot {
        let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
        for (i, (name, _, _)) in threads.iter().enumerate() {
            snap.threads
                .push(ThreadRecord::new(*name, format!("0x{i}"), format!("\"{name}\"")));
        }
        for (i, (_, owns, blocked_on)) in threads.iter().enumerate() {
            for id in owns.iter() {
                let lock = snap.resolve_lock(id, Some("java.lang.Object"));
                snap.locks[lock].owner = Some(i);
                snap.threads[i].owned_locks.push(lock);
            }
            if let Some(id) = blocked_on {
                let lock = snap.resolve_lock(id, Some("java.lang.Object"));
                snap.threads[i].blocked_for = Some(lock);
                snap.threads[i].state = ThreadState::Blocked;
                snap.locks[lock].blockers.push(i);
            }
        }
        snap
    }

    fn lock<'a>(snap: &'a ThreadDumpSnapshot, id: &str) -> &'a LockRecord {
        snap.lock_by_id(id).expect("lock exists")
    }

    #[test]
    fn two_thread_cycle_is_found() {
        let snap = make_snapshot(&[("A", &["0x2"], Some("0x1")), ("B", &["0x1"], Some("0x2"))]);
        let chain = find_deadlock(&LockGraph::new(&snap)).expect("deadlock");
        let mut members = chain.threads.clone();
        members.sort();
        assert_eq!(members, vec![0, 1]);
        assert_eq!(chain.locks.len(), 2);
        assert!(chain.narrative.contains("\"A\" is waiting to lock <0x1>"));
        assert!(chain.narrative.contains("which is held by \"B\""));
    }

    #[test]
    fn mark_deadlock_sets_fatal() {
        let mut snap =
            make_snapshot(&[("A", &["0x2"], Some("0x1")), ("B", &["0x1"], Some("0x2"))]);
        let chain = find_deadlock(&LockGraph::new(&snap)).expect("deadlock");
        mark_deadlock(&mut snap, chain);
        assert!(snap.has_deadlock());
        for thread in &snap.threads {
            assert_eq!(thread.health, HealthLevel::Fatal);
            assert!(thread.advisories.iter().any(|a| a.name == "Deadlock"));
        }
    }

    #[test]
    fn self_block_is_not_a_deadlock() {
        let mut snap = make_snapshot(&[("A", &["0x1"], None), ("B", &[], Some("0x1"))]);
        // A appears blocked on the lock it holds
        let l = snap.lock_index["0x1"];
        snap.threads[0].blocked_for = Some(l);
        snap.locks[l].blockers.push(0);
        assert_eq!(find_deadlock(&LockGraph::new(&snap)), None);
    }

    #[test]
    fn plain_contention_is_not_a_deadlock() {
        let snap = make_snapshot(&[
            ("A", &["0x1"], None),
            ("B", &["0x2"], Some("0x1")),
            ("C", &[], Some("0x2")),
        ]);
        assert_eq!(find_deadlock(&LockGraph::new(&snap)), None);
    }

    #[test]
    fn three_thread_cycle_excludes_lead_in_thread() {
        // D waits on A's lock but is not part of the loop A -> B -> C -> A
        let snap = make_snapshot(&[
            ("A", &["0xa"], Some("0xb")),
            ("B", &["0xb"], Some("0xc")),
            ("C", &["0xc"], Some("0xa")),
            ("D", &["0xd"], Some("0xa")),
            ("E", &[], Some("0xd")),
        ]);
        let chain = find_deadlock(&LockGraph::new(&snap)).expect("deadlock");
        let mut members = chain.threads.clone();
        members.sort();
        assert_eq!(members, vec![0, 1, 2]);

        let graph = LockGraph::new(&snap);
        for (i, &t) in chain.threads.iter().enumerate() {
            let next = chain.threads[(i + 1) % chain.threads.len()];
            assert_eq!(graph.waits_on(t), Some(next));
        }
    }

    #[test]
    fn lead_in_walk_is_trimmed() {
        let snap = make_snapshot(&[
            ("A", &["0xa"], Some("0xb")),
            ("B", &["0xb"], Some("0xa")),
            ("D", &["0xd"], Some("0xa")),
        ]);
        let graph = LockGraph::new(&snap);
        // walk D -> A -> B -> A
        let trimmed = sanitize_chain(&graph, &[2, 0, 1, 0]).expect("loop");
        assert_eq!(trimmed, vec![0, 1]);
        assert_eq!(lock(&snap, "0xd").owner, Some(2));
    }

    #[test]
    fn unverifiable_walk_is_rejected() {
        let snap = make_snapshot(&[("A", &["0xa"], Some("0xb")), ("B", &["0xb"], None)]);
        let graph = LockGraph::new(&snap);
        assert_eq!(sanitize_chain(&graph, &[0, 1, 0]), None);
    }
}

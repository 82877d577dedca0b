//! Lock graph, deadlock detection and blocking-chain trees for parsed dumps.
//!
//! The segmenter hands over a [`ThreadDumpSnapshot`] whose threads carry raw
//! lock mentions, plus the [`MonitorMap`] gathered while reading stacks.
//! [`Finalizer::finalize`] turns that into linked thread/lock arenas, a
//! deadlock verdict, the blocking tree, advisories, counts and health order.

use std::sync::Arc;

use tdump_types::{LockIdx, MonitorMap, MonitorRole, ThreadDumpSnapshot, ThreadIdx, ThreadState};
use tracing::debug;

pub mod advisory;
pub mod blocking;
pub mod detect;

pub use advisory::{Advisor, AdvisoryPool, NoAdvice};
pub use blocking::BlockingTreeBuilder;

// ── Lock graph ──────────────────────────────────────────────────

/// What happened while linking one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub locks: usize,
    /// Locks claimed by a second thread; the later claim won.
    pub owner_conflicts: usize,
    /// `locked` mentions dropped because the same thread waits on that monitor.
    pub released_while_waiting: usize,
    /// Blocked-for mentions dropped because the thread already owns the lock.
    pub self_blocks_discarded: usize,
    /// Owners filled in from an inline `owned by "..."` hint.
    pub owners_from_hints: usize,
}

/// Read-only view over the linked thread and lock arenas of a snapshot.
#[derive(Clone, Copy)]
pub struct LockGraph<'a> {
    snapshot: &'a ThreadDumpSnapshot,
}

impl<'a> LockGraph<'a> {
    pub fn new(snapshot: &'a ThreadDumpSnapshot) -> Self {
        Self { snapshot }
    }

    /// Link the mentions captured in each thread into ownership, blocked-for
    /// and sleeper relations.
    ///
    /// Every monitor in `monitors` gets a lock record even if no mention
    /// survives linking. Ownership is resolved for all threads before any
    /// blocked-for mention is looked at.
    pub fn link(snapshot: &mut ThreadDumpSnapshot, monitors: &MonitorMap) -> LinkReport {
        let mut report = LinkReport::default();

        for (id, entry) in monitors.iter() {
            snapshot.resolve_lock(id, entry.class_name.as_deref());
        }

        for thread in 0..snapshot.threads.len() {
            let mentions = std::mem::take(&mut snapshot.threads[thread].mentions);
            for mention in mentions.iter().filter(|m| m.role == MonitorRole::Owner) {
                let waits_on_it = mentions
                    .iter()
                    .any(|m| m.role == MonitorRole::Sleeper && m.monitor_id == mention.monitor_id);
                if waits_on_it {
                    report.released_while_waiting += 1;
                    continue;
                }
                let lock = snapshot.resolve_lock(&mention.monitor_id, mention.class_name.as_deref());
                if set_owner(snapshot, lock, thread) {
                    report.owner_conflicts += 1;
                }
            }
            snapshot.threads[thread].mentions = mentions;
        }

        for thread in 0..snapshot.threads.len() {
            let mentions = std::mem::take(&mut snapshot.threads[thread].mentions);
            for mention in &mentions {
                match mention.role {
                    MonitorRole::Owner => {}
                    MonitorRole::Waiter => {
                        let lock =
                            snapshot.resolve_lock(&mention.monitor_id, mention.class_name.as_deref());
                        if snapshot.threads[thread].owns(lock) {
                            report.self_blocks_discarded += 1;
                            continue;
                        }
                        let record = &mut snapshot.threads[thread];
                        match record.blocked_for {
                            None => record.blocked_for = Some(lock),
                            Some(existing) if existing != lock => continue,
                            Some(_) => {}
                        }
                        if record.state == ThreadState::Running {
                            record.state = ThreadState::Blocked;
                        }
                        push_unique(&mut snapshot.locks[lock].blockers, thread);

                        if snapshot.locks[lock].owner.is_none()
                            && let Some(hint) = &mention.owner_hint
                            && let Some(owner) = snapshot.find_thread(hint)
                            && owner != thread
                        {
                            set_owner(snapshot, lock, owner);
                            report.owners_from_hints += 1;
                        }
                    }
                    MonitorRole::Sleeper => {
                        let lock =
                            snapshot.resolve_lock(&mention.monitor_id, mention.class_name.as_deref());
                        push_unique(&mut snapshot.threads[thread].sleeping_on, lock);
                        push_unique(&mut snapshot.locks[lock].sleepers, thread);
                    }
                }
            }
            snapshot.threads[thread].mentions = mentions;
        }

        report.locks = snapshot.locks.len();
        report
    }

    pub fn snapshot(&self) -> &'a ThreadDumpSnapshot {
        self.snapshot
    }

    pub fn owner(&self, lock: LockIdx) -> Option<ThreadIdx> {
        self.snapshot.locks.get(lock).and_then(|l| l.owner)
    }

    pub fn blocked_for(&self, thread: ThreadIdx) -> Option<LockIdx> {
        self.snapshot.threads.get(thread).and_then(|t| t.blocked_for)
    }

    pub fn blockers(&self, lock: LockIdx) -> &'a [ThreadIdx] {
        self.snapshot
            .locks
            .get(lock)
            .map(|l| l.blockers.as_slice())
            .unwrap_or(&[])
    }

    pub fn owned(&self, thread: ThreadIdx) -> &'a [LockIdx] {
        self.snapshot
            .threads
            .get(thread)
            .map(|t| t.owned_locks.as_slice())
            .unwrap_or(&[])
    }

    /// The thread holding the lock `thread` is blocked on.
    pub fn waits_on(&self, thread: ThreadIdx) -> Option<ThreadIdx> {
        self.blocked_for(thread).and_then(|lock| self.owner(lock))
    }
}

/// Make `thread` the owner of `lock`. Returns true if another thread lost it.
fn set_owner(snapshot: &mut ThreadDumpSnapshot, lock: LockIdx, thread: ThreadIdx) -> bool {
    let previous = snapshot.locks[lock].owner.replace(thread);
    let conflict = match previous {
        Some(prev) if prev != thread => {
            snapshot.threads[prev].owned_locks.retain(|&l| l != lock);
            true
        }
        _ => false,
    };
    push_unique(&mut snapshot.threads[thread].owned_locks, lock);
    conflict
}

fn push_unique(list: &mut Vec<usize>, value: usize) {
    if !list.contains(&value) {
        list.push(value);
    }
}

// ── Finalization ────────────────────────────────────────────────

/// Knobs for the post-segmentation pass.
#[derive(Debug, Clone)]
pub struct FinalizeOptions {
    /// Worker threads used for advisory evaluation.
    pub advisory_workers: usize,
    /// Blocked threads above which a monitor is flagged as "a lot of waiting".
    pub lot_of_waiting_threshold: u32,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            advisory_workers: 6,
            lot_of_waiting_threshold: 5,
        }
    }
}

/// Runs every post-segmentation step over a snapshot, in order.
///
/// Clones share one advisory pool, so parsing many files at once does not
/// spawn a pool per file.
#[derive(Clone)]
pub struct Finalizer {
    advisor: Arc<dyn Advisor>,
    pool: Arc<AdvisoryPool>,
    tree: BlockingTreeBuilder,
}

impl Finalizer {
    pub fn new(options: &FinalizeOptions, advisor: Arc<dyn Advisor>) -> Self {
        Self {
            advisor,
            pool: Arc::new(AdvisoryPool::new(options.advisory_workers)),
            tree: BlockingTreeBuilder::new(options.lot_of_waiting_threshold),
        }
    }

    /// Link locks, detect a deadlock, build the blocking tree, evaluate
    /// advisories and settle counts and health. `monitors` is consumed.
    pub fn finalize(&self, snapshot: &mut ThreadDumpSnapshot, monitors: MonitorMap) {
        let report = LockGraph::link(snapshot, &monitors);

        let chain = detect::find_deadlock(&LockGraph::new(snapshot));
        if let Some(chain) = chain {
            detect::mark_deadlock(snapshot, chain);
        }

        snapshot.blocking_tree = self.tree.build(snapshot, &monitors);

        // all advisories settle before health is ranked
        self.pool.evaluate(snapshot, self.advisor.as_ref());

        snapshot.recount();
        snapshot.rank_health();

        debug!(
            dump = snapshot.index,
            threads = snapshot.threads.len(),
            locks = report.locks,
            owner_conflicts = report.owner_conflicts,
            self_blocks = report.self_blocks_discarded,
            deadlock = snapshot.has_deadlock(),
            "finalized snapshot"
        );
    }
}

#[cfg(test)]
mod tests;

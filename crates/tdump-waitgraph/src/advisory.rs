//! Advisory evaluation for finalized threads and locks.
//!
//! The rules themselves are supplied by the caller through [`Advisor`]. One
//! evaluation runs per thread and per lock on a bounded rayon pool; the
//! results are collected before anything is written back, so health ranking
//! always sees every advisory.

use rayon::prelude::*;
use tdump_types::{Advisory, LockRecord, ThreadDumpSnapshot, ThreadRecord};
use tracing::warn;

use crate::LockGraph;

/// Pattern-matching collaborator that inspects finished records.
///
/// Implementations only read; the graph is fully linked when they run.
pub trait Advisor: Send + Sync {
    fn evaluate_thread(&self, thread: &ThreadRecord, graph: &LockGraph<'_>) -> Vec<Advisory>;

    fn evaluate_lock(&self, lock: &LockRecord, graph: &LockGraph<'_>) -> Vec<Advisory>;
}

/// An advisor with no rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdvice;

impl Advisor for NoAdvice {
    fn evaluate_thread(&self, _thread: &ThreadRecord, _graph: &LockGraph<'_>) -> Vec<Advisory> {
        Vec::new()
    }

    fn evaluate_lock(&self, _lock: &LockRecord, _graph: &LockGraph<'_>) -> Vec<Advisory> {
        Vec::new()
    }
}

/// Worker pool for advisory evaluation.
pub struct AdvisoryPool {
    pool: Option<rayon::ThreadPool>,
}

impl AdvisoryPool {
    /// Build a pool of `workers` threads. If the pool cannot be created,
    /// evaluation runs on the calling thread instead.
    pub fn new(workers: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("tdump-advisory-{i}"))
            .build();
        match pool {
            Ok(pool) => Self { pool: Some(pool) },
            Err(e) => {
                warn!(error = %e, "advisory pool unavailable, evaluating sequentially");
                Self { pool: None }
            }
        }
    }

    /// Evaluate every thread and lock, then attach the results.
    ///
    /// Health of each record becomes the worst of its current health and the
    /// health of its new advisories.
    pub fn evaluate(&self, snapshot: &mut ThreadDumpSnapshot, advisor: &dyn Advisor) {
        let (thread_results, lock_results) = {
            let graph = LockGraph::new(snapshot);
            let run = || {
                let threads: Vec<Vec<Advisory>> = snapshot
                    .threads
                    .par_iter()
                    .map(|t| advisor.evaluate_thread(t, &graph))
                    .collect();
                let locks: Vec<Vec<Advisory>> = snapshot
                    .locks
                    .par_iter()
                    .map(|l| advisor.evaluate_lock(l, &graph))
                    .collect();
                (threads, locks)
            };
            match &self.pool {
                Some(pool) => pool.install(run),
                None => {
                    let threads = snapshot
                        .threads
                        .iter()
                        .map(|t| advisor.evaluate_thread(t, &graph))
                        .collect();
                    let locks = snapshot
                        .locks
                        .iter()
                        .map(|l| advisor.evaluate_lock(l, &graph))
                        .collect();
                    (threads, locks)
                }
            }
        };

        for (thread, advisories) in snapshot.threads.iter_mut().zip(thread_results) {
            for advisory in advisories {
                thread.add_advisory(advisory);
            }
        }
        for (lock, advisories) in snapshot.locks.iter_mut().zip(lock_results) {
            for advisory in advisories {
                lock.add_advisory(advisory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdump_types::{HealthLevel, VendorFormat};

    /// Flags threads whose stack mentions a socket read, and every lock with
    /// a blocker.
    struct SocketAdvisor;

    impl Advisor for SocketAdvisor {
        fn evaluate_thread(&self, thread: &ThreadRecord, _graph: &LockGraph<'_>) -> Vec<Advisory> {
            if thread.stack.contains("socketRead") {
                vec![Advisory::new("Socket Read", HealthLevel::Watch, "reading a socket")]
            } else {
                Vec::new()
            }
        }

        fn evaluate_lock(&self, lock: &LockRecord, _graph: &LockGraph<'_>) -> Vec<Advisory> {
            if lock.blockers.is_empty() {
                Vec::new()
            } else {
                vec![Advisory::new("Contended", HealthLevel::Warning, "has blockers")]
            }
        }
    }

    fn make_snapshot() -> ThreadDumpSnapshot {
        let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
        let mut reader = ThreadRecord::new("reader", "1", "\"reader\"");
        reader.stack = "at java.net.SocketInputStream.socketRead0(Native Method)".to_string();
        snap.threads.push(reader);
        snap.threads.push(ThreadRecord::new("idle", "2", "\"idle\""));
        let lock = snap.resolve_lock("0x1", None);
        snap.locks[lock].blockers.push(1);
        snap
    }

    #[test]
    fn advisories_raise_health_to_the_worst_level() {
        let mut snap = make_snapshot();
        snap.threads[0].add_advisory(Advisory::deadlock());
        AdvisoryPool::new(6).evaluate(&mut snap, &SocketAdvisor);

        assert_eq!(snap.threads[0].health, HealthLevel::Fatal);
        assert_eq!(snap.threads[0].advisories.len(), 2);
        assert_eq!(snap.threads[1].health, HealthLevel::Ignore);
        assert_eq!(snap.locks[0].health, HealthLevel::Warning);
    }

    #[test]
    fn single_worker_pool_gives_same_results() {
        let mut wide = make_snapshot();
        let mut narrow = make_snapshot();
        AdvisoryPool::new(6).evaluate(&mut wide, &SocketAdvisor);
        AdvisoryPool::new(1).evaluate(&mut narrow, &SocketAdvisor);
        let healths = |s: &ThreadDumpSnapshot| s.threads.iter().map(|t| t.health).collect::<Vec<_>>();
        assert_eq!(healths(&wide), healths(&narrow));
        assert_eq!(healths(&wide), vec![HealthLevel::Watch, HealthLevel::Ignore]);
    }

    #[test]
    fn no_advice_leaves_records_untouched() {
        let mut snap = make_snapshot();
        AdvisoryPool::new(2).evaluate(&mut snap, &NoAdvice);
        assert!(snap.threads.iter().all(|t| t.advisories.is_empty()));
        assert!(snap.locks.iter().all(|l| l.advisories.is_empty()));
    }
}

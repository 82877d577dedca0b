//! Blocking-chain tree construction.
//!
//! Turns the flat per-monitor view of a dump (owner, blocked threads) into a
//! forest where a thread that holds a contended monitor sits above the
//! threads waiting for it, and a holder that is itself blocked hangs below
//! the monitor it waits on.

use tdump_types::{
    BlockingNode, BlockingNodeKind, BlockingTree, LockIdx, MonitorMap, ThreadDumpSnapshot,
    ThreadIdx,
};
use tracing::debug;

/// Synchronizer classes whose crowds of waiters are normal pool behavior.
const BENIGN_WAIT_CLASSES: &[&str] = &[
    "java.util.concurrent.locks.AbstractQueuedSynchronizer$ConditionObject",
    "java.util.concurrent.LinkedBlockingQueue",
    "java.util.concurrent.LinkedBlockingDeque",
    "java.util.concurrent.ArrayBlockingQueue",
    "java.util.concurrent.SynchronousQueue",
    "java.util.concurrent.DelayQueue",
    "java.util.concurrent.LinkedTransferQueue",
    "weblogic.kernel.ExecuteThread",
];

/// Builds [`BlockingTree`]s.
#[derive(Debug, Clone)]
pub struct BlockingTreeBuilder {
    lot_of_waiting_threshold: u32,
}

impl BlockingTreeBuilder {
    pub fn new(lot_of_waiting_threshold: u32) -> Self {
        Self {
            lot_of_waiting_threshold,
        }
    }

    /// Build the tree for a linked snapshot.
    ///
    /// Owners come from the snapshot's lock records, blocked threads from
    /// `monitors`.
    pub fn build(&self, snapshot: &ThreadDumpSnapshot, monitors: &MonitorMap) -> BlockingTree {
        let mut work = WorkTree::default();
        let chains = work.flat_pass(snapshot, monitors);
        let guarded = work.merge_chains(&chains);
        let top_merges = work.dedup_top_level();
        let depth_merges = work.dedup_depth();
        let tree = work.finish(snapshot, self);

        debug!(
            chains = chains.len(),
            roots = tree.roots.len(),
            cycle_guarded = guarded,
            top_merges,
            depth_merges,
            "built blocking tree"
        );
        tree
    }

    fn flags_lot_of_waiting(&self, blocked: u32, class_name: Option<&str>) -> bool {
        blocked > self.lot_of_waiting_threshold && !class_name.is_some_and(is_benign_class)
    }
}

fn is_benign_class(class_name: &str) -> bool {
    let dotted = class_name.replace('/', ".");
    BENIGN_WAIT_CLASSES.iter().any(|c| dotted.contains(c))
}

// ── Working arena ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct WorkNode {
    kind: BlockingNodeKind,
    children: Vec<usize>,
    parent: Option<usize>,
}

/// One owner → monitor → blockers chain from the flat pass.
#[derive(Debug, Clone, Copy)]
struct FlatChain {
    lock: LockIdx,
    owner: Option<ThreadIdx>,
    root: usize,
    monitor: usize,
}

#[derive(Debug, Default)]
struct WorkTree {
    nodes: Vec<WorkNode>,
    roots: Vec<usize>,
}

impl WorkTree {
    fn push(&mut self, kind: BlockingNodeKind) -> usize {
        self.nodes.push(WorkNode {
            kind,
            children: Vec::new(),
            parent: None,
        });
        self.nodes.len() - 1
    }

    fn attach(&mut self, parent: usize, child: usize) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    fn thread_of(&self, node: usize) -> Option<ThreadIdx> {
        match self.nodes[node].kind {
            BlockingNodeKind::Thread { thread } => Some(thread),
            BlockingNodeKind::Monitor { .. } => None,
        }
    }

    /// True if `node` lies in the subtree rooted at `ancestor`.
    fn is_within(&self, node: usize, ancestor: usize) -> bool {
        let mut cursor = Some(node);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return true;
            }
            cursor = self.nodes[current].parent;
        }
        false
    }

    /// Owner thread, monitor, blocked threads as leaves, one chain per
    /// contended monitor. Unowned monitors become roots themselves.
    fn flat_pass(&mut self, snapshot: &ThreadDumpSnapshot, monitors: &MonitorMap) -> Vec<FlatChain> {
        let mut chains = Vec::new();
        for (id, entry) in monitors.iter() {
            if entry.waiters.is_empty() {
                continue;
            }
            let Some(&lock) = snapshot.lock_index.get(id) else {
                continue;
            };
            let owner = snapshot.locks[lock].owner;

            let monitor = self.push(BlockingNodeKind::Monitor { lock });
            for waiter in &entry.waiters {
                let leaf = self.push(BlockingNodeKind::Thread {
                    thread: waiter.thread,
                });
                self.attach(monitor, leaf);
            }

            let root = match owner {
                Some(thread) => {
                    let root = self.push(BlockingNodeKind::Thread { thread });
                    self.attach(root, monitor);
                    root
                }
                None => monitor,
            };
            self.roots.push(root);
            chains.push(FlatChain {
                lock,
                owner,
                root,
                monitor,
            });
        }
        chains
    }

    /// Hang each owner's chain under the monitor that owner is blocked on,
    /// replacing the owner's placeholder leaf there.
    ///
    /// Returns the number of moves refused because they would close a loop.
    fn merge_chains(&mut self, chains: &[FlatChain]) -> usize {
        let mut guarded = 0;
        for upper in chains {
            let Some(owner) = upper.owner else { continue };
            if self.nodes[upper.root].parent.is_some() {
                continue;
            }
            for lower in chains {
                if lower.lock == upper.lock {
                    continue;
                }
                let placeholder = self.nodes[lower.monitor]
                    .children
                    .iter()
                    .copied()
                    .find(|&c| self.thread_of(c) == Some(owner) && self.nodes[c].children.is_empty());
                let Some(placeholder) = placeholder else {
                    continue;
                };
                if self.is_within(lower.monitor, upper.root) {
                    guarded += 1;
                    break;
                }
                let siblings = &mut self.nodes[lower.monitor].children;
                siblings.retain(|&c| c != placeholder);
                self.nodes[placeholder].parent = None;
                self.attach(lower.monitor, upper.root);
                self.roots.retain(|&r| r != upper.root);
                break;
            }
        }
        guarded
    }

    /// Merge top-level thread nodes standing for the same thread until a full
    /// scan finds nothing. Returns the number of merges.
    fn dedup_top_level(&mut self) -> usize {
        let mut merges = 0;
        loop {
            let mut merged = false;
            'scan: for i in 0..self.roots.len() {
                for j in (i + 1)..self.roots.len() {
                    let (keep, drop) = (self.roots[i], self.roots[j]);
                    let same = self.thread_of(keep).is_some()
                        && self.thread_of(keep) == self.thread_of(drop);
                    if same
                        && !self.nodes[keep].children.is_empty()
                        && !self.nodes[drop].children.is_empty()
                    {
                        self.adopt_children(keep, drop);
                        self.roots.remove(j);
                        merges += 1;
                        merged = true;
                        break 'scan;
                    }
                }
            }
            if !merged {
                return merges;
            }
        }
    }

    /// Within every monitor node, merge child thread nodes for the same thread.
    fn dedup_depth(&mut self) -> usize {
        let mut merges = 0;
        let mut stack = self.roots.clone();
        let mut visited = vec![false; self.nodes.len()];
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            if self.thread_of(node).is_none() {
                let mut kept: Vec<usize> = Vec::new();
                for child in self.nodes[node].children.clone() {
                    let thread = self.thread_of(child);
                    let first = kept.iter().copied().find(|&k| self.thread_of(k) == thread);
                    match first {
                        Some(first) => {
                            self.adopt_children(first, child);
                            merges += 1;
                        }
                        None => kept.push(child),
                    }
                }
                self.nodes[node].children = kept;
            }
            stack.extend(self.nodes[node].children.iter().copied());
        }
        merges
    }

    fn adopt_children(&mut self, keep: usize, drop: usize) {
        let moved = std::mem::take(&mut self.nodes[drop].children);
        for child in moved {
            self.attach(keep, child);
        }
        self.nodes[drop].parent = None;
    }

    /// Count thread descendants per node and copy the reachable nodes into a
    /// dense arena.
    fn finish(&self, snapshot: &ThreadDumpSnapshot, builder: &BlockingTreeBuilder) -> BlockingTree {
        let mut counts = vec![0u32; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = self.roots.clone();
        let mut visited = vec![false; self.nodes.len()];
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            order.push(node);
            stack.extend(self.nodes[node].children.iter().copied());
        }
        // children always come after their parent in `order`
        for &node in order.iter().rev() {
            counts[node] = self.nodes[node]
                .children
                .iter()
                .map(|&c| counts[c] + u32::from(self.thread_of(c).is_some()))
                .sum();
        }

        let mut tree = BlockingTree::default();
        let mut roots = self.roots.clone();
        roots.sort_by(|a, b| counts[*b].cmp(&counts[*a]));
        for root in roots {
            let idx = self.copy_into(root, snapshot, builder, &counts, &mut tree);
            tree.roots.push(idx);
        }
        tree
    }

    fn copy_into(
        &self,
        node: usize,
        snapshot: &ThreadDumpSnapshot,
        builder: &BlockingTreeBuilder,
        counts: &[u32],
        tree: &mut BlockingTree,
    ) -> usize {
        let kind = self.nodes[node].kind;
        let lot_of_waiting = match kind {
            BlockingNodeKind::Monitor { lock } => builder
                .flags_lot_of_waiting(counts[node], snapshot.locks[lock].class_name.as_deref()),
            BlockingNodeKind::Thread { .. } => false,
        };
        let idx = tree.nodes.len();
        tree.nodes.push(BlockingNode {
            kind,
            label: kind.label(snapshot),
            children: Vec::new(),
            blocked_threads: counts[node],
            lot_of_waiting,
        });
        for &child in &self.nodes[node].children {
            let child_idx = self.copy_into(child, snapshot, builder, counts, tree);
            tree.nodes[idx].children.push(child_idx);
        }
        idx
    }
}

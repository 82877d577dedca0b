use facet::Facet;

use crate::{LockIdx, ThreadDumpSnapshot, ThreadIdx};

/// Labels of thread nodes start with this marker.
pub const THREAD_LABEL_PREFIX: &str = "Thread";

/// What a node of the blocking tree stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
pub enum BlockingNodeKind {
    Thread { thread: ThreadIdx },
    Monitor { lock: LockIdx },
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct BlockingNode {
    pub kind: BlockingNodeKind,
    pub label: String,
    /// Indices into [`BlockingTree::nodes`].
    pub children: Vec<usize>,
    /// Thread nodes anywhere below this one.
    pub blocked_threads: u32,
    /// Monitor with more blocked threads than the configured threshold.
    pub lot_of_waiting: bool,
}

impl BlockingNode {
    pub fn is_thread(&self) -> bool {
        matches!(self.kind, BlockingNodeKind::Thread { .. })
    }
}

/// Forest of blocking chains: thread, the monitor it holds, the threads
/// blocked on that monitor, and so on downwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct BlockingTree {
    pub nodes: Vec<BlockingNode>,
    pub roots: Vec<usize>,
}

impl BlockingTree {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Visit every reachable node depth-first, with its depth.
    pub fn walk(&self, mut visit: impl FnMut(usize, &BlockingNode)) {
        let mut stack: Vec<(usize, usize)> = self.roots.iter().rev().map(|&r| (r, 0)).collect();
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            visit(depth, node);
            stack.extend(node.children.iter().rev().map(|&c| (c, depth + 1)));
        }
    }

    /// Thread nodes reachable from the roots, counting repeats.
    pub fn thread_node_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, node| {
            if node.is_thread() {
                count += 1;
            }
        });
        count
    }

    /// Render the forest as indented text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.walk(|depth, node| {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&node.label);
            if node.blocked_threads > 0 {
                out.push_str(&format!(" [{} blocked]", node.blocked_threads));
            }
            if node.lot_of_waiting {
                out.push_str(" (lot of waiting)");
            }
            out.push('\n');
        });
        out
    }
}

/// Label for a thread node.
fn thread_label(snapshot: &ThreadDumpSnapshot, thread: ThreadIdx) -> String {
    format!("{THREAD_LABEL_PREFIX} \"{}\"", snapshot.threads[thread].name)
}

/// Label for a monitor node.
fn monitor_label(snapshot: &ThreadDumpSnapshot, lock: LockIdx) -> String {
    format!("Monitor {}", snapshot.locks[lock].describe())
}

impl BlockingNodeKind {
    pub fn label(self, snapshot: &ThreadDumpSnapshot) -> String {
        match self {
            BlockingNodeKind::Thread { thread } => thread_label(snapshot, thread),
            BlockingNodeKind::Monitor { lock } => monitor_label(snapshot, lock),
        }
    }
}

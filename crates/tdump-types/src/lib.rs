//! Snapshot types for parsed JVM thread dumps.
//!
//! One [`ThreadDumpSnapshot`] is produced per dump found in an input stream.
//! Threads and locks live in arenas inside the snapshot and refer to each
//! other by index, so the lock graph can be walked in both directions without
//! shared ownership.

use std::collections::HashMap;

use facet::Facet;

mod monitors;
mod tree;

pub use monitors::{MonitorEntry, MonitorHolder, MonitorMap, MonitorRole, normalize_monitor_id};
pub use tree::{BlockingNode, BlockingNodeKind, BlockingTree, THREAD_LABEL_PREFIX};

/// Index of a thread inside [`ThreadDumpSnapshot::threads`].
pub type ThreadIdx = usize;

/// Index of a lock inside [`ThreadDumpSnapshot::locks`].
pub type LockIdx = usize;

// ── Health ──────────────────────────────────────────────────────

/// Ordered severity scale. `Fatal` is the worst.
/// Records start at `Ignore` until an advisory says otherwise.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Ignore,
    Normal,
    Unknown,
    Watch,
    Warning,
    Fatal,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Ignore => "IGNORE",
            HealthLevel::Normal => "NORMAL",
            HealthLevel::Unknown => "UNKNOWN",
            HealthLevel::Watch => "WATCH",
            HealthLevel::Warning => "WARNING",
            HealthLevel::Fatal => "FATAL",
        }
    }

    /// The worst level among `self` and everything in `others`.
    pub fn worst<I: IntoIterator<Item = HealthLevel>>(self, others: I) -> HealthLevel {
        others.into_iter().fold(self, Ord::max)
    }
}

/// A named finding attached to a thread or a lock.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Advisory {
    pub name: String,
    pub health: HealthLevel,
    pub description: String,
}

impl Advisory {
    pub fn new(name: impl Into<String>, health: HealthLevel, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health,
            description: description.into(),
        }
    }

    /// The advisory attached to every thread that takes part in a deadlock.
    pub fn deadlock() -> Self {
        Self::new(
            "Deadlock",
            HealthLevel::Fatal,
            "Thread is part of a circular lock chain and will never make progress",
        )
    }
}

// ── Dump format ─────────────────────────────────────────────────

/// JVM vendor dump formats the parser knows how to classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum VendorFormat {
    HotSpot,
    JRockit,
    Ibm,
    OpenJdk,
    /// Generic JMX / WLST style dumps, also the starting point when nothing
    /// better was detected.
    Fallback,
}

impl VendorFormat {
    pub const ALL: [VendorFormat; 5] = [
        VendorFormat::HotSpot,
        VendorFormat::JRockit,
        VendorFormat::Ibm,
        VendorFormat::OpenJdk,
        VendorFormat::Fallback,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VendorFormat::HotSpot => "hotspot",
            VendorFormat::JRockit => "jrockit",
            VendorFormat::Ibm => "ibm",
            VendorFormat::OpenJdk => "openjdk",
            VendorFormat::Fallback => "fallback",
        }
    }

    /// Parse a user supplied format name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .or_else(|| match name.to_ascii_lowercase().as_str() {
                "sun" | "oracle" => Some(VendorFormat::HotSpot),
                "j9" | "openj9" | "javacore" => Some(VendorFormat::Ibm),
                "jmx" | "wlst" => Some(VendorFormat::Fallback),
                _ => None,
            })
    }
}

// ── Threads ─────────────────────────────────────────────────────

/// Scheduling state of a thread as reported (or implied) by the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ThreadState {
    Running,
    Blocked,
    Waiting,
    Parking,
    TimedWait,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Running => "running",
            ThreadState::Blocked => "blocked",
            ThreadState::Waiting => "waiting",
            ThreadState::Parking => "parking",
            ThreadState::TimedWait => "timed_wait",
        }
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ThreadState::Waiting | ThreadState::Parking | ThreadState::TimedWait
        )
    }
}

/// A monitor reference seen inside a thread's stack, before linking.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct LockMention {
    /// Normalized monitor id.
    pub monitor_id: String,
    pub class_name: Option<String>,
    pub role: MonitorRole,
    /// Name of the owning thread when the dump states it inline.
    pub owner_hint: Option<String>,
}

/// One thread of a dump.
///
/// `(name, tid)` is unique within a snapshot.
#[derive(Debug, Clone, Facet)]
pub struct ThreadRecord {
    /// Filtered display name (quotes and surrounding noise removed).
    pub name: String,
    /// Thread id as printed by the VM, possibly suffixed to keep identities unique.
    pub tid: String,
    pub native_id: Option<String>,
    /// The raw header line(s), spliced if the name spanned lines.
    pub title: String,
    pub state: ThreadState,
    pub priority: Option<u32>,
    pub daemon: bool,
    pub is_gc_thread: bool,
    /// WebLogic marked the thread as STUCK.
    pub stuck: bool,
    /// Execution context id from a thread-context section, if any.
    pub ecid: Option<String>,
    /// Full stack text, one frame or annotation per line.
    pub stack: String,
    pub mentions: Vec<LockMention>,
    pub owned_locks: Vec<LockIdx>,
    pub blocked_for: Option<LockIdx>,
    pub sleeping_on: Vec<LockIdx>,
    pub health: HealthLevel,
    pub advisories: Vec<Advisory>,
}

impl ThreadRecord {
    pub fn new(name: impl Into<String>, tid: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tid: tid.into(),
            native_id: None,
            title: title.into(),
            state: ThreadState::Running,
            priority: None,
            daemon: false,
            is_gc_thread: false,
            stuck: false,
            ecid: None,
            stack: String::new(),
            mentions: Vec::new(),
            owned_locks: Vec::new(),
            blocked_for: None,
            sleeping_on: Vec::new(),
            health: HealthLevel::default(),
            advisories: Vec::new(),
        }
    }

    pub fn owns(&self, lock: LockIdx) -> bool {
        self.owned_locks.contains(&lock)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_for.is_some()
    }

    /// Attach an advisory and raise the thread's health to match.
    pub fn add_advisory(&mut self, advisory: Advisory) {
        self.health = self.health.max(advisory.health);
        if !self.advisories.contains(&advisory) {
            self.advisories.push(advisory);
        }
    }
}

// ── Locks ───────────────────────────────────────────────────────

/// One monitor or ownable synchronizer of a dump.
#[derive(Debug, Clone, Facet)]
pub struct LockRecord {
    pub id: String,
    pub class_name: Option<String>,
    pub owner: Option<ThreadIdx>,
    /// Threads blocked trying to enter, in first-seen order, without duplicates.
    pub blockers: Vec<ThreadIdx>,
    /// Threads in `wait()` / parked on this object.
    pub sleepers: Vec<ThreadIdx>,
    pub health: HealthLevel,
    pub advisories: Vec<Advisory>,
}

impl LockRecord {
    pub fn new(id: impl Into<String>, class_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            class_name,
            owner: None,
            blockers: Vec::new(),
            sleepers: Vec::new(),
            health: HealthLevel::default(),
            advisories: Vec::new(),
        }
    }

    /// `<id> (class)` as used in narratives and tree labels.
    pub fn describe(&self) -> String {
        match &self.class_name {
            Some(class) => format!("<{}> ({})", self.id, class),
            None => format!("<{}>", self.id),
        }
    }

    pub fn add_advisory(&mut self, advisory: Advisory) {
        self.health = self.health.max(advisory.health);
        if !self.advisories.contains(&advisory) {
            self.advisories.push(advisory);
        }
    }
}

// ── Trailing sections ───────────────────────────────────────────

/// One row of a class histogram.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct HistogramEntry {
    pub rank: u32,
    pub instances: u64,
    pub bytes: u64,
    pub class_name: String,
}

/// A class histogram printed after the thread section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct ClassHistogram {
    pub entries: Vec<HistogramEntry>,
    pub total_instances: u64,
    pub total_bytes: u64,
}

// ── Snapshot ────────────────────────────────────────────────────

/// Thread counts per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct DumpCounts {
    pub total: u32,
    pub running: u32,
    pub blocked: u32,
    /// Threads in `Waiting`, `Parking` or `TimedWait`.
    pub waiting: u32,
    /// Threads sleeping on at least one monitor.
    pub sleeping: u32,
    /// Threads owning at least one lock.
    pub locking: u32,
    pub gc: u32,
}

/// A confirmed circular wait.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct DeadlockChain {
    /// Threads in cycle order: each waits for a lock held by the next one,
    /// the last waits for the first.
    pub threads: Vec<ThreadIdx>,
    /// `locks[i]` is the lock `threads[i]` is blocked on.
    pub locks: Vec<LockIdx>,
    pub narrative: String,
}

/// Everything known about one thread dump.
#[derive(Debug, Clone, Facet)]
pub struct ThreadDumpSnapshot {
    /// Position of this dump in its input stream, starting at 0.
    pub index: u32,
    pub format: VendorFormat,
    pub vendor: String,
    pub version: Option<String>,
    pub start_time: Option<String>,
    /// 1-based line number of the dump's first line in the input.
    pub start_line: u64,
    pub threads: Vec<ThreadRecord>,
    pub locks: Vec<LockRecord>,
    /// Monitor id to index into `locks`.
    pub lock_index: HashMap<String, LockIdx>,
    pub counts: DumpCounts,
    pub deadlock: Option<DeadlockChain>,
    /// The dump itself printed a deadlock report.
    pub vendor_reported_deadlock: bool,
    pub heap_info: Option<String>,
    pub class_histogram: Option<ClassHistogram>,
    pub lock_chains: Option<String>,
    pub health: HealthLevel,
    /// Thread indices sorted by descending health, ties in dump order.
    pub health_order: Vec<ThreadIdx>,
    pub blocking_tree: BlockingTree,
}

impl ThreadDumpSnapshot {
    pub fn new(index: u32, format: VendorFormat, start_line: u64) -> Self {
        Self {
            index,
            format,
            vendor: format.name().to_string(),
            version: None,
            start_time: None,
            start_line,
            threads: Vec::new(),
            locks: Vec::new(),
            lock_index: HashMap::new(),
            counts: DumpCounts::default(),
            deadlock: None,
            vendor_reported_deadlock: false,
            heap_info: None,
            class_histogram: None,
            lock_chains: None,
            health: HealthLevel::default(),
            health_order: Vec::new(),
            blocking_tree: BlockingTree::default(),
        }
    }

    pub fn has_deadlock(&self) -> bool {
        self.deadlock.is_some()
    }

    pub fn lock_by_id(&self, id: &str) -> Option<&LockRecord> {
        self.lock_index.get(id).map(|&idx| &self.locks[idx])
    }

    /// First thread whose filtered name is `name`.
    pub fn find_thread(&self, name: &str) -> Option<ThreadIdx> {
        self.threads.iter().position(|t| t.name == name)
    }

    /// Look up the lock record for `id`, creating it on first sight.
    ///
    /// A later mention that carries a class name fills in a missing one.
    pub fn resolve_lock(&mut self, id: &str, class_name: Option<&str>) -> LockIdx {
        if let Some(&idx) = self.lock_index.get(id) {
            let lock = &mut self.locks[idx];
            if lock.class_name.is_none() {
                lock.class_name = class_name.map(str::to_string);
            }
            return idx;
        }
        let idx = self.locks.len();
        self.locks
            .push(LockRecord::new(id, class_name.map(str::to_string)));
        self.lock_index.insert(id.to_string(), idx);
        idx
    }

    /// Threads in descending health order.
    pub fn threads_by_health(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.health_order.iter().map(|&idx| &self.threads[idx])
    }

    /// Recompute [`DumpCounts`] from the thread arena.
    pub fn recount(&mut self) {
        let mut counts = DumpCounts::default();
        for thread in &self.threads {
            counts.total += 1;
            match thread.state {
                ThreadState::Running => counts.running += 1,
                ThreadState::Blocked => counts.blocked += 1,
                ThreadState::Waiting | ThreadState::Parking | ThreadState::TimedWait => {
                    counts.waiting += 1
                }
            }
            if !thread.sleeping_on.is_empty() {
                counts.sleeping += 1;
            }
            if !thread.owned_locks.is_empty() {
                counts.locking += 1;
            }
            if thread.is_gc_thread {
                counts.gc += 1;
            }
        }
        self.counts = counts;
    }

    /// Recompute the overall health and the health-sorted thread view.
    pub fn rank_health(&mut self) {
        let mut order: Vec<ThreadIdx> = (0..self.threads.len()).collect();
        // stable: equal health keeps dump order
        order.sort_by(|&a, &b| self.threads[b].health.cmp(&self.threads[a].health));
        self.health_order = order;
        self.health = HealthLevel::default()
            .worst(self.threads.iter().map(|t| t.health))
            .worst(self.locks.iter().map(|l| l.health));
    }
}

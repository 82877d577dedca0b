use std::collections::BTreeMap;

use facet::Facet;

use crate::ThreadIdx;

// ── Monitor roles ───────────────────────────────────────────────

/// How a thread relates to a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum MonitorRole {
    /// Holds the monitor (`- locked`, `Holding lock`, `entered lock`).
    Owner,
    /// Blocked trying to enter the monitor.
    Waiter,
    /// In `wait()` on the monitor, or parked on it.
    Sleeper,
}

/// A thread as recorded against a monitor.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct MonitorHolder {
    pub thread: ThreadIdx,
    pub title: String,
}

/// Everything the stacks of one dump said about a single monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct MonitorEntry {
    pub class_name: Option<String>,
    pub owner: Option<MonitorHolder>,
    pub waiters: Vec<MonitorHolder>,
    pub sleepers: Vec<MonitorHolder>,
}

/// Per-dump monitor index, built while stacks are read and dropped once the
/// snapshot is finalized.
///
/// Iteration order is by monitor id so every pass over it is deterministic.
#[derive(Debug, Clone, Default)]
pub struct MonitorMap {
    entries: BTreeMap<String, MonitorEntry>,
}

impl MonitorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `thread` has `role` on monitor `id`.
    ///
    /// The owner is last-write-wins; waiters and sleepers are kept once per thread.
    pub fn record(
        &mut self,
        id: &str,
        class_name: Option<&str>,
        role: MonitorRole,
        thread: ThreadIdx,
        title: &str,
    ) {
        let entry = self.entries.entry(normalize_monitor_id(id)).or_default();
        if entry.class_name.is_none() {
            entry.class_name = class_name.map(str::to_string);
        }
        let holder = MonitorHolder {
            thread,
            title: title.to_string(),
        };
        match role {
            MonitorRole::Owner => entry.owner = Some(holder),
            MonitorRole::Waiter => push_unique(&mut entry.waiters, holder),
            MonitorRole::Sleeper => push_unique(&mut entry.sleepers, holder),
        }
    }

    pub fn get(&self, id: &str) -> Option<&MonitorEntry> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MonitorEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct threads sleeping on any monitor.
    pub fn sleeping_threads(&self) -> usize {
        let mut threads: Vec<ThreadIdx> = self
            .entries
            .values()
            .flat_map(|e| e.sleepers.iter().map(|h| h.thread))
            .collect();
        threads.sort_unstable();
        threads.dedup();
        threads.len()
    }
}

fn push_unique(list: &mut Vec<MonitorHolder>, holder: MonitorHolder) {
    if !list.iter().any(|h| h.thread == holder.thread) {
        list.push(holder);
    }
}

/// Canonical form of a monitor id.
///
/// Strips angle brackets, trailing `[fat lock]`-style qualifiers and commas,
/// and lowercases the hex address so ids written by different stack lines of
/// the same dump compare equal.
pub fn normalize_monitor_id(raw: &str) -> String {
    let mut id = raw.trim().trim_end_matches(',').trim_end();
    while let Some(stripped) = id.strip_suffix(']') {
        match stripped.rfind('[') {
            Some(open) => id = stripped[..open].trim_end(),
            None => break,
        }
    }
    let id = id.trim_start_matches('<').trim_end_matches('>');
    match id.rfind('@') {
        Some(at) => format!("{}@{}", &id[..at], id[at + 1..].to_ascii_lowercase()),
        None => id.to_ascii_lowercase(),
    }
}

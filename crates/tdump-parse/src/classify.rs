//! Per-vendor line classification.
//!
//! Each [`VendorFormat`] owns a [`PatternTable`]; a [`Classifier`] points at
//! one table and answers what structural role a line plays. The fallback
//! table also gathers vendor evidence so the segmenter can switch to the
//! right table partway through a dump.

use std::io::{self, BufRead};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tdump_types::{MonitorRole, ThreadState, VendorFormat, normalize_monitor_id};
use tracing::debug;

use crate::reader::LineReader;

// ── Classification results ──────────────────────────────────────

/// A monitor reference pulled out of a lock line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRef {
    /// Normalized id.
    pub id: String,
    pub class_name: Option<String>,
    pub owner_hint: Option<String>,
}

/// Structural role of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    DumpStart,
    ThreadHeader,
    StackFrame,
    Lock { role: MonitorRole, monitor: MonitorRef },
    ThreadState(ThreadState),
    /// Extra facts about the current thread printed on their own line.
    ThreadDetail {
        native_id: Option<String>,
        daemon: Option<bool>,
    },
    /// Start of something that is no longer thread stacks. Not consumed.
    EndOfDump,
    /// The format's explicit end line. Consumed.
    ExactEndOfDump,
    /// Opens a block of threads that the dump prints again later.
    RepeatedThreads,
    Other,
}

/// Dump-level facts found before the first thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    Version(String),
    StartTime(String),
    Heap(String),
    LockChain(String),
}

/// Fields of a thread header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHeader {
    pub raw_name: String,
    pub name: String,
    pub tid: String,
    pub native_id: Option<String>,
    pub priority: Option<u32>,
    pub daemon: bool,
    pub state: Option<ThreadState>,
    pub stuck: bool,
    /// Lock the header itself says the thread is blocked on.
    pub blocked_on: Option<MonitorRef>,
}

/// Capability the segmenter drives. Implemented by [`Classifier`].
pub trait LineClassifier {
    fn format(&self) -> VendorFormat;

    fn classify(&self, line: &str) -> LineKind;

    /// Parse a (possibly spliced) header line.
    fn parse_header(&self, title: &str) -> Option<ThreadHeader>;

    /// The line opens a quoted title that ends on a later line.
    fn needs_splice(&self, line: &str) -> bool;

    fn is_gc_thread(&self, name: &str) -> bool;

    fn preamble(&self, line: &str) -> Option<Preamble>;

    /// The line can sit inside a thread block even though it has no
    /// structural role of its own.
    fn is_thread_text(&self, line: &str) -> bool;

    /// The line closes a block opened by [`LineKind::RepeatedThreads`].
    /// Not consumed.
    fn ends_repeated_threads(&self, line: &str) -> bool;

    /// Feed a line as vendor evidence. Returns the format to switch to once
    /// enough evidence has been seen.
    fn observe(&mut self, _line: &str) -> Option<VendorFormat> {
        None
    }

    /// Replace the active pattern table.
    fn switch_to(&mut self, format: VendorFormat);
}

// ── Pattern tables ──────────────────────────────────────────────

/// Every pattern one vendor format needs.
pub struct PatternTable {
    format: VendorFormat,
    dump_start: Regex,
    thread_header: Regex,
    stack_frame: Regex,
    owned: Vec<Regex>,
    blocked: Vec<Regex>,
    sleeping: Vec<Regex>,
    state_line: Option<Regex>,
    details: Vec<Regex>,
    end_of_dump: Option<Regex>,
    exact_end: Option<Regex>,
    gc_thread: Regex,
    thread_text: Regex,
    repeated_threads: Option<(Regex, Regex)>,
    version: Vec<Regex>,
    start_time: Vec<Regex>,
    heap_line: Option<Regex>,
    lock_chain_line: Option<Regex>,
    parse_header: fn(&str) -> Option<ThreadHeader>,
}

pub(crate) fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

const HEX_ID: &str = r"<(?P<id>0x[0-9a-fA-F]+)>(?: \(a (?P<class>[^)]+)\))?";

fn hotspot_family(format: VendorFormat) -> PatternTable {
    PatternTable {
        format,
        dump_start: re(r"^Full thread dump\b"),
        thread_header: re(r#"(?s)^".*"\s.*\btid=\S+"#),
        stack_frame: re(r"^\s+at \S"),
        owned: vec![
            re(&format!(r"^\s+- locked {HEX_ID}")),
            re(r"^\s+- <(?P<id>0x[0-9a-fA-F]+)> \(a (?P<class>[^)]+)\)"),
        ],
        blocked: vec![
            re(&format!(r"^\s+- waiting to lock {HEX_ID}")),
            re(&format!(r"^\s+- waiting to re-lock in wait\(\) {HEX_ID}")),
        ],
        sleeping: vec![
            re(&format!(r"^\s+- waiting on {HEX_ID}")),
            re(&format!(r"^\s+- parking to wait for\s+{HEX_ID}")),
        ],
        state_line: Some(re(
            r"^\s+java\.lang\.Thread\.State: (?P<state>[A-Z_]+)(?: \((?P<detail>[^)]*)\))?",
        )),
        details: Vec::new(),
        end_of_dump: Some(re(
            r"^(?:Heap\s*$|Found one Java-level deadlock|Found \d+ deadlocks?|\s*num\s+#instances\s+#bytes\s+class name)",
        )),
        exact_end: Some(re(r"^JNI global ref")),
        gc_thread: re(
            r"(?i)(?:\bGC\b|^G1 |^Gang worker|Concurrent Mark-Sweep|^ParGC|Surrogate Locker|^ZDirector|^Shenandoah)",
        ),
        thread_text: re(r"^(?:\s|$)"),
        repeated_threads: None,
        version: vec![re(r"^Full thread dump (?P<v>.*?):?\s*$")],
        start_time: vec![re(r"^(?P<t>\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2})\s*$")],
        heap_line: None,
        lock_chain_line: None,
        parse_header: parse_hotspot_header,
    }
}

static HOTSPOT: LazyLock<PatternTable> = LazyLock::new(|| hotspot_family(VendorFormat::HotSpot));

static OPENJDK: LazyLock<PatternTable> = LazyLock::new(|| hotspot_family(VendorFormat::OpenJdk));

const JR_ID: &str = r"(?P<id>[^\s\[]+)";

static JROCKIT: LazyLock<PatternTable> = LazyLock::new(|| PatternTable {
    format: VendorFormat::JRockit,
    dump_start: re(r"^===== FULL THREAD DUMP"),
    thread_header: re(r#"(?s)^".*" id=\d+ idx=\S+ tid=\d+"#),
    stack_frame: re(r"^\s+at \S"),
    owned: vec![re(&format!(r"^\s*\^-- Holding lock: {JR_ID}"))],
    blocked: vec![re(&format!(r"^\s*-- Blocked trying to get lock: {JR_ID}"))],
    sleeping: vec![
        re(&format!(r"^\s*-- Waiting for notification on: {JR_ID}")),
        re(&format!(r"^\s*-- Parking to wait for: {JR_ID}")),
        re(&format!(r"^\s*\^-- Lock released while waiting: {JR_ID}")),
    ],
    state_line: None,
    details: Vec::new(),
    end_of_dump: Some(re(
        r"^(?:Circular \(deadlocked\) lock chains|Blocked lock chains|Open lock chains)",
    )),
    exact_end: Some(re(r"^===== END OF THREAD DUMP")),
    gc_thread: re(r"(?i)^\(?GC (?:Main|Worker)"),
    thread_text: re(r"^(?:\s|$)"),
    repeated_threads: None,
    version: vec![re(r"^(?P<v>(?:BEA|Oracle) JRockit\(R\).*?)\s*$")],
    start_time: vec![re(
        r"^(?P<t>\w{3} \w{3} +\d{1,2} \d{2}:\d{2}:\d{2} \d{4})\s*$",
    )],
    heap_line: None,
    lock_chain_line: None,
    parse_header: parse_jrockit_header,
});

static IBM: LazyLock<PatternTable> = LazyLock::new(|| PatternTable {
    format: VendorFormat::Ibm,
    dump_start: re(r"^0SECTION\s+TITLE"),
    thread_header: re(r#"^3XMTHREADINFO\s+(?:"|Anonymous native thread)"#),
    stack_frame: re(r"^4XE(?:STACKTRACE|NATIVESTACK)"),
    owned: vec![re(r"^5XESTACKTRACE\s+\(entered lock: (?P<id>[^,\s)]+)")],
    blocked: vec![re(
        r#"^3XMTHREADBLOCK\s+Blocked on: (?P<id>\S+)(?:.*?Owned by: "(?P<owner>[^"]*)")?"#,
    )],
    sleeping: vec![re(r"^3XMTHREADBLOCK\s+(?:Waiting on|Parked on): (?P<id>\S+)")],
    state_line: None,
    details: vec![
        re(r"^3XMTHREADINFO1\s+\(native thread ID:(?P<nid>0x[0-9A-Fa-f]+)"),
        re(r"^3XMJAVALTHREAD\s+\(java/lang/Thread getId:\S+ isDaemon:(?P<daemon>true|false)\)"),
    ],
    end_of_dump: None,
    exact_end: Some(re(r"^0SECTION\s+(?:HOOKS|SHARED CLASSES|CLASSES)\b")),
    gc_thread: re(r"(?i)^(?:GC Slave|GC Worker|GC Helper|Concurrent Mark Helper)"),
    thread_text: re(r"^(?:NULL|[1-5]X|\s|$)"),
    // the current thread is printed on its own and again in the full list
    repeated_threads: Some((re(r"^1XMCURTHDINFO"), re(r"^(?:1X|0SECTION)"))),
    version: vec![re(r"^1CIJAVAVERSION\s+(?P<v>.*?)\s*$")],
    start_time: vec![re(r"^1TIDATETIME\s+Date:\s*(?P<t>.*?)\s*$")],
    heap_line: Some(re(r"^\dST(?:HEAP|SEG)")),
    lock_chain_line: Some(re(r"^\dLKDEADLOCK")),
    parse_header: parse_ibm_header,
});

static FALLBACK: LazyLock<PatternTable> = LazyLock::new(|| PatternTable {
    format: VendorFormat::Fallback,
    dump_start: re(
        r"^(?:Thread dump for the running server|Full thread dump|===== FULL THREAD DUMP|0SECTION\s+TITLE)",
    ),
    thread_header: re(r#"(?s)^".*?"(?: daemon)?(?: prio=\d+)? Id=\d+ [A-Z_]+"#),
    stack_frame: re(r"^\s+at \S"),
    owned: vec![
        re(r"^\s+-\s+locked (?P<id>\S+)"),
        re(r"^\s+- (?P<id>[\w.$/]+@[0-9a-fA-F]+)\s*$"),
    ],
    blocked: vec![re(r"^\s+-\s+blocked on (?P<id>\S+)")],
    sleeping: vec![
        re(r"^\s+-\s+waiting on (?P<id>\S+)"),
        re(r"^\s+-\s+parking to wait for (?P<id>\S+)"),
    ],
    state_line: None,
    details: Vec::new(),
    end_of_dump: None,
    exact_end: None,
    gc_thread: re(
        r"(?i)(?:\bGC\b|^G1 |^Gang worker|Concurrent Mark|^ParGC|^\(?GC (?:Main|Worker))",
    ),
    thread_text: re(r"^(?:\s|$)"),
    repeated_threads: None,
    version: Vec::new(),
    start_time: vec![re(r"^(?P<t>\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2})\s*$")],
    heap_line: None,
    lock_chain_line: None,
    parse_header: parse_jmx_header,
});

/// The pattern table of `format`.
pub fn table_for(format: VendorFormat) -> &'static PatternTable {
    match format {
        VendorFormat::HotSpot => &HOTSPOT,
        VendorFormat::OpenJdk => &OPENJDK,
        VendorFormat::JRockit => &JROCKIT,
        VendorFormat::Ibm => &IBM,
        VendorFormat::Fallback => &FALLBACK,
    }
}

// ── Header parsing ──────────────────────────────────────────────

static QUOTED_NAME: LazyLock<Regex> = LazyLock::new(|| re(r#"(?s)^"(?P<name>.*)"(?P<rest>[^"]*)$"#));
static TID: LazyLock<Regex> = LazyLock::new(|| re(r"\btid=(?P<v>\S+)"));
static NID: LazyLock<Regex> = LazyLock::new(|| re(r"\bnid=(?P<v>\S+)"));
static SEQ: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*#(?P<v>\d+)"));
static OSTID: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*#\d+ \[(?P<v>\d+)\]"));
static PRIO: LazyLock<Regex> = LazyLock::new(|| re(r"\bprio=(?P<v>\d+)"));
static DAEMON: LazyLock<Regex> = LazyLock::new(|| re(r"\bdaemon\b"));
static HS_STATUS: LazyLock<Regex> = LazyLock::new(|| re(r"\bnid=\S+\s+(?P<v>[^\[]*)"));

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|c| c.name("v"))
        .map(|m| m.as_str().to_string())
}

/// WebLogic decorates names with `[ACTIVE]`, `[STUCK]` and friends.
fn filter_name(raw: &str) -> (String, bool) {
    let mut name = raw.trim();
    let mut stuck = false;
    loop {
        let Some(rest) = name.strip_prefix('[') else { break };
        let Some(close) = rest.find(']') else { break };
        match &rest[..close] {
            "STUCK" => stuck = true,
            "ACTIVE" | "STANDBY" | "HOGGER" => {}
            _ => break,
        }
        name = rest[close + 1..].trim_start();
    }
    (name.to_string(), stuck)
}

fn base_header(raw_name: &str) -> ThreadHeader {
    let (name, stuck) = filter_name(raw_name);
    ThreadHeader {
        raw_name: raw_name.to_string(),
        name,
        tid: String::new(),
        native_id: None,
        priority: None,
        daemon: false,
        state: None,
        stuck,
        blocked_on: None,
    }
}

fn parse_hotspot_header(title: &str) -> Option<ThreadHeader> {
    let caps = QUOTED_NAME.captures(title)?;
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let mut header = base_header(&caps["name"]);
    header.tid = capture(&TID, rest)
        .or_else(|| capture(&SEQ, rest).map(|n| format!("#{n}")))
        .unwrap_or_default();
    header.native_id = capture(&NID, rest).or_else(|| capture(&OSTID, rest));
    header.priority = capture(&PRIO, rest).and_then(|p| p.parse().ok());
    header.daemon = DAEMON.is_match(rest);
    header.state = capture(&HS_STATUS, rest).and_then(|s| hotspot_status(&s));
    Some(header)
}

fn hotspot_status(status: &str) -> Option<ThreadState> {
    let status = status.trim();
    if status.contains("waiting for monitor entry") {
        Some(ThreadState::Blocked)
    } else if status.contains("in Object.wait()") {
        Some(ThreadState::Waiting)
    } else if status.contains("sleeping") {
        Some(ThreadState::TimedWait)
    } else if status.contains("waiting on condition") {
        Some(ThreadState::Parking)
    } else if status.starts_with("runnable") {
        Some(ThreadState::Running)
    } else {
        None
    }
}

/// Map a `java.lang.Thread.State` name (and its parenthesised detail).
pub fn java_state(state: &str, detail: &str) -> ThreadState {
    match state {
        "BLOCKED" => ThreadState::Blocked,
        "WAITING" if detail.contains("parking") => ThreadState::Parking,
        "WAITING" => ThreadState::Waiting,
        "TIMED_WAITING" if detail.contains("parking") => ThreadState::Parking,
        "TIMED_WAITING" => ThreadState::TimedWait,
        _ => ThreadState::Running,
    }
}

static JR_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    re(r#"(?s)^"(?P<name>.*)" id=(?P<id>\d+) idx=\S+ tid=(?P<tid>\d+) prio=(?P<prio>\d+)(?P<flags>.*)$"#)
});

fn parse_jrockit_header(title: &str) -> Option<ThreadHeader> {
    let caps = JR_HEADER.captures(title)?;
    let mut header = base_header(&caps["name"]);
    header.tid = caps["tid"].to_string();
    header.priority = caps["prio"].parse().ok();
    let flags: Vec<&str> = caps["flags"].split(',').map(str::trim).collect();
    header.daemon = flags.contains(&"daemon");
    header.state = Some(if flags.contains(&"blocked") {
        ThreadState::Blocked
    } else if flags.contains(&"parked") {
        ThreadState::Parking
    } else if flags.contains(&"sleeping") {
        ThreadState::TimedWait
    } else if flags.contains(&"waiting") {
        ThreadState::Waiting
    } else {
        ThreadState::Running
    });
    Some(header)
}

static IBM_NAME: LazyLock<Regex> =
    LazyLock::new(|| re(r#"(?s)^3XMTHREADINFO\s+"(?P<name>.*)"\s+(?P<rest>J9VMThread:.*)$"#));
static IBM_TID: LazyLock<Regex> = LazyLock::new(|| re(r"J9VMThread:(?P<v>0x[0-9A-Fa-f]+)"));
static IBM_STATE: LazyLock<Regex> = LazyLock::new(|| re(r"\bstate:(?P<v>[A-Z]+)"));

fn parse_ibm_header(title: &str) -> Option<ThreadHeader> {
    let Some(caps) = IBM_NAME.captures(title) else {
        return title
            .contains("Anonymous native thread")
            .then(|| base_header("Anonymous native thread"));
    };
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    let mut header = base_header(&caps["name"]);
    header.tid = capture(&IBM_TID, rest).unwrap_or_default();
    header.priority = capture(&PRIO, rest).and_then(|p| p.parse().ok());
    header.state = capture(&IBM_STATE, rest).map(|s| match s.as_str() {
        "B" => ThreadState::Blocked,
        "P" => ThreadState::Parking,
        "CW" | "S" => ThreadState::Waiting,
        _ => ThreadState::Running,
    });
    Some(header)
}

static JMX_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    re(concat!(
        r#"(?s)^"(?P<name>.*?)"(?P<daemon> daemon)?(?: prio=(?P<prio>\d+))? Id=(?P<tid>\d+) (?P<state>[A-Z_]+)"#,
        r#"(?: on (?P<lock>\S+))?(?: owned by "(?P<owner>.*?)" Id=\d+)?"#,
    ))
});

fn parse_jmx_header(title: &str) -> Option<ThreadHeader> {
    let caps = JMX_HEADER.captures(title)?;
    let mut header = base_header(&caps["name"]);
    header.tid = caps["tid"].to_string();
    header.daemon = caps.name("daemon").is_some();
    header.priority = caps.name("prio").and_then(|p| p.as_str().parse().ok());
    let state = java_state(&caps["state"], "");
    header.state = Some(state);
    if state == ThreadState::Blocked
        && let Some(lock) = caps.name("lock")
    {
        header.blocked_on = Some(monitor_ref(lock.as_str(), None, caps.name("owner").map(|m| m.as_str())));
    }
    Some(header)
}

fn monitor_ref(raw_id: &str, class_name: Option<&str>, owner: Option<&str>) -> MonitorRef {
    let id = normalize_monitor_id(raw_id);
    let class_name = class_name
        .map(str::to_string)
        .or_else(|| id.rfind('@').map(|at| id[..at].replace('/', ".")));
    MonitorRef {
        id,
        class_name,
        owner_hint: owner.map(|o| filter_name(o).0),
    }
}

fn monitor_from(caps: &Captures<'_>) -> MonitorRef {
    monitor_ref(
        caps.name("id").map_or("", |m| m.as_str()),
        caps.name("class").map(|m| m.as_str()),
        caps.name("owner").map(|m| m.as_str()),
    )
}

// ── Classifier ──────────────────────────────────────────────────

/// Evidence weights for leaving the fallback table.
const HEADER_WEIGHT: u32 = 2;
const MARKER_WEIGHT: u32 = 1;
const SWITCH_THRESHOLD: u32 = 2;

#[derive(Debug, Default, Clone)]
struct Evidence {
    hotspot: u32,
    jrockit: u32,
    ibm: u32,
}

/// Table-driven [`LineClassifier`].
pub struct Classifier {
    table: &'static PatternTable,
    evidence: Evidence,
}

impl Classifier {
    pub fn new(format: VendorFormat) -> Self {
        Self {
            table: table_for(format),
            evidence: Evidence::default(),
        }
    }

    /// Guess the format from the first `window` lines of `reader`, leaving
    /// the reader where it was.
    pub fn detect<R: BufRead>(reader: &mut LineReader<R>, window: usize) -> io::Result<VendorFormat> {
        let checkpoint = reader.checkpoint();
        let mut found = None;
        for _ in 0..window {
            let Some(line) = reader.next_line()? else { break };
            if let Some(format) = strong_marker(&line) {
                found = Some(format);
                break;
            }
        }
        reader.rewind(checkpoint);
        let format = found.unwrap_or(VendorFormat::Fallback);
        debug!(format = format.name(), "detected dump format");
        Ok(format)
    }
}

fn strong_marker(line: &str) -> Option<VendorFormat> {
    if JROCKIT.dump_start.is_match(line) || line.contains("alive,") {
        Some(VendorFormat::JRockit)
    } else if line.starts_with("0SECTION") || line.starts_with("3XMTHREADINFO") {
        Some(VendorFormat::Ibm)
    } else if line.starts_with("Full thread dump OpenJDK") {
        Some(VendorFormat::OpenJdk)
    } else if HOTSPOT.dump_start.is_match(line) || line.contains("tid=0x") {
        Some(VendorFormat::HotSpot)
    } else {
        None
    }
}

impl LineClassifier for Classifier {
    fn format(&self) -> VendorFormat {
        self.table.format
    }

    fn classify(&self, line: &str) -> LineKind {
        let t = self.table;
        if t.dump_start.is_match(line) {
            return LineKind::DumpStart;
        }
        if t.thread_header.is_match(line) {
            return LineKind::ThreadHeader;
        }
        if t.repeated_threads.as_ref().is_some_and(|(start, _)| start.is_match(line)) {
            return LineKind::RepeatedThreads;
        }
        if t.exact_end.as_ref().is_some_and(|r| r.is_match(line)) {
            return LineKind::ExactEndOfDump;
        }
        if t.end_of_dump.as_ref().is_some_and(|r| r.is_match(line)) {
            return LineKind::EndOfDump;
        }
        if let Some(caps) = t.state_line.as_ref().and_then(|r| r.captures(line)) {
            let detail = caps.name("detail").map_or("", |m| m.as_str());
            return LineKind::ThreadState(java_state(&caps["state"], detail));
        }
        let groups = [
            (MonitorRole::Waiter, &t.blocked),
            (MonitorRole::Sleeper, &t.sleeping),
            (MonitorRole::Owner, &t.owned),
        ];
        for (role, patterns) in groups {
            if let Some(caps) = patterns.iter().find_map(|r| r.captures(line)) {
                return LineKind::Lock {
                    role,
                    monitor: monitor_from(&caps),
                };
            }
        }
        if let Some(caps) = t.details.iter().find_map(|r| r.captures(line)) {
            return LineKind::ThreadDetail {
                native_id: caps.name("nid").map(|m| m.as_str().to_string()),
                daemon: caps.name("daemon").map(|m| m.as_str() == "true"),
            };
        }
        if t.stack_frame.is_match(line) {
            return LineKind::StackFrame;
        }
        LineKind::Other
    }

    fn parse_header(&self, title: &str) -> Option<ThreadHeader> {
        (self.table.parse_header)(title)
    }

    fn needs_splice(&self, line: &str) -> bool {
        let quoted = line.starts_with('"') || line.starts_with("3XMTHREADINFO ");
        quoted && line.matches('"').count() % 2 == 1 && !self.table.thread_header.is_match(line)
    }

    fn is_gc_thread(&self, name: &str) -> bool {
        self.table.gc_thread.is_match(name)
    }

    fn preamble(&self, line: &str) -> Option<Preamble> {
        let t = self.table;
        if let Some(v) = t.version.iter().find_map(|r| r.captures(line)) {
            return Some(Preamble::Version(v["v"].to_string()));
        }
        if let Some(v) = t.start_time.iter().find_map(|r| r.captures(line)) {
            return Some(Preamble::StartTime(v["t"].to_string()));
        }
        if t.heap_line.as_ref().is_some_and(|r| r.is_match(line)) {
            return Some(Preamble::Heap(line.to_string()));
        }
        if t.lock_chain_line.as_ref().is_some_and(|r| r.is_match(line)) {
            return Some(Preamble::LockChain(line.to_string()));
        }
        None
    }

    fn is_thread_text(&self, line: &str) -> bool {
        self.table.thread_text.is_match(line)
    }

    fn ends_repeated_threads(&self, line: &str) -> bool {
        self.table
            .repeated_threads
            .as_ref()
            .is_none_or(|(start, end)| end.is_match(line) && !start.is_match(line))
    }

    fn observe(&mut self, line: &str) -> Option<VendorFormat> {
        if self.table.format != VendorFormat::Fallback {
            return None;
        }
        // JRockit headers also carry `tid=`, so they are tested first
        let (format, weight) = if JROCKIT.thread_header.is_match(line) {
            (VendorFormat::JRockit, HEADER_WEIGHT)
        } else if HOTSPOT.thread_header.is_match(line) {
            (VendorFormat::HotSpot, HEADER_WEIGHT)
        } else if IBM.thread_header.is_match(line) {
            (VendorFormat::Ibm, HEADER_WEIGHT)
        } else if line.contains("tid=0x") || line.contains(" nid=") {
            (VendorFormat::HotSpot, MARKER_WEIGHT)
        } else if line.contains("alive,") {
            (VendorFormat::JRockit, MARKER_WEIGHT)
        } else if line.contains("3XMTHREADINFO") || line.contains("J9VMThread") {
            (VendorFormat::Ibm, MARKER_WEIGHT)
        } else {
            return None;
        };
        let score = match format {
            VendorFormat::JRockit => &mut self.evidence.jrockit,
            VendorFormat::Ibm => &mut self.evidence.ibm,
            _ => &mut self.evidence.hotspot,
        };
        *score += weight;
        (*score >= SWITCH_THRESHOLD).then_some(format)
    }

    fn switch_to(&mut self, format: VendorFormat) {
        self.table = table_for(format);
        self.evidence = Evidence::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(kind: LineKind) -> (MonitorRole, MonitorRef) {
        match kind {
            LineKind::Lock { role, monitor } => (role, monitor),
            other => panic!("expected a lock line, got {other:?}"),
        }
    }

    #[test]
    fn hotspot_lines() {
        let c = Classifier::new(VendorFormat::HotSpot);
        assert_eq!(
            c.classify("Full thread dump Java HotSpot(TM) 64-Bit Server VM (25.181-b13 mixed mode):"),
            LineKind::DumpStart
        );
        assert_eq!(
            c.classify(r#""main" #1 prio=5 os_prio=0 tid=0x00007f0c2400a800 nid=0x2a03 waiting on condition [0x00007f0c2b1fe000]"#),
            LineKind::ThreadHeader
        );
        assert_eq!(c.classify("\tat java.lang.Thread.sleep(Native Method)"), LineKind::StackFrame);
        assert_eq!(
            c.classify("   java.lang.Thread.State: TIMED_WAITING (parking)"),
            LineKind::ThreadState(ThreadState::Parking)
        );
        let (role, monitor) = lock(c.classify("\t- waiting to lock <0x00000000D5F0A1B0> (a java.lang.Object)"));
        assert_eq!(role, MonitorRole::Waiter);
        assert_eq!(monitor.id, "0x00000000d5f0a1b0");
        assert_eq!(monitor.class_name.as_deref(), Some("java.lang.Object"));
        let (role, _) = lock(c.classify("\t- <0x000000076ab62208> (a java.util.concurrent.locks.ReentrantLock$NonfairSync)"));
        assert_eq!(role, MonitorRole::Owner);
        assert_eq!(c.classify("JNI global references: 1234"), LineKind::ExactEndOfDump);
        assert_eq!(c.classify("Heap"), LineKind::EndOfDump);
        assert_eq!(c.classify("Locked ownable synchronizers:"), LineKind::Other);
    }

    #[test]
    fn hotspot_header_fields() {
        let c = Classifier::new(VendorFormat::HotSpot);
        let h = c
            .parse_header(r#""[STUCK] ExecuteThread: '3' for queue: 'weblogic.kernel.Default (self-tuning)'" daemon prio=10 tid=0x0000000002c49000 nid=0x5b4 waiting for monitor entry [0x00007f2a]"#)
            .expect("header");
        assert_eq!(h.name, "ExecuteThread: '3' for queue: 'weblogic.kernel.Default (self-tuning)'");
        assert!(h.stuck);
        assert!(h.daemon);
        assert_eq!(h.tid, "0x0000000002c49000");
        assert_eq!(h.native_id.as_deref(), Some("0x5b4"));
        assert_eq!(h.priority, Some(10));
        assert_eq!(h.state, Some(ThreadState::Blocked));
    }

    #[test]
    fn jrockit_lines() {
        let c = Classifier::new(VendorFormat::JRockit);
        let title = r#""Worker-1" id=14 idx=0x3c tid=4821 prio=5 alive, blocked, native_blocked, daemon"#;
        assert_eq!(c.classify(title), LineKind::ThreadHeader);
        let h = c.parse_header(title).expect("header");
        assert_eq!(h.tid, "4821");
        assert!(h.daemon);
        assert_eq!(h.state, Some(ThreadState::Blocked));

        let (role, monitor) = lock(c.classify("    -- Blocked trying to get lock: java/lang/Object@0x0A1B2C3D[fat lock]"));
        assert_eq!(role, MonitorRole::Waiter);
        assert_eq!(monitor.id, "java/lang/Object@0x0a1b2c3d");
        assert_eq!(monitor.class_name.as_deref(), Some("java.lang.Object"));
        let (role, _) = lock(c.classify("    ^-- Holding lock: java/lang/Object@0x0a1b2c3d[thin lock]"));
        assert_eq!(role, MonitorRole::Owner);
        assert_eq!(c.classify("===== END OF THREAD DUMP ==============="), LineKind::ExactEndOfDump);
    }

    #[test]
    fn ibm_lines() {
        let c = Classifier::new(VendorFormat::Ibm);
        let title = r#"3XMTHREADINFO      "WebContainer : 0" J9VMThread:0x0000000001E8F300, j9thread_t:0x00007F2A5C0E1D30, java/lang/Thread:0x00000000E0A52910, state:B, prio=5"#;
        assert_eq!(c.classify(title), LineKind::ThreadHeader);
        let h = c.parse_header(title).expect("header");
        assert_eq!(h.name, "WebContainer : 0");
        assert_eq!(h.tid, "0x0000000001E8F300");
        assert_eq!(h.state, Some(ThreadState::Blocked));

        let (role, monitor) = lock(c.classify(r#"3XMTHREADBLOCK     Blocked on: java/util/HashMap@0x00000000E0A56520 Owned by: "WebContainer : 1" (J9VMThread:0x0000000001E90000, java/lang/Thread:0x00000000E0A53000)"#));
        assert_eq!(role, MonitorRole::Waiter);
        assert_eq!(monitor.owner_hint.as_deref(), Some("WebContainer : 1"));
        assert_eq!(monitor.id, "java/util/HashMap@0x00000000e0a56520");
        assert_eq!(
            c.classify("3XMTHREADINFO1            (native thread ID:0x3F21, native priority:0x5, native policy:UNKNOWN)"),
            LineKind::ThreadDetail {
                native_id: Some("0x3F21".to_string()),
                daemon: None
            }
        );
        assert_eq!(c.classify("0SECTION       HOOKS subcomponent dump routine"), LineKind::ExactEndOfDump);
        assert_eq!(c.classify("0SECTION       THREADS subcomponent dump routine"), LineKind::Other);
        assert_eq!(c.classify("1XMCURTHDINFO  Current thread"), LineKind::RepeatedThreads);
        assert!(!c.ends_repeated_threads("3XMTHREADINFO      \"main\" J9VMThread:0x0000000000A1B200, state:R, prio=5"));
        assert!(!c.ends_repeated_threads("NULL"));
        assert!(c.ends_repeated_threads("1XMTHDINFO     Thread Details"));
        assert!(c.is_thread_text("4XESTACKTRACE                at java/lang/Object.wait(Native Method)"));
        assert!(!c.is_thread_text("0SECTION       HOOKS subcomponent dump routine"));
    }

    #[test]
    fn jmx_header_carries_owner_hint() {
        let c = Classifier::new(VendorFormat::Fallback);
        let title = r#""worker-2" daemon prio=5 Id=27 BLOCKED on java.lang.Object@1b6d3586 owned by "worker-1" Id=26"#;
        assert_eq!(c.classify(title), LineKind::ThreadHeader);
        let h = c.parse_header(title).expect("header");
        assert_eq!(h.name, "worker-2");
        assert_eq!(h.tid, "27");
        assert!(h.daemon);
        let blocked = h.blocked_on.expect("blocked on");
        assert_eq!(blocked.id, "java.lang.Object@1b6d3586");
        assert_eq!(blocked.owner_hint.as_deref(), Some("worker-1"));
    }

    #[test]
    fn fallback_switches_on_weighted_evidence() {
        let mut c = Classifier::new(VendorFormat::Fallback);
        assert_eq!(c.observe("some banner with tid=0x1234 in it"), None);
        assert_eq!(c.observe("nid=0x12 again tid=0x99"), Some(VendorFormat::HotSpot));

        let mut c = Classifier::new(VendorFormat::Fallback);
        assert_eq!(
            c.observe(r#""Main Thread" id=1 idx=0x4 tid=28217 prio=5 alive, in native"#),
            Some(VendorFormat::JRockit)
        );
        c.switch_to(VendorFormat::JRockit);
        assert_eq!(c.format(), VendorFormat::JRockit);
        assert_eq!(c.observe("tid=0x1 tid=0x2"), None);
    }

    #[test]
    fn splice_only_for_open_quotes() {
        let c = Classifier::new(VendorFormat::HotSpot);
        assert!(c.needs_splice("\"broken"));
        assert!(!c.needs_splice(r#""ok" prio=5 tid=0x1 nid=0x2 runnable"#));
        assert!(!c.needs_splice("\tat Foo.bar(Foo.java:1)"));
    }

    #[test]
    fn preamble_facts() {
        let c = Classifier::new(VendorFormat::HotSpot);
        assert_eq!(
            c.preamble("Full thread dump OpenJDK 64-Bit Server VM (17.0.2+8-86 mixed mode, sharing):"),
            Some(Preamble::Version("OpenJDK 64-Bit Server VM (17.0.2+8-86 mixed mode, sharing)".to_string()))
        );
        assert_eq!(
            c.preamble("2023-04-01 12:30:45"),
            Some(Preamble::StartTime("2023-04-01 12:30:45".to_string()))
        );
        let ibm = Classifier::new(VendorFormat::Ibm);
        assert_eq!(
            ibm.preamble("1STHEAPFREE    Bytes of Heap Space Free: 3a4c1f0"),
            Some(Preamble::Heap("1STHEAPFREE    Bytes of Heap Space Free: 3a4c1f0".to_string()))
        );
    }
}

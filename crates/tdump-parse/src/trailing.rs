//! Optional sections printed after the thread stacks of a dump.
//!
//! Each probe looks a bounded number of lines ahead for its header and puts
//! the reader back exactly where it was when the header is not there.

use std::io::{self, BufRead};
use std::sync::LazyLock;

use regex::Regex;
use tdump_types::{ClassHistogram, HistogramEntry, ThreadDumpSnapshot};
use tracing::trace;

use crate::classify::{LineClassifier, LineKind, re};
use crate::reader::LineReader;

static HEAP_HEADER: LazyLock<Regex> = LazyLock::new(|| re(r"^Heap\s*$"));
static HISTOGRAM_HEADER: LazyLock<Regex> =
    LazyLock::new(|| re(r"^\s*num\s+#instances\s+#bytes\s+class name"));
static LOCK_CHAIN_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    re(r"^(?:Found one Java-level deadlock|Found \d+ deadlocks?|Circular \(deadlocked\) lock chains|Blocked lock chains|Open lock chains)")
});
static CONTEXT_HEADER: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)^(?:ECID|Thread) context\b"));

static DEADLOCK_COUNT: LazyLock<Regex> = LazyLock::new(|| re(r"^Found (?P<n>\d+) deadlocks?"));
static HISTOGRAM_ROW: LazyLock<Regex> = LazyLock::new(|| {
    re(r"^\s*(?P<rank>\d+):\s+(?P<instances>\d+)\s+(?P<bytes>\d+)\s+(?P<class>.+?)\s*$")
});
static HISTOGRAM_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| re(r"^Total\s+(?P<instances>\d+)\s+(?P<bytes>\d+)"));
static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| re(r"^-+\s*$"));
static CONTEXT_ROW: LazyLock<Regex> =
    LazyLock::new(|| re(r#"^"(?P<name>[^"]+)".*?\bECID\s*[:=]\s*(?P<ecid>\S+)"#));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Heap,
    ClassHistogram,
    LockChains,
    ThreadContext,
}

impl SectionKind {
    pub(crate) const ORDER: [SectionKind; 4] = [
        SectionKind::Heap,
        SectionKind::ClassHistogram,
        SectionKind::LockChains,
        SectionKind::ThreadContext,
    ];

    fn header(self) -> &'static Regex {
        match self {
            SectionKind::Heap => &HEAP_HEADER,
            SectionKind::ClassHistogram => &HISTOGRAM_HEADER,
            SectionKind::LockChains => &LOCK_CHAIN_HEADER,
            SectionKind::ThreadContext => &CONTEXT_HEADER,
        }
    }
}

fn any_section_header(line: &str) -> bool {
    SectionKind::ORDER.iter().any(|k| k.header().is_match(line))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TrailingSection {
    Heap(String),
    ClassHistogram(ClassHistogram),
    LockChains { text: String, reports_deadlock: bool },
    ThreadContext(Vec<(String, String)>),
}

pub(crate) struct TrailingProbe {
    window: usize,
    max_lines: usize,
}

impl TrailingProbe {
    pub(crate) fn new(window: usize, max_lines: usize) -> Self {
        Self { window, max_lines }
    }

    /// Probe every section in order, in rounds, until a full round finds
    /// nothing. Each section is taken at most once.
    pub(crate) fn collect<R: BufRead, C: LineClassifier>(
        &self,
        reader: &mut LineReader<R>,
        classifier: &C,
        snapshot: &mut ThreadDumpSnapshot,
    ) -> io::Result<()> {
        let mut pending: Vec<SectionKind> = SectionKind::ORDER.to_vec();
        loop {
            let mut found_any = false;
            let mut i = 0;
            while i < pending.len() {
                match self.probe(reader, classifier, pending[i])? {
                    Some(section) => {
                        apply(snapshot, section);
                        pending.remove(i);
                        found_any = true;
                    }
                    None => i += 1,
                }
            }
            if !found_any || pending.is_empty() {
                return Ok(());
            }
        }
    }

    /// Look for `kind` within the window. On a miss the reader is rewound to
    /// where the probe started.
    pub(crate) fn probe<R: BufRead, C: LineClassifier>(
        &self,
        reader: &mut LineReader<R>,
        classifier: &C,
        kind: SectionKind,
    ) -> io::Result<Option<TrailingSection>> {
        let checkpoint = reader.checkpoint();
        for _ in 0..self.window {
            let Some(line) = reader.peek_line()? else { break };
            if kind.header().is_match(line) {
                let header = line.to_string();
                reader.advance()?;
                let section = self.read_body(reader, classifier, kind, header)?;
                reader.release(checkpoint);
                trace!(?kind, "found trailing section");
                return Ok(Some(section));
            }
            let boundary = matches!(
                classifier.classify(line),
                LineKind::DumpStart | LineKind::ThreadHeader
            );
            if boundary || any_section_header(line) {
                break;
            }
            reader.advance()?;
        }
        reader.rewind(checkpoint);
        Ok(None)
    }

    fn read_body<R: BufRead, C: LineClassifier>(
        &self,
        reader: &mut LineReader<R>,
        classifier: &C,
        kind: SectionKind,
        header: String,
    ) -> io::Result<TrailingSection> {
        match kind {
            SectionKind::Heap => {
                let mut text = header;
                self.take_while(reader, |line| line.starts_with([' ', '\t']) && !line.trim().is_empty(), |line| {
                    text.push('\n');
                    text.push_str(line);
                })?;
                Ok(TrailingSection::Heap(text))
            }
            SectionKind::ClassHistogram => {
                let mut histogram = ClassHistogram::default();
                let mut total = None;
                for _ in 0..self.max_lines {
                    let Some(line) = reader.peek_line()? else { break };
                    if let Some(caps) = HISTOGRAM_TOTAL.captures(line) {
                        total = Some((
                            caps["instances"].parse().unwrap_or(0),
                            caps["bytes"].parse().unwrap_or(0),
                        ));
                        reader.advance()?;
                        break;
                    }
                    if let Some(caps) = HISTOGRAM_ROW.captures(line) {
                        histogram.entries.push(HistogramEntry {
                            rank: caps["rank"].parse().unwrap_or(0),
                            instances: caps["instances"].parse().unwrap_or(0),
                            bytes: caps["bytes"].parse().unwrap_or(0),
                            class_name: caps["class"].to_string(),
                        });
                    } else if !SEPARATOR.is_match(line) {
                        break;
                    }
                    reader.advance()?;
                }
                let (instances, bytes) = total.unwrap_or_else(|| {
                    histogram.entries.iter().fold((0, 0), |(i, b), e| (i + e.instances, b + e.bytes))
                });
                histogram.total_instances = instances;
                histogram.total_bytes = bytes;
                Ok(TrailingSection::ClassHistogram(histogram))
            }
            SectionKind::LockChains => {
                let mut reports_deadlock = reports_deadlock(&header);
                let mut text = header.clone();
                if !DEADLOCK_COUNT.is_match(&header) {
                    for _ in 0..self.max_lines {
                        let Some(line) = reader.peek_line()? else { break };
                        let stop = matches!(
                            classifier.classify(line),
                            LineKind::DumpStart | LineKind::ExactEndOfDump
                        ) || HEAP_HEADER.is_match(line)
                            || HISTOGRAM_HEADER.is_match(line)
                            || CONTEXT_HEADER.is_match(line);
                        if stop {
                            break;
                        }
                        let closing = DEADLOCK_COUNT.is_match(line);
                        reports_deadlock |= reports_deadlock_line(line);
                        text.push('\n');
                        text.push_str(line);
                        reader.advance()?;
                        if closing {
                            break;
                        }
                    }
                }
                Ok(TrailingSection::LockChains {
                    text: text.trim_end().to_string(),
                    reports_deadlock,
                })
            }
            SectionKind::ThreadContext => {
                let mut rows = Vec::new();
                self.take_while(reader, |line| CONTEXT_ROW.is_match(line), |line| {
                    if let Some(caps) = CONTEXT_ROW.captures(line) {
                        rows.push((caps["name"].to_string(), caps["ecid"].to_string()));
                    }
                })?;
                Ok(TrailingSection::ThreadContext(rows))
            }
        }
    }

    /// Consume lines while `keep` holds, up to the section line cap.
    fn take_while<R: BufRead>(
        &self,
        reader: &mut LineReader<R>,
        keep: impl Fn(&str) -> bool,
        mut each: impl FnMut(&str),
    ) -> io::Result<()> {
        for _ in 0..self.max_lines {
            let Some(line) = reader.peek_line()? else { break };
            if !keep(line) {
                break;
            }
            each(line);
            reader.advance()?;
        }
        Ok(())
    }
}

fn reports_deadlock(header: &str) -> bool {
    if let Some(caps) = DEADLOCK_COUNT.captures(header) {
        return caps["n"].parse::<u32>().is_ok_and(|n| n > 0);
    }
    reports_deadlock_line(header)
}

fn reports_deadlock_line(line: &str) -> bool {
    line.starts_with("Found one Java-level deadlock")
        || line.starts_with("Circular (deadlocked) lock chains")
        || DEADLOCK_COUNT
            .captures(line)
            .is_some_and(|c| c["n"].parse::<u32>().is_ok_and(|n| n > 0))
}

fn apply(snapshot: &mut ThreadDumpSnapshot, section: TrailingSection) {
    match section {
        TrailingSection::Heap(text) => {
            if snapshot.heap_info.is_none() {
                snapshot.heap_info = Some(text);
            }
        }
        TrailingSection::ClassHistogram(histogram) => snapshot.class_histogram = Some(histogram),
        TrailingSection::LockChains {
            text,
            reports_deadlock,
        } => {
            snapshot.vendor_reported_deadlock |= reports_deadlock;
            match &mut snapshot.lock_chains {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&text);
                }
                None => snapshot.lock_chains = Some(text),
            }
        }
        TrailingSection::ThreadContext(rows) => {
            // repeated names take their rows in dump order
            for (name, ecid) in rows {
                if let Some(thread) = snapshot
                    .threads
                    .iter_mut()
                    .find(|t| t.name == name && t.ecid.is_none())
                {
                    thread.ecid = Some(ecid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::classify::Classifier;
    use tdump_types::VendorFormat;

    fn reader(text: &str) -> LineReader<Cursor<Vec<u8>>> {
        LineReader::new(Cursor::new(text.as_bytes().to_vec()))
    }

    const HEAP: &str = "\nHeap\n PSYoungGen      total 76288K, used 6554K\n  eden space 65536K, 10% used\n Metaspace       used 2764K\n\nnext\n";

    #[test]
    fn heap_section_is_collected() {
        let mut r = reader(HEAP);
        let c = Classifier::new(VendorFormat::HotSpot);
        let probe = TrailingProbe::new(25, 10_000);
        let section = probe.probe(&mut r, &c, SectionKind::Heap).unwrap().expect("heap");
        match section {
            TrailingSection::Heap(text) => {
                assert!(text.starts_with("Heap\n PSYoungGen"));
                assert!(text.ends_with("Metaspace       used 2764K"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.peek_line().unwrap(), Some(""));
    }

    #[test]
    fn missing_section_leaves_position_unchanged() {
        let mut r = reader("\nFull thread dump OpenJDK:\n\n\"main\" #1 prio=5 tid=0x1 nid=0x2 runnable\n");
        let c = Classifier::new(VendorFormat::HotSpot);
        let probe = TrailingProbe::new(25, 10_000);
        let before = r.position();
        assert_eq!(probe.probe(&mut r, &c, SectionKind::Heap).unwrap(), None);
        assert_eq!(r.position(), before);
        assert_eq!(r.line_number(), 0);
    }

    #[test]
    fn probe_window_is_bounded() {
        let mut text = String::new();
        for i in 0..30 {
            text.push_str(&format!("noise {i}\n"));
        }
        text.push_str("Heap\n garbage-first heap total 1K\n");
        let mut r = reader(&text);
        let c = Classifier::new(VendorFormat::HotSpot);
        assert_eq!(TrailingProbe::new(25, 10_000).probe(&mut r, &c, SectionKind::Heap).unwrap(), None);
        assert_eq!(r.position(), 0);
        assert!(TrailingProbe::new(40, 10_000).probe(&mut r, &c, SectionKind::Heap).unwrap().is_some());
    }

    #[test]
    fn histogram_rows_and_total() {
        let text = " num     #instances         #bytes  class name\n----------------------------------------------\n   1:         12345        1234560  [C\n   2:          2345         234560  java.lang.String (java.base@11.0.2)\nTotal         14690        1469120\n";
        let mut r = reader(text);
        let c = Classifier::new(VendorFormat::HotSpot);
        let section = TrailingProbe::new(25, 10_000)
            .probe(&mut r, &c, SectionKind::ClassHistogram)
            .unwrap();
        let Some(TrailingSection::ClassHistogram(h)) = section else {
            panic!("no histogram");
        };
        assert_eq!(h.entries.len(), 2);
        assert_eq!(h.entries[1].class_name, "java.lang.String (java.base@11.0.2)");
        assert_eq!(h.total_instances, 14690);
        assert_eq!(h.total_bytes, 1469120);
        assert_eq!(r.peek_line().unwrap(), None);
    }

    #[test]
    fn sections_are_found_in_any_order() {
        let text = "Heap\n def new generation total 4K\nFound one Java-level deadlock:\n=============================\n\"B\":\n  waiting to lock monitor 0x1 (object 0x2, a java.lang.Object),\n  which is held by \"A\"\n\nFound 1 deadlock.\n";
        let mut r = reader(text);
        let c = Classifier::new(VendorFormat::HotSpot);
        let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
        TrailingProbe::new(25, 10_000).collect(&mut r, &c, &mut snap).unwrap();
        assert!(snap.heap_info.is_some());
        assert!(snap.vendor_reported_deadlock);
        let chains = snap.lock_chains.expect("lock chains");
        assert!(chains.starts_with("Found one Java-level deadlock:"));
        assert!(chains.ends_with("Found 1 deadlock."));
    }

    #[test]
    fn context_rows_attach_ecids() {
        let text = "Thread context:\n\"worker-1\" ECID: 0000KX1abc\n\"worker-2\" ECID: 0000KX1abd\n\n";
        let mut r = reader(text);
        let c = Classifier::new(VendorFormat::HotSpot);
        let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
        snap.threads.push(tdump_types::ThreadRecord::new("worker-1", "0x1", "\"worker-1\""));
        TrailingProbe::new(25, 10_000).collect(&mut r, &c, &mut snap).unwrap();
        assert_eq!(snap.threads[0].ecid.as_deref(), Some("0000KX1abc"));
    }

    #[test]
    fn context_row_attaches_to_one_thread_per_row() {
        let text = "ECID context:\n\"dup\" ECID: first\n\"dup\" ECID: second\n\"lonely\" ECID: third\n\n";
        let mut r = reader(text);
        let c = Classifier::new(VendorFormat::HotSpot);
        let mut snap = ThreadDumpSnapshot::new(0, VendorFormat::HotSpot, 1);
        for tid in ["0x1", "0x2", "0x3"] {
            snap.threads.push(tdump_types::ThreadRecord::new("dup", tid, "\"dup\""));
        }
        TrailingProbe::new(25, 10_000).collect(&mut r, &c, &mut snap).unwrap();
        let ecids: Vec<Option<&str>> = snap.threads.iter().map(|t| t.ecid.as_deref()).collect();
        assert_eq!(ecids, vec![Some("first"), Some("second"), None]);
    }
}

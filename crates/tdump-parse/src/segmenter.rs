//! Splits a text stream into thread dumps and builds one snapshot per dump.
//!
//! The segmenter walks four states per dump: seeking a start marker, reading
//! thread blocks, probing trailing sections, done. It keeps one parsed dump
//! ahead of the caller so [`DumpSegmenter::has_more_dumps`] can answer
//! without consuming anything.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tdump_types::{
    LockMention, MonitorMap, MonitorRole, ThreadDumpSnapshot, ThreadRecord, ThreadState,
    VendorFormat,
};
use tdump_waitgraph::{Advisor, Finalizer};
use tracing::{debug, info, warn};

use crate::ParseOptions;
use crate::classify::{Classifier, LineClassifier, LineKind, MonitorRef, Preamble, ThreadHeader};
use crate::error::{DumpFailure, FormatError, ParseError, ParseWarning};
use crate::reader::{Checkpoint, LineReader};
use crate::trailing::TrailingProbe;

/// Where a dump began.
struct DumpStart {
    /// Before the start line, or before the first header of a headerless dump.
    checkpoint: Checkpoint,
    /// 1-based line number of that line.
    line: u64,
    /// The start marker line, if there was one.
    marker: Option<String>,
    start_time: Option<String>,
}

enum ThreadsEnd {
    Finished,
    /// The fallback table switched to a vendor table; read the dump again.
    Restart,
}

pub struct DumpSegmenter<R, C = Classifier> {
    reader: LineReader<R>,
    classifier: C,
    options: ParseOptions,
    finalizer: Finalizer,
    trailing: TrailingProbe,
    next_index: u32,
    /// Thread headers may open a dump without a start marker: no marker has
    /// been seen yet, or a vendor table was picked mid-stream.
    headerless: bool,
    ahead: Option<ThreadDumpSnapshot>,
    pending_error: Option<ParseError>,
    exhausted: bool,
    warnings: Vec<ParseWarning>,
}

impl DumpSegmenter<BufReader<File>> {
    /// Open `path` and detect its format.
    pub fn open(
        path: impl AsRef<Path>,
        options: ParseOptions,
        advisor: Arc<dyn Advisor>,
    ) -> Result<Self, ParseError> {
        let finalizer = Finalizer::new(&options.finalize, advisor);
        Self::open_with(path, options, finalizer)
    }

    /// Like [`DumpSegmenter::open`], reusing an existing finalizer and its
    /// advisory pool.
    pub fn open_with(
        path: impl AsRef<Path>,
        options: ParseOptions,
        finalizer: Finalizer,
    ) -> Result<Self, ParseError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader_with(BufReader::new(file), options, finalizer)
    }
}

impl<R: BufRead> DumpSegmenter<R> {
    /// Wrap `input`, using the forced format if one is set and detecting it
    /// from the first lines otherwise.
    pub fn from_reader(
        input: R,
        options: ParseOptions,
        advisor: Arc<dyn Advisor>,
    ) -> Result<Self, ParseError> {
        let finalizer = Finalizer::new(&options.finalize, advisor);
        Self::from_reader_with(input, options, finalizer)
    }

    pub fn from_reader_with(
        input: R,
        options: ParseOptions,
        finalizer: Finalizer,
    ) -> Result<Self, ParseError> {
        let mut reader = LineReader::new(input);
        let format = match options.format {
            Some(format) => format,
            None => Classifier::detect(&mut reader, options.detection_window)?,
        };
        Ok(Self::with_classifier(
            reader,
            Classifier::new(format),
            options,
            finalizer,
        ))
    }
}

impl<R: BufRead, C: LineClassifier> DumpSegmenter<R, C> {
    pub fn with_classifier(
        reader: LineReader<R>,
        classifier: C,
        options: ParseOptions,
        finalizer: Finalizer,
    ) -> Self {
        let trailing = TrailingProbe::new(options.probe_window, options.max_section_lines);
        Self {
            reader,
            classifier,
            options,
            finalizer,
            trailing,
            next_index: 0,
            headerless: true,
            ahead: None,
            pending_error: None,
            exhausted: false,
            warnings: Vec::new(),
        }
    }

    /// The table currently in use.
    pub fn format(&self) -> VendorFormat {
        self.classifier.format()
    }

    /// Dumps skipped so far.
    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<ParseWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Whether another snapshot is available. A stream failure hit while
    /// looking ahead is reported here.
    pub fn has_more_dumps(&mut self) -> Result<bool, ParseError> {
        self.fill_ahead();
        if self.ahead.is_some() {
            return Ok(true);
        }
        match self.pending_error.take() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    /// The next snapshot, or `None` at end of input.
    pub fn parse_next(&mut self) -> Result<Option<ThreadDumpSnapshot>, ParseError> {
        self.fill_ahead();
        match self.ahead.take() {
            Some(snapshot) => {
                self.fill_ahead();
                Ok(Some(snapshot))
            }
            None => match self.pending_error.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    fn fill_ahead(&mut self) {
        if self.ahead.is_some() || self.pending_error.is_some() || self.exhausted {
            return;
        }
        match self.parse_ahead() {
            Ok(Some(snapshot)) => self.ahead = Some(snapshot),
            Ok(None) => self.exhausted = true,
            Err(err) => {
                self.pending_error = Some(err);
                self.exhausted = true;
            }
        }
    }

    fn parse_ahead(&mut self) -> Result<Option<ThreadDumpSnapshot>, ParseError> {
        loop {
            match self.segment_dump() {
                Ok(snapshot) => return Ok(snapshot),
                Err(DumpFailure::Stream(err)) => return Err(err),
                Err(DumpFailure::Format(err)) => {
                    let warning = ParseWarning {
                        dump_index: self.next_index,
                        line_number: self.reader.line_number(),
                        last_line: self.reader.last_line().to_string(),
                        message: err.to_string(),
                    };
                    warn!(%warning, "skipping malformed dump");
                    self.warnings.push(warning);
                    self.skip_failed_dump()?;
                }
            }
        }
    }

    fn segment_dump(&mut self) -> Result<Option<ThreadDumpSnapshot>, DumpFailure> {
        let mut restarted = false;
        loop {
            let Some(start) = self.seek_start()? else {
                return Ok(None);
            };
            // only the fallback table may need to re-read the dump
            let restart_point = if self.classifier.format() == VendorFormat::Fallback && !restarted {
                Some(start.checkpoint)
            } else {
                self.reader.release(start.checkpoint);
                None
            };

            let mut dump = DumpBuilder::new(
                ThreadDumpSnapshot::new(self.next_index, self.classifier.format(), start.line),
                self.options.max_threads,
            );
            dump.snapshot.start_time = start.start_time;
            if let Some(fact) = start.marker.as_deref().and_then(|line| self.classifier.preamble(line)) {
                dump.preamble(fact);
            }

            // an implicit start's header was already fed to `observe`
            let observed = start.marker.is_none();
            match self.read_threads(&mut dump, observed) {
                Ok(ThreadsEnd::Finished) => {
                    if let Some(cp) = restart_point {
                        self.reader.release(cp);
                    }
                }
                Ok(ThreadsEnd::Restart) => {
                    if let Some(cp) = restart_point {
                        self.reader.rewind(cp);
                        restarted = true;
                        continue;
                    }
                }
                Err(err) => {
                    if let Some(cp) = restart_point {
                        self.reader.release(cp);
                    }
                    return Err(err);
                }
            }

            self.trailing
                .collect(&mut self.reader, &self.classifier, &mut dump.snapshot)?;

            let (mut snapshot, monitors) = dump.finish();
            self.finalizer.finalize(&mut snapshot, monitors);
            self.next_index += 1;
            debug!(
                dump = snapshot.index,
                vendor = %snapshot.vendor,
                threads = snapshot.threads.len(),
                "dump parsed"
            );
            return Ok(Some(snapshot));
        }
    }

    /// Skip to the next dump start. The returned checkpoint is still pinned.
    fn seek_start(&mut self) -> Result<Option<DumpStart>, DumpFailure> {
        let mut start_time = None;
        loop {
            let checkpoint = self.reader.checkpoint();
            let Some(line) = self.reader.next_line()? else {
                self.reader.release(checkpoint);
                return Ok(None);
            };
            if let Some(format) = self.classifier.observe(&line) {
                self.switch_format(format);
                // read the evidence line again with the new table
                self.reader.rewind(checkpoint);
                continue;
            }
            match self.classifier.classify(&line) {
                LineKind::DumpStart => {
                    self.headerless = false;
                    return Ok(Some(DumpStart {
                        checkpoint,
                        line: self.reader.line_number(),
                        marker: Some(line),
                        start_time,
                    }));
                }
                LineKind::ThreadHeader if self.implicit_starts() => {
                    self.reader.rewind(checkpoint);
                    let checkpoint = self.reader.checkpoint();
                    return Ok(Some(DumpStart {
                        checkpoint,
                        line: self.reader.line_number() + 1,
                        marker: None,
                        start_time,
                    }));
                }
                _ => {
                    if let Some(Preamble::StartTime(time)) = self.classifier.preamble(&line) {
                        start_time = Some(time);
                    }
                    self.reader.release(checkpoint);
                }
            }
        }
    }

    /// Move past what is left of a dump that was given up on.
    ///
    /// Stops before the next start marker or loose end, after an exact end.
    /// Where a thread header alone can open a dump, the rest of the failed
    /// dump's thread blocks are skipped too, up to the first line of
    /// unrelated text.
    fn skip_failed_dump(&mut self) -> Result<(), ParseError> {
        let implicit_starts = self.implicit_starts();
        loop {
            let Some(line) = self.reader.peek_line()?.map(str::to_string) else {
                return Ok(());
            };
            match self.classifier.classify(&line) {
                LineKind::DumpStart | LineKind::EndOfDump => return Ok(()),
                LineKind::ExactEndOfDump => {
                    self.reader.advance()?;
                    return Ok(());
                }
                LineKind::Other if !implicit_starts || !self.classifier.is_thread_text(&line) => {
                    return Ok(());
                }
                _ => {
                    self.reader.advance()?;
                }
            }
        }
    }

    /// A thread header may open a dump without a start marker.
    fn implicit_starts(&self) -> bool {
        self.headerless || self.classifier.format() == VendorFormat::Fallback
    }

    fn switch_format(&mut self, format: VendorFormat) {
        info!(
            line = self.reader.line_number(),
            to = format.name(),
            "switching dump format"
        );
        self.classifier.switch_to(format);
        self.headerless = true;
    }

    /// Read thread blocks until the dump ends. With `first_observed` the
    /// first line has already been fed to `observe`.
    fn read_threads(
        &mut self,
        dump: &mut DumpBuilder,
        mut first_observed: bool,
    ) -> Result<ThreadsEnd, DumpFailure> {
        loop {
            let Some(line) = self.reader.peek_line()?.map(str::to_string) else {
                break;
            };
            let already_observed = std::mem::take(&mut first_observed);
            if !already_observed && let Some(format) = self.classifier.observe(&line) {
                self.switch_format(format);
                return Ok(ThreadsEnd::Restart);
            }

            if self.classifier.needs_splice(&line) {
                self.reader.advance()?;
                let title = self.splice_title(line)?;
                if self.classifier.classify(&title) == LineKind::ThreadHeader {
                    self.begin_thread(dump, title)?;
                } else {
                    dump.append_line(&title);
                }
                continue;
            }

            match self.classifier.classify(&line) {
                LineKind::DumpStart | LineKind::EndOfDump => break,
                LineKind::ExactEndOfDump => {
                    self.reader.advance()?;
                    break;
                }
                LineKind::RepeatedThreads => {
                    self.reader.advance()?;
                    dump.flush_thread(&self.classifier);
                    self.skip_repeated_threads()?;
                }
                LineKind::ThreadHeader => {
                    self.reader.advance()?;
                    self.begin_thread(dump, line)?;
                }
                LineKind::ThreadState(state) => {
                    self.reader.advance()?;
                    dump.set_state(state);
                    dump.append_line(&line);
                }
                LineKind::Lock { role, monitor } => {
                    self.reader.advance()?;
                    dump.mention(role, monitor);
                    dump.append_line(&line);
                }
                LineKind::ThreadDetail { native_id, daemon } => {
                    self.reader.advance()?;
                    dump.detail(native_id, daemon);
                    dump.append_line(&line);
                }
                LineKind::StackFrame | LineKind::Other => {
                    self.reader.advance()?;
                    if dump.in_thread() {
                        dump.append_line(&line);
                    } else if let Some(fact) = self.classifier.preamble(&line) {
                        dump.preamble(fact);
                    }
                }
            }
        }
        dump.flush_thread(&self.classifier);
        Ok(ThreadsEnd::Finished)
    }

    /// Skip a block whose threads are printed again later in the dump.
    fn skip_repeated_threads(&mut self) -> Result<(), DumpFailure> {
        while let Some(line) = self.reader.peek_line()? {
            if self.classifier.ends_repeated_threads(line) {
                break;
            }
            self.reader.advance()?;
        }
        Ok(())
    }

    /// Join continuation lines onto a title whose quote is still open.
    fn splice_title(&mut self, mut title: String) -> Result<String, DumpFailure> {
        let mut spliced = 0;
        while self.classifier.needs_splice(&title) {
            if spliced == self.options.max_title_lines {
                return Err(FormatError::UnterminatedTitle { lines: spliced }.into());
            }
            let Some(next) = self.reader.next_line()? else {
                break;
            };
            title.push('\n');
            title.push_str(&next);
            spliced += 1;
        }
        Ok(title)
    }

    fn begin_thread(&mut self, dump: &mut DumpBuilder, title: String) -> Result<(), DumpFailure> {
        if self.options.cancel.is_cancelled() {
            return Err(ParseError::Cancelled {
                line: self.reader.line_number(),
            }
            .into());
        }
        match self.classifier.parse_header(&title) {
            Some(header) => dump.begin_thread(header, title, &self.classifier)?,
            None => {
                debug!(line = self.reader.line_number(), "unparseable thread header");
                dump.append_line(&title);
            }
        }
        Ok(())
    }
}

impl<R: BufRead, C: LineClassifier> Iterator for DumpSegmenter<R, C> {
    type Item = Result<ThreadDumpSnapshot, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parse_next().transpose()
    }
}

// ── Per-dump accumulation ───────────────────────────────────────

struct PendingThread {
    header: ThreadHeader,
    title: String,
    stack: String,
    mentions: Vec<LockMention>,
    state_line: Option<ThreadState>,
}

/// Collects threads and monitor mentions for the dump being read.
struct DumpBuilder {
    snapshot: ThreadDumpSnapshot,
    monitors: MonitorMap,
    current: Option<PendingThread>,
    identities: HashSet<(String, String)>,
    max_threads: usize,
}

impl DumpBuilder {
    fn new(snapshot: ThreadDumpSnapshot, max_threads: usize) -> Self {
        Self {
            snapshot,
            monitors: MonitorMap::new(),
            current: None,
            identities: HashSet::new(),
            max_threads,
        }
    }

    fn in_thread(&self) -> bool {
        self.current.is_some()
    }

    fn begin_thread<C: LineClassifier>(
        &mut self,
        mut header: ThreadHeader,
        title: String,
        classifier: &C,
    ) -> Result<(), FormatError> {
        self.flush_thread(classifier);
        if self.snapshot.threads.len() >= self.max_threads {
            return Err(FormatError::TooManyThreads {
                limit: self.max_threads,
            });
        }
        let mentions = header
            .blocked_on
            .take()
            .map(|monitor| vec![lock_mention(MonitorRole::Waiter, monitor)])
            .unwrap_or_default();
        self.current = Some(PendingThread {
            header,
            title,
            stack: String::new(),
            mentions,
            state_line: None,
        });
        Ok(())
    }

    fn append_line(&mut self, line: &str) {
        let Some(thread) = &mut self.current else {
            return;
        };
        if line.trim().is_empty() {
            return;
        }
        if !thread.stack.is_empty() {
            thread.stack.push('\n');
        }
        thread.stack.push_str(line);
    }

    fn set_state(&mut self, state: ThreadState) {
        if let Some(thread) = &mut self.current {
            thread.state_line = Some(state);
        }
    }

    fn mention(&mut self, role: MonitorRole, monitor: MonitorRef) {
        if let Some(thread) = &mut self.current {
            thread.mentions.push(lock_mention(role, monitor));
        }
    }

    fn detail(&mut self, native_id: Option<String>, daemon: Option<bool>) {
        if let Some(thread) = &mut self.current {
            if native_id.is_some() {
                thread.header.native_id = native_id;
            }
            if let Some(daemon) = daemon {
                thread.header.daemon = daemon;
            }
        }
    }

    fn preamble(&mut self, fact: Preamble) {
        let snap = &mut self.snapshot;
        match fact {
            Preamble::Version(v) => {
                snap.version.get_or_insert(v);
            }
            Preamble::StartTime(t) => {
                snap.start_time.get_or_insert(t);
            }
            Preamble::Heap(line) => append_text(&mut snap.heap_info, &line),
            Preamble::LockChain(line) => {
                if line.contains("Deadlock detected") {
                    snap.vendor_reported_deadlock = true;
                }
                append_text(&mut snap.lock_chains, &line);
            }
        }
    }

    fn flush_thread<C: LineClassifier>(&mut self, classifier: &C) {
        let Some(pending) = self.current.take() else {
            return;
        };
        let PendingThread {
            header,
            title,
            stack,
            mentions,
            state_line,
        } = pending;

        let idx = self.snapshot.threads.len();
        let tid = self.unique_tid(&header.name, &header.tid);
        let mut record = ThreadRecord::new(header.name, tid, title);
        record.native_id = header.native_id;
        record.priority = header.priority;
        record.daemon = header.daemon;
        record.stuck = header.stuck;
        record.is_gc_thread = classifier.is_gc_thread(&record.name);

        let mut state = state_line.or(header.state).unwrap_or(ThreadState::Running);
        if state == ThreadState::Waiting && stack.contains("java.lang.Thread.sleep") {
            state = ThreadState::TimedWait;
        }
        record.state = state;
        record.stack = stack;

        for m in &mentions {
            self.monitors
                .record(&m.monitor_id, m.class_name.as_deref(), m.role, idx, &record.title);
        }
        record.mentions = mentions;
        self.snapshot.threads.push(record);
    }

    /// `(name, tid)` must be unique within a dump; repeats get `~2`, `~3`...
    fn unique_tid(&mut self, name: &str, tid: &str) -> String {
        let mut candidate = tid.to_string();
        let mut n = 1;
        while !self.identities.insert((name.to_string(), candidate.clone())) {
            n += 1;
            candidate = format!("{tid}~{n}");
        }
        candidate
    }

    fn finish(self) -> (ThreadDumpSnapshot, MonitorMap) {
        (self.snapshot, self.monitors)
    }
}

fn lock_mention(role: MonitorRole, monitor: MonitorRef) -> LockMention {
    LockMention {
        monitor_id: monitor.id,
        class_name: monitor.class_name,
        role,
        owner_hint: monitor.owner_hint,
    }
}

fn append_text(slot: &mut Option<String>, line: &str) {
    match slot {
        Some(text) => {
            text.push('\n');
            text.push_str(line);
        }
        None => *slot = Some(line.to_string()),
    }
}

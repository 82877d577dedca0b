//! Thread dump segmentation and parsing.
//!
//! [`DumpSegmenter`] pulls one [`ThreadDumpSnapshot`] at a time out of a text
//! stream that may hold any number of dumps, possibly from different JVM
//! vendors, mixed with unrelated log output. [`DumpStore`] runs several
//! files side by side.

use std::io::Cursor;
use std::sync::Arc;

use tdump_types::{ThreadDumpSnapshot, VendorFormat};
use tdump_waitgraph::{FinalizeOptions, NoAdvice};
use tokio_util::sync::CancellationToken;

pub mod classify;
mod error;
pub mod reader;
mod segmenter;
mod store;
mod trailing;

pub use classify::{Classifier, LineClassifier};
pub use error::{FormatError, ParseError, ParseWarning};
pub use reader::{Checkpoint, LineReader};
pub use segmenter::DumpSegmenter;
pub use store::{DiscoveredDumps, DumpStore, parse_file};

/// Knobs for a parse.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Skip detection and use this table.
    pub format: Option<VendorFormat>,
    /// Lines looked at by format detection.
    pub detection_window: usize,
    /// Lines a trailing-section probe may skip before giving up.
    pub probe_window: usize,
    /// Continuation lines joined onto an unterminated thread title.
    pub max_title_lines: usize,
    pub max_section_lines: usize,
    pub max_threads: usize,
    pub finalize: FinalizeOptions,
    /// Checked before each thread header.
    pub cancel: CancellationToken,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            format: None,
            detection_window: 200,
            probe_window: 25,
            max_title_lines: 4,
            max_section_lines: 10_000,
            max_threads: 100_000,
            finalize: FinalizeOptions::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Parse every dump in `text` without advisories.
pub fn parse_str(
    text: &str,
    options: ParseOptions,
) -> Result<(Vec<ThreadDumpSnapshot>, Vec<ParseWarning>), ParseError> {
    let input = Cursor::new(text.as_bytes());
    let mut segmenter = DumpSegmenter::from_reader(input, options, Arc::new(NoAdvice))?;
    let mut snapshots = Vec::new();
    while let Some(snapshot) = segmenter.parse_next()? {
        snapshots.push(snapshot);
    }
    Ok((snapshots, segmenter.take_warnings()))
}

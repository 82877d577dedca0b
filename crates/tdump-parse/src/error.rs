//! Error types for tdump-parse

use facet::Facet;
use thiserror::Error;

/// Failure that ends parsing of a whole stream.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error while reading dump: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing cancelled at line {line}")]
    Cancelled { line: u64 },
}

/// Failure that ends only the dump being segmented; scanning resumes with
/// the next dump-start marker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("thread title still unterminated after {lines} spliced lines")]
    UnterminatedTitle { lines: usize },

    #[error("more than {limit} threads in one dump")]
    TooManyThreads { limit: usize },
}

/// User-visible note about a dump that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ParseWarning {
    /// Ordinal the skipped dump would have had in the stream.
    pub dump_index: u32,
    /// 1-based line number of the last line read before giving up.
    pub line_number: u64,
    pub last_line: String,
    pub message: String,
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dump #{} skipped at line {}: {} (last line read: {:?})",
            self.dump_index + 1,
            self.line_number,
            self.message,
            self.last_line
        )
    }
}

/// Outcome of segmenting one dump that did not produce a snapshot.
#[derive(Debug)]
pub(crate) enum DumpFailure {
    Stream(ParseError),
    Format(FormatError),
}

impl From<std::io::Error> for DumpFailure {
    fn from(err: std::io::Error) -> Self {
        DumpFailure::Stream(ParseError::Io(err))
    }
}

impl From<ParseError> for DumpFailure {
    fn from(err: ParseError) -> Self {
        DumpFailure::Stream(err)
    }
}

impl From<FormatError> for DumpFailure {
    fn from(err: FormatError) -> Self {
        DumpFailure::Format(err)
    }
}

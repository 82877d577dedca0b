//! Shared "file → discovered dumps" store for parsing several files at once.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use facet::Facet;
use parking_lot::Mutex;
use rayon::prelude::*;
use tdump_types::ThreadDumpSnapshot;
use tdump_waitgraph::{Advisor, Finalizer};
use tracing::{info, warn};

use crate::ParseOptions;
use crate::classify::LineClassifier;
use crate::error::ParseWarning;
use crate::segmenter::DumpSegmenter;

/// Everything one file produced.
#[derive(Debug, Default, Facet)]
pub struct DiscoveredDumps {
    pub snapshots: Vec<ThreadDumpSnapshot>,
    pub warnings: Vec<ParseWarning>,
    /// Stream failure that stopped the file early. Snapshots parsed before
    /// it are kept.
    pub error: Option<String>,
}

#[derive(Default)]
pub struct DumpStore {
    files: Mutex<BTreeMap<PathBuf, DiscoveredDumps>>,
}

impl DumpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every path in parallel. Each file's result lands in the store
    /// in a single write once the file is done. All files share one
    /// advisory pool.
    pub fn parse_files(&self, paths: &[PathBuf], options: &ParseOptions, advisor: Arc<dyn Advisor>) {
        let finalizer = Finalizer::new(&options.finalize, advisor);
        paths.par_iter().for_each(|path| {
            let found = parse_file_with(path, options.clone(), finalizer.clone());
            self.files.lock().insert(path.clone(), found);
        });
        info!(files = paths.len(), "parsed dump files");
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    /// Run `f` over the result for `path`, if that file was parsed.
    pub fn with_file<T>(&self, path: &Path, f: impl FnOnce(&DiscoveredDumps) -> T) -> Option<T> {
        self.files.lock().get(path).map(f)
    }

    pub fn into_inner(self) -> BTreeMap<PathBuf, DiscoveredDumps> {
        self.files.into_inner()
    }
}

/// Parse one file to the end. A stream failure is recorded, not returned.
pub fn parse_file(path: &Path, options: ParseOptions, advisor: Arc<dyn Advisor>) -> DiscoveredDumps {
    let finalizer = Finalizer::new(&options.finalize, advisor);
    parse_file_with(path, options, finalizer)
}

fn parse_file_with(path: &Path, options: ParseOptions, finalizer: Finalizer) -> DiscoveredDumps {
    match DumpSegmenter::open_with(path, options, finalizer) {
        Ok(segmenter) => drain(segmenter, &path.display().to_string()),
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot open dump file");
            DiscoveredDumps {
                error: Some(err.to_string()),
                ..DiscoveredDumps::default()
            }
        }
    }
}

/// Pull every snapshot out of `segmenter`. Snapshots parsed before a stream
/// failure are kept next to the error.
pub(crate) fn drain<R: BufRead, C: LineClassifier>(
    mut segmenter: DumpSegmenter<R, C>,
    source: &str,
) -> DiscoveredDumps {
    let mut found = DiscoveredDumps::default();
    for result in segmenter.by_ref() {
        match result {
            Ok(snapshot) => found.snapshots.push(snapshot),
            Err(err) => {
                warn!(source, %err, "dump stream ended early");
                found.error = Some(err.to_string());
                break;
            }
        }
    }
    found.warnings = segmenter.take_warnings();
    found
}

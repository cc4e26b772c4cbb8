//! Run-local log sinks.
//!
//! The dispatcher keeps two append-only log files under the run root (the
//! exception log and the node-error log) in addition to its structured
//! process logging. [`FileSink`] is the shared handle both are written
//! through: line-oriented, thread-safe, flushed after every append so the
//! file is current even if the process dies mid-run.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared append-only file sink with auto-flush.
///
/// The file is opened lazily on the first append, creating parent
/// directories as needed, so sinks can be constructed before the run tree
/// is materialized.
#[derive(Debug, Clone)]
pub struct FileSink {
    inner: Arc<Mutex<SinkInner>>,
}

#[derive(Debug)]
struct SinkInner {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    /// Create a sink for `path` without touching the filesystem yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                path: path.into(),
                writer: None,
            })),
        }
    }

    /// Path the sink appends to.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Append `text` followed by a newline and flush.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened or
    /// written.
    pub fn append(&self, text: &str) -> std::io::Result<()> {
        let mut inner = self.lock();
        if inner.writer.is_none() {
            let writer = open_append(&inner.path)?;
            inner.writer = Some(writer);
        }
        let writer = inner.writer.as_mut().expect("writer just opened");
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("exception.log");
        let sink = FileSink::new(&path);

        sink.append("first").unwrap();
        sink.append("second").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_clones_share_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-error.log");
        let sink = FileSink::new(&path);
        let clone = sink.clone();

        sink.append("from original").unwrap();
        clone.append("from clone").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "from original\nfrom clone\n");
    }

    #[test]
    fn test_appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exception.log");

        FileSink::new(&path).append("run one").unwrap();
        FileSink::new(&path).append("run two").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "run one\nrun two\n");
    }
}

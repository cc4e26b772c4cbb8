//! Run-directory layout.
//!
//! Everything a run produces lives under a timestamped root:
//!
//! ```text
//! dispatch-root/
//!   last -> <timestamp>                  (symlink to the newest run)
//!   <timestamp>/                         (per-run root; per-target below
//!     [<target>/]                         it in distributed mode)
//!       trace/                           (deleted on target rotation)
//!       test-case/
//!       profile/stat.pg, profile/stat.dat
//!       log/vm/<n>  log/svm/<n>
//!       log/exception.log  log/node-error.log  log/finish
//! ```

use std::path::{Path, PathBuf};

use corral_core::pool::TEST_CASE_DIR_NAME;

use crate::error::{DispatchError, DispatchResult};

/// Trace directory name under the run root.
pub const TRACE_DIR_NAME: &str = "trace";
/// Profile directory name under the run root.
pub const PROFILE_DIR_NAME: &str = "profile";
/// Log directory name under the run root.
pub const LOG_DIR_NAME: &str = "log";
/// VM error-log subdirectory under `log/`.
pub const LOG_VM_DIR_NAME: &str = "vm";
/// SVM error-log subdirectory under `log/`.
pub const LOG_SVM_DIR_NAME: &str = "svm";
/// Exception log file name under `log/`.
pub const EXCEPTION_LOG_FILE_NAME: &str = "exception.log";
/// Node-error log file name under `log/`.
pub const NODE_ERROR_LOG_FILE_NAME: &str = "node-error.log";
/// End-of-target status snapshot file name under `log/`.
pub const FINISH_FILE_NAME: &str = "finish";
/// Name of the newest-run symlink under the base directory.
pub const LAST_SYMLINK_NAME: &str = "last";

/// The run's position in the output tree.
#[derive(Debug, Clone)]
pub struct RunLayout {
    base: PathBuf,
    timestamp: String,
    root: PathBuf,
}

impl RunLayout {
    /// Lay out a new run under `base`, rooted at a timestamp directory.
    ///
    /// Nothing is created on disk until [`RunLayout::materialize`].
    #[must_use]
    pub fn new(base: &Path) -> Self {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d_%H.%M.%S")
            .to_string();
        let root = base.join(&timestamp);
        Self {
            base: base.to_path_buf(),
            timestamp,
            root,
        }
    }

    /// Current run root (per-target in distributed mode).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-root the layout at the per-target subdirectory for `target`.
    ///
    /// Only the final path component of the target name is used, so
    /// targets named like `coreutils/cat` produce a flat `cat/` subdir.
    pub fn retarget(&mut self, target: &str) {
        let dir = Path::new(target)
            .file_name()
            .map_or_else(|| target.to_string(), |n| n.to_string_lossy().into_owned());
        self.root = self.base.join(&self.timestamp).join(dir);
    }

    /// Create the run tree if it does not exist and refresh the `last`
    /// symlink to point at this run's timestamp directory.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DirCreate`] on directory-creation failure.
    pub fn materialize(&self) -> DispatchResult<()> {
        if !self.root.exists() {
            for dir in [
                self.trace_dir(),
                self.test_case_dir(),
                self.profile_dir(),
                self.vm_log_dir(),
                self.svm_log_dir(),
            ] {
                std::fs::create_dir_all(&dir)
                    .map_err(|source| DispatchError::DirCreate { path: dir.clone(), source })?;
            }
        }
        self.refresh_last_symlink();
        Ok(())
    }

    #[cfg(unix)]
    fn refresh_last_symlink(&self) {
        let link = self.base.join(LAST_SYMLINK_NAME);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&self.timestamp, &link) {
            tracing::warn!(error = %e, "failed to refresh last-run symlink");
        }
    }

    #[cfg(not(unix))]
    fn refresh_last_symlink(&self) {}

    /// `trace/` under the run root.
    #[must_use]
    pub fn trace_dir(&self) -> PathBuf {
        self.root.join(TRACE_DIR_NAME)
    }

    /// `test-case/` under the run root.
    #[must_use]
    pub fn test_case_dir(&self) -> PathBuf {
        self.root.join(TEST_CASE_DIR_NAME)
    }

    /// `profile/` under the run root.
    #[must_use]
    pub fn profile_dir(&self) -> PathBuf {
        self.root.join(PROFILE_DIR_NAME)
    }

    /// `log/` under the run root.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR_NAME)
    }

    /// `log/vm/` under the run root.
    #[must_use]
    pub fn vm_log_dir(&self) -> PathBuf {
        self.log_dir().join(LOG_VM_DIR_NAME)
    }

    /// `log/svm/` under the run root.
    #[must_use]
    pub fn svm_log_dir(&self) -> PathBuf {
        self.log_dir().join(LOG_SVM_DIR_NAME)
    }

    /// `log/exception.log` under the run root.
    #[must_use]
    pub fn exception_log_path(&self) -> PathBuf {
        self.log_dir().join(EXCEPTION_LOG_FILE_NAME)
    }

    /// `log/node-error.log` under the run root.
    #[must_use]
    pub fn node_error_log_path(&self) -> PathBuf {
        self.log_dir().join(NODE_ERROR_LOG_FILE_NAME)
    }

    /// `log/finish` under the run root.
    #[must_use]
    pub fn finish_path(&self) -> PathBuf {
        self.log_dir().join(FINISH_FILE_NAME)
    }

    /// Whether the run's log directory has been materialized yet.
    #[must_use]
    pub fn log_dir_exists(&self) -> bool {
        self.log_dir().is_dir()
    }

    /// Delete the trace directory. Traces are per-target and expensive;
    /// there is no reason to keep them once the target is done.
    ///
    /// # Errors
    ///
    /// [`DispatchError::FileWrite`] on removal failure; a directory that
    /// never existed is not a failure.
    pub fn clean_trace_dir(&self) -> DispatchResult<()> {
        let dir = self.trace_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DispatchError::FileWrite { path: dir, source }),
        }
    }

    /// Next free numbered error-file path under `log/<subdir>/`: the
    /// smallest unused positive integer.
    #[must_use]
    pub fn next_error_path(&self, subdir: &str) -> PathBuf {
        let dir = self.log_dir().join(subdir);
        let mut i = 1u32;
        while dir.join(i.to_string()).exists() {
            i += 1;
        }
        dir.join(i.to_string())
    }
}

//! Execution traces.
//!
//! A trace is the serialized record of one instrumented execution on a VM
//! node. The dispatcher persists each received trace under the run's
//! `trace/` directory, named by its UUID, and hands paths to the trace
//! pool; SVM refills re-load the payload from disk.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from trace persistence.
#[derive(Debug, Error)]
pub enum TraceFileError {
    /// Reading or writing the trace file failed.
    #[error("trace file i/o error at {path}: {source}")]
    Io {
        /// The file involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file contents did not decode as a trace.
    #[error("trace file {path} is not a valid trace: {source}")]
    Codec {
        /// The file involved.
        path: String,
        /// Underlying codec error.
        #[source]
        source: serde_json::Error,
    },
}

/// One serialized execution record.
///
/// The semantic content of `data` belongs to the VM/SVM pair; the
/// dispatcher only moves it, keyed by the UUID minted on the producing
/// node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trace {
    /// Stable identity, minted by the producing VM node.
    pub uuid: Uuid,
    /// Target program the trace was captured from.
    pub target: String,
    /// Opaque serialized execution record.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Trace {
    /// Build a trace with a fresh UUID. Intended for producers and tests.
    #[must_use]
    pub fn new(target: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            target: target.into(),
            data,
        }
    }

    /// File name the trace is stored under.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.uuid.to_string()
    }

    /// Persist the trace to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceFileError::Io`] on write failure.
    pub fn to_file(&self, path: &Path) -> Result<(), TraceFileError> {
        let bytes = serde_json::to_vec(self).map_err(|source| TraceFileError::Codec {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, bytes).map_err(|source| TraceFileError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load a trace previously written by [`Trace::to_file`].
    ///
    /// # Errors
    ///
    /// Returns [`TraceFileError::Io`] if the file cannot be read (including
    /// the lookup race where the file was removed after being pooled) and
    /// [`TraceFileError::Codec`] on corrupt contents.
    pub fn from_file(path: &Path) -> Result<Self, TraceFileError> {
        let bytes = fs::read(path).map_err(|source| TraceFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| TraceFileError::Codec {
            path: path.display().to_string(),
            source,
        })
    }
}

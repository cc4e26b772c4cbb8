//! Dispatcher configuration.
//!
//! The option tree is loaded from a TOML file, transmitted verbatim to
//! every registering worker as the `config` payload, and consulted by the
//! dispatch supervisor for mode, rotation thresholds, imaging, and
//! profiling cadence. Every field has a default so a minimal file (or none
//! at all, in tests) yields a working dev-mode configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from option loading.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The file could not be read.
    #[error("failed to read options file {}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file contents are not valid TOML for the option tree.
    #[error("failed to parse options file {}: {source}", path.display())]
    Parse {
        /// The file involved.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// The complete dispatcher option tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchOptions {
    /// Operating mode.
    pub mode: ModeOptions,
    /// Target list and rotation thresholds.
    pub test: TestOptions,
    /// VM-node imaging and refill tuning.
    pub vm: VmOptions,
    /// Trace pool tuning.
    pub trace: TraceOptions,
    /// Profiling cadence.
    pub profile: ProfileOptions,
    /// Base directory for the per-run output tree.
    pub dispatch_root: PathBuf,
}

/// Operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModeOptions {
    /// Distributed mode rotates targets across the cluster; dev mode runs
    /// a single implicit target until the operator stops the dispatcher.
    pub distributed: bool,
}

/// Target list and rotation thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestOptions {
    /// Ordered target names; seeds the rotation queue.
    pub items: Vec<String>,
    /// Per-target expiry thresholds.
    pub interval: IntervalOptions,
}

/// Per-target expiry thresholds. A target expires when the cluster
/// converges or any threshold is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntervalOptions {
    /// Lifetime-unique traces gathered for the target.
    pub trace: u64,
    /// Test cases generated for the target.
    pub tc: u64,
    /// Wall-clock seconds spent on the target.
    pub time: u64,
}

/// VM-node options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmOptions {
    /// Guest image provisioning.
    pub image: ImageOptions,
    /// Refill cap: top a VM node up to this many pending test cases.
    pub test_multiplier: u64,
    /// Refill cap: top an SVM node up to this many pending traces.
    pub trace_multiplier: u64,
}

/// Guest image provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageOptions {
    /// Path to the guest OS image on the dispatcher host.
    pub path: PathBuf,
    /// Whether registering VM nodes should have their image validated and
    /// re-provisioned on mismatch.
    pub update: bool,
}

/// Trace pool options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceOptions {
    /// Selection strategy name; `"fifo"` is the only built-in today.
    pub strategy: String,
}

/// Profiling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileOptions {
    /// Minimum seconds between statistics rows.
    pub interval: u64,
}

impl Default for ModeOptions {
    fn default() -> Self {
        Self { distributed: false }
    }
}

impl Default for IntervalOptions {
    fn default() -> Self {
        Self {
            trace: 10_000,
            tc: 100_000,
            time: 8 * 60 * 60,
        }
    }
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            image: ImageOptions::default(),
            test_multiplier: 10,
            trace_multiplier: 2,
        }
    }
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            strategy: "fifo".to_string(),
        }
    }
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

impl DispatchOptions {
    /// Load the option tree from a TOML file.
    ///
    /// # Errors
    ///
    /// [`OptionsError::Io`] if the file cannot be read,
    /// [`OptionsError::Parse`] on invalid contents.
    pub fn from_file(path: &Path) -> Result<Self, OptionsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| OptionsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            mode: ModeOptions::default(),
            test: TestOptions::default(),
            vm: VmOptions::default(),
            trace: TraceOptions::default(),
            profile: ProfileOptions::default(),
            dispatch_root: PathBuf::from("dispatch-root"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_dev_mode() {
        let options = DispatchOptions::default();
        assert!(!options.mode.distributed);
        assert!(options.test.items.is_empty());
        assert_eq!(options.trace.strategy, "fifo");
        assert_eq!(options.dispatch_root, PathBuf::from("dispatch-root"));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        std::fs::write(
            &path,
            r#"
            [mode]
            distributed = true

            [test]
            items = ["coreutils/cat", "coreutils/ls"]

            [test.interval]
            trace = 10
            tc = 500
            time = 3600

            [vm]
            test_multiplier = 4

            [vm.image]
            path = "/srv/images/guest.img"
            update = true

            [profile]
            interval = 30
            "#,
        )
        .unwrap();

        let options = DispatchOptions::from_file(&path).unwrap();
        assert!(options.mode.distributed);
        assert_eq!(options.test.items.len(), 2);
        assert_eq!(options.test.interval.trace, 10);
        assert_eq!(options.test.interval.tc, 500);
        assert_eq!(options.vm.test_multiplier, 4);
        assert_eq!(options.vm.trace_multiplier, 2); // default preserved
        assert!(options.vm.image.update);
        assert_eq!(options.profile.interval, 30);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, "[mode]\ndistributed = false\nmystery = 1\n").unwrap();
        assert!(matches!(
            DispatchOptions::from_file(&path),
            Err(OptionsError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = DispatchOptions::from_file(Path::new("/nonexistent/dispatch.toml"));
        assert!(matches!(result, Err(OptionsError::Io { .. })));
    }

    #[test]
    fn test_serde_roundtrip_is_identity() {
        let mut options = DispatchOptions::default();
        options.mode.distributed = true;
        options.test.items = vec!["target-a".into()];
        options.vm.image.path = PathBuf::from("/srv/guest.img");

        let json = serde_json::to_string(&options).unwrap();
        let decoded: DispatchOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, options);
    }
}

//! Dispatcher error type.

use std::path::PathBuf;

use corral_core::image::ImageError;
use corral_core::options::OptionsError;
use corral_core::pool::PoolError;
use corral_core::protocol::ProtocolError;
use corral_core::trace::TraceFileError;
use thiserror::Error;

/// Convenience alias for dispatcher results.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Everything that can go wrong while dispatching.
///
/// Protocol failures are scoped to one worker: the affected machine moves
/// to its error state and the run continues. Filesystem failures are
/// fatal to the run.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A worker protocol exchange failed.
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    /// A pool operation failed.
    #[error("pool failure: {0}")]
    Pool(#[from] PoolError),

    /// Trace persistence failed.
    #[error("trace failure: {0}")]
    TraceFile(#[from] TraceFileError),

    /// Image fingerprinting or packaging failed.
    #[error("image failure: {0}")]
    Image(#[from] ImageError),

    /// Option loading failed.
    #[error("options failure: {0}")]
    Options(#[from] OptionsError),

    /// A run-tree directory could not be created.
    #[error("failed to create directory {}: {source}", path.display())]
    DirCreate {
        /// The directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A run-tree file could not be opened or written.
    #[error("failed to write {}: {source}", path.display())]
    FileWrite {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Binding the master port failed.
    #[error("failed to bind master port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A registering peer sent something other than a role announcement.
    #[error("registration packet is not a role announcement: {kind}")]
    InvalidRegistration {
        /// Kind the peer sent.
        kind: String,
    },

    /// Uncategorized I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

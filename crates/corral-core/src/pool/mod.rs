//! Work pools.
//!
//! The dispatcher balances the cluster through two bounded-strategy
//! queues: the [`TracePool`] (traces waiting for an SVM node) and the
//! [`TestPool`] (test cases waiting for a VM node). Both dispense each
//! accepted item exactly once and keep two counters: how many items are
//! still waiting (`count_next`) and how many unique items were ever
//! accepted this run (`count_all*`). The first never exceeds the second.
//!
//! Pools are only touched from the dispatch thread, so they carry no
//! internal locking.

mod test;
mod trace;

use std::collections::VecDeque;
use std::path::PathBuf;

use thiserror::Error;

pub use test::{TestPool, TEST_CASE_DIR_NAME};
pub use trace::TracePool;

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configured selection strategy name is not known.
    #[error("unknown pool strategy '{name}'")]
    UnknownStrategy {
        /// The offending name.
        name: String,
    },

    /// A pooled trace path does not carry a UUID file name.
    #[error("pooled trace path has no uuid file name: {}", path.display())]
    InvalidTracePath {
        /// The offending path.
        path: PathBuf,
    },

    /// Persisting a pooled item failed.
    #[error("pool i/o error at {}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Dispensing order for pooled trace paths.
///
/// Selected by name at pool construction so the guest configuration can
/// pick the ordering without the dispatcher caring which one runs.
#[derive(Debug)]
pub(crate) enum Strategy {
    /// First-in, first-out.
    Fifo(VecDeque<PathBuf>),
}

impl Strategy {
    pub(crate) fn by_name(name: &str) -> Result<Self, PoolError> {
        match name {
            "fifo" => Ok(Self::Fifo(VecDeque::new())),
            other => Err(PoolError::UnknownStrategy {
                name: other.to_string(),
            }),
        }
    }

    pub(crate) fn push(&mut self, path: PathBuf) {
        match self {
            Self::Fifo(queue) => queue.push_back(path),
        }
    }

    pub(crate) fn next(&mut self) -> Option<PathBuf> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        match self {
            Self::Fifo(queue) => queue.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_by_name() {
        assert!(Strategy::by_name("fifo").is_ok());
        assert!(matches!(
            Strategy::by_name("weighted"),
            Err(PoolError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn test_fifo_order() {
        let mut s = Strategy::by_name("fifo").unwrap();
        s.push(PathBuf::from("a"));
        s.push(PathBuf::from("b"));
        assert_eq!(s.remaining(), 2);
        assert_eq!(s.next(), Some(PathBuf::from("a")));
        assert_eq!(s.next(), Some(PathBuf::from("b")));
        assert_eq!(s.next(), None);
    }
}

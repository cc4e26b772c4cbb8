//! Trace pool.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{PoolError, Strategy};

/// Pool of on-disk traces awaiting symbolic replay.
///
/// Items are trace file paths whose file name is the trace UUID. A UUID is
/// accepted once per run: re-inserting it (a VM node re-reporting the same
/// trace) is a no-op, so no trace is ever dispensed twice under FIFO.
#[derive(Debug)]
pub struct TracePool {
    strategy: Strategy,
    seen: HashSet<Uuid>,
}

impl TracePool {
    /// Build an empty pool with the named strategy (`"fifo"`).
    ///
    /// # Errors
    ///
    /// [`PoolError::UnknownStrategy`] for unrecognized names.
    pub fn new(strategy: &str) -> Result<Self, PoolError> {
        Ok(Self {
            strategy: Strategy::by_name(strategy)?,
            seen: HashSet::new(),
        })
    }

    /// Offer a trace file to the pool.
    ///
    /// Returns `true` if the trace was accepted, `false` if its UUID was
    /// already seen this run.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidTracePath`] if the file name is not a UUID.
    pub fn insert(&mut self, path: &Path) -> Result<bool, PoolError> {
        let uuid = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Uuid::parse_str(n).ok())
            .ok_or_else(|| PoolError::InvalidTracePath {
                path: path.to_path_buf(),
            })?;

        if !self.seen.insert(uuid) {
            return Ok(false);
        }
        self.strategy.push(path.to_path_buf());
        Ok(true)
    }

    /// Dispense the next trace path, if any.
    pub fn next(&mut self) -> Option<PathBuf> {
        self.strategy.next()
    }

    /// Traces still waiting to be dispensed.
    #[must_use]
    pub fn count_next(&self) -> u64 {
        self.strategy.remaining()
    }

    /// Unique traces accepted over the pool's lifetime.
    #[must_use]
    pub fn count_all_unique(&self) -> u64 {
        self.seen.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_path(dir: &Path) -> PathBuf {
        dir.join(Uuid::new_v4().to_string())
    }

    #[test]
    fn test_insert_and_dispense_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = TracePool::new("fifo").unwrap();
        let first = trace_path(dir.path());
        let second = trace_path(dir.path());

        assert!(pool.insert(&first).unwrap());
        assert!(pool.insert(&second).unwrap());
        assert_eq!(pool.count_next(), 2);
        assert_eq!(pool.count_all_unique(), 2);

        assert_eq!(pool.next(), Some(first));
        assert_eq!(pool.next(), Some(second));
        assert_eq!(pool.next(), None);
        assert_eq!(pool.count_next(), 0);
        assert_eq!(pool.count_all_unique(), 2);
    }

    #[test]
    fn test_duplicate_uuid_never_dispensed_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = TracePool::new("fifo").unwrap();
        let path = trace_path(dir.path());

        assert!(pool.insert(&path).unwrap());
        assert!(!pool.insert(&path).unwrap());
        assert_eq!(pool.count_next(), 1);
        assert_eq!(pool.count_all_unique(), 1);

        assert!(pool.next().is_some());
        // Re-offering after dispensing still refuses the duplicate.
        assert!(!pool.insert(&path).unwrap());
        assert_eq!(pool.next(), None);
    }

    #[test]
    fn test_count_next_never_exceeds_count_all_unique() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = TracePool::new("fifo").unwrap();
        for _ in 0..5 {
            pool.insert(&trace_path(dir.path())).unwrap();
            assert!(pool.count_next() <= pool.count_all_unique());
        }
        while pool.next().is_some() {
            assert!(pool.count_next() <= pool.count_all_unique());
        }
    }

    #[test]
    fn test_non_uuid_path_rejected() {
        let mut pool = TracePool::new("fifo").unwrap();
        let result = pool.insert(Path::new("/tmp/not-a-uuid"));
        assert!(matches!(result, Err(PoolError::InvalidTracePath { .. })));
    }
}

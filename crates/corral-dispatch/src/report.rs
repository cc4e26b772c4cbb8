//! Run reporting: the in-terminal status table and the profile statistics.

use std::io::Write;
use std::path::PathBuf;

use corral_core::node::NodeRole;

use crate::error::{DispatchError, DispatchResult};

/// Gnuplot preamble written once per target next to `stat.dat`.
const STAT_PG: &str = r#"#!/usr/bin/gnuplot
reset
set terminal png

set title "Test cases and traces per second"
set grid
set key reverse Left outside
set style data linespoints

set ylabel "tcs/traces"
set xlabel "seconds"

plot "stat.dat" using 1:2 title "tc remaining", \
     "" using 1:3 title "tc total", \
     "" using 1:4 title "trace remaining", \
     "" using 1:5 title "trace total"
"#;

/// Per-node column of the status table.
#[derive(Debug, Clone, Copy)]
pub struct NodeColumn {
    /// Worker role, shown in the column header.
    pub role: NodeRole,
    /// Worker-side pending test cases.
    pub test_case_count: u64,
    /// Worker-side pending traces.
    pub trace_count: u64,
}

/// One rendering of the cluster's state.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Seconds since the current target started.
    pub elapsed_secs: u64,
    /// Test cases waiting in the pool.
    pub tests_left: u64,
    /// Unique test cases accepted this target.
    pub tests_total: u64,
    /// Traces waiting in the pool.
    pub traces_left: u64,
    /// Unique traces accepted this target.
    pub traces_total: u64,
    /// One column per registered worker, in registration order.
    pub nodes: Vec<NodeColumn>,
}

impl StatusSnapshot {
    /// Render the two-line table.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn render<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write!(w, "{:>12}|{:>12}|{:>12}|", "time (s)", "tests left", "traces left")?;
        for (i, node) in self.nodes.iter().enumerate() {
            let header = format!("{}-[{}] tc/tr", i + 1, node.role.label());
            write!(w, "{header:>14}|")?;
        }
        writeln!(w)?;

        let tests = format!("{}/{}", self.tests_left, self.tests_total);
        let traces = format!("{}/{}", self.traces_left, self.traces_total);
        write!(w, "{:>12}|{tests:>12}|{traces:>12}|", self.elapsed_secs)?;
        for node in &self.nodes {
            let counts = format!("{}/{}", node.test_case_count, node.trace_count);
            write!(w, "{counts:>14}|")?;
        }
        writeln!(w)
    }
}

/// Appends `(t, tc_left, tc_total, trace_left, trace_total)` rows to
/// `profile/stat.dat`, at most once per configured interval, and writes
/// the gnuplot preamble before the first row.
///
/// One writer lives per target: rotation rebuilds it so each target's
/// profile directory gets its own preamble and a clock starting at zero.
#[derive(Debug)]
pub struct ProfileWriter {
    dir: PathBuf,
    interval: u64,
    last_elapsed: u64,
    header_written: bool,
}

impl ProfileWriter {
    /// Create a writer for the given profile directory.
    #[must_use]
    pub fn new(dir: PathBuf, interval: u64) -> Self {
        Self {
            dir,
            interval,
            last_elapsed: 0,
            header_written: false,
        }
    }

    /// Append a statistics row if the interval has elapsed since the last
    /// one.
    ///
    /// # Errors
    ///
    /// [`DispatchError::FileWrite`] on write failure.
    pub fn maybe_write(&mut self, snapshot: &StatusSnapshot) -> DispatchResult<()> {
        let elapsed = snapshot.elapsed_secs;
        if elapsed.saturating_sub(self.last_elapsed) < self.interval {
            return Ok(());
        }
        self.last_elapsed = elapsed;

        if !self.header_written {
            self.header_written = true;
            let path = self.dir.join("stat.pg");
            std::fs::write(&path, STAT_PG)
                .map_err(|source| DispatchError::FileWrite { path: path.clone(), source })?;
        }

        let path = self.dir.join("stat.dat");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| DispatchError::FileWrite { path: path.clone(), source })?;
        writeln!(
            file,
            "{} {} {} {} {}",
            elapsed,
            snapshot.tests_left,
            snapshot.tests_total,
            snapshot.traces_left,
            snapshot.traces_total
        )
        .map_err(|source| DispatchError::FileWrite { path, source })
    }
}

//! Progress accounting for a running engine.
//!
//! Workers update two monotonic counters: units known (raised on submission
//! and on mid-stage discovery, before the unit is visible to any worker) and
//! units finished. Because the total is always raised first, any snapshot an
//! observer takes satisfies `compiled <= total` even while discovery is
//! racing completion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use console::style;
use serde::Serialize;

use crate::helpers;
use crate::helpers::emojis::*;

pub struct ProgressTracker {
    total: AtomicU64,
    compiled: AtomicU64,
    paused: AtomicBool,
    started: Instant,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            compiled: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Raise the known-unit count. Must happen before the counted units are
    /// handed to the queue.
    pub fn add_total(&self, count: u64) {
        self.total.fetch_add(count, Ordering::SeqCst);
    }

    /// One unit reached its terminal stage.
    pub fn step(&self) {
        self.compiled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Point-in-time view. Reads the compiled count before the total, so a
    /// concurrent submission can only make the snapshot's total larger and
    /// `compiled <= total` holds for every observation.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let compiled = self.compiled.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        ProgressSnapshot {
            compiled,
            total,
            duration_seconds: self.started.elapsed().as_secs_f64(),
            paused: self.paused.load(Ordering::SeqCst),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub compiled: u64,
    pub total: u64,
    pub duration_seconds: f64,
    pub paused: bool,
}

/// Render a snapshot as a single status line for terminal hosts.
pub fn render(snapshot: &ProgressSnapshot) -> String {
    if snapshot.paused {
        return format!(
            "{}{}Paused at rendezvous ({}/{})",
            LINE_CLEAR,
            HOURGLASS,
            snapshot.compiled,
            snapshot.total
        );
    }
    if snapshot.total > 0 && snapshot.compiled >= snapshot.total {
        return format!(
            "{}{}{} {} units{}",
            LINE_CLEAR,
            SPARKLES,
            style("Compiled").bold().green(),
            snapshot.total,
            helpers::timing(snapshot.duration_seconds, false),
        );
    }
    format!(
        "{}{}{} {}/{} units",
        LINE_CLEAR,
        SWORDS,
        style("Compiling").bold().cyan(),
        snapshot.compiled,
        snapshot.total
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_never_exceeds_total() {
        let tracker = ProgressTracker::new();
        tracker.add_total(3);
        tracker.step();
        tracker.step();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.compiled, 2);
        assert_eq!(snapshot.total, 3);
        assert!(snapshot.compiled <= snapshot.total);
        assert!(!snapshot.paused);
    }

    #[test]
    fn paused_flag_round_trips() {
        let tracker = ProgressTracker::new();
        tracker.set_paused(true);
        assert!(tracker.snapshot().paused);
        tracker.set_paused(false);
        assert!(!tracker.snapshot().paused);
    }

    #[test]
    fn render_reports_completion() {
        let line = render(&ProgressSnapshot {
            compiled: 5,
            total: 5,
            duration_seconds: 1.25,
            paused: false,
        });
        assert!(line.contains("5 units"));
        assert!(line.contains("in 1.25s"));
    }

    #[test]
    fn render_reports_pause() {
        let line = render(&ProgressSnapshot {
            compiled: 2,
            total: 8,
            duration_seconds: 0.5,
            paused: true,
        });
        assert!(line.contains("Paused"));
        assert!(line.contains("2/8"));
    }
}

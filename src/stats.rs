// Statistics and the diagnostics report
//
// None of this is needed for correctness. The counters are plain relaxed atomics: a report is a best-effort
// picture of a moving system, not a consistent snapshot.

use std::fmt;
use std::time::Duration;

use mem::sync::{AtomicU64, Ordering};

use crate::config::DriverMode;

#[derive(Debug)]
pub(crate) struct BatchStats {
    passes: AtomicU64,
    batches: AtomicU64,
    barriers: AtomicU64,
    invoked: AtomicU64,
    outstanding: AtomicU64,
    forced: AtomicU64,
    deferred_harvests: AtomicU64,
}

impl BatchStats {
    pub(crate) fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            barriers: AtomicU64::new(0),
            invoked: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
            forced: AtomicU64::new(0),
            deferred_harvests: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_forced(&self) {
        self.forced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_deferred_harvest(&self) {
        self.deferred_harvests.fetch_add(1, Ordering::Relaxed);
    }

    // Counted before the node is queued so `outstanding` can't dip below zero when the invoker races ahead of us.
    #[inline(always)]
    pub(crate) fn record_submit(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_invoked(&self) {
        self.invoked.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            invoked: self.invoked.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            deferred_harvests: self.deferred_harvests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Calls to `tick()` that got past the single-orchestrator check.
    pub passes: u64,
    /// Completed batches, forced ones included.
    pub batches: u64,
    pub barriers: u64,
    pub invoked: u64,
    /// Submitted but not yet invoked.
    pub outstanding: u64,
    /// Batches ended by the timeout rather than by every worker consenting. Should stay at zero.
    pub forced: u64,
    /// Ticks that kept the batch open because an append into a list due for harvest was still in flight.
    pub deferred_harvests: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRow {
    pub id: usize,
    pub idle: bool,
    pub waiting: bool,
    pub depth: [usize; 2],
}

/// Textual diagnostics, rendered through `Display`.
#[derive(Debug, Clone)]
pub struct Report {
    pub hz: u32,
    pub driver: Option<DriverMode>,
    pub stats: StatsSnapshot,
    pub since_last_batch: Duration,
    pub current_queue: usize,
    pub workers: Vec<WorkerRow>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>14}: hz", self.hz)?;
        match self.driver {
            Some(mode) => writeln!(f, "{:>14}: driver", mode.name())?,
            None => writeln!(f, "{:>14}: driver", "none")?,
        }
        writeln!(f, "{:>14}: #passes seen", self.stats.passes)?;
        writeln!(f, "{:>14}: #batches seen", self.stats.batches)?;
        writeln!(f, "{:>14}: #barriers seen", self.stats.barriers)?;
        writeln!(f, "{:>14}: #callbacks invoked", self.stats.invoked)?;
        writeln!(f, "{:>14}: #callbacks left to invoke", self.stats.outstanding)?;
        writeln!(
            f,
            "{:>14}: #msecs since last end-of-batch",
            self.since_last_batch.as_millis()
        )?;
        writeln!(f, "{:>14}: #passes forced (0 is best)", self.stats.forced)?;
        writeln!(f, "{:>14}: #harvests deferred", self.stats.deferred_harvests)?;
        writeln!(f)?;

        for row in &self.workers {
            write!(f, "{:>4} ", row.id)?;
        }
        writeln!(f, " WORKER")?;

        for row in &self.workers {
            let idle = if row.idle { 'I' } else { '-' };
            let waiting = if row.waiting { 'W' } else { '-' };
            write!(f, "  {idle}{waiting} ")?;
        }
        writeln!(f, " FLAGS")?;

        for q in 0..2 {
            for row in &self.workers {
                write!(f, "{:>4} ", row.depth[q])?;
            }
            let marker = if q == self.current_queue { '*' } else { ' ' };
            writeln!(f, "  Q{q}{marker}")?;
        }

        writeln!(f)?;
        writeln!(f, "FLAGS:")?;
        writeln!(f, "  I - worker idle, W - worker holding up end-of-batch,")?;
        writeln!(f, "  * - the current Q, other is the previous Q.")
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn outstanding_tracks_submit_and_invoke() {
        let stats = BatchStats::new();
        for _ in 0..3 {
            stats.record_submit();
        }
        stats.record_invoked();

        let snap = stats.snapshot();
        assert_eq!(snap.invoked, 1);
        assert_eq!(snap.outstanding, 2);
    }

    #[test]
    fn report_layout() {
        let report = Report {
            hz: 20,
            driver: Some(DriverMode::Daemon),
            stats: StatsSnapshot {
                passes: 12,
                batches: 10,
                forced: 1,
                ..Default::default()
            },
            since_last_batch: Duration::from_millis(42),
            current_queue: 1,
            workers: vec![
                WorkerRow {
                    id: 0,
                    idle: false,
                    waiting: true,
                    depth: [3, 0],
                },
                WorkerRow {
                    id: 1,
                    idle: true,
                    waiting: false,
                    depth: [0, 5],
                },
            ],
        };

        let text = report.to_string();
        println!("{text}");

        assert!(text.contains("            20: hz"));
        assert!(text.contains("        daemon: driver"));
        assert!(text.contains("            10: #batches seen"));
        assert!(text.contains("            42: #msecs since last end-of-batch"));
        assert!(text.contains("             1: #passes forced (0 is best)"));
        assert!(text.contains("   0    1  WORKER"));
        assert!(text.contains("  -W   I-  FLAGS"));
        assert!(text.contains("   3    0   Q0 "));
        assert!(text.contains("   0    5   Q1*"));
    }
}

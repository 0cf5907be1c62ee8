use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tracing::info;

/// Counts completed units of a parallel stage and logs every tenth of the
/// total. Shared by reference across rayon workers.
#[derive(Debug)]
pub struct ProgressTracker {
    label: &'static str,
    total: usize,
    processed: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(label: &'static str, total: usize) -> Self {
        Self {
            label,
            total,
            processed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Records one finished unit. Returns the percentage milestone crossed by
    /// this call, if any.
    pub fn record(&self) -> Option<usize> {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        let milestone = milestone_crossed(processed, self.total)?;
        info!(
            stage = self.label,
            processed,
            total = self.total,
            elapsed_ms = elapsed_ms(self.started),
            "{}% complete",
            milestone
        );
        Some(milestone)
    }
}

fn milestone_crossed(processed: usize, total: usize) -> Option<usize> {
    if total == 0 || processed == 0 || processed > total {
        return None;
    }
    let current = processed * 10 / total;
    let previous = (processed - 1) * 10 / total;
    (current > previous).then_some(current * 10)
}

pub fn elapsed_ms(start: Instant) -> u64 {
    (start.elapsed().as_secs_f32() * 1000.0).round() as u64
}

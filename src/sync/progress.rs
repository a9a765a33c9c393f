use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where the orchestrator reports progress and asks whether to stop.
pub trait ProgressSink: Send + Sync {
    fn update(&self, percentage: u8, label: &str);

    /// Polled once after each completed unit of work.
    fn cancel_requested(&self) -> bool;
}

/// Cooperative cancellation flag shared with whoever may cancel a run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress through the `log` facade, cancellation through a [`CancelFlag`].
#[derive(Debug, Clone, Default)]
pub struct LogProgress {
    cancel: CancelFlag,
}

impl LogProgress {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl ProgressSink for LogProgress {
    fn update(&self, percentage: u8, label: &str) {
        log::info!("[{percentage:>3}%] {label}");
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Denominator used for a selection of `size` endpoints. Multi-item
/// selections count one extra step, so a phase never shows 100%.
pub fn selection_total(size: usize) -> usize {
    match size {
        0 | 1 => size,
        n => n + 1,
    }
}

pub fn progress_percentage(completed: usize, size: usize) -> u8 {
    let total = selection_total(size);
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * completed as f64 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

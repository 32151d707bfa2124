// Progress reporting for long-running volume operations

use std::sync::Arc;

/// Progress information for format, defragment, scan and erase operations
#[derive(Debug, Clone)]
pub struct OperationProgress {
    /// Operation name ("format", "defragment", ...)
    pub operation: String,
    /// What is being worked on (a pathname, a region of the volume)
    pub item: String,
    /// Units completed so far (clusters, sectors, files)
    pub done: u64,
    /// Total units, 0 when unknown
    pub total: u64,
    /// Percentage complete (0-100)
    pub percentage: f32,
}

impl OperationProgress {
    pub fn new(operation: impl Into<String>, total: u64) -> Self {
        Self {
            operation: operation.into(),
            item: String::new(),
            done: 0,
            total,
            percentage: 0.0,
        }
    }

    pub fn update(&mut self, item: impl Into<String>, done: u64) {
        self.item = item.into();
        self.done = done;
        if self.total > 0 {
            self.percentage = (self.done as f32 / self.total as f32 * 100.0).min(100.0);
        }
    }
}

/// Trait for progress reporting callbacks
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: &OperationProgress);
}

/// No-op progress callback
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _progress: &OperationProgress) {}
}

/// Logging progress callback
pub struct LoggingProgress;

impl ProgressCallback for LoggingProgress {
    fn on_progress(&self, progress: &OperationProgress) {
        log::info!(
            "{} progress: {:.1}% ({}/{}) {}",
            progress.operation,
            progress.percentage,
            progress.done,
            progress.total,
            progress.item
        );
    }
}

/// Function-based progress callback
pub struct FnProgress<F>
where
    F: Fn(&OperationProgress) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgress<F>
where
    F: Fn(&OperationProgress) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(&OperationProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &OperationProgress) {
        (self.callback)(progress);
    }
}

/// Progress reporter that manages callbacks
pub struct ProgressReporter {
    progress: OperationProgress,
    callback: Arc<dyn ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(operation: impl Into<String>, total: u64, callback: Arc<dyn ProgressCallback>) -> Self {
        Self {
            progress: OperationProgress::new(operation, total),
            callback,
        }
    }

    pub fn with_noop(operation: impl Into<String>, total: u64) -> Self {
        Self::new(operation, total, Arc::new(NoOpProgress))
    }

    pub fn set_total(&mut self, total: u64) {
        self.progress.total = total;
    }

    pub fn report(&mut self, item: impl Into<String>, done: u64) {
        self.progress.update(item, done);
        self.callback.on_progress(&self.progress);
    }

    /// Add `delta` units to the running count
    pub fn advance(&mut self, item: impl Into<String>, delta: u64) {
        let done = self.progress.done + delta;
        self.report(item, done);
    }

    pub fn done(&self) -> u64 {
        self.progress.done
    }

    pub fn complete(&mut self) {
        self.progress.done = self.progress.total;
        self.progress.percentage = 100.0;
        self.callback.on_progress(&self.progress);
    }
}

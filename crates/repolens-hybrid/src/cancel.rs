use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for a rebuild, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProgress {
    pub project_id: String,
    pub full: bool,
    pub embedded: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(&BuildProgress) + Send + Sync>;

/// Knobs for a single rebuild call.
#[derive(Clone, Default)]
pub struct RebuildOptions {
    pub full: bool,
    pub cancel: Option<CancelToken>,
    pub progress: Option<ProgressFn>,
}

impl RebuildOptions {
    pub fn full(full: bool) -> Self {
        Self { full, ..Self::default() }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    pub(crate) fn report(&self, progress: &BuildProgress) {
        if let Some(cb) = &self.progress {
            cb(progress);
        }
    }
}

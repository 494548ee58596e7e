//! Progress reporting for import runs.
//!
//! The executor reports each stage's [`State`] through a
//! [`ProgressCallback`] so front-ends can render it (progress bars, logs)
//! without the pipeline knowing how.

use std::sync::Arc;

use feeds_feed_models::Stage;
use feeds_feed_models::state::State;

/// Receives progress of long-running operations.
///
/// Implementations must be `Send + Sync` so one reporter can be shared by
/// every worker.
pub trait ProgressCallback: Send + Sync {
    /// Set the total expected units of work (enables percentage/ETA).
    fn set_total(&self, total: u64);

    /// Set the current position (absolute, not delta).
    fn set_position(&self, pos: u64);

    /// Advance progress by `delta` units.
    fn inc(&self, delta: u64);

    /// Update the message displayed alongside the progress indicator.
    fn set_message(&self, msg: String);

    /// Mark progress as complete with a final message.
    fn finish(&self, msg: String);

    /// Mark progress as complete and remove the progress indicator.
    fn finish_and_clear(&self);
}

/// Ignores every update. Used by tests and quiet commands.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _pos: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

/// Returns a shared [`NullProgress`] instance.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Forwards a stage state to a reporter.
pub(crate) fn report(progress: &dyn ProgressCallback, label: &str, stage: Stage, state: &State) {
    if let Some(total) = state.total {
        progress.set_total(total);
    }
    progress.set_position(state.progress);
    let message = state.message.as_deref().map_or_else(
        || format!("{label}: {stage}"),
        |message| format!("{label}: {stage} ({message})"),
    );
    progress.set_message(message);
}

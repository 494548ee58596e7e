//! Per-stage progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress and restart position of one stage of one feed's import.
///
/// `progress` never exceeds `total` once the total is known. Once
/// `completed` is set, the stage is finished for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Total units of work, when known.
    pub total: Option<u64>,
    /// Units of work done so far.
    pub progress: u64,
    /// Stage-owned restart position (byte offset, file index, ...).
    pub pointer: Option<u64>,
    /// Last status message.
    pub message: Option<String>,
    /// Whether this stage finished for the current run.
    pub completed: bool,
    /// When progress was last recorded.
    pub updated: Option<DateTime<Utc>>,
    /// Item outcome counters.
    #[serde(default)]
    pub counters: Counters,
}

/// Item outcome counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// New entities created.
    pub created: u64,
    /// Existing entities replaced or updated.
    pub updated: u64,
    /// Matched entities whose content hash did not change.
    pub unchanged: u64,
    /// Items skipped by policy or by an item filter.
    pub skipped: u64,
    /// Entities deleted by clean or expire.
    pub deleted: u64,
    /// Entities unpublished by clean.
    pub unpublished: u64,
    /// Entities whose clean, expire, or save failed.
    pub failed: u64,
}

impl Counters {
    /// Adds another set of counters to this one.
    pub const fn merge(&mut self, other: &Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.unpublished += other.unpublished;
        self.failed += other.failed;
    }
}

impl State {
    /// Sets the total, clamping progress to it.
    pub fn set_total(&mut self, total: u64) {
        self.total = Some(total);
        self.progress = self.progress.min(total);
    }

    /// Grows the total by `delta`, starting from zero if unknown.
    pub fn add_total(&mut self, delta: u64) {
        self.total = Some(self.total.unwrap_or(0).saturating_add(delta));
    }

    /// Sets progress (clamped to the total) and records the update time.
    pub fn set_progress(&mut self, progress: u64, now: DateTime<Utc>) {
        self.progress = self.total.map_or(progress, |total| progress.min(total));
        self.updated = Some(now);
    }

    /// Advances progress by `delta`.
    pub fn advance(&mut self, delta: u64, now: DateTime<Utc>) {
        self.set_progress(self.progress.saturating_add(delta), now);
    }

    /// Sets the status message.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Marks the stage finished.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.updated = Some(now);
        if let Some(total) = self.total {
            self.progress = total;
        }
    }

    /// Returns progress as a fraction in `0.0..=1.0`; `1.0` once completed
    /// and `0.0` while the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.completed {
            return 1.0;
        }
        match self.total {
            Some(0) | None => 0.0,
            Some(total) => (self.progress as f64 / total as f64).min(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn progress_is_clamped_to_total() {
        let mut state = State::default();
        state.set_total(3);
        state.set_progress(10, now());
        assert_eq!(state.progress, 3);

        state.set_total(2);
        assert_eq!(state.progress, 2);
    }

    #[test]
    fn progress_is_unbounded_until_total_known() {
        let mut state = State::default();
        state.advance(5, now());
        assert_eq!(state.progress, 5);
        assert_eq!(state.updated, Some(now()));
        assert!(state.fraction().abs() < f64::EPSILON);
    }

    #[test]
    fn completion_is_full_progress() {
        let mut state = State::default();
        state.add_total(4);
        state.add_total(4);
        state.advance(2, now());
        assert!((state.fraction() - 0.25).abs() < f64::EPSILON);
        state.complete(now());
        assert_eq!(state.progress, 8);
        assert!((state.fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_merge() {
        let mut a = Counters {
            created: 1,
            deleted: 2,
            ..Counters::default()
        };
        a.merge(&Counters {
            created: 3,
            failed: 1,
            ..Counters::default()
        });
        assert_eq!(a.created, 4);
        assert_eq!(a.deleted, 2);
        assert_eq!(a.failed, 1);
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the feeds toolchain.
//!
//! Provides `indicatif`-backed progress bars behind the pipeline's
//! [`ProgressCallback`] trait, plus [`init_logger`] which sets up
//! `indicatif-log-bridge` so that `log::info!` and friends are suspended
//! while progress bars redraw.
//!
//! Any binary that calls [`init_logger()`] at startup gets full progress bar
//! support for free. The `render_*` helpers format feeds and stage states
//! as plain-text tables.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use feeds_feed_models::state::State;
use feeds_feed_models::{Feed, Stage};
use feeds_pipeline::progress::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
    /// Style to switch to once `set_total()` provides a known length.
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    /// Creates a bar for one import run. It starts as a spinner (no total
    /// known) and transitions to a full bar with percentage/ETA once a
    /// stage reports its total through [`ProgressCallback::set_total()`].
    #[must_use]
    pub fn import_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {msg} {wide_bar:.cyan/dim} {pos}/{len} {percent}% [{eta}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self { bar, bar_style })
    }

    /// Creates a progress bar for step-level progress (e.g., feeds 1/7).
    /// Total is known up front so this starts as a bar immediately.
    #[must_use]
    pub fn steps_bar(
        multi: &MultiProgress,
        message: &str,
        total: u64,
    ) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} {wide_bar:.green/dim} {pos}/{len} [{elapsed_precise}]",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar.set_message(message.to_string());

        let bar_style = bar.style();

        Arc::new(Self { bar, bar_style })
    }

    /// Creates a spinner for queue work, where runs of many feeds
    /// interleave and no single total applies. Stage messages still show.
    #[must_use]
    pub fn queue_spinner(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        let style = ProgressStyle::with_template("{spinner:.yellow} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style.clone());
        bar.set_message(message.to_string());

        Arc::new(Spinner(Self {
            bar,
            bar_style: style,
        }))
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        // Stages report their total on every step; only reset on change.
        if self.bar.length() == Some(total) {
            return;
        }
        self.bar.set_length(total);
        self.bar.set_position(0);
        // Switch from spinner to bar style now that we know the total.
        self.bar.set_style(self.bar_style.clone());
    }

    fn set_position(&self, pos: u64) {
        self.bar.set_position(pos);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Keeps spinning: totals and positions of individual stages are ignored.
struct Spinner(IndicatifProgress);

impl ProgressCallback for Spinner {
    fn set_total(&self, _total: u64) {}

    fn set_position(&self, _pos: u64) {}

    fn inc(&self, delta: u64) {
        self.0.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.0.set_message(msg);
    }

    fn finish(&self, msg: String) {
        // One run finishing does not end the queue work.
        self.0.set_message(msg);
    }

    fn finish_and_clear(&self) {
        self.0.finish_and_clear();
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    // Build the pretty-env-logger logger manually so we can wrap it.
    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    multi
}

/// Formats an optional timestamp to the second, `-` when absent.
#[must_use]
pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || "-".to_string(),
        |time| time.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// Renders feeds as a table, one line per feed.
#[must_use]
pub fn render_feeds(feeds: &[Feed]) -> String {
    let mut out = format!(
        "{:<6} {:<16} {:<24} {:>8} {:<6} {:<20} {:<20}\n",
        "ID", "TYPE", "LABEL", "ITEMS", "ACTIVE", "IMPORTED", "NEXT"
    );
    out.push_str(&"-".repeat(106));
    out.push('\n');
    for feed in feeds {
        let _ = writeln!(
            out,
            "{:<6} {:<16} {:<24} {:>8} {:<6} {:<20} {:<20}",
            feed.id.to_string(),
            feed.feed_type,
            feed.label,
            feed.item_count,
            if feed.active { "yes" } else { "no" },
            format_time(feed.imported),
            format_time(feed.next_import),
        );
    }
    out
}

/// Renders the persisted stage states of one feed.
#[must_use]
pub fn render_states(states: &[(Stage, State)]) -> String {
    if states.is_empty() {
        return "No recorded state\n".to_string();
    }
    let mut out = String::new();
    for (stage, state) in states {
        let total = state
            .total
            .map_or_else(|| "?".to_string(), |total| total.to_string());
        let status = if state.completed { "done" } else { "running" };
        let _ = write!(
            out,
            "{:<8} {:<7} {}/{} ({:.0}%)",
            stage.to_string(),
            status,
            state.progress,
            total,
            state.fraction() * 100.0,
        );
        if let Some(pointer) = state.pointer {
            let _ = write!(out, " pointer={pointer}");
        }
        let c = &state.counters;
        let _ = write!(
            out,
            " created={} updated={} unchanged={} skipped={} deleted={} unpublished={} failed={}",
            c.created, c.updated, c.unchanged, c.skipped, c.deleted, c.unpublished, c.failed
        );
        if let Some(message) = &state.message {
            let _ = write!(out, " \"{message}\"");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use feeds_feed_models::{FeedId, NewFeed};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn formats_missing_and_present_times() {
        assert_eq!(format_time(None), "-");
        assert_eq!(format_time(Some(at(0))), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn renders_one_row_per_feed() {
        let mut feed = NewFeed::new("csv_file", "Parcels", "/tmp/parcels.csv")
            .into_feed(FeedId(7), at(0));
        feed.item_count = 42;
        feed.active = false;

        let table = render_feeds(&[feed]);
        let lines: Vec<_> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[2].starts_with("7 "));
        assert!(lines[2].contains("csv_file"));
        assert!(lines[2].contains("Parcels"));
        assert!(lines[2].contains("42"));
        assert!(lines[2].contains("no"));
    }

    #[test]
    fn renders_state_progress_and_counters() {
        let mut state = State::default();
        state.set_total(4);
        state.set_progress(1, at(10));
        state.pointer = Some(1);
        state.counters.created = 1;
        state.set_message("batch 1");

        let text = render_states(&[(Stage::Process, state)]);

        assert!(text.starts_with("process  running 1/4 (25%) pointer=1"));
        assert!(text.contains("created=1 updated=0"));
        assert!(text.trim_end().ends_with("\"batch 1\""));
        assert_eq!(render_states(&[]), "No recorded state\n");
    }
}

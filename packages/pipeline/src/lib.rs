#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! The import pipeline: feed type configuration, the plugin registry,
//! per-feed locking, and the stage executor.
//!
//! Feed types are TOML documents (see [`config::FeedTypes`]); the
//! built-in ones are embedded at compile time and more can be loaded from
//! a directory. [`registry::PluginRegistry`] maps the plugin ids a feed
//! type names to factories and validates feed types before use.
//! [`executor::Executor`] drives imports as chains of queued stage tasks,
//! guarded by a [`lock::FeedLock`] per feed.

pub mod config;
pub mod executor;
pub mod filter;
pub mod lock;
pub mod progress;
pub mod registry;

pub use config::{ConfigError, ExecutorSettings, FeedTypes};
pub use executor::{Executor, ImportError, ImportOutcome, ImportSummary, StageError, WorkReport};
pub use registry::{PluginContext, PluginRegistry};

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Parser plugins and custom source resolution.
//!
//! A [`Parser`] turns a [`FetcherResult`] into a [`ParserResult`]. After
//! building each raw item, the parser runs the feed type's custom sources
//! through a [`sources::SourceResolver`], which writes every resolved value
//! into the item under the custom source's name.
//!
//! [`csv_parser::CsvParser`] is batched and restartable: each call parses
//! at most `line_limit` rows starting at the byte offset recorded in
//! [`State::pointer`]. [`json_parser::JsonParser`] parses a whole document
//! in one call.

pub mod csv_parser;
pub mod csv_reader;
pub mod json_parser;
pub mod sources;

use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::item::{ItemError, ParserResult};
use feeds_feed_models::state::State;
use serde::Serialize;

/// Errors that can occur while parsing fetched content.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// CSV decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON decoding failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while reading fetched content.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The input or the parser configuration is unusable.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of what went wrong.
        message: String,
    },

    /// A row's column count differs from the header in strict mode.
    #[error("Row at byte {offset}: expected {expected} columns, found {found}")]
    ColumnCount {
        /// Byte offset where the row starts.
        offset: u64,
        /// Number of header columns.
        expected: usize,
        /// Number of columns in the row.
        found: usize,
    },

    /// A value could not be stored on an item.
    #[error(transparent)]
    Item(#[from] ItemError),
}

/// A source a parser provides natively, without a custom source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingSource {
    /// Source key used in mappings.
    pub key: String,
    /// Human-readable label.
    pub label: String,
}

impl MappingSource {
    /// Creates a mapping source whose label equals its key.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            label: key.to_owned(),
        }
    }
}

/// Turns fetched content into items.
pub trait Parser: Send + Sync {
    /// Returns the registry id of this parser (e.g. `"csv"`).
    fn id(&self) -> &'static str;

    /// Parses the next batch of items.
    ///
    /// The parser records its restart position in `state` and marks the
    /// state completed once the content is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the content cannot be read or decoded.
    /// The state is left at its last checkpoint.
    fn parse(
        &self,
        feed: &Feed,
        fetched: &FetcherResult,
        state: &mut State,
    ) -> Result<ParserResult, ParseError>;

    /// Returns the sources this parser provides natively.
    fn mapping_sources(&self) -> Vec<MappingSource>;

    /// Returns the custom source types this parser can resolve.
    fn custom_source_types(&self) -> &'static [&'static str];
}

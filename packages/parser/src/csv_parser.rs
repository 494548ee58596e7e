//! Batched, restartable CSV parser.
//!
//! Each call reads up to `line_limit` rows starting at the byte offset
//! recorded in the parse state and records the offset just past the last
//! row read. The header (when present) is re-read from offset 0 on every
//! call, so a queued parse task needs nothing but the state to resume.

use std::sync::Arc;

use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::item::{Item, ParserResult};
use feeds_feed_models::state::State;
use feeds_time::Clock;
use serde::Deserialize;
use serde_json::Value;

use crate::csv_reader::CsvReader;
use crate::sources::SourceResolver;
use crate::{MappingSource, ParseError, Parser};

/// Settings of the `csv` parser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CsvSettings {
    /// Field delimiter: `,`, `;`, `|`, `\t` (or `tab`), or any single
    /// ASCII character.
    pub delimiter: String,
    /// Whether the first row names the columns.
    pub has_header: bool,
    /// Column names for files without a header row.
    pub columns: Vec<String>,
    /// Reject rows whose column count differs from the header instead of
    /// padding them with empty values.
    pub strict_columns: bool,
    /// Rows per parse batch.
    pub line_limit: usize,
}

impl Default for CsvSettings {
    fn default() -> Self {
        Self {
            delimiter: ",".to_owned(),
            has_header: true,
            columns: Vec::new(),
            strict_columns: false,
            line_limit: 100,
        }
    }
}

impl CsvSettings {
    /// Returns the delimiter as a byte.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidInput`] if the delimiter is not a
    /// single ASCII character.
    pub fn delimiter_byte(&self) -> Result<u8, ParseError> {
        match self.delimiter.as_str() {
            "\\t" | "tab" | "TAB" => Ok(b'\t'),
            d if d.len() == 1 && d.is_ascii() => Ok(d.as_bytes()[0]),
            d => Err(ParseError::InvalidInput {
                message: format!("delimiter must be a single ASCII character, got {d:?}"),
            }),
        }
    }
}

/// Parses delimited text into fixed-schema items.
#[derive(Debug, Clone)]
pub struct CsvParser {
    settings: CsvSettings,
    delimiter: u8,
    resolver: SourceResolver,
    clock: Arc<dyn Clock>,
}

impl CsvParser {
    /// Custom source types this parser resolves.
    pub const CUSTOM_SOURCE_TYPES: &'static [&'static str] = &["csv", "blank"];

    /// Creates a CSV parser.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidInput`] if the settings are invalid.
    pub fn new(
        settings: CsvSettings,
        resolver: SourceResolver,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ParseError> {
        let delimiter = settings.delimiter_byte()?;
        if settings.line_limit == 0 {
            return Err(ParseError::InvalidInput {
                message: "line_limit must be at least 1".to_owned(),
            });
        }
        Ok(Self {
            settings,
            delimiter,
            resolver,
            clock,
        })
    }

    fn build_item(
        &self,
        columns: Option<&[String]>,
        schema: Option<&Arc<[String]>>,
        row: Vec<String>,
    ) -> Result<Item, ParseError> {
        let mut item = schema.map_or_else(Item::dynamic, |s| Item::with_schema(s.clone()));
        match columns {
            Some(columns) => {
                let mut values = row.into_iter();
                for name in columns {
                    item.set(name.clone(), Value::String(values.next().unwrap_or_default()))?;
                }
            }
            None => {
                for (index, value) in row.into_iter().enumerate() {
                    item.set(index.to_string(), Value::String(value))?;
                }
            }
        }
        self.resolver.apply(&mut item)?;
        Ok(item)
    }
}

impl Parser for CsvParser {
    fn id(&self) -> &'static str {
        "csv"
    }

    fn parse(
        &self,
        feed: &Feed,
        fetched: &FetcherResult,
        state: &mut State,
    ) -> Result<ParserResult, ParseError> {
        let mut reader = CsvReader::open(fetched, self.delimiter)?;
        let total = fetched.len()?;

        let header = if self.settings.has_header {
            reader
                .next_row()?
                .map(|row| row.into_iter().map(|h| h.trim().to_owned()).collect())
        } else {
            None
        };
        let columns: Option<Vec<String>> = header.or_else(|| {
            (!self.settings.columns.is_empty()).then(|| self.settings.columns.clone())
        });
        let schema: Option<Arc<[String]>> = columns.as_ref().map(|columns| {
            let mut names = columns.clone();
            names.extend(
                self.resolver
                    .names()
                    .filter(|n| !columns.iter().any(|c| c == n))
                    .map(str::to_owned),
            );
            names.into()
        });

        let data_start = reader.position();
        let start = state.pointer.map_or(data_start, |p| p.max(data_start));
        if start != data_start {
            reader.seek(start)?;
        }

        let mut result = ParserResult::new();
        let mut exhausted = false;
        while result.len() < self.settings.line_limit {
            let row_start = reader.position();
            let Some(row) = reader.next_row()? else {
                exhausted = true;
                break;
            };
            if self.settings.strict_columns
                && let Some(columns) = &columns
                && row.len() != columns.len()
            {
                return Err(ParseError::ColumnCount {
                    offset: row_start,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            result.push(self.build_item(columns.as_deref(), schema.as_ref(), row)?);
        }

        let position = reader.position();
        let now = self.clock.now();
        state.set_total(total);
        state.pointer = Some(position);
        state.set_progress(position, now);
        if exhausted || position >= total {
            state.complete(now);
        }

        log::debug!(
            "Feed {}: parsed {} rows, now at byte {position} of {total}",
            feed.id,
            result.len()
        );
        Ok(result)
    }

    fn mapping_sources(&self) -> Vec<MappingSource> {
        self.settings
            .columns
            .iter()
            .map(|c| MappingSource::new(c))
            .collect()
    }

    fn custom_source_types(&self) -> &'static [&'static str] {
        Self::CUSTOM_SOURCE_TYPES
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use feeds_feed_models::feed_type::CustomSource;
    use feeds_feed_models::{FeedId, NewFeed};
    use feeds_time::ManualClock;
    use serde_json::json;

    use super::*;
    use crate::sources::{BlankSource, CsvColumnSource};

    fn parser(settings: CsvSettings) -> CsvParser {
        let resolver = SourceResolver::new()
            .with_source("guid", CustomSource::new("csv", "id"), Arc::new(CsvColumnSource))
            .with_source("title", CustomSource::new("csv", "Title"), Arc::new(CsvColumnSource))
            .with_source("note", CustomSource::new("blank", ""), Arc::new(BlankSource));
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(100, 0).unwrap()));
        CsvParser::new(settings, resolver, clock).unwrap()
    }

    fn feed() -> Feed {
        NewFeed::new("articles", "Articles", "inline")
            .into_feed(FeedId(1), DateTime::from_timestamp(0, 0).unwrap())
    }

    fn guids(result: &ParserResult) -> Vec<String> {
        result
            .iter()
            .map(|i| i.get_str("guid").unwrap().to_owned())
            .collect()
    }

    #[test]
    fn parses_in_batches_and_resumes_from_state() {
        let parser = parser(CsvSettings {
            line_limit: 2,
            ..CsvSettings::default()
        });
        let fetched = FetcherResult::raw(b"id,title\r\n1,a\r\n2,b\r\n3,c\r\n".to_vec());
        let mut state = State::default();

        let first = parser.parse(&feed(), &fetched, &mut state).unwrap();
        assert_eq!(guids(&first), vec!["1", "2"]);
        assert!(!state.completed);
        assert!(state.progress > 0);

        let second = parser.parse(&feed(), &fetched, &mut state).unwrap();
        assert_eq!(guids(&second), vec!["3"]);
        assert!(state.completed);
        assert_eq!(state.progress, state.total.unwrap());
    }

    #[test]
    fn items_are_fixed_schema_with_resolved_sources() {
        let parser = parser(CsvSettings::default());
        let fetched = FetcherResult::raw(b" id ; Title \n1;Alpha\n".to_vec());
        let parser = CsvParser {
            delimiter: b';',
            ..parser
        };
        let result = parser
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        let item = result.get(0).unwrap();
        assert!(item.is_fixed());
        assert_eq!(item.get("id"), Some(&json!("1")));
        assert_eq!(item.get("guid"), Some(&json!("1")));
        assert_eq!(item.get("title"), Some(&json!("Alpha")));
        assert_eq!(item.get("note"), Some(&Value::Null));
    }

    #[test]
    fn short_rows_read_as_empty_unless_strict() {
        let fetched = FetcherResult::raw(b"id,title\n1\n".to_vec());
        let lenient = parser(CsvSettings::default())
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(lenient.get(0).unwrap().get("title"), Some(&json!("")));

        let mut state = State::default();
        let err = parser(CsvSettings {
            strict_columns: true,
            ..CsvSettings::default()
        })
        .parse(&feed(), &fetched, &mut state)
        .unwrap_err();
        assert!(matches!(
            err,
            ParseError::ColumnCount {
                offset: 9,
                expected: 2,
                found: 1
            }
        ));
        assert_eq!(state.pointer, None);
    }

    #[test]
    fn configured_columns_name_headerless_files() {
        let parser = parser(CsvSettings {
            has_header: false,
            columns: vec!["id".to_string(), "title".to_string()],
            ..CsvSettings::default()
        });
        let fetched = FetcherResult::raw(b"1,Alpha\n2,Beta\n".to_vec());
        let result = parser
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(guids(&result), vec!["1", "2"]);
        assert_eq!(result.get(1).unwrap().get("title"), Some(&json!("Beta")));
        assert_eq!(
            parser.mapping_sources(),
            vec![MappingSource::new("id"), MappingSource::new("title")]
        );
    }

    #[test]
    fn headerless_files_use_column_indexes() {
        let resolver = SourceResolver::new().with_source(
            "guid",
            CustomSource::new("csv", "0"),
            Arc::new(CsvColumnSource),
        );
        let parser = CsvParser::new(
            CsvSettings {
                has_header: false,
                delimiter: "tab".to_string(),
                ..CsvSettings::default()
            },
            resolver,
            Arc::new(feeds_time::SystemClock),
        )
        .unwrap();
        let fetched = FetcherResult::raw(b"7\tx\n8\ty\n".to_vec());
        let result = parser
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(guids(&result), vec!["7", "8"]);
        assert!(!result.get(0).unwrap().is_fixed());
    }

    #[test]
    fn reads_file_backed_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.csv");
        std::fs::write(&path, "id,title\n1,\"multi\nline\"\n2,b\n").unwrap();
        let result = parser(CsvSettings::default())
            .parse(&feed(), &FetcherResult::file(&path), &mut State::default())
            .unwrap();
        assert_eq!(result.get(0).unwrap().get("title"), Some(&json!("multi\nline")));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn missing_file_is_invalid_input() {
        let err = parser(CsvSettings::default())
            .parse(
                &feed(),
                &FetcherResult::file("/definitely/not/here.csv"),
                &mut State::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidInput { .. }));
    }

    #[test]
    fn rejects_bad_settings() {
        let clock: Arc<dyn Clock> = Arc::new(feeds_time::SystemClock);
        for settings in [
            CsvSettings {
                delimiter: "::".to_string(),
                ..CsvSettings::default()
            },
            CsvSettings {
                line_limit: 0,
                ..CsvSettings::default()
            },
        ] {
            assert!(CsvParser::new(settings, SourceResolver::new(), clock.clone()).is_err());
        }
        let pipe = CsvSettings {
            delimiter: "|".to_string(),
            ..CsvSettings::default()
        };
        assert_eq!(pipe.delimiter_byte().unwrap(), b'|');
    }
}

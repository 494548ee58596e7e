//! Restartable CSV row reader.
//!
//! Wraps a [`csv::Reader`] over fetched content. After every row,
//! [`CsvReader::position`] is the byte offset just past that row, so a new
//! reader seeked there yields exactly the rows that follow. A quoted field
//! spanning several lines is one row; the offset is never inside it.
//!
//! `\r\n`, `\n`, and a lone `\r` all end a row. Doubled quotes inside a
//! quoted field decode to one quote. Empty lines are skipped. A UTF-8 byte
//! order mark at offset 0 is removed from the first field.

use feeds_feed_models::fetched::{FetcherResult, ReadSeek};

use crate::ParseError;

const BOM: char = '\u{feff}';

/// Streams rows from fetched content.
pub struct CsvReader<'a> {
    reader: csv::Reader<Box<dyn ReadSeek + 'a>>,
    record: csv::StringRecord,
    at_start: bool,
}

impl std::fmt::Debug for CsvReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvReader")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl<'a> CsvReader<'a> {
    /// Opens a reader at the start of `fetched`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidInput`] if the content cannot be
    /// opened (for example a missing file).
    pub fn open(fetched: &'a FetcherResult, delimiter: u8) -> Result<Self, ParseError> {
        let source = fetched.open().map_err(|e| ParseError::InvalidInput {
            message: match fetched.path() {
                Some(path) => format!("cannot open {}: {e}", path.display()),
                None => e.to_string(),
            },
        })?;

        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(source);

        Ok(Self {
            reader,
            record: csv::StringRecord::new(),
            at_start: true,
        })
    }

    /// Moves the reader to a byte offset previously returned by
    /// [`CsvReader::position`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the underlying seek fails.
    pub fn seek(&mut self, offset: u64) -> Result<(), ParseError> {
        let mut position = csv::Position::new();
        position.set_byte(offset);
        self.reader.seek(position)?;
        self.at_start = offset == 0;
        Ok(())
    }

    /// Returns the byte offset just past the last row read.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.reader.position().byte()
    }

    /// Reads the next row, or `None` at the end of the content.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Csv`] for malformed content (for example
    /// invalid UTF-8).
    pub fn next_row(&mut self) -> Result<Option<Vec<String>>, ParseError> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        let mut row: Vec<String> = self.record.iter().map(str::to_owned).collect();
        if std::mem::take(&mut self.at_start)
            && let Some(first) = row.first_mut()
            && let Some(rest) = first.strip_prefix(BOM)
        {
            *first = rest.to_owned();
        }
        Ok(Some(row))
    }
}

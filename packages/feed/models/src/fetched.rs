//! Fetched content, shared between the fetch and parse stages.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A readable source that can also seek, as needed by restartable parsers.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Raw content produced by a fetcher.
///
/// The result is a reference to content that is already local: reading it
/// any number of times never goes back to the remote source. It is
/// serializable so queued parse tasks can reopen it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetcherResult {
    /// Content held in memory.
    Raw {
        /// The fetched bytes.
        data: Vec<u8>,
    },
    /// Content stored in a local file.
    File {
        /// Path of the local file.
        path: PathBuf,
    },
}

impl FetcherResult {
    /// Wraps in-memory content.
    #[must_use]
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self::Raw { data: data.into() }
    }

    /// Wraps a local file.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    /// Returns the local file path, if the content is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Raw { .. } => None,
            Self::File { path } => Some(path),
        }
    }

    /// Reads the whole content.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be read.
    pub fn bytes(&self) -> io::Result<Cow<'_, [u8]>> {
        match self {
            Self::Raw { data } => Ok(Cow::Borrowed(data)),
            Self::File { path } => std::fs::read(path).map(Cow::Owned),
        }
    }

    /// Reads the whole content with a leading UTF-8 byte order mark
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be read.
    pub fn sanitized_bytes(&self) -> io::Result<Cow<'_, [u8]>> {
        Ok(match self.bytes()? {
            Cow::Borrowed(b) => Cow::Borrowed(b.strip_prefix(UTF8_BOM).unwrap_or(b)),
            Cow::Owned(b) => match b.strip_prefix(UTF8_BOM) {
                Some(rest) => Cow::Owned(rest.to_vec()),
                None => Cow::Owned(b),
            },
        })
    }

    /// Opens a fresh seekable reader positioned at the start.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file cannot be opened.
    pub fn open(&self) -> io::Result<Box<dyn ReadSeek + '_>> {
        match self {
            Self::Raw { data } => Ok(Box::new(Cursor::new(data.as_slice()))),
            Self::File { path } => Ok(Box::new(File::open(path)?)),
        }
    }

    /// Returns the content length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file metadata cannot be read.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            Self::Raw { data } => Ok(data.len() as u64),
            Self::File { path } => Ok(std::fs::metadata(path)?.len()),
        }
    }

    /// Returns `true` if the content is empty.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backing file metadata cannot be read.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

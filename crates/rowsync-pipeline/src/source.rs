//! External row sources
//!
//! A source yields `(line_number, cells)` pairs lazily, numbered from 1 and
//! strictly increasing. Line 1 conventionally holds the headers.

use async_stream::try_stream;
use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::path::{Path, PathBuf};

use crate::error::SourceError;

/// One source line: number and cells
pub type SourceLine = (i64, Vec<String>);

pub trait RowSource: Send + Sync {
    fn rows(&self) -> BoxStream<'_, Result<SourceLine, SourceError>>;
}

/// Delimited file on disk, read record by record
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSource for CsvSource {
    fn rows(&self) -> BoxStream<'_, Result<SourceLine, SourceError>> {
        read_records(self.path.clone(), self.delimiter).boxed()
    }
}

fn read_records(
    path: PathBuf,
    delimiter: u8,
) -> impl Stream<Item = Result<SourceLine, SourceError>> + Send {
    try_stream! {
        let file = tokio::fs::File::open(&path).await?;
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .create_reader(file);

        let mut record = StringRecord::new();
        let mut line_number = 0i64;

        while reader.read_record(&mut record).await? {
            line_number += 1;
            yield (line_number, record.iter().map(str::to_string).collect());
        }

        tracing::debug!(path = %path.display(), lines = line_number, "Source exhausted");
    }
}

/// In-memory source, numbered from 1 in order
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    rows: Vec<Vec<String>>,
}

impl VecSource {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    /// Build from string slices, handy for fixtures
    pub fn from_rows(rows: &[&[&str]]) -> Self {
        Self::new(
            rows.iter()
                .map(|cells| cells.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }
}

impl RowSource for VecSource {
    fn rows(&self) -> BoxStream<'_, Result<SourceLine, SourceError>> {
        stream::iter(
            self.rows
                .iter()
                .enumerate()
                .map(|(index, cells)| Ok((index as i64 + 1, cells.clone()))),
        )
        .boxed()
    }
}

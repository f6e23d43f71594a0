//! Storage traits for raw rows, parsed rows and target entities
//!
//! Every stream is lazy and forward-only: backends fetch `page_size` rows at a
//! time so no stage ever materializes a whole file.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: in-process, used by tests and embedders without a database
//! - [`PgStore`]: Postgres through `sqlx`

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use rowsync_common::FileRef;
use std::collections::HashMap;

use crate::entity::EntityKind;
use crate::error::StoreResult;
use crate::models::{NewParsedRow, NewRawRow, ParsedRow, ParsedRowUpdate, RawRow, RawRowUpdate, TargetId, Values};
use crate::parser::unique_headers;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Line number holding the header cells
pub const HEADER_LINE: i64 = 1;

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn insert_rows(&self, rows: &[NewRawRow]) -> StoreResult<()>;

    /// Replace content of existing rows, keyed on row id
    async fn upsert_rows(&self, rows: &[RawRowUpdate]) -> StoreResult<()>;

    /// Rows of `file` in line order
    fn stream_by_line(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<RawRow>>;

    async fn find_row(&self, file: &FileRef, line_number: i64) -> StoreResult<Option<RawRow>>;

    /// Delete every raw row of `file`, returning the count
    async fn delete_rows(&self, file: &FileRef) -> StoreResult<u64>;

    /// Unique header names from the header line, empty when it is missing
    async fn headers(&self, file: &FileRef) -> StoreResult<Vec<String>> {
        Ok(self
            .find_row(file, HEADER_LINE)
            .await?
            .map(|row| unique_headers(&row.content))
            .unwrap_or_default())
    }

    /// Data rows (after the header line) in chunks of `size`, keyed by line.
    /// The last chunk holds the remainder.
    fn read_rows(&self, file: &FileRef, size: usize) -> BoxStream<'static, StoreResult<Vec<(i64, Vec<String>)>>> {
        Box::pin(
            self.stream_by_line(file, size)
                .try_filter(|row| futures::future::ready(row.line_number > HEADER_LINE))
                .map_ok(|row| (row.line_number, row.content))
                .try_chunks(size.max(1))
                .map_err(|err| err.1),
        )
    }
}

#[async_trait]
pub trait ParsedRowStore: Send + Sync {
    async fn insert_parsed_rows(&self, rows: &[NewParsedRow]) -> StoreResult<()>;

    /// Parsed rows of `file` ordered by line, then order number
    fn stream_parsed_rows(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<ParsedRow>>;

    /// Parsed rows of one target type ordered by line, then order number
    fn stream_by_type(
        &self,
        file: &FileRef,
        target_type: &str,
        page_size: usize,
    ) -> BoxStream<'static, StoreResult<ParsedRow>>;

    /// Distinct target types ordered by the smallest order number they appear
    /// at, then by earliest line, then by name
    async fn target_types(&self, file: &FileRef) -> StoreResult<Vec<String>>;

    async fn delete_parsed_rows(&self, file: &FileRef) -> StoreResult<u64>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Open a chunk transaction spanning target tables and parsed rows
    async fn begin(&self) -> StoreResult<Box<dyn ApplyTransaction>>;
}

/// Writes of one apply chunk. Dropping without `commit` discards them.
#[async_trait]
pub trait ApplyTransaction: Send {
    async fn bulk_insert(&mut self, kind: &dyn EntityKind, rows: &[Values]) -> StoreResult<()>;

    /// Insert or update by primary key, writing only the given attributes.
    /// Each id appears at most once per call.
    async fn bulk_upsert(&mut self, kind: &dyn EntityKind, rows: &[(TargetId, Values)]) -> StoreResult<()>;

    /// Target ids by unique key; the lowest id wins when a key repeats
    async fn lookup_identifiers(
        &mut self,
        kind: &dyn EntityKind,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>>;

    /// Target ids already written onto parsed rows of `target_type` in `file`
    async fn resolved_identifiers(
        &mut self,
        file: &FileRef,
        target_type: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>>;

    /// Write apply results back, keyed on parsed row id
    async fn upsert_parsed_rows(&mut self, rows: &[ParsedRowUpdate]) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

/// Everything the pipeline needs from one backend
pub trait Store: RowStore + ParsedRowStore + TargetStore {}

impl<T: RowStore + ParsedRowStore + TargetStore> Store for T {}

//! Snapshot reconcile
//!
//! Walks the source and the stored rows of a file side by side, both in line
//! order. Unchanged lines are left alone, changed lines are updated in place
//! and keep their row id, new lines are inserted. Stored lines the source no
//! longer has are kept.

use futures::stream::{BoxStream, Peekable, Stream, StreamExt};
use rowsync_common::FileRef;
use std::cmp::Ordering;
use std::pin::Pin;
use tracing::{debug, info};

use crate::error::{CollectError, SourceError, StoreResult};
use crate::models::{NewRawRow, RawRow, RawRowUpdate};
use crate::source::SourceLine;
use crate::stats::CollectStats;
use crate::storage::RowStore;

type StoredRows = Peekable<BoxStream<'static, StoreResult<RawRow>>>;

#[derive(Debug, Clone)]
pub struct SnapshotReconciler {
    chunk_size: usize,
}

impl SnapshotReconciler {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    #[tracing::instrument(skip(self, source, store), fields(file = %file))]
    pub async fn reconcile<S>(
        &self,
        file: &FileRef,
        source: S,
        store: &dyn RowStore,
    ) -> Result<CollectStats, CollectError>
    where
        S: Stream<Item = Result<SourceLine, SourceError>> + Send,
    {
        let mut stats = CollectStats::new();
        let mut stored = store.stream_by_line(file, self.chunk_size).peekable();
        let mut source = Box::pin(source);

        let mut inserts: Vec<NewRawRow> = Vec::with_capacity(self.chunk_size);
        let mut updates: Vec<RawRowUpdate> = Vec::with_capacity(self.chunk_size);
        let mut previous: Option<i64> = None;

        while let Some(line) = source.next().await {
            let (line_number, content) = line?;
            if let Some(previous) = previous.filter(|previous| line_number <= *previous) {
                return Err(SourceError::OutOfOrder {
                    previous,
                    current: line_number,
                }
                .into());
            }
            previous = Some(line_number);
            stats.lines_read += 1;

            match advance_to(&mut stored, line_number, &mut stats).await? {
                Some(existing) if existing.content == content => stats.unchanged += 1,
                Some(existing) => {
                    updates.push(RawRowUpdate {
                        id: existing.id,
                        file: file.clone(),
                        line_number,
                        content,
                    });
                    stats.updated += 1;
                },
                None => {
                    inserts.push(NewRawRow {
                        file: file.clone(),
                        line_number,
                        content,
                    });
                    stats.inserted += 1;
                },
            }

            if inserts.len() >= self.chunk_size {
                store.insert_rows(&inserts).await?;
                debug!(rows = inserts.len(), "Inserted raw rows");
                inserts.clear();
            }
            if updates.len() >= self.chunk_size {
                store.upsert_rows(&updates).await?;
                debug!(rows = updates.len(), "Updated raw rows");
                updates.clear();
            }
        }

        if !inserts.is_empty() {
            store.insert_rows(&inserts).await?;
        }
        if !updates.is_empty() {
            store.upsert_rows(&updates).await?;
        }

        stats.timing.complete();
        info!(
            lines = stats.lines_read,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "Reconciled source snapshot"
        );
        Ok(stats)
    }
}

/// Move the stored cursor up to `line_number` and take the row stored there.
///
/// Rows below the line are passed over; a row above it stays on the cursor.
async fn advance_to(
    stored: &mut StoredRows,
    line_number: i64,
    stats: &mut CollectStats,
) -> StoreResult<Option<RawRow>> {
    loop {
        let position = match Pin::new(&mut *stored).peek().await {
            None => return Ok(None),
            Some(Ok(row)) => Some(row.line_number.cmp(&line_number)),
            Some(Err(_)) => None,
        };

        match position {
            Some(Ordering::Less) => {
                stored.next().await;
                stats.skipped_stored += 1;
            },
            Some(Ordering::Equal) => return stored.next().await.transpose(),
            Some(Ordering::Greater) => return Ok(None),
            None => {
                return match stored.next().await {
                    Some(Err(err)) => Err(err),
                    _ => Ok(None),
                }
            },
        }
    }
}

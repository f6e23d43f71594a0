//! Parse stage
//!
//! Feeds stored data rows through a [`RowParser`] and persists one parsed row
//! per result. Each raw row is a failure boundary: a parser error or panic
//! becomes an error slot for that line and parsing moves on to the next row.
//!
//! Order numbers count the entities of one row from 1 unless the parser sets
//! them explicitly. Validation failures and parser errors get order 0.

use async_stream::try_stream;
use futures::future::{self, FutureExt};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use rowsync_common::FileRef;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entity::TargetEntity;
use crate::error::{EntityError, ParseError, StoreResult};
use crate::models::{ErrorBag, NewParsedRow, RowId, TargetId, Values};
use crate::parser::{FileContext, Parsed, Row, RowOutcome, RowParser, RowValidator};
use crate::stats::ParseStats;
use crate::storage::{ParsedRowStore, RowStore, HEADER_LINE};

const GENERIC_ROW_ERROR: &str = "The row could not be parsed.";

/// Optional parser capabilities, probed once per pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub initializes: bool,
    pub validates: bool,
    pub handles_chunks: bool,
}

impl Capabilities {
    fn probe(parser: &dyn RowParser) -> Self {
        Self {
            initializes: parser.initializer().is_some(),
            validates: parser.validation().is_some(),
            handles_chunks: parser.chunk_handler().is_some(),
        }
    }
}

/// What one parsed row holds
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Entity {
        target_type: String,
        target_id: Option<TargetId>,
        unique_key: Option<String>,
        values: Values,
    },
    ValidationFailed(ErrorBag),
    ParseFailed(ErrorBag),
}

/// A parse result before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub line_number: i64,
    pub raw_row_id: RowId,
    pub order_number: i32,
    pub outcome: ItemOutcome,
}

impl ParsedItem {
    fn for_row(row: &Row, order_number: i32, outcome: ItemOutcome) -> Self {
        Self {
            line_number: row.line_number,
            raw_row_id: row.raw_row_id,
            order_number,
            outcome,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.outcome, ItemOutcome::Entity { .. })
    }

    pub fn into_new_row(self, file: &FileRef) -> NewParsedRow {
        let mut row = NewParsedRow {
            file: file.clone(),
            line_number: self.line_number,
            raw_row_id: self.raw_row_id,
            order_number: self.order_number,
            target_type: None,
            target_id: None,
            target_unique_key: None,
            values: Values::new(),
            errors: ErrorBag::new(),
        };
        match self.outcome {
            ItemOutcome::Entity {
                target_type,
                target_id,
                unique_key,
                values,
            } => {
                row.target_type = Some(target_type);
                row.target_id = target_id;
                row.target_unique_key = unique_key;
                row.values = values;
            },
            ItemOutcome::ValidationFailed(errors) | ItemOutcome::ParseFailed(errors) => {
                row.errors = errors;
            },
        }
        row
    }
}

pub struct ParsePipeline {
    parser: Arc<dyn RowParser>,
    chunk_size: usize,
    capabilities: Capabilities,
}

impl ParsePipeline {
    pub fn new(parser: Arc<dyn RowParser>, chunk_size: usize) -> Self {
        let capabilities = Capabilities::probe(parser.as_ref());
        Self {
            parser,
            chunk_size: chunk_size.max(1),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Parse data rows lazily.
    ///
    /// Initialization runs once before the first row. Rows failing validation
    /// never reach the parser. Chunk handlers see each chunk before its rows are
    /// parsed; a handler error fails the stream.
    pub fn parse<'a, S>(
        &'a self,
        context: &'a FileContext,
        rows: S,
    ) -> impl Stream<Item = Result<ParsedItem, ParseError>> + Send + 'a
    where
        S: Stream<Item = StoreResult<Row>> + Send + 'a,
    {
        try_stream! {
            if self.capabilities.initializes {
                if let Some(initializer) = self.parser.initializer() {
                    initializer
                        .initialize(context)
                        .await
                        .map_err(ParseError::Initialization)?;
                }
            }

            let validator = if self.capabilities.validates {
                self.parser
                    .validation()
                    .map(|validation| RowValidator::new(validation.rules(context)))
            } else {
                None
            };

            let mut rows = Box::pin(rows);
            let mut chunk: Vec<Row> = Vec::with_capacity(self.chunk_size);

            while let Some(row) = rows.next().await {
                let row = row?;
                if let Some(validator) = &validator {
                    if let Err(errors) = validator.validate(&row.fields()) {
                        debug!(line = row.line_number, "Row failed validation");
                        yield ParsedItem::for_row(&row, 0, ItemOutcome::ValidationFailed(errors));
                        continue;
                    }
                }

                chunk.push(row);
                if chunk.len() >= self.chunk_size {
                    for item in self.parse_chunk(&chunk).await? {
                        yield item;
                    }
                    chunk.clear();
                }
            }

            if !chunk.is_empty() {
                for item in self.parse_chunk(&chunk).await? {
                    yield item;
                }
            }
        }
    }

    async fn parse_chunk(&self, chunk: &[Row]) -> Result<Vec<ParsedItem>, ParseError> {
        if self.capabilities.handles_chunks {
            if let Some(handler) = self.parser.chunk_handler() {
                handler
                    .handle_rows(chunk)
                    .await
                    .map_err(|source| ParseError::ChunkHandler {
                        line: chunk.last().map_or(0, |row| row.line_number),
                        source,
                    })?;
            }
        }

        let mut items = Vec::with_capacity(chunk.len());
        for row in chunk {
            items.extend(self.parse_row(row).await);
        }
        Ok(items)
    }

    /// Every result of one row, stopping at the first error
    async fn parse_row(&self, row: &Row) -> Vec<ParsedItem> {
        let mut items = Vec::new();
        let failed = |message: String| {
            warn!(line = row.line_number, error = %message, "Row parser failed");
            ParsedItem::for_row(
                row,
                0,
                ItemOutcome::ParseFailed(ErrorBag::single(row.line_number.to_string(), message)),
            )
        };

        let mut results = match panic::catch_unwind(AssertUnwindSafe(|| self.parser.parse(row))) {
            Ok(results) => results,
            Err(payload) => {
                items.push(failed(panic_message(payload)));
                return items;
            },
        };

        let mut counter = 0;
        loop {
            let next = match AssertUnwindSafe(results.next()).catch_unwind().await {
                Ok(next) => next,
                Err(payload) => {
                    items.push(failed(panic_message(payload)));
                    break;
                },
            };

            let parsed: Parsed = match next {
                None => break,
                Some(Ok(parsed)) => parsed,
                Some(Err(err)) => {
                    items.push(failed(err.to_string()));
                    break;
                },
            };

            match parsed.outcome {
                RowOutcome::Errors(errors) => {
                    let errors = if errors.is_empty() {
                        ErrorBag::single(row.line_number.to_string(), GENERIC_ROW_ERROR)
                    } else {
                        errors
                    };
                    items.push(ParsedItem::for_row(row, 0, ItemOutcome::ParseFailed(errors)));
                    break;
                },
                RowOutcome::Entity(entity) => {
                    counter += 1;
                    let order = parsed.order.unwrap_or(counter);
                    match entity_outcome(entity.as_ref()) {
                        Ok(outcome) => items.push(ParsedItem::for_row(row, order, outcome)),
                        Err(err) => {
                            items.push(failed(err.to_string()));
                            break;
                        },
                    }
                },
            }
        }
        items
    }

    /// Replace the parsed rows of `file` with a fresh parse of its raw rows
    #[tracing::instrument(skip(self, rows, parsed), fields(file = %file))]
    pub async fn run(
        &self,
        file: &FileRef,
        rows: &dyn RowStore,
        parsed: &dyn ParsedRowStore,
    ) -> Result<ParseStats, ParseError> {
        let mut stats = ParseStats::new();
        stats.previous_removed = parsed.delete_parsed_rows(file).await?;

        let headers: Arc<[String]> = rows.headers(file).await?.into();
        let context = FileContext {
            file: file.clone(),
            headers: headers.to_vec(),
        };

        let data_rows = rows
            .stream_by_line(file, self.chunk_size)
            .try_filter(|raw| future::ready(raw.line_number > HEADER_LINE))
            .map_ok(move |raw| Row::new(raw.id, raw.line_number, raw.content, headers.clone()));

        let mut items = Box::pin(self.parse(&context, data_rows));
        let mut buffer: Vec<NewParsedRow> = Vec::with_capacity(self.chunk_size);
        let mut last_line: Option<i64> = None;

        while let Some(item) = items.next().await {
            let item = item?;
            if last_line != Some(item.line_number) {
                stats.lines_with_results += 1;
                last_line = Some(item.line_number);
            }
            match &item.outcome {
                ItemOutcome::Entity { .. } => stats.entities += 1,
                ItemOutcome::ValidationFailed(_) => stats.validation_failures += 1,
                ItemOutcome::ParseFailed(_) => stats.parse_failures += 1,
            }

            buffer.push(item.into_new_row(file));
            if buffer.len() >= self.chunk_size {
                parsed.insert_parsed_rows(&buffer).await?;
                stats.chunks += 1;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            parsed.insert_parsed_rows(&buffer).await?;
            stats.chunks += 1;
        }

        stats.timing.complete();
        info!(
            entities = stats.entities,
            validation_failures = stats.validation_failures,
            parse_failures = stats.parse_failures,
            "Parsed raw rows"
        );
        Ok(stats)
    }
}

fn entity_outcome(entity: &dyn TargetEntity) -> Result<ItemOutcome, EntityError> {
    Ok(ItemOutcome::Entity {
        target_type: entity.entity_type().to_string(),
        target_id: entity.target_id(),
        unique_key: entity.unique_key(),
        values: entity.values()?,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Row parser panicked".to_string()
    }
}

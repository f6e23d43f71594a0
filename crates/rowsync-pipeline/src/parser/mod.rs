//! Row parser contract
//!
//! A [`RowParser`] turns one stored row into a lazy sequence of [`Parsed`]
//! results. Optional capabilities are exposed through accessor methods that
//! return `Some` when the parser implements them; the parse stage probes them
//! once when it is built.
//!
//! - [`RequiresInitialization`]: one call with the file context before any row
//! - [`HasValidationRules`]: field rules checked before the parser sees a row
//! - [`HandlesRowChunks`]: receives each chunk of rows before they are parsed

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rowsync_common::FileRef;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::TargetEntity;
use crate::models::{ErrorBag, RowId};

pub mod mapping;
pub mod validation;

pub use mapping::ColumnMapParser;
pub use validation::{FieldRule, RowValidator, ValidationRules};

/// Results of parsing one row
pub type ParsedStream<'a> = BoxStream<'a, anyhow::Result<Parsed>>;

/// File level context handed to initializing and validating parsers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub file: FileRef,
    /// Header line cells, made unique
    pub headers: Vec<String>,
}

/// A stored data row with its cells keyed by header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub raw_row_id: RowId,
    pub line_number: i64,
    pub content: Vec<String>,
    headers: Arc<[String]>,
}

impl Row {
    pub fn new(
        raw_row_id: RowId,
        line_number: i64,
        content: Vec<String>,
        headers: Arc<[String]>,
    ) -> Self {
        Self {
            raw_row_id,
            line_number,
            content,
            headers,
        }
    }

    /// Cell under `name`; cells past the header width are addressed by index
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.headers.iter().position(|h| h == name) {
            Some(index) => self.content.get(index).map(String::as_str),
            None => name
                .parse::<usize>()
                .ok()
                .filter(|index| *index >= self.headers.len())
                .and_then(|index| self.content.get(index))
                .map(String::as_str),
        }
    }

    /// Header name to cell value
    pub fn fields(&self) -> BTreeMap<String, String> {
        self.content
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let key = self
                    .headers
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| index.to_string());
                (key, cell.clone())
            })
            .collect()
    }
}

/// One parser yield: a target entity or the errors that stop the row
#[derive(Debug)]
pub enum RowOutcome {
    Entity(Box<dyn TargetEntity>),
    Errors(ErrorBag),
}

#[derive(Debug)]
pub struct Parsed {
    /// Explicit order within the row; `None` uses the row's counter
    pub order: Option<i32>,
    pub outcome: RowOutcome,
}

impl Parsed {
    pub fn entity<E: TargetEntity + 'static>(entity: E) -> Self {
        Self {
            order: None,
            outcome: RowOutcome::Entity(Box::new(entity)),
        }
    }

    pub fn errors(errors: ErrorBag) -> Self {
        Self {
            order: None,
            outcome: RowOutcome::Errors(errors),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

pub trait RowParser: Send + Sync {
    fn parse<'a>(&'a self, row: &'a Row) -> ParsedStream<'a>;

    fn initializer(&self) -> Option<&dyn RequiresInitialization> {
        None
    }

    fn validation(&self) -> Option<&dyn HasValidationRules> {
        None
    }

    fn chunk_handler(&self) -> Option<&dyn HandlesRowChunks> {
        None
    }
}

#[async_trait]
pub trait RequiresInitialization: Send + Sync {
    async fn initialize(&self, context: &FileContext) -> anyhow::Result<()>;
}

pub trait HasValidationRules: Send + Sync {
    fn rules(&self, context: &FileContext) -> ValidationRules;
}

#[async_trait]
pub trait HandlesRowChunks: Send + Sync {
    async fn handle_rows(&self, rows: &[Row]) -> anyhow::Result<()>;
}

/// Stream over already computed results
pub fn yields<'a>(results: Vec<anyhow::Result<Parsed>>) -> ParsedStream<'a> {
    stream::iter(results).boxed()
}

/// Stream with a single result
pub fn single<'a>(parsed: Parsed) -> ParsedStream<'a> {
    yields(vec![Ok(parsed)])
}

/// Make repeated headers unique: `name`, `name (2)`, `name (3)`
pub fn unique_headers(cells: &[String]) -> Vec<String> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    cells
        .iter()
        .map(|cell| {
            let count = seen.entry(cell.as_str()).or_insert(0);
            *count += 1;
            if *count == 1 {
                cell.clone()
            } else {
                format!("{} ({})", cell, count)
            }
        })
        .collect()
}

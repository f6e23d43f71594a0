//! Shared fixtures for pipeline integration tests
//!
//! Two target types with a foreign key between them, a parser that yields
//! both from one line, and an [`ImportFile`] over an in-memory source.

#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use rowsync_common::FileRef;
use rowsync_pipeline::entity::{Entity, ForeignKey, ForeignRef};
use rowsync_pipeline::parser::{
    single, yields, FieldRule, FileContext, HandlesRowChunks, HasValidationRules, Parsed, ParsedStream,
    RequiresInitialization, Row, RowParser, ValidationRules,
};
use rowsync_pipeline::{EntityRegistry, ImportFile, RowSource, VecSource};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HEADERS: &[&str] = &["company", "email", "name"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
}

impl Entity for Company {
    const TYPE: &'static str = "companies";
    const UNIQUE_KEY: &'static str = "name";

    fn unique_key(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company_id: Option<ForeignRef>,
}

impl Entity for Employee {
    const TYPE: &'static str = "employees";
    const UNIQUE_KEY: &'static str = "email";

    fn unique_key(&self) -> Option<String> {
        Some(self.email.clone())
    }

    fn foreign_entity_keys() -> Vec<ForeignKey> {
        vec![ForeignKey::new("companies", "company_id")]
    }
}

pub fn registry() -> EntityRegistry {
    EntityRegistry::new().with::<Company>().with::<Employee>()
}

fn employee(row: &Row) -> Employee {
    Employee {
        email: row.get("email").unwrap_or_default().to_string(),
        name: row.get("name").map(str::to_string),
        company_id: row.get("company").map(|c| ForeignRef::Key(c.to_string())),
    }
}

fn company(row: &Row) -> Company {
    Company {
        name: row.get("company").unwrap_or_default().to_string(),
    }
}

/// Company first, then its employee. A line whose email reads `fail` errors
/// after the company has been yielded.
#[derive(Debug, Default)]
pub struct StaffParser {
    pub employees_first: bool,
}

impl StaffParser {
    pub fn employees_first() -> Self {
        Self { employees_first: true }
    }
}

impl RowParser for StaffParser {
    fn parse<'a>(&'a self, row: &'a Row) -> ParsedStream<'a> {
        if self.employees_first {
            return yields(vec![Ok(Parsed::entity(employee(row))), Ok(Parsed::entity(company(row)))]);
        }
        let mut results = vec![Ok(Parsed::entity(company(row)))];
        if row.get("email") == Some("fail") {
            results.push(Err(anyhow!("cannot import {}", row.line_number)));
        }
        results.push(Ok(Parsed::entity(employee(row))));
        yields(results)
    }
}

/// Requires an email, records initialization and chunk sizes
#[derive(Debug, Default)]
pub struct RecordingParser {
    pub initialized: AtomicUsize,
    pub chunks: Mutex<Vec<usize>>,
}

impl RowParser for RecordingParser {
    fn parse<'a>(&'a self, row: &'a Row) -> ParsedStream<'a> {
        single(Parsed::entity(employee(row)))
    }

    fn initializer(&self) -> Option<&dyn RequiresInitialization> {
        Some(self)
    }

    fn validation(&self) -> Option<&dyn HasValidationRules> {
        Some(self)
    }

    fn chunk_handler(&self) -> Option<&dyn HandlesRowChunks> {
        Some(self)
    }
}

#[async_trait]
impl RequiresInitialization for RecordingParser {
    async fn initialize(&self, context: &FileContext) -> anyhow::Result<()> {
        if context.headers.is_empty() {
            return Err(anyhow!("file has no header line"));
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl HasValidationRules for RecordingParser {
    fn rules(&self, _context: &FileContext) -> ValidationRules {
        ValidationRules::new().field("email", vec![FieldRule::Required, FieldRule::Email])
    }
}

#[async_trait]
impl HandlesRowChunks for RecordingParser {
    async fn handle_rows(&self, rows: &[Row]) -> anyhow::Result<()> {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push(rows.len());
        }
        Ok(())
    }
}

/// Sleeps in its chunk handler so a stage can be held open
#[derive(Debug)]
pub struct SlowParser {
    pub delay: Duration,
}

impl RowParser for SlowParser {
    fn parse<'a>(&'a self, row: &'a Row) -> ParsedStream<'a> {
        single(Parsed::entity(company(row)))
    }

    fn chunk_handler(&self) -> Option<&dyn HandlesRowChunks> {
        Some(self)
    }
}

#[async_trait]
impl HandlesRowChunks for SlowParser {
    async fn handle_rows(&self, _rows: &[Row]) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

pub struct TestFile {
    pub file: FileRef,
    pub source: VecSource,
    pub parser: Arc<dyn RowParser>,
}

impl TestFile {
    /// Header line followed by `lines`
    pub fn new(file_id: i64, lines: &[[&str; 3]], parser: Arc<dyn RowParser>) -> Self {
        let mut rows = vec![HEADERS.iter().map(|h| h.to_string()).collect::<Vec<_>>()];
        rows.extend(lines.iter().map(|cells| cells.iter().map(|c| c.to_string()).collect()));
        Self {
            file: FileRef::new("csv_files", file_id),
            source: VecSource::new(rows),
            parser,
        }
    }

    pub fn staff(file_id: i64, lines: &[[&str; 3]]) -> Self {
        Self::new(file_id, lines, Arc::new(StaffParser::default()))
    }
}

impl ImportFile for TestFile {
    fn file_ref(&self) -> FileRef {
        self.file.clone()
    }

    fn source(&self) -> &dyn RowSource {
        &self.source
    }

    fn row_parser(&self) -> Arc<dyn RowParser> {
        Arc::clone(&self.parser)
    }
}

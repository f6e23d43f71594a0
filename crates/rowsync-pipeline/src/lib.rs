//! Rowsync Pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental import of delimited files into typed target tables.
//!
//! # Stages
//!
//! 1. **Collect**: reconcile a source snapshot into stored raw rows, one per line
//! 2. **Parse**: run a [`RowParser`] over the data rows and store its results
//!    as parsed rows, entity candidates or per-row errors
//! 3. **Apply**: write parsed rows into target tables, resolving foreign keys
//!    and turning repeated creations into updates
//!
//! # Example
//!
//! ```no_run
//! use rowsync_pipeline::{
//!     ColumnMapParser, CsvSource, Entity, EntityRegistry, ImportFile, MemoryStore, Pipeline,
//!     PipelineConfig, RowParser, RowSource,
//! };
//! use rowsync_common::FileRef;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Contact {
//!     email: String,
//!     name: Option<String>,
//! }
//!
//! impl Entity for Contact {
//!     const TYPE: &'static str = "contacts";
//!     const UNIQUE_KEY: &'static str = "email";
//!
//!     fn unique_key(&self) -> Option<String> {
//!         Some(self.email.clone())
//!     }
//! }
//!
//! struct ContactsFile {
//!     source: CsvSource,
//! }
//!
//! impl ImportFile for ContactsFile {
//!     fn file_ref(&self) -> FileRef {
//!         FileRef::new("contacts_csv", 1)
//!     }
//!
//!     fn source(&self) -> &dyn RowSource {
//!         &self.source
//!     }
//!
//!     fn row_parser(&self) -> Arc<dyn RowParser> {
//!         Arc::new(ColumnMapParser::<Contact>::new().column("E-mail", "email").column("Name", "name"))
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pipeline = Pipeline::new(
//!     Arc::new(MemoryStore::new()),
//!     EntityRegistry::new().with::<Contact>(),
//!     PipelineConfig::from_env()?,
//! );
//! let file = ContactsFile { source: CsvSource::new("contacts.csv") };
//!
//! pipeline.parse(&file).await?;
//! let stats = pipeline.apply(&file.file_ref()).await?;
//! tracing::info!(created = stats.created, "Import applied");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod events;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod source;
pub mod stats;
pub mod storage;

pub use config::PipelineConfig;
pub use entity::{Entity, EntityKind, EntityRegistry, ForeignKey, ForeignRef, TargetEntity};
pub use error::{ApplyError, CollectError, ParseError, SourceError, StageError, StoreError};
pub use events::{ChannelEventSink, Disposition, EventSink, PipelineEvent, Stage, TracingEventSink};
pub use models::{ErrorBag, ParsedRow, RawRow, Values};
pub use parser::{ColumnMapParser, FileContext, Parsed, Row, RowParser};
pub use runner::{ImportFile, Pipeline};
pub use source::{CsvSource, RowSource, VecSource};
pub use stats::{ApplyStats, CollectStats, ParseStats};
pub use storage::{MemoryStore, PgStore, Store};

//! The three import stages
//!
//! - [`reconcile`]: merge a source snapshot into stored raw rows
//! - [`parse`]: turn raw rows into parsed rows through a [`RowParser`](crate::parser::RowParser)
//! - [`apply`]: write parsed rows into target tables chunk by chunk

pub mod apply;
pub mod parse;
pub mod reconcile;

pub use apply::ApplyEngine;
pub use parse::{Capabilities, ItemOutcome, ParsePipeline, ParsedItem};
pub use reconcile::SnapshotReconciler;

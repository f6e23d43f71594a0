//! Persisted row models
//!
//! `RawRow` is one stored line of a source file. `ParsedRow` is one parse outcome
//! for a raw row: either an entity candidate (`target_type` set, no errors) or an
//! error slot (`target_type` null, non-empty errors).

use chrono::{DateTime, Utc};
use rowsync_common::FileRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map of a target entity
pub type Values = serde_json::Map<String, serde_json::Value>;

/// Storage identifier of a raw or parsed row
pub type RowId = i64;

/// Storage identifier assigned by the target store
pub type TargetId = i64;

// ============================================================================
// Raw rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub id: RowId,
    pub file: FileRef,
    pub line_number: i64,
    pub content: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A raw row that has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRawRow {
    pub file: FileRef,
    pub line_number: i64,
    pub content: Vec<String>,
}

/// New content for an existing raw row, keyed by its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRowUpdate {
    pub id: RowId,
    pub file: FileRef,
    pub line_number: i64,
    pub content: Vec<String>,
}

// ============================================================================
// Error bags
// ============================================================================

/// Field name to human readable messages.
///
/// Keys are validated field names, or the line number when a whole row failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorBag(BTreeMap<String, Vec<String>>);

impl ErrorBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag holding a single message
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut bag = Self::new();
        bag.add(field, message);
        bag
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.add(field, message);
        self
    }

    pub fn merge(&mut self, other: ErrorBag) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every message, in field order
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.0.values().flatten().map(String::as_str)
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

impl From<BTreeMap<String, Vec<String>>> for ErrorBag {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        Self(map)
    }
}

impl fmt::Display for ErrorBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.messages().collect();
        write!(f, "{}", messages.join(" "))
    }
}

// ============================================================================
// Parsed rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    pub id: RowId,
    pub file: FileRef,
    pub line_number: i64,
    pub raw_row_id: RowId,
    pub order_number: i32,
    pub target_type: Option<String>,
    pub target_id: Option<TargetId>,
    pub target_unique_key: Option<String>,
    pub values: Values,
    pub errors: ErrorBag,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParsedRow {
    pub fn is_error(&self) -> bool {
        self.target_type.is_none()
    }

    /// Entity slot without a target id yet
    pub fn is_pending_creation(&self) -> bool {
        self.target_type.is_some() && self.target_id.is_none()
    }

    /// Changes the apply stage writes back onto this row
    pub fn to_update(&self) -> ParsedRowUpdate {
        ParsedRowUpdate {
            id: self.id,
            target_id: self.target_id,
            target_unique_key: self.target_unique_key.clone(),
            values: self.values.clone(),
        }
    }
}

/// A parsed row that has not been stored yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewParsedRow {
    pub file: FileRef,
    pub line_number: i64,
    pub raw_row_id: RowId,
    pub order_number: i32,
    pub target_type: Option<String>,
    pub target_id: Option<TargetId>,
    pub target_unique_key: Option<String>,
    pub values: Values,
    pub errors: ErrorBag,
}

/// Apply write-back keyed on the parsed row id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRowUpdate {
    pub id: RowId,
    pub target_id: Option<TargetId>,
    pub target_unique_key: Option<String>,
    pub values: Values,
}

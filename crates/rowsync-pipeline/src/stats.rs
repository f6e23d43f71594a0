//! Per-stage statistics
//!
//! Each stage returns its stats to the caller and logs them when it finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Start and end time of one stage run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl Timing {
    pub fn start() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }
}

/// Reconcile outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectStats {
    /// Source lines read
    pub lines_read: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Stored rows passed over because the source has no line at their number
    pub skipped_stored: u64,
    pub timing: Timing,
}

impl CollectStats {
    pub fn new() -> Self {
        Self {
            timing: Timing::start(),
            ..Default::default()
        }
    }

    /// Rows written to the store
    pub fn writes(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Parse outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStats {
    /// Lines that produced at least one parsed row
    pub lines_with_results: u64,
    /// Parsed rows removed from a previous run
    pub previous_removed: u64,
    pub entities: u64,
    pub validation_failures: u64,
    pub parse_failures: u64,
    pub chunks: u64,
    pub timing: Timing,
}

impl ParseStats {
    pub fn new() -> Self {
        Self {
            timing: Timing::start(),
            ..Default::default()
        }
    }

    pub fn errors(&self) -> u64 {
        self.validation_failures + self.parse_failures
    }
}

/// Apply outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub types: u64,
    pub chunks: u64,
    pub created: u64,
    pub updated: u64,
    /// Creations redirected to update because the key already existed
    pub collided: u64,
    pub unresolved_references: u64,
    /// Rows without a unique key, left untouched
    pub skipped: u64,
    /// Target types missing from the entity registry
    pub unknown_types: u64,
    pub timing: Timing,
}

impl ApplyStats {
    pub fn new() -> Self {
        Self {
            timing: Timing::start(),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, chunk: &ApplyStats) {
        self.chunks += chunk.chunks;
        self.created += chunk.created;
        self.updated += chunk.updated;
        self.collided += chunk.collided;
        self.unresolved_references += chunk.unresolved_references;
        self.skipped += chunk.skipped;
    }
}

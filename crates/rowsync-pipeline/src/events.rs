//! Pipeline notifications
//!
//! Stages report progress through an [`EventSink`]. Emitting never blocks and
//! never fails the stage.

use rowsync_common::FileRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::models::ParsedRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Collect,
    Parse,
    Apply,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Parse => "parse",
            Stage::Apply => "apply",
        }
    }

    /// Name used in logs and for the overlap guard, e.g. `parse csv_files #3`
    pub fn display_name(&self, file: &FileRef) -> String {
        format!("{} {} #{}", self.as_str(), file.file_type, file.file_id)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which apply path a group of rows takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Create,
    Update,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Collecting { file: FileRef },
    Collected { file: FileRef },
    CollectFailed { file: FileRef, error: String },
    Parsing { file: FileRef },
    Parsed { file: FileRef },
    ParseFailed { file: FileRef, error: String },
    Applying { file: FileRef },
    Applied { file: FileRef },
    ApplyFailed { file: FileRef, error: String },
    RowsApplying {
        file: FileRef,
        target_type: String,
        disposition: Disposition,
        rows: Vec<ParsedRow>,
    },
    RowsApplied {
        file: FileRef,
        target_type: String,
        disposition: Disposition,
        rows: Vec<ParsedRow>,
    },
}

impl PipelineEvent {
    pub fn started(stage: Stage, file: FileRef) -> Self {
        match stage {
            Stage::Collect => Self::Collecting { file },
            Stage::Parse => Self::Parsing { file },
            Stage::Apply => Self::Applying { file },
        }
    }

    pub fn finished(stage: Stage, file: FileRef) -> Self {
        match stage {
            Stage::Collect => Self::Collected { file },
            Stage::Parse => Self::Parsed { file },
            Stage::Apply => Self::Applied { file },
        }
    }

    pub fn failed(stage: Stage, file: FileRef, error: impl Into<String>) -> Self {
        let error = error.into();
        match stage {
            Stage::Collect => Self::CollectFailed { file, error },
            Stage::Parse => Self::ParseFailed { file, error },
            Stage::Apply => Self::ApplyFailed { file, error },
        }
    }

    pub fn file(&self) -> &FileRef {
        match self {
            Self::Collecting { file }
            | Self::Collected { file }
            | Self::CollectFailed { file, .. }
            | Self::Parsing { file }
            | Self::Parsed { file }
            | Self::ParseFailed { file, .. }
            | Self::Applying { file }
            | Self::Applied { file }
            | Self::ApplyFailed { file, .. }
            | Self::RowsApplying { file, .. }
            | Self::RowsApplied { file, .. } => file,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Collecting { .. } => "collecting",
            Self::Collected { .. } => "collected",
            Self::CollectFailed { .. } => "collect_failed",
            Self::Parsing { .. } => "parsing",
            Self::Parsed { .. } => "parsed",
            Self::ParseFailed { .. } => "parse_failed",
            Self::Applying { .. } => "applying",
            Self::Applied { .. } => "applied",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::RowsApplying { .. } => "rows_applying",
            Self::RowsApplied { .. } => "rows_applied",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::CollectFailed { file, error }
            | PipelineEvent::ParseFailed { file, error }
            | PipelineEvent::ApplyFailed { file, error } => {
                warn!(event = event.name(), file = %file, error = %error, "Pipeline stage failed");
            },
            PipelineEvent::RowsApplying {
                file,
                target_type,
                disposition,
                rows,
            }
            | PipelineEvent::RowsApplied {
                file,
                target_type,
                disposition,
                rows,
            } => {
                info!(
                    event = event.name(),
                    file = %file,
                    target_type = %target_type,
                    disposition = ?disposition,
                    rows = rows.len(),
                    "Pipeline rows"
                );
            },
            other => info!(event = other.name(), file = %other.file(), "Pipeline stage"),
        }
    }
}

/// Forwards events to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Err(err) = self.tx.send(event) {
            trace!(event = err.0.name(), "Event receiver dropped");
        }
    }
}

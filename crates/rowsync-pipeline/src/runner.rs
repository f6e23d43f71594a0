//! Stage runner
//!
//! [`Pipeline`] runs the collect, parse and apply stages for one file at a
//! time per stage. A stage already running for a file refuses a second run
//! instead of queueing it. Every run is bounded by the configured timeout and
//! reports start, finish or failure through the event sink.

use futures::Future;
use rowsync_common::FileRef;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::entity::EntityRegistry;
use crate::error::StageError;
use crate::events::{EventSink, PipelineEvent, Stage, TracingEventSink};
use crate::parser::RowParser;
use crate::pipeline::{ApplyEngine, ParsePipeline, SnapshotReconciler};
use crate::source::RowSource;
use crate::stats::{ApplyStats, CollectStats, ParseStats};
use crate::storage::Store;

/// A file the pipeline can import
pub trait ImportFile: Send + Sync {
    fn file_ref(&self) -> FileRef;

    fn source(&self) -> &dyn RowSource;

    fn row_parser(&self) -> Arc<dyn RowParser>;
}

type RunningSet = Arc<Mutex<HashSet<(Stage, FileRef)>>>;

pub struct Pipeline<S> {
    store: Arc<S>,
    registry: Arc<EntityRegistry>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
    running: RunningSet,
}

impl<S> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
            running: Arc::clone(&self.running),
        }
    }
}

impl<S: Store + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>, registry: EntityRegistry, config: PipelineConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            events: Arc::new(TracingEventSink),
            config,
            running: Arc::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Reconcile the file's source into stored raw rows
    pub async fn collect(&self, file: &dyn ImportFile) -> Result<CollectStats, StageError> {
        let file_ref = file.file_ref();
        self.run_stage(Stage::Collect, &file_ref, async {
            let reconciler = SnapshotReconciler::new(self.config.chunk_size);
            Ok::<_, StageError>(reconciler
                .reconcile(&file_ref, file.source().rows(), self.store.as_ref())
                .await?)
        })
        .await
    }

    /// Replace the file's parsed rows from its stored raw rows
    pub async fn parse_rows(&self, file: &dyn ImportFile) -> Result<ParseStats, StageError> {
        let file_ref = file.file_ref();
        self.run_stage(Stage::Parse, &file_ref, async {
            let pipeline = ParsePipeline::new(file.row_parser(), self.config.chunk_size);
            let store = self.store.as_ref();
            Ok::<_, StageError>(pipeline.run(&file_ref, store, store).await?)
        })
        .await
    }

    /// Collect, then parse
    pub async fn parse(&self, file: &dyn ImportFile) -> Result<(CollectStats, ParseStats), StageError> {
        let collected = self.collect(file).await?;
        let parsed = self.parse_rows(file).await?;
        Ok((collected, parsed))
    }

    /// Write the file's parsed rows into target tables
    pub async fn apply(&self, file: &FileRef) -> Result<ApplyStats, StageError> {
        self.run_stage(Stage::Apply, file, async {
            let engine = ApplyEngine::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.events),
                self.config.chunk_size,
            );
            let store = self.store.as_ref();
            Ok::<_, StageError>(engine.apply(file, store, store).await?)
        })
        .await
    }

    /// New file hook: collect and parse unless auto start is off
    pub async fn file_created(
        &self,
        file: &dyn ImportFile,
    ) -> Result<Option<(CollectStats, ParseStats)>, StageError> {
        if !self.config.auto_start_on_file_create {
            info!(file = %file.file_ref(), "Auto start disabled, file left unprocessed");
            return Ok(None);
        }
        self.parse(file).await.map(Some)
    }

    /// Deleted file hook: remove the file's parsed and raw rows
    pub async fn file_deleted(&self, file: &FileRef) -> Result<(), StageError> {
        let parsed = self.store.delete_parsed_rows(file).await?;
        let raw = self.store.delete_rows(file).await?;
        info!(file = %file, parsed, raw, "Removed rows of deleted file");
        Ok(())
    }

    #[tracing::instrument(skip(self, work), fields(stage = %stage, file = %file))]
    async fn run_stage<T, F>(&self, stage: Stage, file: &FileRef, work: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let _guard = OverlapGuard::acquire(&self.running, stage, file)?;
        let name = stage.display_name(file);

        info!(job = %name, "Stage started");
        self.events.emit(PipelineEvent::started(stage, file.clone()));

        let result = match tokio::time::timeout(self.config.stage_timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                stage,
                file: file.clone(),
                timeout_secs: self.config.stage_timeout_secs,
            }),
        };

        match &result {
            Ok(_) => {
                info!(job = %name, "Stage finished");
                self.events.emit(PipelineEvent::finished(stage, file.clone()));
            },
            Err(err) => {
                error!(job = %name, error = %err, "Stage failed");
                self.events
                    .emit(PipelineEvent::failed(stage, file.clone(), err.to_string()));
            },
        }
        result
    }
}

/// Marks a stage as running for a file until dropped
struct OverlapGuard {
    running: RunningSet,
    key: (Stage, FileRef),
}

impl OverlapGuard {
    fn acquire(running: &RunningSet, stage: Stage, file: &FileRef) -> Result<Self, StageError> {
        let key = (stage, file.clone());
        let mut set = running.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Err(StageError::AlreadyRunning {
                stage,
                file: file.clone(),
            });
        }
        Ok(Self {
            running: Arc::clone(running),
            key,
        })
    }
}

impl Drop for OverlapGuard {
    fn drop(&mut self) {
        let mut set = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(&self.key);
    }
}

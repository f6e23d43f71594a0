//! Stage runner: events, timeouts, overlap refusal and file hooks

mod common;

use anyhow::Result;
use common::{SlowParser, TestFile};
use rowsync_pipeline::{
    ChannelEventSink, ImportFile, MemoryStore, Pipeline, PipelineConfig, PipelineEvent, Stage, StageError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(events: &mut UnboundedReceiver<PipelineEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    names
}

fn slow_file(delay: Duration) -> TestFile {
    TestFile::new(1, &[["Acme", "a@acme.test", "Ann"]], Arc::new(SlowParser { delay }))
}

#[tokio::test]
async fn test_stage_events_in_order() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (sink, mut events) = ChannelEventSink::new();
    let pipeline = Pipeline::new(store, common::registry(), PipelineConfig::default()).with_events(Arc::new(sink));
    let file = TestFile::staff(1, &[["Acme", "a@acme.test", "Ann"]]);

    pipeline.parse(&file).await?;
    pipeline.apply(&file.file_ref()).await?;

    assert_eq!(
        drain(&mut events),
        vec![
            "collecting",
            "collected",
            "parsing",
            "parsed",
            "applying",
            "rows_applying",
            "rows_applied",
            "rows_applying",
            "rows_applied",
            "applied",
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stage_exceeding_timeout_fails() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (sink, mut events) = ChannelEventSink::new();
    let config = PipelineConfig::default().with_stage_timeout_secs(1);
    let pipeline = Pipeline::new(store, common::registry(), config).with_events(Arc::new(sink));
    let file = slow_file(Duration::from_secs(5));

    pipeline.collect(&file).await?;
    let err = pipeline.parse_rows(&file).await.err();

    assert!(matches!(
        err,
        Some(StageError::Timeout {
            stage: Stage::Parse,
            timeout_secs: 1,
            ..
        })
    ));
    assert_eq!(drain(&mut events).last().copied(), Some("parse_failed"));

    // the guard is released once the stage has failed
    let file = slow_file(Duration::from_millis(10));
    assert!(pipeline.parse_rows(&file).await.is_ok());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_run_is_refused() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store, common::registry(), PipelineConfig::default());
    let file = slow_file(Duration::from_secs(2));
    pipeline.collect(&file).await?;

    let (first, second) = tokio::join!(pipeline.parse_rows(&file), pipeline.parse_rows(&file));

    assert!(first.is_ok());
    let second = second.err();
    assert!(second.as_ref().is_some_and(StageError::is_overlap));
    assert_eq!(
        second.map(|e| e.to_string()),
        Some("parse for csv_files#1 is already running".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_file_created_respects_auto_start() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let file = TestFile::staff(1, &[["Acme", "a@acme.test", "Ann"]]);

    let idle = Pipeline::new(
        Arc::clone(&store),
        common::registry(),
        PipelineConfig::default().with_auto_start(false),
    );
    assert!(idle.file_created(&file).await?.is_none());
    assert!(store.raw_rows(&file.file).await.is_empty());

    let eager = Pipeline::new(Arc::clone(&store), common::registry(), PipelineConfig::default());
    let (collected, parsed) = eager.file_created(&file).await?.unwrap_or_default();
    assert_eq!(collected.inserted, 2);
    assert_eq!(parsed.entities, 2);
    Ok(())
}

#[tokio::test]
async fn test_file_deleted_removes_rows() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(Arc::clone(&store), common::registry(), PipelineConfig::default());
    let file = TestFile::staff(1, &[["Acme", "a@acme.test", "Ann"]]);
    let other = TestFile::staff(2, &[["Acme", "a@acme.test", "Ann"]]);

    pipeline.parse(&file).await?;
    pipeline.parse(&other).await?;
    pipeline.file_deleted(&file.file_ref()).await?;

    assert!(store.raw_rows(&file.file).await.is_empty());
    assert!(store.parsed_rows(&file.file).await.is_empty());
    assert_eq!(store.raw_rows(&other.file).await.len(), 2);
    Ok(())
}

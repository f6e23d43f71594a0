//! Apply stage
//!
//! Writes parsed entity rows into their target tables. Types are applied in
//! the order they first appear in the parse output, rows of a type in chunks,
//! each chunk inside its own transaction.
//!
//! Foreign key attributes holding a unique key are resolved to target ids
//! first. A reference that cannot be resolved yet is written as null to the
//! target while the parsed row keeps the key, so a later apply fills it in once
//! the referenced row has been applied.
//!
//! Rows without a target id are created. A creation whose key already exists,
//! in the store or earlier in the same chunk, becomes an update of that
//! entity. Rows with a target id are upserted, one write per entity with the
//! last row's values. Every written row gets its target id, key and values
//! stored back, so a second apply only updates.

use futures::StreamExt;
use rowsync_common::FileRef;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entity::{reference_key, EntityKind, EntityRegistry};
use crate::error::ApplyError;
use crate::events::{Disposition, EventSink, PipelineEvent};
use crate::models::{ParsedRow, ParsedRowUpdate, TargetId, Values};
use crate::stats::ApplyStats;
use crate::storage::{ApplyTransaction, ParsedRowStore, TargetStore};

pub struct ApplyEngine {
    registry: Arc<EntityRegistry>,
    events: Arc<dyn EventSink>,
    chunk_size: usize,
}

/// Creation rows sorted by what happened to them
#[derive(Debug, Default)]
struct CreateOutcome {
    created: Vec<ParsedRow>,
    redirected: Vec<ParsedRow>,
    skipped: Vec<ParsedRow>,
}

impl ApplyEngine {
    pub fn new(registry: Arc<EntityRegistry>, events: Arc<dyn EventSink>, chunk_size: usize) -> Self {
        Self {
            registry,
            events,
            chunk_size: chunk_size.max(1),
        }
    }

    #[tracing::instrument(skip(self, parsed, target), fields(file = %file))]
    pub async fn apply(
        &self,
        file: &FileRef,
        parsed: &dyn ParsedRowStore,
        target: &dyn TargetStore,
    ) -> Result<ApplyStats, ApplyError> {
        let mut stats = ApplyStats::new();

        for target_type in parsed.target_types(file).await? {
            let Some(kind) = self.registry.get(&target_type) else {
                warn!(target_type = %target_type, "Skipping rows of unregistered entity type");
                stats.unknown_types += 1;
                continue;
            };
            stats.types += 1;

            let mut rows = parsed.stream_by_type(file, &target_type, self.chunk_size);
            let mut chunk: Vec<ParsedRow> = Vec::with_capacity(self.chunk_size);
            while let Some(row) = rows.next().await {
                chunk.push(row?);
                if chunk.len() >= self.chunk_size {
                    let rows = std::mem::take(&mut chunk);
                    stats.merge(&self.apply_chunk(file, kind.as_ref(), rows, target).await?);
                }
            }
            if !chunk.is_empty() {
                stats.merge(&self.apply_chunk(file, kind.as_ref(), chunk, target).await?);
            }
        }

        stats.timing.complete();
        info!(
            types = stats.types,
            created = stats.created,
            updated = stats.updated,
            collided = stats.collided,
            unresolved = stats.unresolved_references,
            "Applied parsed rows"
        );
        Ok(stats)
    }

    /// One transaction: commit on success, roll back on any error
    async fn apply_chunk(
        &self,
        file: &FileRef,
        kind: &dyn EntityKind,
        rows: Vec<ParsedRow>,
        target: &dyn TargetStore,
    ) -> Result<ApplyStats, ApplyError> {
        let mut tx = target.begin().await?;

        match self.write_chunk(file, kind, rows, tx.as_mut()).await {
            Ok((stats, applied)) => {
                tx.commit().await?;
                for event in applied {
                    self.events.emit(event);
                }
                Ok(stats)
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback of apply chunk failed");
                }
                Err(err)
            },
        }
    }

    async fn write_chunk(
        &self,
        file: &FileRef,
        kind: &dyn EntityKind,
        mut rows: Vec<ParsedRow>,
        tx: &mut dyn ApplyTransaction,
    ) -> Result<(ApplyStats, Vec<PipelineEvent>), ApplyError> {
        let mut stats = ApplyStats {
            chunks: 1,
            ..Default::default()
        };
        let mut applied = Vec::new();
        let mut written: Vec<ParsedRowUpdate> = Vec::with_capacity(rows.len());

        self.resolve_references(file, kind, &mut rows, tx, &mut stats).await?;

        let (creating, mut updating): (Vec<ParsedRow>, Vec<ParsedRow>) =
            rows.into_iter().partition(|row| row.target_id.is_none());

        if !creating.is_empty() {
            self.events.emit(self.rows_event(file, kind, Disposition::Create, creating.clone(), false));
            let outcome = self.create(kind, creating, tx, &mut stats).await?;

            stats.skipped += outcome.skipped.len() as u64;
            written.extend(outcome.created.iter().map(ParsedRow::to_update));
            updating.extend(outcome.redirected);
            updating.sort_by_key(|row| (row.line_number, row.order_number));
            applied.push(self.rows_event(file, kind, Disposition::Create, outcome.created, true));
        }

        if !updating.is_empty() {
            self.events.emit(self.rows_event(file, kind, Disposition::Update, updating.clone(), false));
            let mut latest: BTreeMap<TargetId, Values> = BTreeMap::new();
            for row in &updating {
                if let Some(id) = row.target_id {
                    latest.insert(id, target_values(kind, &row.values));
                }
            }
            let payload: Vec<(TargetId, Values)> = latest.into_iter().collect();
            tx.bulk_upsert(kind, &payload).await?;

            stats.updated += updating.len() as u64;
            written.extend(updating.iter().map(ParsedRow::to_update));
            applied.push(self.rows_event(file, kind, Disposition::Update, updating, true));
        }

        if !written.is_empty() {
            tx.upsert_parsed_rows(&written).await?;
        }
        Ok((stats, applied))
    }

    async fn create(
        &self,
        kind: &dyn EntityKind,
        rows: Vec<ParsedRow>,
        tx: &mut dyn ApplyTransaction,
        stats: &mut ApplyStats,
    ) -> Result<CreateOutcome, ApplyError> {
        let mut outcome = CreateOutcome::default();
        let mut keyed: Vec<(String, ParsedRow)> = Vec::with_capacity(rows.len());
        for row in rows {
            match row.target_unique_key.clone() {
                Some(key) => keyed.push((key, row)),
                None => {
                    warn!(line = row.line_number, entity_type = kind.entity_type(), "Skipping entity without a unique key");
                    outcome.skipped.push(row);
                },
            }
        }
        if keyed.is_empty() {
            return Ok(outcome);
        }

        let keys: Vec<String> = keyed
            .iter()
            .map(|(key, _)| key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let existing = tx.lookup_identifiers(kind, &keys).await?;

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut new_keys: Vec<String> = Vec::new();
        let mut inserts: Vec<Values> = Vec::new();
        for (key, row) in &keyed {
            if !existing.contains_key(key) && claimed.insert(key.as_str()) {
                new_keys.push(key.clone());
                inserts.push(target_values(kind, &row.values));
            }
        }

        let created_ids = if inserts.is_empty() {
            HashMap::new()
        } else {
            tx.bulk_insert(kind, &inserts).await?;
            tx.lookup_identifiers(kind, &new_keys).await?
        };

        let mut first_claim: HashSet<String> = HashSet::new();
        for (key, mut row) in keyed {
            if let Some(id) = existing.get(&key) {
                row.target_id = Some(*id);
                stats.collided += 1;
                outcome.redirected.push(row);
            } else if let Some(id) = created_ids.get(&key) {
                row.target_id = Some(*id);
                if first_claim.insert(key) {
                    stats.created += 1;
                    outcome.created.push(row);
                } else {
                    stats.collided += 1;
                    outcome.redirected.push(row);
                }
            } else {
                return Err(ApplyError::MissingIdentifier {
                    entity_type: kind.entity_type().to_string(),
                    key,
                });
            }
        }

        debug!(
            created = outcome.created.len(),
            redirected = outcome.redirected.len(),
            "Created entities"
        );
        Ok(outcome)
    }

    /// Replace foreign key attributes holding a unique key with the target id
    /// already stored for it in this file. Keys that stay unknown are left in
    /// place. The unique key of each row is recomputed from its target values.
    async fn resolve_references(
        &self,
        file: &FileRef,
        kind: &dyn EntityKind,
        rows: &mut [ParsedRow],
        tx: &mut dyn ApplyTransaction,
        stats: &mut ApplyStats,
    ) -> Result<(), ApplyError> {
        let foreign_keys = kind.foreign_entity_keys();

        let mut wanted: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for row in rows.iter() {
            for foreign in &foreign_keys {
                if let Some(key) = row.values.get(&foreign.attribute).and_then(reference_key) {
                    wanted
                        .entry(foreign.entity_type.as_str())
                        .or_default()
                        .insert(key.to_string());
                }
            }
        }

        let mut resolved: HashMap<&str, HashMap<String, TargetId>> = HashMap::new();
        for (entity_type, keys) in wanted {
            let keys: Vec<String> = keys.into_iter().collect();
            let ids = tx.resolved_identifiers(file, entity_type, &keys).await?;
            resolved.insert(entity_type, ids);
        }

        for row in rows.iter_mut() {
            for foreign in &foreign_keys {
                let Some(key) = row
                    .values
                    .get(&foreign.attribute)
                    .and_then(reference_key)
                    .map(str::to_string)
                else {
                    continue;
                };
                match resolved
                    .get(foreign.entity_type.as_str())
                    .and_then(|ids| ids.get(&key))
                {
                    Some(id) => {
                        row.values.insert(foreign.attribute.clone(), Value::from(*id));
                    },
                    None => {
                        stats.unresolved_references += 1;
                        debug!(
                            line = row.line_number,
                            attribute = %foreign.attribute,
                            key = %key,
                            "Foreign key not resolved yet"
                        );
                    },
                }
            }
            row.target_unique_key = kind.materialize(&target_values(kind, &row.values))?.unique_key();
        }
        Ok(())
    }

    fn rows_event(
        &self,
        file: &FileRef,
        kind: &dyn EntityKind,
        disposition: Disposition,
        rows: Vec<ParsedRow>,
        applied: bool,
    ) -> PipelineEvent {
        let file = file.clone();
        let target_type = kind.entity_type().to_string();
        if applied {
            PipelineEvent::RowsApplied {
                file,
                target_type,
                disposition,
                rows,
            }
        } else {
            PipelineEvent::RowsApplying {
                file,
                target_type,
                disposition,
                rows,
            }
        }
    }
}

/// Values written to the target table: foreign keys still holding a unique
/// key are null there
fn target_values(kind: &dyn EntityKind, values: &Values) -> Values {
    let mut values = values.clone();
    for foreign in kind.foreign_entity_keys() {
        if values.get(&foreign.attribute).and_then(reference_key).is_some() {
            values.insert(foreign.attribute, Value::Null);
        }
    }
    values
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entity::{Entity, ForeignKey, ForeignRef};
    use crate::events::{ChannelEventSink, NoopEventSink};
    use crate::models::{ErrorBag, NewParsedRow};
    use crate::storage::MemoryStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Company {
        name: String,
    }

    impl Entity for Company {
        const TYPE: &'static str = "companies";
        const UNIQUE_KEY: &'static str = "name";

        fn unique_key(&self) -> Option<String> {
            Some(self.name.clone())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Employee {
        email: String,
        #[serde(default)]
        company_id: Option<ForeignRef>,
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

    #[derive(Debug, Serialize, Deserialize)]
    struct Person {
        email: String,
    }

    impl Entity for Person {
        const TYPE: &'static str = "people";
        const UNIQUE_KEY: &'static str = "email";
        const UNIQUE_KEY_SQL: Option<&'static str> = Some("lower(email)");

        fn unique_key(&self) -> Option<String> {
            Some(self.email.to_lowercase())
        }
    }

    fn registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::new()
                .with::<Company>()
                .with::<Employee>()
                .with::<Person>(),
        )
    }

    fn entity_row(file: &FileRef, line: i64, order: i32, kind: &str, key: &str, values: serde_json::Value) -> NewParsedRow {
        NewParsedRow {
            file: file.clone(),
            line_number: line,
            raw_row_id: line,
            order_number: order,
            target_type: Some(kind.to_string()),
            target_id: None,
            target_unique_key: Some(key.to_string()),
            values: values.as_object().cloned().unwrap(),
            errors: ErrorBag::new(),
        }
    }

    #[tokio::test]
    async fn test_creates_then_updates_on_second_apply() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[
                entity_row(&file, 2, 1, "companies", "Acme", json!({"name": "Acme"})),
                entity_row(&file, 3, 1, "companies", "Globex", json!({"name": "Globex"})),
            ])
            .await
            .unwrap();

        let engine = ApplyEngine::new(registry(), Arc::new(NoopEventSink), 10);
        let first = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!(first.created, 2);

        let second = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.table_rows("companies").await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_chunk_create_once() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[
                entity_row(&file, 2, 1, "companies", "Acme", json!({"name": "Acme"})),
                entity_row(&file, 3, 1, "companies", "Acme", json!({"name": "Acme"})),
            ])
            .await
            .unwrap();

        let engine = ApplyEngine::new(registry(), Arc::new(NoopEventSink), 10);
        let stats = engine.apply(&file, &store, &store).await.unwrap();

        assert_eq!(stats.created, 1);
        assert_eq!(stats.collided, 1);
        let ids: Vec<Option<TargetId>> = store.parsed_rows(&file).await.iter().map(|r| r.target_id).collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(store.table_rows("companies").await.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_key_writes_entity_once_per_chunk() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[
                entity_row(&file, 2, 1, "companies", "Acme", json!({"name": "Acme"})),
                entity_row(&file, 3, 1, "companies", "Acme", json!({"name": "Acme"})),
                entity_row(&file, 4, 1, "companies", "Acme", json!({"name": "Acme"})),
            ])
            .await
            .unwrap();

        let engine = ApplyEngine::new(registry(), Arc::new(NoopEventSink), 100);
        let first = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!((first.created, first.collided, first.updated), (1, 2, 2));

        let second = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!((second.created, second.updated), (0, 3));
        assert_eq!(store.table_rows("companies").await.len(), 1);
    }

    #[tokio::test]
    async fn test_derived_unique_key_finds_created_entity() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[
                entity_row(&file, 2, 1, "people", "ann@x.test", json!({"email": "Ann@X.test"})),
                entity_row(&file, 3, 1, "people", "ann@x.test", json!({"email": "ann@x.test"})),
            ])
            .await
            .unwrap();

        let engine = ApplyEngine::new(registry(), Arc::new(NoopEventSink), 100);
        let stats = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!((stats.created, stats.collided), (1, 1));

        let people = store.table_rows("people").await;
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].1["email"], "ann@x.test");

        let again = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!((again.created, again.updated), (0, 2));
        assert_eq!(store.table_rows("people").await.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_key_resolves_from_earlier_type() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[
                entity_row(&file, 2, 1, "companies", "Acme", json!({"name": "Acme"})),
                entity_row(&file, 2, 2, "employees", "a@acme.test", json!({"email": "a@acme.test", "company_id": "Acme"})),
            ])
            .await
            .unwrap();

        let (sink, mut events) = ChannelEventSink::new();
        let engine = ApplyEngine::new(registry(), Arc::new(sink), 10);
        let stats = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!(stats.unresolved_references, 0);

        let company_id = store.table_rows("companies").await[0].0;
        let employees = store.table_rows("employees").await;
        assert_eq!(employees[0].1["company_id"], json!(company_id));

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["rows_applying", "rows_applied", "rows_applying", "rows_applied"]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_skipped() {
        let store = MemoryStore::new();
        let file = FileRef::new("csv_files", 1);
        store
            .insert_parsed_rows(&[entity_row(&file, 2, 1, "invoices", "1", json!({"number": "1"}))])
            .await
            .unwrap();

        let engine = ApplyEngine::new(registry(), Arc::new(NoopEventSink), 10);
        let stats = engine.apply(&file, &store, &store).await.unwrap();
        assert_eq!(stats.unknown_types, 1);
        assert_eq!(stats.created, 0);
    }
}

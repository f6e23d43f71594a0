//! In-process store
//!
//! All tables live behind one async mutex. An apply transaction holds that
//! mutex from `begin` until `commit` or `rollback` and keeps a copy of the state
//! taken at `begin`, which rollback (or drop) restores.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use rowsync_common::FileRef;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ApplyTransaction, ParsedRowStore, RowStore, TargetStore};
use crate::entity::EntityKind;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    NewParsedRow, NewRawRow, ParsedRow, ParsedRowUpdate, RawRow, RawRowUpdate, RowId, TargetId,
    Values,
};

#[derive(Debug, Clone, Default)]
struct Table {
    last_id: TargetId,
    rows: BTreeMap<TargetId, Values>,
}

#[derive(Debug, Clone, Default)]
struct State {
    last_raw_id: RowId,
    raw_rows: BTreeMap<RowId, RawRow>,
    last_parsed_id: RowId,
    parsed_rows: BTreeMap<RowId, ParsedRow>,
    tables: HashMap<String, Table>,
    rejected_tables: HashSet<String>,
}

impl State {
    fn writable_table(&mut self, table: &str) -> StoreResult<&mut Table> {
        if self.rejected_tables.contains(table) {
            return Err(StoreError::Rejected(format!("table '{}' refuses writes", table)));
        }
        Ok(self.tables.entry(table.to_string()).or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw rows of `file` in line order
    pub async fn raw_rows(&self, file: &FileRef) -> Vec<RawRow> {
        let state = self.state.lock().await;
        let mut rows: Vec<RawRow> = state
            .raw_rows
            .values()
            .filter(|row| &row.file == file)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.line_number);
        rows
    }

    /// Parsed rows of `file` in line, then order number order
    pub async fn parsed_rows(&self, file: &FileRef) -> Vec<ParsedRow> {
        let state = self.state.lock().await;
        let mut rows: Vec<ParsedRow> = state
            .parsed_rows
            .values()
            .filter(|row| &row.file == file)
            .cloned()
            .collect();
        rows.sort_by_key(parsed_key);
        rows
    }

    /// Stored entities of `table` in id order
    pub async fn table_rows(&self, table: &str) -> Vec<(TargetId, Values)> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|(id, v)| (*id, v.clone())).collect())
            .unwrap_or_default()
    }

    /// Store an entity outside the pipeline, as another writer would
    pub async fn seed_entity(&self, table: &str, values: Values) -> TargetId {
        let mut state = self.state.lock().await;
        let table = state.tables.entry(table.to_string()).or_default();
        table.last_id += 1;
        let id = table.last_id;
        table.rows.insert(id, values);
        id
    }

    /// Make every later write to `table` fail
    pub async fn reject_writes_to(&self, table: &str) {
        self.state
            .lock()
            .await
            .rejected_tables
            .insert(table.to_string());
    }

    /// Lazily page through rows selected by `fetch`, resuming after the key of
    /// the last row of the previous page
    fn paged<T, K, F, G>(&self, page_size: usize, fetch: F, key_of: G) -> BoxStream<'static, StoreResult<T>>
    where
        T: Send + 'static,
        K: Send + 'static,
        F: Fn(&State, Option<&K>, usize) -> Vec<T> + Send + Sync + 'static,
        G: Fn(&T) -> K + Send + Sync + 'static,
    {
        enum Cursor<K> {
            Start,
            After(K),
            Done,
        }

        let state = self.state.clone();
        let page_size = page_size.max(1);
        let fetch = Arc::new(fetch);
        let key_of = Arc::new(key_of);

        stream::unfold(Cursor::Start, move |cursor| {
            let state = state.clone();
            let fetch = fetch.clone();
            let key_of = key_of.clone();
            async move {
                let after = match cursor {
                    Cursor::Done => return None,
                    Cursor::Start => None,
                    Cursor::After(key) => Some(key),
                };

                let page = {
                    let guard = state.lock().await;
                    (*fetch)(&*guard, after.as_ref(), page_size)
                };

                if page.is_empty() {
                    return None;
                }

                let next = match page.last() {
                    Some(last) if page.len() >= page_size => Cursor::After((*key_of)(last)),
                    _ => Cursor::Done,
                };

                Some((stream::iter(page.into_iter().map(Ok)), next))
            }
        })
        .flatten()
        .boxed()
    }
}

type ParsedKey = (i64, i32, RowId);

fn parsed_key(row: &ParsedRow) -> ParsedKey {
    (row.line_number, row.order_number, row.id)
}

fn parsed_page<P>(state: &State, after: Option<&ParsedKey>, limit: usize, keep: P) -> Vec<ParsedRow>
where
    P: Fn(&ParsedRow) -> bool,
{
    let mut rows: Vec<ParsedRow> = state
        .parsed_rows
        .values()
        .filter(|row| keep(*row) && after.map_or(true, |a| parsed_key(*row) > *a))
        .cloned()
        .collect();
    rows.sort_by_key(parsed_key);
    rows.truncate(limit);
    rows
}

/// Text form of a stored key column
#[async_trait]
impl RowStore for MemoryStore {
    async fn insert_rows(&self, rows: &[NewRawRow]) -> StoreResult<()> {
        let mut state = self.state.lock().await;

        let taken: HashSet<(FileRef, i64)> = state
            .raw_rows
            .values()
            .map(|row| (row.file.clone(), row.line_number))
            .collect();
        let mut incoming = HashSet::new();
        for row in rows {
            let key = (row.file.clone(), row.line_number);
            if taken.contains(&key) || !incoming.insert(key) {
                return Err(StoreError::conflict(
                    "raw row",
                    format!("{}:{}", row.file, row.line_number),
                ));
            }
        }

        let now = Utc::now();
        for row in rows {
            state.last_raw_id += 1;
            let id = state.last_raw_id;
            state.raw_rows.insert(
                id,
                RawRow {
                    id,
                    file: row.file.clone(),
                    line_number: row.line_number,
                    content: row.content.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        Ok(())
    }

    async fn upsert_rows(&self, rows: &[RawRowUpdate]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for update in rows {
            match state.raw_rows.get_mut(&update.id) {
                Some(existing) => {
                    existing.content = update.content.clone();
                    existing.updated_at = now;
                },
                None => {
                    state.last_raw_id = state.last_raw_id.max(update.id);
                    state.raw_rows.insert(
                        update.id,
                        RawRow {
                            id: update.id,
                            file: update.file.clone(),
                            line_number: update.line_number,
                            content: update.content.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                },
            }
        }

        Ok(())
    }

    fn stream_by_line(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<RawRow>> {
        let file = file.clone();
        self.paged(
            page_size,
            move |state: &State, after: Option<&i64>, limit: usize| {
                let mut rows: Vec<RawRow> = state
                    .raw_rows
                    .values()
                    .filter(|row| row.file == file && after.map_or(true, |a| row.line_number > *a))
                    .cloned()
                    .collect();
                rows.sort_by_key(|row| row.line_number);
                rows.truncate(limit);
                rows
            },
            |row: &RawRow| row.line_number,
        )
    }

    async fn find_row(&self, file: &FileRef, line_number: i64) -> StoreResult<Option<RawRow>> {
        let state = self.state.lock().await;
        Ok(state
            .raw_rows
            .values()
            .find(|row| &row.file == file && row.line_number == line_number)
            .cloned())
    }

    async fn delete_rows(&self, file: &FileRef) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.raw_rows.len();
        state.raw_rows.retain(|_, row| &row.file != file);
        Ok((before - state.raw_rows.len()) as u64)
    }
}

#[async_trait]
impl ParsedRowStore for MemoryStore {
    async fn insert_parsed_rows(&self, rows: &[NewParsedRow]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        for row in rows {
            state.last_parsed_id += 1;
            let id = state.last_parsed_id;
            state.parsed_rows.insert(
                id,
                ParsedRow {
                    id,
                    file: row.file.clone(),
                    line_number: row.line_number,
                    raw_row_id: row.raw_row_id,
                    order_number: row.order_number,
                    target_type: row.target_type.clone(),
                    target_id: row.target_id,
                    target_unique_key: row.target_unique_key.clone(),
                    values: row.values.clone(),
                    errors: row.errors.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        Ok(())
    }

    fn stream_parsed_rows(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<ParsedRow>> {
        let file = file.clone();
        self.paged(
            page_size,
            move |state: &State, after: Option<&ParsedKey>, limit: usize| {
                parsed_page(state, after, limit, |row| row.file == file)
            },
            parsed_key,
        )
    }

    fn stream_by_type(
        &self,
        file: &FileRef,
        target_type: &str,
        page_size: usize,
    ) -> BoxStream<'static, StoreResult<ParsedRow>> {
        let file = file.clone();
        let target_type = target_type.to_string();
        self.paged(
            page_size,
            move |state: &State, after: Option<&ParsedKey>, limit: usize| {
                parsed_page(state, after, limit, |row| {
                    row.file == file && row.target_type.as_deref() == Some(target_type.as_str())
                })
            },
            parsed_key,
        )
    }

    async fn target_types(&self, file: &FileRef) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;

        let mut firsts: HashMap<&str, (i32, i64)> = HashMap::new();
        for row in state.parsed_rows.values().filter(|row| &row.file == file) {
            if let Some(target_type) = row.target_type.as_deref() {
                let first = firsts
                    .entry(target_type)
                    .or_insert((row.order_number, row.line_number));
                first.0 = first.0.min(row.order_number);
                first.1 = first.1.min(row.line_number);
            }
        }

        let mut types: Vec<(i32, i64, &str)> = firsts
            .into_iter()
            .map(|(name, (order, line))| (order, line, name))
            .collect();
        types.sort_unstable();

        Ok(types.into_iter().map(|(_, _, name)| name.to_string()).collect())
    }

    async fn delete_parsed_rows(&self, file: &FileRef) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.parsed_rows.len();
        state.parsed_rows.retain(|_, row| &row.file != file);
        Ok((before - state.parsed_rows.len()) as u64)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn ApplyTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let backup = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            backup: Some(backup),
        }))
    }
}

struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<State>>,
    backup: Option<State>,
}

impl MemoryTransaction {
    fn state(&mut self) -> StoreResult<&mut State> {
        self.guard
            .as_deref_mut()
            .ok_or(StoreError::TransactionFinished)
    }

    fn restore(&mut self) {
        if let (Some(mut guard), Some(backup)) = (self.guard.take(), self.backup.take()) {
            *guard = backup;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl ApplyTransaction for MemoryTransaction {
    async fn bulk_insert(&mut self, kind: &dyn EntityKind, rows: &[Values]) -> StoreResult<()> {
        let table = self.state()?.writable_table(kind.table())?;
        for values in rows {
            table.last_id += 1;
            table.rows.insert(table.last_id, values.clone());
        }
        Ok(())
    }

    /// Attributes present in `values` overwrite the stored ones, others are
    /// kept. An id may appear only once per call, as in one Postgres statement.
    async fn bulk_upsert(&mut self, kind: &dyn EntityKind, rows: &[(TargetId, Values)]) -> StoreResult<()> {
        let mut seen = HashSet::with_capacity(rows.len());
        if let Some((id, _)) = rows.iter().find(|(id, _)| !seen.insert(*id)) {
            return Err(StoreError::Conflict(format!(
                "{} row {} is written twice in one statement",
                kind.table(),
                id
            )));
        }

        let table = self.state()?.writable_table(kind.table())?;
        for (id, values) in rows {
            table.last_id = table.last_id.max(*id);
            let stored = table.rows.entry(*id).or_default();
            for (column, value) in values {
                stored.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn lookup_identifiers(
        &mut self,
        kind: &dyn EntityKind,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>> {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut found = HashMap::new();

        if let Some(table) = self.state()?.tables.get(kind.table()) {
            for (id, values) in &table.rows {
                if let Some(key) = kind.stored_unique_key(values) {
                    if wanted.contains(key.as_str()) {
                        found.entry(key).or_insert(*id);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn resolved_identifiers(
        &mut self,
        file: &FileRef,
        target_type: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>> {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut found: HashMap<String, TargetId> = HashMap::new();

        for row in self.state()?.parsed_rows.values() {
            if &row.file != file || row.target_type.as_deref() != Some(target_type) {
                continue;
            }
            if let (Some(key), Some(id)) = (row.target_unique_key.as_deref(), row.target_id) {
                if wanted.contains(key) {
                    found
                        .entry(key.to_string())
                        .and_modify(|existing| *existing = (*existing).min(id))
                        .or_insert(id);
                }
            }
        }

        Ok(found)
    }

    async fn upsert_parsed_rows(&mut self, rows: &[ParsedRowUpdate]) -> StoreResult<()> {
        let state = self.state()?;
        let now = Utc::now();

        for update in rows {
            if let Some(row) = state.parsed_rows.get_mut(&update.id) {
                row.target_id = update.target_id;
                row.target_unique_key = update.target_unique_key.clone();
                row.values = update.values.clone();
                row.updated_at = now;
            }
        }

        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.backup.take();
        self.guard.take().map(drop).ok_or(StoreError::TransactionFinished)
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.guard.is_none() {
            return Err(StoreError::TransactionFinished);
        }
        self.restore();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entity::{Entity, KindOf};
    use futures::TryStreamExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Widget {
        sku: String,
    }

    impl Entity for Widget {
        const TYPE: &'static str = "widget";
        const TABLE: &'static str = "widgets";
        const UNIQUE_KEY: &'static str = "sku";

        fn unique_key(&self) -> Option<String> {
            Some(self.sku.clone())
        }
    }

    fn file() -> FileRef {
        FileRef::new("csv_files", 1)
    }

    fn raw(line: i64, cells: &[&str]) -> NewRawRow {
        NewRawRow {
            file: file(),
            line_number: line,
            content: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn values(v: serde_json::Value) -> Values {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_stream_by_line_pages_in_order() {
        let store = MemoryStore::new();
        store
            .insert_rows(&[raw(3, &["c"]), raw(1, &["a"]), raw(2, &["b"]), raw(4, &["d"])])
            .await
            .unwrap();

        let rows: Vec<RawRow> = store.stream_by_line(&file(), 3).try_collect().await.unwrap();
        let lines: Vec<i64> = rows.iter().map(|r| r.line_number).collect();
        assert_eq!(lines, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_duplicate_line_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_rows(&[raw(1, &["a"])]).await.unwrap();

        let err = store.insert_rows(&[raw(1, &["b"])]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.raw_rows(&file()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_read_rows_chunks_with_remainder() {
        let store = MemoryStore::new();
        store
            .insert_rows(&[raw(1, &["h"]), raw(2, &["a"]), raw(3, &["b"]), raw(4, &["c"])])
            .await
            .unwrap();

        let chunks: Vec<Vec<(i64, Vec<String>)>> =
            store.read_rows(&file(), 2).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].iter().map(|(l, _)| *l).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(chunks[1].len(), 1);
    }

    #[tokio::test]
    async fn test_headers_are_unique() {
        let store = MemoryStore::new();
        store.insert_rows(&[raw(1, &["a", "a", "b"])]).await.unwrap();
        assert_eq!(store.headers(&file()).await.unwrap(), vec!["a", "a (2)", "b"]);
        assert!(store
            .headers(&FileRef::new("csv_files", 2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let store = MemoryStore::new();
        let kind = KindOf::<Widget>::new();

        let mut tx = store.begin().await.unwrap();
        tx.bulk_insert(&kind, &[values(json!({"sku": "w-1"}))]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.table_rows("widgets").await.is_empty());
        assert!(matches!(tx.commit().await, Err(StoreError::TransactionFinished)));
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        let kind = KindOf::<Widget>::new();

        {
            let mut tx = store.begin().await.unwrap();
            tx.bulk_insert(&kind, &[values(json!({"sku": "w-1"}))]).await.unwrap();
        }

        assert!(store.table_rows("widgets").await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_prefers_lowest_id() {
        let store = MemoryStore::new();
        let kind = KindOf::<Widget>::new();
        let first = store.seed_entity("widgets", values(json!({"sku": "w-1"}))).await;
        store.seed_entity("widgets", values(json!({"sku": "w-1"}))).await;

        let mut tx = store.begin().await.unwrap();
        tx.bulk_insert(&kind, &[values(json!({"sku": "w-2"}))]).await.unwrap();
        let found = tx
            .lookup_identifiers(&kind, &["w-1".to_string(), "w-2".to_string(), "w-3".to_string()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(found.get("w-1"), Some(&first));
        assert_eq!(found.get("w-2"), Some(&3));
        assert!(!found.contains_key("w-3"));
        assert_eq!(store.table_rows("widgets").await.len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_keeps_absent_attributes() {
        let store = MemoryStore::new();
        let kind = KindOf::<Widget>::new();
        let id = store
            .seed_entity("widgets", values(json!({"sku": "w-1", "color": "red"})))
            .await;

        let mut tx = store.begin().await.unwrap();
        tx.bulk_upsert(&kind, &[(id, values(json!({"sku": "w-1b"})))])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.table_rows("widgets").await,
            vec![(id, values(json!({"sku": "w-1b", "color": "red"})))]
        );
    }

    #[tokio::test]
    async fn test_upsert_refuses_repeated_id() {
        let store = MemoryStore::new();
        let kind = KindOf::<Widget>::new();
        let id = store.seed_entity("widgets", values(json!({"sku": "w-1"}))).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .bulk_upsert(
                &kind,
                &[(id, values(json!({"sku": "a"}))), (id, values(json!({"sku": "b"})))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rejected_table() {
        let store = MemoryStore::new();
        store.reject_writes_to("widgets").await;

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .bulk_insert(&KindOf::<Widget>::new(), &[values(json!({"sku": "w-1"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_target_types_order_by_first_order_number() {
        let store = MemoryStore::new();
        let row = |line: i64, order: i32, target_type: &str| NewParsedRow {
            file: file(),
            line_number: line,
            raw_row_id: line,
            order_number: order,
            target_type: Some(target_type.to_string()),
            target_id: None,
            target_unique_key: None,
            values: Values::new(),
            errors: Default::default(),
        };

        store
            .insert_parsed_rows(&[row(2, 2, "contact"), row(2, 1, "company"), row(3, 2, "note"), row(4, 1, "tag")])
            .await
            .unwrap();

        assert_eq!(
            store.target_types(&file()).await.unwrap(),
            vec!["company", "tag", "contact", "note"]
        );
    }
}

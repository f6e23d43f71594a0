//! Postgres store
//!
//! Raw and parsed rows live in the `raw_rows` and `parsed_rows` tables created by
//! the bundled migrations. Target entities live in application tables named by
//! each [`EntityKind`]; their rows are written through `jsonb_populate_recordset`
//! so column types come from the table definition.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use rowsync_common::FileRef;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use super::{ApplyTransaction, ParsedRowStore, RowStore, TargetStore};
use crate::db::DbConfig;
use crate::entity::EntityKind;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ErrorBag, NewParsedRow, NewRawRow, ParsedRow, ParsedRowUpdate, RawRow, RawRowUpdate, TargetId,
    Values,
};

/// Rows per statement, well below the Postgres bind parameter limit
const BIND_CHUNK_SIZE: usize = 1000;

const RAW_COLUMNS: &str = "id, file_type, file_id, line_number, content, created_at, updated_at";

const PARSED_COLUMNS: &str = r#"id, file_type, file_id, line_number, raw_row_id, order_number,
    target_type, target_id, target_unique_key, "values", errors, created_at, updated_at"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `config` and bring the row tables up to date
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        let store = Self::new(crate::db::create_pool(config).await?);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        crate::db::run_migrations(&self.pool).await
    }
}

fn raw_row_from(row: &PgRow) -> StoreResult<RawRow> {
    let Json(content): Json<Vec<String>> = row.try_get("content")?;
    Ok(RawRow {
        id: row.try_get("id")?,
        file: FileRef::new(row.try_get::<String, _>("file_type")?, row.try_get("file_id")?),
        line_number: row.try_get("line_number")?,
        content,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parsed_row_from(row: &PgRow) -> StoreResult<ParsedRow> {
    let Json(values): Json<Values> = row.try_get("values")?;
    let Json(errors): Json<ErrorBag> = row.try_get("errors")?;
    Ok(ParsedRow {
        id: row.try_get("id")?,
        file: FileRef::new(row.try_get::<String, _>("file_type")?, row.try_get("file_id")?),
        line_number: row.try_get("line_number")?,
        raw_row_id: row.try_get("raw_row_id")?,
        order_number: row.try_get("order_number")?,
        target_type: row.try_get("target_type")?,
        target_id: row.try_get("target_id")?,
        target_unique_key: row.try_get("target_unique_key")?,
        values,
        errors,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn raw_pages(
    pool: PgPool,
    file: FileRef,
    page_size: usize,
) -> impl Stream<Item = StoreResult<RawRow>> + Send + 'static {
    try_stream! {
        let limit = page_size.max(1) as i64;
        let mut after = i64::MIN;

        loop {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM raw_rows
                 WHERE file_type = $1 AND file_id = $2 AND line_number > $3
                 ORDER BY line_number LIMIT $4",
                RAW_COLUMNS
            ))
            .bind(&file.file_type)
            .bind(file.file_id)
            .bind(after)
            .bind(limit)
            .fetch_all(&pool)
            .await?;

            let fetched = rows.len() as i64;
            for row in &rows {
                let raw = raw_row_from(row)?;
                after = raw.line_number;
                yield raw;
            }

            if fetched < limit {
                break;
            }
        }
    }
}

fn parsed_pages(
    pool: PgPool,
    file: FileRef,
    target_type: Option<String>,
    page_size: usize,
) -> impl Stream<Item = StoreResult<ParsedRow>> + Send + 'static {
    try_stream! {
        let limit = page_size.max(1) as i64;
        let mut after: (i64, i32, i64) = (i64::MIN, i32::MIN, i64::MIN);

        loop {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM parsed_rows
                 WHERE file_type = $1 AND file_id = $2
                   AND ($3::varchar IS NULL OR target_type = $3)
                   AND (line_number, order_number, id) > ($4, $5, $6)
                 ORDER BY line_number, order_number, id LIMIT $7",
                PARSED_COLUMNS
            ))
            .bind(&file.file_type)
            .bind(file.file_id)
            .bind(target_type.as_deref())
            .bind(after.0)
            .bind(after.1)
            .bind(after.2)
            .bind(limit)
            .fetch_all(&pool)
            .await?;

            let fetched = rows.len() as i64;
            for row in &rows {
                let parsed = parsed_row_from(row)?;
                after = (parsed.line_number, parsed.order_number, parsed.id);
                yield parsed;
            }

            if fetched < limit {
                break;
            }
        }
    }
}

#[async_trait]
impl RowStore for PgStore {
    async fn insert_rows(&self, rows: &[NewRawRow]) -> StoreResult<()> {
        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO raw_rows (file_type, file_id, line_number, content) ");

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.file.file_type)
                    .push_bind(row.file.file_id)
                    .push_bind(row.line_number)
                    .push_bind(Json(&row.content));
            });

            query_builder.build().execute(&self.pool).await?;
        }

        debug!(rows = rows.len(), "Inserted raw rows");
        Ok(())
    }

    async fn upsert_rows(&self, rows: &[RawRowUpdate]) -> StoreResult<()> {
        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO raw_rows (id, file_type, file_id, line_number, content) ",
            );

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.file.file_type)
                    .push_bind(row.file.file_id)
                    .push_bind(row.line_number)
                    .push_bind(Json(&row.content));
            });

            query_builder
                .push(" ON CONFLICT (id) DO UPDATE SET content = EXCLUDED.content, updated_at = NOW()");

            query_builder.build().execute(&self.pool).await?;
        }

        debug!(rows = rows.len(), "Updated raw rows");
        Ok(())
    }

    fn stream_by_line(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<RawRow>> {
        raw_pages(self.pool.clone(), file.clone(), page_size).boxed()
    }

    async fn find_row(&self, file: &FileRef, line_number: i64) -> StoreResult<Option<RawRow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM raw_rows WHERE file_type = $1 AND file_id = $2 AND line_number = $3",
            RAW_COLUMNS
        ))
        .bind(&file.file_type)
        .bind(file.file_id)
        .bind(line_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(raw_row_from).transpose()
    }

    async fn delete_rows(&self, file: &FileRef) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM raw_rows WHERE file_type = $1 AND file_id = $2")
            .bind(&file.file_type)
            .bind(file.file_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ParsedRowStore for PgStore {
    async fn insert_parsed_rows(&self, rows: &[NewParsedRow]) -> StoreResult<()> {
        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO parsed_rows (
                    file_type, file_id, line_number, raw_row_id, order_number,
                    target_type, target_id, target_unique_key, "values", errors
                ) "#,
            );

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.file.file_type)
                    .push_bind(row.file.file_id)
                    .push_bind(row.line_number)
                    .push_bind(row.raw_row_id)
                    .push_bind(row.order_number)
                    .push_bind(row.target_type.as_deref())
                    .push_bind(row.target_id)
                    .push_bind(row.target_unique_key.as_deref())
                    .push_bind(Json(&row.values))
                    .push_bind(Json(&row.errors));
            });

            query_builder.build().execute(&self.pool).await?;
        }

        debug!(rows = rows.len(), "Inserted parsed rows");
        Ok(())
    }

    fn stream_parsed_rows(&self, file: &FileRef, page_size: usize) -> BoxStream<'static, StoreResult<ParsedRow>> {
        parsed_pages(self.pool.clone(), file.clone(), None, page_size).boxed()
    }

    fn stream_by_type(
        &self,
        file: &FileRef,
        target_type: &str,
        page_size: usize,
    ) -> BoxStream<'static, StoreResult<ParsedRow>> {
        parsed_pages(
            self.pool.clone(),
            file.clone(),
            Some(target_type.to_string()),
            page_size,
        )
        .boxed()
    }

    async fn target_types(&self, file: &FileRef) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT target_type FROM parsed_rows
             WHERE file_type = $1 AND file_id = $2 AND target_type IS NOT NULL
             GROUP BY target_type
             ORDER BY MIN(order_number), MIN(line_number), target_type",
        )
        .bind(&file.file_type)
        .bind(file.file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("target_type").map_err(StoreError::from))
            .collect()
    }

    async fn delete_parsed_rows(&self, file: &FileRef) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM parsed_rows WHERE file_type = $1 AND file_id = $2")
            .bind(&file.file_type)
            .bind(file.file_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn ApplyTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgApplyTransaction { tx: Some(tx) }))
    }
}

struct PgApplyTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgApplyTransaction {
    fn tx(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl ApplyTransaction for PgApplyTransaction {
    async fn bulk_insert(&mut self, kind: &dyn EntityKind, rows: &[Values]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let columns = column_union(rows.iter());
        let tx = self.tx()?;

        if columns.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES", quote_ident(kind.table())?);
            for _ in rows {
                sqlx::query(&sql).execute(&mut **tx).await?;
            }
            return Ok(());
        }

        let sql = insert_entities_sql(kind.table(), &columns)?;
        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            let payload = Value::Array(chunk.iter().cloned().map(Value::Object).collect());
            sqlx::query(&sql).bind(Json(payload)).execute(&mut **tx).await?;
        }

        debug!(table = kind.table(), rows = rows.len(), "Inserted target entities");
        Ok(())
    }

    async fn bulk_upsert(&mut self, kind: &dyn EntityKind, rows: &[(TargetId, Values)]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let columns = column_union(rows.iter().map(|(_, values)| values));
        let sql = upsert_entities_sql(kind.table(), kind.primary_key(), &columns)?;
        let tx = self.tx()?;

        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            let payload = Value::Array(
                chunk
                    .iter()
                    .map(|(id, values)| {
                        let mut object = values.clone();
                        object.insert(kind.primary_key().to_string(), Value::from(*id));
                        Value::Object(object)
                    })
                    .collect(),
            );
            sqlx::query(&sql).bind(Json(payload)).execute(&mut **tx).await?;
        }

        debug!(table = kind.table(), rows = rows.len(), "Upserted target entities");
        Ok(())
    }

    async fn lookup_identifiers(
        &mut self,
        kind: &dyn EntityKind,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = lookup_sql(
            kind.table(),
            kind.primary_key(),
            kind.unique_key_name(),
            kind.unique_key_sql(),
        )?;
        let rows = sqlx::query(&sql)
            .bind(keys)
            .fetch_all(&mut **self.tx()?)
            .await?;

        let mut found = HashMap::new();
        for row in rows {
            let key: String = row.try_get("unique_key")?;
            let id: TargetId = row.try_get("id")?;
            found.entry(key).or_insert(id);
        }
        Ok(found)
    }

    async fn resolved_identifiers(
        &mut self,
        file: &FileRef,
        target_type: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, TargetId>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT target_unique_key, MIN(target_id) AS target_id FROM parsed_rows
             WHERE file_type = $1 AND file_id = $2 AND target_type = $3
               AND target_id IS NOT NULL AND target_unique_key = ANY($4)
             GROUP BY target_unique_key",
        )
        .bind(&file.file_type)
        .bind(file.file_id)
        .bind(target_type)
        .bind(keys)
        .fetch_all(&mut **self.tx()?)
        .await?;

        let mut found = HashMap::new();
        for row in rows {
            let key: String = row.try_get("target_unique_key")?;
            let id: TargetId = row.try_get("target_id")?;
            found.insert(key, id);
        }
        Ok(found)
    }

    async fn upsert_parsed_rows(&mut self, rows: &[ParsedRowUpdate]) -> StoreResult<()> {
        let tx = self.tx()?;
        for chunk in rows.chunks(BIND_CHUNK_SIZE) {
            sqlx::query(
                r#"UPDATE parsed_rows AS p
                   SET target_id = u.target_id,
                       target_unique_key = u.target_unique_key,
                       "values" = u."values",
                       updated_at = NOW()
                   FROM jsonb_to_recordset($1) AS u(
                       id BIGINT, target_id BIGINT, target_unique_key TEXT, "values" JSONB
                   )
                   WHERE p.id = u.id"#,
            )
            .bind(Json(chunk))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}

/// Sorted union of attribute names
fn column_union<'a>(rows: impl Iterator<Item = &'a Values>) -> Vec<String> {
    rows.flat_map(|values| values.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    }
}

/// Quote a table or column name, allowing one `schema.` prefix
fn quote_ident(name: &str) -> StoreResult<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| is_identifier(part)) {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(parts
        .iter()
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join("."))
}

fn quote_all(columns: &[String]) -> StoreResult<Vec<String>> {
    columns
        .iter()
        .map(|column| {
            if column.contains('.') {
                Err(StoreError::InvalidIdentifier(column.clone()))
            } else {
                quote_ident(column)
            }
        })
        .collect()
}

fn insert_entities_sql(table: &str, columns: &[String]) -> StoreResult<String> {
    let table = quote_ident(table)?;
    let columns = quote_all(columns)?.join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)"
    ))
}

fn upsert_entities_sql(table: &str, primary_key: &str, columns: &[String]) -> StoreResult<String> {
    let table = quote_ident(table)?;
    let pk = quote_all(&[primary_key.to_string()])?.concat();
    let updates: Vec<String> = quote_all(columns)?
        .into_iter()
        .filter(|column| *column != pk)
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();

    let mut all = vec![pk.clone()];
    all.extend(quote_all(columns)?.into_iter().filter(|column| *column != pk));
    let all = all.join(", ");

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {table} ({all}) SELECT {all} FROM jsonb_populate_recordset(NULL::{table}, $1) ON CONFLICT ({pk}) {action}"
    ))
}

/// `key_sql` is trusted SQL declared on the entity type; without it the key
/// column's text is compared.
fn lookup_sql(table: &str, primary_key: &str, unique_key: &str, key_sql: Option<&str>) -> StoreResult<String> {
    let table = quote_ident(table)?;
    let pk = quote_all(&[primary_key.to_string()])?.concat();
    let key = match key_sql {
        Some(expression) => format!("({expression})::text"),
        None => format!("{}::text", quote_all(&[unique_key.to_string()])?.concat()),
    };
    Ok(format!(
        "SELECT {pk}::bigint AS id, {key} AS unique_key FROM {table} WHERE {key} = ANY($1) ORDER BY {pk}"
    ))
}

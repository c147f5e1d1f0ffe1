//! Streaming write pipeline: delete-then-insert batches in chunked
//! transactions.
//!
//! Incoming entities accumulate into a delete batch (OR-joined identity
//! predicates) and an insert batch (multi-row VALUES). Every
//! `flush_threshold` entities, and once at end of stream, the batch runs in
//! its own transaction: on error the transaction is rolled back and the
//! original error surfaces, wrapping any rollback failure.

use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use edl_core::config::DatasetDefinition;
use edl_core::entity::{Entity, Value};
use edl_core::error::LayerError;
use edl_core::mapper::{Mapper, RowItem};
use edl_core::token::{quote_text, TIME_FORMAT};

/// Renders one mapper value as a SQL literal for batch statements.
fn sql_val(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => format!("'{b}'"),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => quote_text(s),
        Value::Time(t) => quote_text(&t.format(TIME_FORMAT).to_string()),
        Value::Json(v) => quote_text(&v.to_string()),
        Value::Entity(e) => quote_text(&serde_json::to_string(e).unwrap_or_default()),
        Value::List(items) => {
            let rendered: Vec<String> = items.iter().map(|v| v.to_text()).collect();
            quote_text(&serde_json::to_string(&rendered).unwrap_or_default())
        }
    }
}

/// Accumulates one chunk of DELETE predicates and INSERT tuples.
struct Batch {
    table: String,
    id_column: String,
    since_column: String,
    append_mode: bool,
    delete: String,
    insert: String,
    size: usize,
}

impl Batch {
    fn new(table: &str, id_column: &str, since_column: &str, append_mode: bool) -> Self {
        Batch {
            table: table.to_string(),
            id_column: id_column.to_string(),
            since_column: since_column.to_lowercase(),
            append_mode,
            delete: String::new(),
            insert: String::new(),
            size: 0,
        }
    }

    /// Adds one mapped row. Delete-then-insert is the upsert discipline:
    /// every entity contributes a delete predicate (unless appending), and
    /// non-deleted entities contribute an insert tuple.
    fn add(&mut self, item: &RowItem) {
        if self.append_mode {
            if item.deleted {
                return;
            }
            self.push_insert(item);
            self.size += 1;
            return;
        }

        self.push_delete(item);
        if !item.deleted {
            self.push_insert(item);
        }
        self.size += 1;
    }

    fn push_delete(&mut self, item: &RowItem) {
        if self.delete.is_empty() {
            self.delete.push_str("DELETE FROM ");
            self.delete.push_str(&self.table);
            self.delete.push_str(" WHERE ");
        } else {
            self.delete.push_str(" OR ");
        }
        let id_value = item.get(&self.id_column).cloned().unwrap_or(Value::Null);
        self.delete.push_str(&self.id_column);
        self.delete.push_str(" = ");
        self.delete.push_str(&sql_val(&id_value));
    }

    fn push_insert(&mut self, item: &RowItem) {
        if self.insert.is_empty() {
            self.insert.push_str("INSERT INTO ");
            self.insert.push_str(&self.table);
            self.insert.push_str(" (");
            for (i, column) in item.columns.iter().enumerate() {
                if i > 0 {
                    self.insert.push_str(", ");
                }
                self.insert.push('"');
                self.insert.push_str(&column.to_lowercase());
                self.insert.push('"');
            }
            if !self.since_column.is_empty() {
                self.insert.push_str(", \"");
                self.insert.push_str(&self.since_column);
                self.insert.push('"');
            }
            self.insert.push_str(") VALUES ");
        } else {
            self.insert.push(',');
        }

        self.insert.push_str(" (");
        for (i, value) in item.values.iter().enumerate() {
            if i > 0 {
                self.insert.push_str(", ");
            }
            self.insert.push_str(&sql_val(value));
        }
        if !self.since_column.is_empty() {
            self.insert.push_str(", NOW()");
        }
        self.insert.push(')');
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn delete_statement(&self) -> Option<&str> {
        (!self.delete.is_empty()).then_some(self.delete.as_str())
    }

    fn insert_statement(&self) -> Option<&str> {
        (!self.insert.is_empty()).then_some(self.insert.as_str())
    }

    fn reset(&mut self) {
        self.delete.clear();
        self.insert.clear();
        self.size = 0;
    }
}

/// Drains an entity stream into chunked upsert transactions for one dataset.
pub struct WritePipeline {
    pool: PgPool,
    mapper: Mapper,
    batch: Batch,
    flush_threshold: usize,
}

impl WritePipeline {
    pub fn new(pool: PgPool, definition: &DatasetDefinition) -> Result<Self, LayerError> {
        let source = &definition.source_config;
        if source.table_name.is_empty() {
            return Err(LayerError::internal(anyhow::anyhow!(
                "table name not found in source config for dataset {}",
                definition.name
            )));
        }
        Ok(WritePipeline {
            pool,
            mapper: Mapper::new(definition),
            batch: Batch::new(
                &source.table_name,
                definition.identity_column(),
                &source.since_column,
                source.append_mode,
            ),
            flush_threshold: source.flush_threshold,
        })
    }

    /// Maps and buffers one entity, flushing when the chunk is full.
    pub async fn write(&mut self, entity: &Entity) -> Result<(), LayerError> {
        let item = self.mapper.entity_to_row(entity)?;
        self.batch.add(&item);
        if self.batch.size >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes the tail batch and finishes the stream.
    pub async fn close(mut self) -> Result<(), LayerError> {
        self.flush().await
    }

    /// Consumer loop: drain the channel until the producer closes it.
    ///
    /// The stop token is shared with the producer. On a write error it is
    /// cancelled so the producer drops its remaining input; a cancellation
    /// from the producer side abandons the stream without flushing the
    /// tail batch.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Entity>,
        stop: CancellationToken,
    ) -> Result<(), LayerError> {
        loop {
            let received = tokio::select! {
                _ = stop.cancelled() => {
                    return Err(LayerError::internal(anyhow::anyhow!(
                        "entity stream aborted"
                    )));
                }
                received = rx.recv() => received,
            };
            match received {
                Some(entity) => {
                    if let Err(err) = self.write(&entity).await {
                        stop.cancel();
                        return Err(err);
                    }
                }
                None => break,
            }
        }
        self.close().await
    }

    /// Runs the current batch in one transaction. An empty batch performs
    /// zero database statements.
    async fn flush(&mut self) -> Result<(), LayerError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(LayerError::query)?;
        if let Some(delete) = self.batch.delete_statement() {
            if let Err(e) = sqlx::query(delete).execute(&mut *tx).await {
                return Err(rollback(tx, e).await);
            }
        }
        if let Some(insert) = self.batch.insert_statement() {
            if let Err(e) = sqlx::query(insert).execute(&mut *tx).await {
                return Err(rollback(tx, e).await);
            }
        }
        tx.commit().await.map_err(LayerError::query)?;
        debug!(rows = self.batch.size, "batch committed");
        self.batch.reset();
        Ok(())
    }
}

async fn rollback(tx: Transaction<'_, Postgres>, cause: sqlx::Error) -> LayerError {
    if let Err(rb) = tx.rollback().await {
        return LayerError::internal(anyhow::anyhow!(
            "failed to rollback transaction: {rb}, underlying: {cause}"
        ));
    }
    LayerError::query(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edl_core::mapper::row_from_pairs;

    fn item(id: i64, name: &str) -> RowItem {
        row_from_pairs(vec![
            ("id".to_string(), Value::String(id.to_string())),
            ("name".to_string(), Value::String(name.to_string())),
        ])
    }

    #[test]
    fn sql_val_quoting() {
        assert_eq!(sql_val(&Value::Null), "NULL");
        assert_eq!(sql_val(&Value::Bool(true)), "'true'");
        assert_eq!(sql_val(&Value::Int(42)), "42");
        assert_eq!(sql_val(&Value::Float(1.5)), "1.5");
        assert_eq!(sql_val(&Value::String("it's".to_string())), "'it''s'");
        assert_eq!(
            sql_val(&Value::Json(serde_json::json!({"a": 1}))),
            "'{\"a\":1}'"
        );
    }

    #[test]
    fn deletes_join_with_or() {
        let mut batch = Batch::new("product", "id", "", false);
        batch.add(&item(1, "a"));
        batch.add(&item(2, "b"));
        assert_eq!(
            batch.delete_statement().unwrap(),
            "DELETE FROM product WHERE id = '1' OR id = '2'"
        );
    }

    #[test]
    fn inserts_accumulate_tuples() {
        let mut batch = Batch::new("product", "id", "", false);
        batch.add(&item(1, "a"));
        batch.add(&item(2, "b"));
        assert_eq!(
            batch.insert_statement().unwrap(),
            "INSERT INTO product (\"id\", \"name\") VALUES  ('1', 'a'), ('2', 'b')"
        );
    }

    #[test]
    fn since_column_receives_now() {
        let mut batch = Batch::new("product", "id", "Timestamp", false);
        batch.add(&item(1, "a"));
        assert_eq!(
            batch.insert_statement().unwrap(),
            "INSERT INTO product (\"id\", \"name\", \"timestamp\") VALUES  ('1', 'a', NOW())"
        );
    }

    #[test]
    fn deleted_entities_only_produce_delete_predicates() {
        let mut batch = Batch::new("product", "id", "", false);
        let mut deleted = item(1, "gone");
        deleted.deleted = true;
        batch.add(&deleted);
        batch.add(&item(2, "kept"));

        assert_eq!(
            batch.delete_statement().unwrap(),
            "DELETE FROM product WHERE id = '1' OR id = '2'"
        );
        assert_eq!(
            batch.insert_statement().unwrap(),
            "INSERT INTO product (\"id\", \"name\") VALUES  ('2', 'kept')"
        );
        assert_eq!(batch.size, 2);
    }

    #[test]
    fn append_mode_suppresses_deletes_entirely() {
        let mut batch = Batch::new("product", "id", "", true);
        let mut deleted = item(1, "gone");
        deleted.deleted = true;
        batch.add(&deleted);
        batch.add(&item(2, "kept"));

        assert!(batch.delete_statement().is_none());
        assert_eq!(
            batch.insert_statement().unwrap(),
            "INSERT INTO product (\"id\", \"name\") VALUES  ('2', 'kept')"
        );
        assert_eq!(batch.size, 1);
    }

    #[test]
    fn empty_batch_has_no_statements() {
        let batch = Batch::new("product", "id", "", false);
        assert!(batch.is_empty());
        assert!(batch.delete_statement().is_none());
        assert!(batch.insert_statement().is_none());
    }

    #[test]
    fn reset_clears_the_chunk() {
        let mut batch = Batch::new("product", "id", "", false);
        batch.add(&item(1, "a"));
        assert!(!batch.is_empty());
        batch.reset();
        assert!(batch.is_empty());
        assert!(batch.delete_statement().is_none());
    }
}

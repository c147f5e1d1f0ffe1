//! Change-cursor reads: max-sentinel round-trip, windowed query execution
//! and lazy row-to-entity streaming.
//!
//! The row stream runs in a spawned task feeding a bounded channel, so a
//! slow client applies back-pressure to the database cursor instead of
//! buffering the result set. Cancellation propagates through a child token
//! and closes the stream on the next row fetch.

use std::sync::Arc;

use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use edl_core::config::DatasetDefinition;
use edl_core::entity::{Entity, Value};
use edl_core::error::LayerError;
use edl_core::mapper::{Mapper, RowItem};
use edl_core::token::{self, SinceDatatype};

use crate::query;

const ROW_CHANNEL_CAPACITY: usize = 100;

/// Parameters of one change read.
#[derive(Debug, Default)]
pub struct ChangesRequest {
    pub since: Option<String>,
    pub limit: i64,
    pub latest_only: bool,
}

/// Opens a change read and returns the entity iterator for it.
///
/// Protocol: resolve the max sentinel in one round-trip, encode it as the
/// continuation token, then stream the windowed data query between the
/// decoded prior token (exclusive) and the max (inclusive).
pub async fn changes(
    pool: &PgPool,
    definition: Arc<DatasetDefinition>,
    request: ChangesRequest,
    cancel: CancellationToken,
) -> Result<EntityIterator, LayerError> {
    if request.latest_only {
        // the layer cannot know whether the table is a change table
        return Err(LayerError::NotSupported(
            "latest only operation not supported".to_string(),
        ));
    }

    let source = &definition.source_config;
    let mut current_token = None;
    let mut max_since = String::new();

    if let Some(max_query) = query::max_since_query(&definition) {
        let datatype = source.since_datatype.ok_or_else(|| {
            LayerError::internal(anyhow::anyhow!("since datatype not set in source config"))
        })?;
        let row = sqlx::query(&max_query)
            .fetch_optional(pool)
            .await
            .map_err(LayerError::query)?
            .ok_or_else(|| LayerError::internal(anyhow::anyhow!("failed to get max since")))?;
        max_since = scan_sentinel(&row, datatype)?;
        current_token = Some(token::encode(&max_since));

        // a NULL max means the window is empty; keep the resumable token
        if max_since.is_empty() {
            return Ok(EntityIterator::empty(current_token, cancel));
        }
    }

    let since = match request.since.as_deref() {
        Some(s) if !s.is_empty() => token::decode(s)?,
        _ => String::new(),
    };

    let sql = query::build_query(&definition, &since, &max_since, request.limit)?;
    debug!(dataset = %definition.name, query = %sql, "changes query");

    let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
    let child = cancel.child_token();
    let producer_cancel = child.clone();
    let pool = pool.clone();
    tokio::spawn(async move {
        let mapper = Mapper::new(&definition);
        let entity_column = definition.source_config.entity_column.to_lowercase();
        let mut rows = sqlx::query(&sql).fetch(&pool);
        let mut plan: Option<Vec<PlannedColumn>> = None;

        loop {
            let fetched = tokio::select! {
                _ = producer_cancel.cancelled() => break,
                fetched = rows.try_next() => fetched,
            };
            let row = match fetched {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read rows");
                    let _ = tx.send(Err(LayerError::query(e))).await;
                    break;
                }
            };

            // the column plan is resolved once, from the first row
            let plan = plan.get_or_insert_with(|| plan_columns(&row));
            let produced = if entity_column.is_empty() {
                decode_row(&row, plan).map(|item| mapper.row_to_entity(&item))
            } else {
                parse_entity_column(&row, plan, &entity_column).map(Some)
            };
            match produced {
                Ok(Some(entity)) => {
                    if tx.send(Ok(entity)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    Ok(EntityIterator {
        rx,
        token: current_token,
        cancel: child,
        closed: false,
    })
}

/// Lazy entity stream for one read. `next` yields one entity at a time
/// until the result set is exhausted or an error surfaces.
pub struct EntityIterator {
    rx: mpsc::Receiver<Result<Entity, LayerError>>,
    token: Option<String>,
    cancel: CancellationToken,
    closed: bool,
}

impl EntityIterator {
    fn empty(token: Option<String>, cancel: CancellationToken) -> Self {
        let (_, rx) = mpsc::channel(1);
        EntityIterator {
            rx,
            token,
            cancel: cancel.child_token(),
            closed: false,
        }
    }

    /// Next entity, or `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<Entity>, LayerError> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(entity)) => Ok(Some(entity)),
            Some(Err(e)) => {
                self.close();
                Err(e)
            }
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    /// Continuation token computed at open, if the dataset has a cursor.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Releases the cursor. Double-close is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.cancel.cancel();
            self.rx.close();
            self.closed = true;
        }
    }
}

impl Drop for EntityIterator {
    fn drop(&mut self) {
        self.close();
    }
}

/// How one projected column decodes into a mapper value.
#[derive(Debug, Clone)]
struct PlannedColumn {
    name: String,
    kind: ColumnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Uuid,
    Other,
}

impl ColumnKind {
    fn from_type_name(name: &str) -> ColumnKind {
        match name {
            "BOOL" => ColumnKind::Bool,
            "INT2" | "SMALLINT" | "SMALLSERIAL" => ColumnKind::Int2,
            "INT4" | "INT" | "SERIAL" => ColumnKind::Int4,
            "INT8" | "BIGINT" | "BIGSERIAL" => ColumnKind::Int8,
            "FLOAT4" | "REAL" => ColumnKind::Float4,
            "FLOAT8" | "DOUBLE PRECISION" => ColumnKind::Float8,
            "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" => ColumnKind::Text,
            "TIMESTAMP" => ColumnKind::Timestamp,
            "TIMESTAMPTZ" => ColumnKind::TimestampTz,
            "DATE" => ColumnKind::Date,
            "JSON" | "JSONB" => ColumnKind::Json,
            "UUID" => ColumnKind::Uuid,
            _ => ColumnKind::Other,
        }
    }
}

fn plan_columns(row: &PgRow) -> Vec<PlannedColumn> {
    row.columns()
        .iter()
        .map(|c| PlannedColumn {
            name: c.name().to_lowercase(),
            kind: ColumnKind::from_type_name(c.type_info().name()),
        })
        .collect()
}

fn decode_row(row: &PgRow, plan: &[PlannedColumn]) -> Result<RowItem, LayerError> {
    let mut item = RowItem::new();
    for (i, column) in plan.iter().enumerate() {
        let value = decode_cell(row, i, column.kind)
            .map_err(|e| LayerError::internal(anyhow::anyhow!("failed to scan row: {e}")))?;
        item.set(&column.name, value);
    }
    Ok(item)
}

fn decode_cell(row: &PgRow, index: usize, kind: ColumnKind) -> Result<Value, sqlx::Error> {
    let value = match kind {
        ColumnKind::Bool => row
            .try_get::<Option<bool>, _>(index)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        ColumnKind::Int2 => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        ColumnKind::Int4 => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        ColumnKind::Int8 => row
            .try_get::<Option<i64>, _>(index)?
            .map(Value::Int)
            .unwrap_or(Value::Null),
        ColumnKind::Float4 => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| float_value(v as f64))
            .unwrap_or(Value::Null),
        ColumnKind::Float8 => row
            .try_get::<Option<f64>, _>(index)?
            .map(float_value)
            .unwrap_or(Value::Null),
        ColumnKind::Text => row
            .try_get::<Option<String>, _>(index)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnKind::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(Value::Time)
            .unwrap_or(Value::Null),
        ColumnKind::TimestampTz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(|v| Value::Time(v.naive_utc()))
            .unwrap_or(Value::Null),
        ColumnKind::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)?
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        ColumnKind::Json => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(Value::Json)
            .unwrap_or(Value::Null),
        ColumnKind::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        // unknown scan types fall back to their textual form
        ColumnKind::Other => row
            .try_get_unchecked::<Option<String>, _>(index)?
            .map(Value::String)
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

/// Integral floats flatten to ints, matching the cell coercion rules.
fn float_value(f: f64) -> Value {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Value::Int(f as i64)
    } else {
        Value::Float(f)
    }
}

/// Scans the max-sentinel row into its canonical textual form; a NULL max
/// yields the empty string.
fn scan_sentinel(row: &PgRow, datatype: SinceDatatype) -> Result<String, LayerError> {
    let kind = ColumnKind::from_type_name(row.columns()[0].type_info().name());
    let value = decode_cell(row, 0, kind)
        .map_err(|e| LayerError::internal(anyhow::anyhow!("failed to get max since: {e}")))?;
    Ok(sentinel_text(&value, datatype))
}

fn sentinel_text(value: &Value, datatype: SinceDatatype) -> String {
    match (value, datatype) {
        (Value::Null, _) => String::new(),
        (Value::Time(t), _) => token::format_time(*t),
        (v, _) => v.to_text(),
    }
}

/// A row of an entity-column dataset: the JSON cell is the entity,
/// verbatim, under an empty namespace context.
fn parse_entity_column(
    row: &PgRow,
    plan: &[PlannedColumn],
    entity_column: &str,
) -> Result<Entity, LayerError> {
    let index = plan
        .iter()
        .position(|c| c.name == entity_column)
        .ok_or_else(|| {
            LayerError::internal(anyhow::anyhow!("entity column {entity_column} not in result"))
        })?;
    let cell = decode_cell(row, index, plan[index].kind)
        .map_err(|e| LayerError::internal(anyhow::anyhow!("failed to scan entity column: {e}")))?;
    entity_from_cell(cell)
}

fn entity_from_cell(cell: Value) -> Result<Entity, LayerError> {
    let parsed = match cell {
        Value::Json(v) => serde_json::from_value::<Entity>(v)
            .map_err(|e| LayerError::internal(anyhow::anyhow!("failed to parse entity: {e}")))?,
        Value::String(s) => serde_json::from_str::<Entity>(&s)
            .map_err(|e| LayerError::internal(anyhow::anyhow!("failed to parse entity: {e}")))?,
        _ => {
            return Err(LayerError::internal(anyhow::anyhow!("no entity")));
        }
    };
    if parsed.id.is_empty() {
        return Err(LayerError::internal(anyhow::anyhow!("no entity")));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_kinds_resolve_from_type_names() {
        assert_eq!(ColumnKind::from_type_name("INT4"), ColumnKind::Int4);
        assert_eq!(ColumnKind::from_type_name("JSONB"), ColumnKind::Json);
        assert_eq!(ColumnKind::from_type_name("TIMESTAMPTZ"), ColumnKind::TimestampTz);
        assert_eq!(ColumnKind::from_type_name("VARCHAR"), ColumnKind::Text);
        // unknown types scan as nullable text
        assert_eq!(ColumnKind::from_type_name("NUMERIC"), ColumnKind::Other);
    }

    #[test]
    fn integral_floats_flatten() {
        assert_eq!(float_value(3.0), Value::Int(3));
        assert_eq!(float_value(3.5), Value::Float(3.5));
    }

    #[test]
    fn sentinel_text_forms() {
        assert_eq!(sentinel_text(&Value::Null, SinceDatatype::Int), "");
        assert_eq!(sentinel_text(&Value::Int(3), SinceDatatype::Int), "3");
        let t = chrono::NaiveDateTime::parse_from_str("2024-03-05 07:08:09", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(
            sentinel_text(&Value::Time(t), SinceDatatype::Time),
            "2024-03-05 07:08:09.000000"
        );
    }

    #[test]
    fn entity_cells_parse_verbatim() {
        let cell = Value::Json(serde_json::json!({
            "id": "http://data.example.io/customers/1",
            "props": {"ns0:name": "Jo"}
        }));
        let entity = entity_from_cell(cell).unwrap();
        assert_eq!(entity.id, "http://data.example.io/customers/1");

        let missing_id = Value::Json(serde_json::json!({"props": {}}));
        assert!(entity_from_cell(missing_id).is_err());
        assert!(entity_from_cell(Value::Null).is_err());
    }

    #[tokio::test]
    async fn closed_iterator_yields_end_of_stream() {
        let cancel = CancellationToken::new();
        let mut iter = EntityIterator::empty(Some(token::encode("")), cancel);
        iter.close();
        iter.close(); // double-close is a no-op
        assert!(iter.next().await.unwrap().is_none());
        assert_eq!(iter.token(), Some(token::encode("").as_str()));
    }

    #[tokio::test]
    async fn empty_iterator_carries_the_token() {
        let cancel = CancellationToken::new();
        let mut iter = EntityIterator::empty(Some("MA==".to_string()), cancel);
        assert!(iter.next().await.unwrap().is_none());
        assert_eq!(iter.token(), Some("MA=="));
    }
}

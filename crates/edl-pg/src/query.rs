//! SELECT composition for dataset reads.
//!
//! The builder produces the data query for a dataset plus an optional since
//! window, and the single-row max-sentinel query the change-cursor protocol
//! runs first. Decoded tokens are the only client-originated text that can
//! reach a query; they pass through the datatype-aware quoting in
//! `edl_core::token` before interpolation.

use edl_core::config::DatasetDefinition;
use edl_core::error::LayerError;
use edl_core::token::{self, SinceDatatype};

/// Alias used for the max-sentinel projection.
pub const MAX_SINCE_ALIAS: &str = "_MAX_SINCE";

/// The one-round-trip query computing the upper sentinel bound, or `None`
/// when the dataset has no since column.
pub fn max_since_query(definition: &DatasetDefinition) -> Option<String> {
    let since_column = &definition.source_config.since_column;
    if since_column.is_empty() {
        return None;
    }
    Some(format!(
        "SELECT MAX({since_column}) AS \"{MAX_SINCE_ALIAS}\" FROM {table}",
        table = definition.since_table()
    ))
}

/// Builds the data query for one read.
///
/// `since` and `max_since` are the decoded textual sentinel forms; either
/// may be empty. A configured `data_query` is used verbatim: its optional
/// `%s` placeholder receives the LIMIT clause, and window predicates are
/// appended with `AND` when the query already has a `WHERE`.
pub fn build_query(
    definition: &DatasetDefinition,
    since: &str,
    max_since: &str,
    limit: i64,
) -> Result<String, LayerError> {
    let source = &definition.source_config;
    let limit_clause = if limit > 0 {
        format!(" LIMIT {limit}")
    } else {
        String::new()
    };

    let mut q;
    let mut limit_placed = false;
    if !source.data_query.is_empty() {
        q = source.data_query.clone();
        if q.contains("%s") {
            q = q.replacen("%s", &limit_clause, 1);
            limit_placed = true;
        }
    } else {
        q = format!(
            "SELECT {cols} FROM {table}",
            cols = column_list(definition)?,
            table = source.table_name
        );
    }

    if !max_since.is_empty() && !source.since_column.is_empty() {
        let datatype = source.since_datatype.ok_or_else(|| {
            LayerError::internal(anyhow::anyhow!("since datatype not set in source config"))
        })?;
        q.push_str(connect_term(&q));
        q.push_str(&window_predicate(
            definition.since_table(),
            &source.since_column,
            since,
            max_since,
            datatype,
        )?);
    }

    if !limit_placed && !limit_clause.is_empty() {
        q.push_str(&limit_clause);
    }
    Ok(q)
}

fn connect_term(q: &str) -> &'static str {
    if q.to_uppercase().contains("WHERE") {
        " AND "
    } else {
        " WHERE "
    }
}

fn window_predicate(
    table: &str,
    column: &str,
    since: &str,
    max_since: &str,
    datatype: SinceDatatype,
) -> Result<String, LayerError> {
    let upper = token::quote(max_since, datatype)?;
    if since.is_empty() {
        Ok(format!("{table}.{column} <= {upper}"))
    } else {
        let lower = token::quote(since, datatype)?;
        Ok(format!(
            "{table}.{column} > {lower} AND {table}.{column} <= {upper}"
        ))
    }
}

/// Projected column list: `*` under mapAll or an entity column, otherwise
/// the mapped properties in order.
fn column_list(definition: &DatasetDefinition) -> Result<String, LayerError> {
    match &definition.outgoing {
        None => {
            if definition.source_config.entity_column.is_empty() {
                Err(LayerError::internal(anyhow::anyhow!(
                    "outgoing mapping config is missing"
                )))
            } else {
                Ok("*".to_string())
            }
        }
        Some(outgoing) => {
            if outgoing.map_all {
                Ok("*".to_string())
            } else {
                Ok(outgoing
                    .mappings
                    .iter()
                    .map(|m| m.property.as_str())
                    .collect::<Vec<_>>()
                    .join(", "))
            }
        }
    }
}

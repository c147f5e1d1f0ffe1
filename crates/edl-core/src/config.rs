//! Dataset configuration model.
//!
//! The layer is driven by a JSON configuration document: a system block with
//! connection defaults and a list of dataset definitions, each mapping one
//! table (or custom query) to an entity stream. Property names are matched
//! case-insensitively, so every column reference is lowered once at parse
//! time.

use serde::{Deserialize, Serialize};

use crate::error::LayerError;
use crate::token::SinceDatatype;

/// Default number of entities accumulated before a write-pipeline flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Full configuration document for the layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Connection URL scheme; defaults to `postgresql`.
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub base_name_space: String,
    #[serde(default)]
    pub datasets: Vec<DatasetDefinition>,
}

impl LayerConfig {
    /// Parses and normalizes a configuration document.
    pub fn parse(bytes: &[u8]) -> Result<LayerConfig, LayerError> {
        let mut config: LayerConfig = serde_json::from_slice(bytes)
            .map_err(|e| LayerError::BadParameter(format!("could not parse configuration: {e}")))?;
        config.normalize();
        Ok(config)
    }

    /// Lowers every column reference and fills namespace defaults.
    pub fn normalize(&mut self) {
        for ds in &mut self.datasets {
            if ds.namespace.is_empty() {
                ds.namespace = ds.source_config.table_name.clone();
            }
            if let Some(outgoing) = &mut ds.outgoing {
                lower_mappings(&mut outgoing.mappings);
            }
            lower_mappings(&mut ds.incoming);
        }
    }
}

fn lower_mappings(mappings: &mut [PropertyMapping]) {
    for m in mappings {
        m.property = m.property.to_lowercase();
        lower_mappings(&mut m.mappings);
    }
}

/// One dataset: a named table or query exposed as an entity stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDefinition {
    pub name: String,
    #[serde(default)]
    pub source_config: SourceConfig,
    #[serde(default)]
    pub outgoing: Option<OutgoingMapping>,
    #[serde(default)]
    pub incoming: Vec<PropertyMapping>,
    /// Namespace segment of the dataset base URI; defaults to the table name.
    #[serde(default)]
    pub namespace: String,
    /// Per-dataset connection overrides.
    #[serde(default)]
    pub connection: Option<ConnectionOverride>,
}

impl DatasetDefinition {
    /// The column receiving entity identities on the write path. Exactly one
    /// incoming mapping should set `isIdentity`; absent that, `id`.
    pub fn identity_column(&self) -> &str {
        self.incoming
            .iter()
            .find(|m| m.is_identity)
            .map(|m| m.property.as_str())
            .unwrap_or("id")
    }

    /// Base URI for the dataset's `ns0` namespace.
    pub fn base_uri(&self, base_name_space: &str) -> String {
        format!("{}{}/", base_name_space, self.namespace)
    }

    /// Table the since window is evaluated against.
    pub fn since_table(&self) -> &str {
        if self.source_config.since_table.is_empty() {
            &self.source_config.table_name
        } else {
            &self.source_config.since_table
        }
    }
}

/// Recognized source options for a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub table_name: String,
    /// Custom SQL with one `%s` placeholder receiving the LIMIT clause.
    #[serde(default)]
    pub data_query: String,
    #[serde(default)]
    pub since_column: String,
    #[serde(default)]
    pub since_table: String,
    #[serde(default)]
    pub since_datatype: Option<SinceDatatype>,
    /// JSON column whose cell value is the entity, verbatim.
    #[serde(default)]
    pub entity_column: String,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default)]
    pub append_mode: bool,
    /// Type IRIs attached to every outgoing entity as `rdf:type`.
    #[serde(default)]
    pub types: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            table_name: String::new(),
            data_query: String::new(),
            since_column: String::new(),
            since_table: String::new(),
            since_datatype: None,
            entity_column: String::new(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            append_mode: false,
            types: Vec::new(),
        }
    }
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

/// Outgoing side of a dataset mapping: map every column, or a mapping list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMapping {
    #[serde(default)]
    pub map_all: bool,
    #[serde(default)]
    pub mappings: Vec<PropertyMapping>,
}

/// One column-to-property mapping, used in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMapping {
    /// Column name, matched case-insensitively.
    pub property: String,
    /// Output property IRI; defaults to `ns0:<column>`.
    #[serde(default)]
    pub property_name: String,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default)]
    pub is_reference: bool,
    /// Format string with one placeholder for the reference IRI.
    #[serde(default)]
    pub reference_template: String,
    /// Format string with one placeholder for the entity id.
    #[serde(default)]
    pub id_template: String,
    #[serde(default)]
    pub ignore: bool,
    /// Cell holds a nested object or list mapped through `mappings`.
    #[serde(default)]
    pub is_entity: bool,
    #[serde(default)]
    pub mappings: Vec<PropertyMapping>,
}

/// Per-dataset connection overrides; credentials resolve directly or from
/// the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOverride {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub user: Option<VariableRef>,
    #[serde(default)]
    pub password: Option<VariableRef>,
}

/// A value given directly or named in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableRef {
    #[serde(rename = "type", default)]
    pub source: String,
    pub key: String,
}

impl VariableRef {
    pub fn resolve(&self) -> String {
        match self.source.as_str() {
            "direct" => self.key.clone(),
            _ => std::env::var(&self.key).unwrap_or_default(),
        }
    }
}

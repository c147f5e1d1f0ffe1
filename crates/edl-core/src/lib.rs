//! # EDL Core - Entity Data Layer Core Library
//!
//! Foundational types for the entity data layer: the entity model and its
//! JSON wire form, dataset definitions and property mappings, the mapping
//! registry with digest-gated snapshot replacement, the bidirectional
//! row ↔ entity mapper, and continuation-token encoding for change cursors.
//!
//! ## Key Components
//!
//! - **Entity Model**: entities with properties, references and a tagged
//!   value variant covering every cell type the layer can produce
//! - **Dataset Definitions**: declarative column-to-property mappings loaded
//!   from JSON configuration
//! - **Mapping Registry**: read-mostly snapshot of dataset definitions,
//!   replaced wholesale when the configuration digest changes
//! - **Continuation Tokens**: base64-URL encoded sentinel bounds for the
//!   polling change feed

pub mod config;
pub mod entity;
pub mod error;
pub mod mapper;
pub mod registry;
pub mod token;

pub use config::{DatasetDefinition, LayerConfig, OutgoingMapping, PropertyMapping, SourceConfig};
pub use entity::{Continuation, Entity, NamespaceContext, Value};
pub use error::{LayerError, LayerResult};
pub use mapper::{Mapper, RowItem};
pub use registry::{Registry, Snapshot};
pub use token::SinceDatatype;

//! Bidirectional row ↔ entity mapping.
//!
//! The outgoing direction turns a typed row into an entity by applying
//! property mappings in order: identity, reference, nested entity, plain
//! property. The incoming direction builds a row item from an entity in
//! property-mapping order, with the identity column receiving the id suffix.

use crate::config::{DatasetDefinition, OutgoingMapping, PropertyMapping};
use crate::entity::{Entity, Value};
use crate::error::LayerError;

/// One row on its way into or out of the database.
///
/// Columns and values are kept in mapping order so the write pipeline can
/// emit stable INSERT column lists.
#[derive(Debug, Clone, Default)]
pub struct RowItem {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    pub deleted: bool,
}

impl RowItem {
    pub fn new() -> Self {
        RowItem::default()
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.columns.push(column.to_string());
        self.values.push(value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }
}

/// Maps rows to entities and entities to rows for one dataset.
#[derive(Debug, Clone)]
pub struct Mapper {
    outgoing: Option<OutgoingMapping>,
    incoming: Vec<PropertyMapping>,
    types: Vec<String>,
}

impl Mapper {
    pub fn new(definition: &DatasetDefinition) -> Self {
        Mapper {
            outgoing: definition.outgoing.clone(),
            incoming: definition.incoming.clone(),
            types: definition.source_config.types.clone(),
        }
    }

    /// Maps a row into an entity, or `None` when the row yields no valid
    /// entity (empty id).
    pub fn row_to_entity(&self, row: &RowItem) -> Option<Entity> {
        let mappings = self
            .outgoing
            .as_ref()
            .map(|o| o.mappings.as_slice())
            .unwrap_or(&[]);
        let mut entity = map_columns(&row.columns, &row.values, mappings)?;

        entity.deleted = row.deleted;
        if !self.types.is_empty() {
            let type_ref = if self.types.len() == 1 {
                Value::String(self.types[0].clone())
            } else {
                Value::List(self.types.iter().cloned().map(Value::String).collect())
            };
            entity.references.insert("rdf:type".to_string(), type_ref);
        }
        entity.strip_if_deleted();
        Some(entity)
    }

    /// Builds a row item from an entity, in incoming-mapping order.
    ///
    /// The identity column receives the id with any namespace prefix
    /// stripped to its suffix. An entity without an identity cannot be
    /// written and is rejected here.
    pub fn entity_to_row(&self, entity: &Entity) -> Result<RowItem, LayerError> {
        if entity.id.is_empty() {
            return Err(LayerError::internal(anyhow::anyhow!(
                "entity has no identity"
            )));
        }

        let mut item = RowItem::new();
        item.deleted = entity.deleted;
        // the identity defaults to an `id` column when no mapping claims it
        if !self.incoming.iter().any(|m| m.is_identity) {
            item.set("id", Value::String(strip_prefix(&entity.id).to_string()));
        }
        for m in &self.incoming {
            if m.ignore {
                continue;
            }
            let key = output_key(m);
            let value = if m.is_identity {
                Value::String(strip_prefix(&entity.id).to_string())
            } else if m.is_reference {
                match entity.references.get(&key) {
                    Some(Value::String(iri)) => Value::String(strip_prefix(iri).to_string()),
                    Some(Value::List(iris)) => Value::List(
                        iris.iter()
                            .map(|v| Value::String(strip_prefix(&v.to_text()).to_string()))
                            .collect(),
                    ),
                    _ => Value::Null,
                }
            } else {
                entity.properties.get(&key).cloned().unwrap_or(Value::Null)
            };
            item.set(&m.property, value);
        }
        Ok(item)
    }
}

/// Core of the outgoing direction, shared with nested entity columns.
fn map_columns(columns: &[String], values: &[Value], mappings: &[PropertyMapping]) -> Option<Entity> {
    let mut entity = Entity::new();
    for (column, value) in columns.iter().zip(values) {
        let mapping = mappings.iter().find(|m| &m.property == column);
        let Some(m) = mapping else {
            // unmapped columns land in properties under the default key
            entity
                .properties
                .insert(format!("ns0:{column}"), value.clone());
            continue;
        };
        if m.ignore {
            continue;
        }
        let key = output_key(m);
        let mut matched = false;
        if m.is_identity && !value.is_null() {
            entity.id = apply_template(&m.id_template, value);
            matched = true;
        }
        if m.is_reference && !value.is_null() {
            entity
                .references
                .insert(key.clone(), Value::String(apply_template(&m.reference_template, value)));
            matched = true;
        }
        if m.is_entity {
            entity.properties.insert(key.clone(), map_nested(value, &m.mappings));
            matched = true;
        }
        if !matched {
            entity.properties.insert(key, value.clone());
        }
    }
    if entity.id.is_empty() {
        return None;
    }
    Some(entity)
}

/// A nested cell is an object, a list of objects, or a pass-through scalar.
fn map_nested(value: &Value, mappings: &[PropertyMapping]) -> Value {
    match value {
        Value::Json(serde_json::Value::Object(obj)) => match map_object(obj, mappings) {
            Some(e) => Value::Entity(Box::new(e)),
            None => Value::Null,
        },
        Value::Json(serde_json::Value::Array(items)) => Value::List(
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::Object(obj) => {
                        map_object(obj, mappings).map(|e| Value::Entity(Box::new(e)))
                    }
                    _ => None,
                })
                .collect(),
        ),
        Value::List(items) => Value::List(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Json(serde_json::Value::Object(obj)) => {
                        map_object(obj, mappings).map(|e| Value::Entity(Box::new(e)))
                    }
                    _ => None,
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn map_object(
    obj: &serde_json::Map<String, serde_json::Value>,
    mappings: &[PropertyMapping],
) -> Option<Entity> {
    let mut columns = Vec::with_capacity(obj.len());
    let mut values = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        columns.push(k.to_lowercase());
        values.push(Value::from_json(v.clone()));
    }
    map_columns(&columns, &values, mappings)
}

fn output_key(m: &PropertyMapping) -> String {
    if m.property_name.is_empty() {
        format!("ns0:{}", m.property)
    } else {
        m.property_name.clone()
    }
}

/// Fills the single placeholder of an id or reference template. An empty
/// template yields the bare value.
fn apply_template(template: &str, value: &Value) -> String {
    let text = value.to_text();
    if template.is_empty() {
        return text;
    }
    for placeholder in ["%s", "%v", "%d"] {
        if template.contains(placeholder) {
            return template.replacen(placeholder, &text, 1);
        }
    }
    format!("{template}{text}")
}

/// Strips a namespace prefix (`ns0:` or a URI base) down to the suffix.
fn strip_prefix(id: &str) -> &str {
    if let Some(pos) = id.rfind(':') {
        let suffix = &id[pos + 1..];
        if !suffix.contains('/') {
            return suffix;
        }
    }
    if let Some(pos) = id.rfind('/') {
        return &id[pos + 1..];
    }
    id
}

/// Convenience for building mapper inputs in tests and the read path.
pub fn row_from_pairs(pairs: Vec<(String, Value)>) -> RowItem {
    let mut item = RowItem::new();
    for (column, value) in pairs {
        item.set(&column, value);
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn mapping(property: &str) -> PropertyMapping {
        PropertyMapping {
            property: property.to_string(),
            ..Default::default()
        }
    }

    fn definition(outgoing: Vec<PropertyMapping>, incoming: Vec<PropertyMapping>) -> DatasetDefinition {
        DatasetDefinition {
            name: "products".to_string(),
            outgoing: Some(OutgoingMapping {
                map_all: false,
                mappings: outgoing,
            }),
            incoming,
            ..Default::default()
        }
    }

    fn identity_mapping() -> PropertyMapping {
        PropertyMapping {
            is_identity: true,
            id_template: "ns0:%s".to_string(),
            ..mapping("id")
        }
    }

    #[test]
    fn identity_and_plain_properties() {
        let mapper = Mapper::new(&definition(
            vec![identity_mapping(), mapping("name")],
            vec![],
        ));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(7)),
            ("name".to_string(), Value::String("widget".to_string())),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert_eq!(e.id, "ns0:7");
        assert_eq!(e.properties["ns0:name"], Value::String("widget".to_string()));
        assert!(!e.properties.contains_key("ns0:id"));
    }

    #[test]
    fn empty_id_discards_the_row() {
        let mapper = Mapper::new(&definition(vec![identity_mapping()], vec![]));
        let row = row_from_pairs(vec![("id".to_string(), Value::Null)]);
        assert!(mapper.row_to_entity(&row).is_none());
    }

    #[test]
    fn identity_and_reference_both_apply() {
        let m = PropertyMapping {
            is_reference: true,
            reference_template: "ns0:ref-%s".to_string(),
            ..identity_mapping()
        };
        let mapper = Mapper::new(&definition(vec![m], vec![]));
        let row = row_from_pairs(vec![("id".to_string(), Value::Int(3))]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert_eq!(e.id, "ns0:3");
        assert_eq!(e.references["ns0:id"], Value::String("ns0:ref-3".to_string()));
    }

    #[test]
    fn ignored_columns_are_skipped() {
        let ignored = PropertyMapping {
            ignore: true,
            ..mapping("internal")
        };
        let mapper = Mapper::new(&definition(vec![identity_mapping(), ignored], vec![]));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            ("internal".to_string(), Value::String("x".to_string())),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert!(e.properties.is_empty());
    }

    #[test]
    fn unmapped_columns_land_in_properties() {
        let mapper = Mapper::new(&definition(vec![identity_mapping()], vec![]));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            ("extra".to_string(), Value::Bool(true)),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert_eq!(e.properties["ns0:extra"], Value::Bool(true));
    }

    #[test]
    fn nested_object_maps_recursively() {
        let nested = PropertyMapping {
            is_entity: true,
            mappings: vec![
                PropertyMapping {
                    is_identity: true,
                    id_template: "ns0:addr-%s".to_string(),
                    ..mapping("id")
                },
                mapping("street"),
            ],
            ..mapping("address")
        };
        let mapper = Mapper::new(&definition(vec![identity_mapping(), nested], vec![]));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            (
                "address".to_string(),
                Value::Json(serde_json::json!({"id": 9, "street": "Main"})),
            ),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        match &e.properties["ns0:address"] {
            Value::Entity(addr) => {
                assert_eq!(addr.id, "ns0:addr-9");
                assert_eq!(addr.properties["ns0:street"], Value::String("Main".to_string()));
            }
            other => panic!("expected nested entity, got {other:?}"),
        }
    }

    #[test]
    fn nested_list_filters_invalid_members() {
        let nested = PropertyMapping {
            is_entity: true,
            mappings: vec![PropertyMapping {
                is_identity: true,
                ..mapping("id")
            }],
            ..mapping("tags")
        };
        let mapper = Mapper::new(&definition(vec![identity_mapping(), nested], vec![]));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            (
                "tags".to_string(),
                Value::Json(serde_json::json!([{"id": "a"}, {"street": "no id"}, null])),
            ),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        match &e.properties["ns0:tags"] {
            Value::List(items) => assert_eq!(items.len(), 1),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn nested_scalar_passes_through() {
        let nested = PropertyMapping {
            is_entity: true,
            ..mapping("blob")
        };
        let mapper = Mapper::new(&definition(vec![identity_mapping(), nested], vec![]));
        let row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            ("blob".to_string(), Value::Null),
        ]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert_eq!(e.properties["ns0:blob"], Value::Null);
    }

    #[test]
    fn deleted_rows_emit_stripped_entities() {
        let mapper = Mapper::new(&definition(vec![identity_mapping(), mapping("name")], vec![]));
        let mut row = row_from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            ("name".to_string(), Value::String("gone".to_string())),
        ]);
        row.deleted = true;
        let e = mapper.row_to_entity(&row).unwrap();
        assert!(e.deleted);
        assert!(e.properties.is_empty());
        assert!(e.references.is_empty());
    }

    #[test]
    fn configured_types_become_rdf_type_references() {
        let mut def = definition(vec![identity_mapping()], vec![]);
        def.source_config = SourceConfig {
            types: vec!["http://data.example.io/schema/Product".to_string()],
            ..Default::default()
        };
        let mapper = Mapper::new(&def);
        let row = row_from_pairs(vec![("id".to_string(), Value::Int(1))]);
        let e = mapper.row_to_entity(&row).unwrap();
        assert_eq!(
            e.references["rdf:type"],
            Value::String("http://data.example.io/schema/Product".to_string())
        );
    }

    #[test]
    fn entity_to_row_orders_by_mapping_and_strips_id() {
        let mapper = Mapper::new(&definition(
            vec![],
            vec![
                PropertyMapping {
                    is_identity: true,
                    ..mapping("id")
                },
                mapping("name"),
                mapping("price"),
            ],
        ));
        let mut e = Entity::new();
        e.id = "http://data.example.io/products/15".to_string();
        e.properties
            .insert("ns0:name".to_string(), Value::String("widget".to_string()));
        e.properties.insert("ns0:price".to_string(), Value::Int(10));

        let row = mapper.entity_to_row(&e).unwrap();
        assert_eq!(row.columns, vec!["id", "name", "price"]);
        assert_eq!(row.values[0], Value::String("15".to_string()));
        assert_eq!(row.values[2], Value::Int(10));
        assert!(!row.deleted);
    }

    #[test]
    fn identity_defaults_to_an_id_column_without_a_mapping() {
        let mapper = Mapper::new(&definition(vec![], vec![mapping("name")]));
        let mut e = Entity::new();
        e.id = "ns0:7".to_string();
        e.properties
            .insert("ns0:name".to_string(), Value::String("widget".to_string()));

        let row = mapper.entity_to_row(&e).unwrap();
        assert_eq!(row.columns, vec!["id", "name"]);
        assert_eq!(row.get("id"), Some(&Value::String("7".to_string())));
        assert_eq!(row.get("name"), Some(&Value::String("widget".to_string())));
    }

    #[test]
    fn entity_to_row_strips_curie_ids() {
        let mapper = Mapper::new(&definition(
            vec![],
            vec![PropertyMapping {
                is_identity: true,
                ..mapping("id")
            }],
        ));
        let mut e = Entity::new();
        e.id = "ns0:42".to_string();
        let row = mapper.entity_to_row(&e).unwrap();
        assert_eq!(row.values[0], Value::String("42".to_string()));
    }

    #[test]
    fn entity_without_identity_is_rejected() {
        let mapper = Mapper::new(&definition(vec![], vec![]));
        let e = Entity::new();
        assert!(matches!(
            mapper.entity_to_row(&e),
            Err(LayerError::Internal(_))
        ));
    }

    #[test]
    fn incoming_references_strip_to_column_values() {
        let reference = PropertyMapping {
            is_reference: true,
            ..mapping("vendor")
        };
        let mapper = Mapper::new(&definition(
            vec![],
            vec![
                PropertyMapping {
                    is_identity: true,
                    ..mapping("id")
                },
                reference,
            ],
        ));
        let mut e = Entity::new();
        e.id = "ns0:1".to_string();
        e.references.insert(
            "ns0:vendor".to_string(),
            Value::String("ns0:acme".to_string()),
        );
        let row = mapper.entity_to_row(&e).unwrap();
        assert_eq!(row.get("vendor"), Some(&Value::String("acme".to_string())));
    }

    #[test]
    fn round_trips_on_the_projected_property_set() {
        let mappings = vec![
            PropertyMapping {
                is_identity: true,
                id_template: "ns0:%s".to_string(),
                ..mapping("id")
            },
            mapping("name"),
            mapping("price"),
        ];
        let def = definition(mappings.clone(), mappings);
        let mapper = Mapper::new(&def);

        let mut original = Entity::new();
        original.id = "ns0:5".to_string();
        original
            .properties
            .insert("ns0:name".to_string(), Value::String("widget".to_string()));
        original.properties.insert("ns0:price".to_string(), Value::Int(99));

        let row = mapper.entity_to_row(&original).unwrap();
        let restored = mapper.row_to_entity(&row).unwrap();
        assert_eq!(restored, original);
    }
}

//! Compact id tables for component and event types.
//!
//! The server numbers every known type and every field within it when it starts
//! and ships the numbering to clients in the server info. A client applies the
//! server's numbering on top of its own schemas, so both ends agree on ids even
//! when the client knows more or fewer types than the server.

use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field ids are a single byte on the wire.
pub const MAX_FIELDS_PER_TYPE: usize = 255;

/// Which direction a field flows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldReplication {
    ServerToAll,
    ServerToOwner,
    OwnerToServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub replication: FieldReplication,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, replication: FieldReplication) -> Self {
        Self {
            name: name.into(),
            replication,
        }
    }
}

/// Local knowledge of one component or event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    /// Components with this unset are never sent over the network.
    pub replicated: bool,
    pub fields: Vec<FieldSchema>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            replicated: true,
            fields,
        }
    }

    pub fn local_only(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            replicated: false,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The wire description of one type's numbering, as carried in server info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializationInfo {
    pub id: u16,
    pub name: String,
    pub field_names: Vec<String>,
    pub field_ids: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TableEntry {
    pub id: u16,
    pub schema: TypeSchema,
    field_ids: Vec<(String, u8)>,
}

impl TableEntry {
    pub fn field_id(&self, name: &str) -> Option<u8> {
        self.field_ids
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, id)| *id)
    }

    pub fn field_name(&self, id: u8) -> Option<&str> {
        self.field_ids
            .iter()
            .find(|(_, field_id)| *field_id == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn replication(&self, field: &str) -> Option<FieldReplication> {
        self.schema.field(field).map(|f| f.replication)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerializationTable {
    entries: Vec<TableEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
}

impl SerializationTable {
    /// Numbers `schemas` in the given order. Fields past the one-byte limit
    /// are left without an id and are never replicated.
    pub fn generate(schemas: &[TypeSchema]) -> Self {
        let mut table = Self::default();

        for (index, schema) in schemas.iter().enumerate() {
            if schema.fields.len() > MAX_FIELDS_PER_TYPE {
                error!(
                    "Type '{}' has {} fields, only the first {} will be replicated",
                    schema.name,
                    schema.fields.len(),
                    MAX_FIELDS_PER_TYPE
                );
            }

            let field_ids = schema
                .fields
                .iter()
                .take(MAX_FIELDS_PER_TYPE)
                .enumerate()
                .map(|(field_index, field)| (field.name.clone(), field_index as u8))
                .collect();

            table.insert(TableEntry {
                id: index as u16,
                schema: schema.clone(),
                field_ids,
            });
        }

        table
    }

    /// Builds a table that uses the server's numbering for the types this side
    /// knows about. Unknown types and fields are logged and left out.
    pub fn apply(infos: &[SerializationInfo], schemas: &[TypeSchema]) -> Self {
        let mut table = Self::default();

        for info in infos {
            let Some(schema) = schemas.iter().find(|s| s.name == info.name) else {
                error!("Unable to resolve type '{}' from server", info.name);
                continue;
            };

            let mut field_ids = Vec::with_capacity(info.field_ids.len());
            for (name, id) in info.field_names.iter().zip(info.field_ids.iter()) {
                if schema.field(name).is_some() {
                    field_ids.push((name.clone(), *id));
                } else {
                    error!("Server has unknown field '{}' on '{}'", name, info.name);
                }
            }

            table.insert(TableEntry {
                id: info.id,
                schema: schema.clone(),
                field_ids,
            });
        }

        table
    }

    fn insert(&mut self, entry: TableEntry) {
        if self.by_id.contains_key(&entry.id) || self.by_name.contains_key(&entry.schema.name) {
            warn!("Duplicate serialization entry for '{}'", entry.schema.name);
            return;
        }
        let index = self.entries.len();
        self.by_name.insert(entry.schema.name.clone(), index);
        self.by_id.insert(entry.id, index);
        self.entries.push(entry);
    }

    pub fn by_name(&self, name: &str) -> Option<&TableEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn by_id(&self, id: u16) -> Option<&TableEntry> {
        self.by_id.get(&id).map(|&i| &self.entries[i])
    }

    pub fn is_replicated(&self, name: &str) -> bool {
        self.by_name(name).map(|e| e.schema.replicated).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_info(&self) -> Vec<SerializationInfo> {
        self.entries
            .iter()
            .map(|entry| SerializationInfo {
                id: entry.id,
                name: entry.schema.name.clone(),
                field_names: entry.field_ids.iter().map(|(n, _)| n.clone()).collect(),
                field_ids: entry.field_ids.iter().map(|(_, id)| *id).collect(),
            })
            .collect()
    }
}

/// The pair of tables a connected peer needs.
#[derive(Debug, Clone, Default)]
pub struct SerializationTables {
    pub components: SerializationTable,
    pub events: SerializationTable,
}

impl SerializationTables {
    pub fn generate(components: &[TypeSchema], events: &[TypeSchema]) -> Self {
        Self {
            components: SerializationTable::generate(components),
            events: SerializationTable::generate(events),
        }
    }

    pub fn apply(
        component_info: &[SerializationInfo],
        event_info: &[SerializationInfo],
        components: &[TypeSchema],
        events: &[TypeSchema],
    ) -> Self {
        Self {
            components: SerializationTable::apply(component_info, components),
            events: SerializationTable::apply(event_info, events),
        }
    }
}

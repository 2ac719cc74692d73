//! Entity and event packing.
//!
//! Components travel as `(type id, [(field id, bytes)])` lists. Field values
//! are already opaque byte strings when they reach this module; the entity
//! store owns their encoding.

use crate::error::SerializationError;
use crate::serialization::{FieldReplication, SerializationTable, SerializationTables};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Network id of a replicated entity. Zero is never assigned.
pub type NetworkEntityId = u32;

pub const NULL_NET_ID: NetworkEntityId = 0;

/// Which clients may see an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicateMode {
    Always,
    Owner,
}

/// One component's current field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentData {
    pub type_name: String,
    pub fields: Vec<(String, Vec<u8>)>,
}

impl ComponentData {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Overwrites the fields present in `update`, keeping the rest.
    pub fn merge(&mut self, update: &ComponentData) {
        for (name, value) in &update.fields {
            match self.fields.iter_mut().find(|(field, _)| field == name) {
                Some((_, existing)) => existing.clone_from(value),
                None => self.fields.push((name.clone(), value.clone())),
            }
        }
    }
}

/// An unpacked entity message: new component state plus removals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityUpdate {
    pub components: Vec<ComponentData>,
    pub removed: Vec<String>,
}

impl EntityUpdate {
    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedField {
    pub id: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedComponent {
    pub type_id: u16,
    pub fields: Vec<PackedField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEntity {
    pub components: Vec<PackedComponent>,
    pub removed_components: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEvent {
    pub type_id: u16,
    pub fields: Vec<PackedField>,
}

/// An event payload by type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub type_name: String,
    pub fields: Vec<(String, Vec<u8>)>,
}

impl EventData {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Decides which fields cross the wire for a given receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCheck {
    /// Server to client. Owner-to-server fields are only included in the
    /// initial snapshot an owner receives.
    ServerToClient { is_owner: bool, initial: bool },
    /// Client to server: only owner-authoritative fields.
    ClientToServer,
    /// No filtering; used when applying server state on the client.
    All,
}

impl FieldCheck {
    pub fn should_replicate(&self, replication: FieldReplication) -> bool {
        match self {
            FieldCheck::ServerToClient { is_owner, initial } => match replication {
                FieldReplication::ServerToAll => true,
                FieldReplication::ServerToOwner => *is_owner,
                FieldReplication::OwnerToServer => *is_owner && *initial,
            },
            FieldCheck::ClientToServer => replication == FieldReplication::OwnerToServer,
            FieldCheck::All => true,
        }
    }
}

pub struct EntitySerializer<'a> {
    tables: &'a SerializationTables,
}

impl<'a> EntitySerializer<'a> {
    pub fn new(tables: &'a SerializationTables) -> Self {
        Self { tables }
    }

    fn pack_component(
        table: &SerializationTable,
        component: &ComponentData,
        check: FieldCheck,
    ) -> Result<Option<PackedComponent>, SerializationError> {
        let entry = table
            .by_name(&component.type_name)
            .ok_or_else(|| SerializationError::UnknownType(component.type_name.clone()))?;
        if !entry.schema.replicated {
            return Ok(None);
        }

        let fields = component
            .fields
            .iter()
            .filter(|(name, _)| {
                entry
                    .replication(name)
                    .map(|r| check.should_replicate(r))
                    .unwrap_or(false)
            })
            .filter_map(|(name, value)| {
                entry.field_id(name).map(|id| PackedField {
                    id,
                    value: value.clone(),
                })
            })
            .collect();

        Ok(Some(PackedComponent {
            type_id: entry.id,
            fields,
        }))
    }

    /// Packs every replicated component of an entity.
    pub fn serialize(
        &self,
        components: &[ComponentData],
        check: FieldCheck,
    ) -> Result<PackedEntity, SerializationError> {
        let mut packed = PackedEntity::default();
        for component in components {
            if let Some(component) = Self::pack_component(&self.tables.components, component, check)? {
                packed.components.push(component);
            }
        }
        Ok(packed)
    }

    /// Packs only what changed. Returns `None` when nothing would be sent.
    pub fn serialize_delta(
        &self,
        components: &[ComponentData],
        added: &BTreeSet<String>,
        changed: &BTreeSet<String>,
        removed: &BTreeSet<String>,
        check: FieldCheck,
    ) -> Result<Option<PackedEntity>, SerializationError> {
        let table = &self.tables.components;
        let mut packed = PackedEntity::default();

        for component in components {
            let is_added = added.contains(&component.type_name);
            if !is_added && !changed.contains(&component.type_name) {
                continue;
            }
            if let Some(component) = Self::pack_component(table, component, check)? {
                // A change with no visible fields carries nothing for this receiver.
                if is_added || !component.fields.is_empty() {
                    packed.components.push(component);
                }
            }
        }

        for type_name in removed {
            if let Some(entry) = table.by_name(type_name) {
                if entry.schema.replicated {
                    packed.removed_components.push(entry.id);
                }
            }
        }

        if packed.components.is_empty() && packed.removed_components.is_empty() {
            Ok(None)
        } else {
            Ok(Some(packed))
        }
    }

    /// Unpacks an entity message, dropping fields `check` does not accept.
    pub fn deserialize(
        &self,
        packed: &PackedEntity,
        check: FieldCheck,
    ) -> Result<EntityUpdate, SerializationError> {
        let table = &self.tables.components;
        let mut update = EntityUpdate::default();

        for component in &packed.components {
            let entry = table
                .by_id(component.type_id)
                .ok_or(SerializationError::UnknownTypeId(component.type_id))?;

            let mut data = ComponentData::new(entry.schema.name.clone());
            for field in &component.fields {
                let Some(name) = entry.field_name(field.id) else {
                    warn!("Skipping unknown field {} on '{}'", field.id, entry.schema.name);
                    continue;
                };
                let accepted = entry
                    .replication(name)
                    .map(|r| check.should_replicate(r))
                    .unwrap_or(false);
                if accepted {
                    data.fields.push((name.to_string(), field.value.clone()));
                }
            }
            update.components.push(data);
        }

        for type_id in &packed.removed_components {
            let entry = table
                .by_id(*type_id)
                .ok_or(SerializationError::UnknownTypeId(*type_id))?;
            update.removed.push(entry.schema.name.clone());
        }

        Ok(update)
    }

    pub fn serialize_event(&self, event: &EventData) -> Result<PackedEvent, SerializationError> {
        let entry = self
            .tables
            .events
            .by_name(&event.type_name)
            .ok_or_else(|| SerializationError::UnknownType(event.type_name.clone()))?;

        let fields = event
            .fields
            .iter()
            .filter_map(|(name, value)| {
                entry.field_id(name).map(|id| PackedField {
                    id,
                    value: value.clone(),
                })
            })
            .collect();

        Ok(PackedEvent {
            type_id: entry.id,
            fields,
        })
    }

    pub fn deserialize_event(&self, packed: &PackedEvent) -> Result<EventData, SerializationError> {
        let entry = self
            .tables
            .events
            .by_id(packed.type_id)
            .ok_or(SerializationError::UnknownTypeId(packed.type_id))?;

        let mut event = EventData::new(entry.schema.name.clone());
        for field in &packed.fields {
            match entry.field_name(field.id) {
                Some(name) => event.fields.push((name.to_string(), field.value.clone())),
                None => warn!("Skipping unknown field {} on event '{}'", field.id, entry.schema.name),
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{FieldSchema, TypeSchema};

    fn tables() -> SerializationTables {
        SerializationTables::generate(
            &[
                TypeSchema::new(
                    "Character",
                    vec![
                        FieldSchema::new("name", FieldReplication::ServerToAll),
                        FieldSchema::new("inventory", FieldReplication::ServerToOwner),
                        FieldSchema::new("look", FieldReplication::OwnerToServer),
                    ],
                ),
                TypeSchema::local_only("AiState", vec![FieldSchema::new("goal", FieldReplication::ServerToAll)]),
            ],
            &[TypeSchema::new(
                "Chat",
                vec![FieldSchema::new("text", FieldReplication::ServerToAll)],
            )],
        )
    }

    fn character() -> ComponentData {
        ComponentData::new("Character")
            .with_field("name", b"ann".to_vec())
            .with_field("inventory", b"sword".to_vec())
            .with_field("look", b"north".to_vec())
    }

    #[test]
    fn test_field_check_rules() {
        let owner_initial = FieldCheck::ServerToClient { is_owner: true, initial: true };
        let owner_delta = FieldCheck::ServerToClient { is_owner: true, initial: false };
        let observer = FieldCheck::ServerToClient { is_owner: false, initial: true };

        assert!(owner_initial.should_replicate(FieldReplication::OwnerToServer));
        assert!(!owner_delta.should_replicate(FieldReplication::OwnerToServer));
        assert!(owner_delta.should_replicate(FieldReplication::ServerToOwner));
        assert!(!observer.should_replicate(FieldReplication::ServerToOwner));
        assert!(observer.should_replicate(FieldReplication::ServerToAll));
        assert!(FieldCheck::ClientToServer.should_replicate(FieldReplication::OwnerToServer));
        assert!(!FieldCheck::ClientToServer.should_replicate(FieldReplication::ServerToAll));
    }

    #[test]
    fn test_observer_does_not_see_owner_fields() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let packed = serializer
            .serialize(
                &[character(), ComponentData::new("AiState").with_field("goal", b"x".to_vec())],
                FieldCheck::ServerToClient { is_owner: false, initial: true },
            )
            .unwrap();

        assert_eq!(packed.components.len(), 1);
        let update = serializer.deserialize(&packed, FieldCheck::All).unwrap();
        assert_eq!(update.components[0].field("name"), Some(&b"ann"[..]));
        assert_eq!(update.components[0].field("inventory"), None);
    }

    #[test]
    fn test_delta_without_changes_is_none() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let empty = BTreeSet::new();

        let delta = serializer
            .serialize_delta(
                &[character()],
                &empty,
                &empty,
                &empty,
                FieldCheck::ServerToClient { is_owner: true, initial: false },
            )
            .unwrap();
        assert!(delta.is_none());
    }

    #[test]
    fn test_delta_carries_changes_and_removals() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let changed: BTreeSet<String> = ["Character".to_string()].into_iter().collect();
        let removed: BTreeSet<String> = ["AiState".to_string(), "Character".to_string()]
            .into_iter()
            .collect();

        let delta = serializer
            .serialize_delta(
                &[character()],
                &BTreeSet::new(),
                &changed,
                &removed,
                FieldCheck::ServerToClient { is_owner: false, initial: false },
            )
            .unwrap()
            .unwrap();

        assert_eq!(delta.components.len(), 1);
        assert_eq!(delta.components[0].fields.len(), 1);
        // Local-only types are never announced as removed.
        assert_eq!(delta.removed_components, vec![0]);
    }

    #[test]
    fn test_client_update_keeps_only_owner_fields() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let packed = serializer.serialize(&[character()], FieldCheck::All).unwrap();

        let update = serializer.deserialize(&packed, FieldCheck::ClientToServer).unwrap();
        assert_eq!(update.components[0].fields, vec![("look".to_string(), b"north".to_vec())]);
    }

    #[test]
    fn test_unknown_type_id_is_rejected() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let packed = PackedEntity {
            components: vec![PackedComponent { type_id: 42, fields: vec![] }],
            removed_components: vec![],
        };

        assert_eq!(
            serializer.deserialize(&packed, FieldCheck::All),
            Err(SerializationError::UnknownTypeId(42))
        );
    }

    #[test]
    fn test_event_packing() {
        let tables = tables();
        let serializer = EntitySerializer::new(&tables);
        let event = EventData::new("Chat").with_field("text", b"hi".to_vec());

        let packed = serializer.serialize_event(&event).unwrap();
        assert_eq!(serializer.deserialize_event(&packed).unwrap(), event);
        assert!(serializer.serialize_event(&EventData::new("Unknown")).is_err());
    }

    #[test]
    fn test_component_merge_overwrites_present_fields() {
        let mut existing = character();
        existing.merge(&ComponentData::new("Character").with_field("look", b"south".to_vec()));

        assert_eq!(existing.field("look"), Some(&b"south"[..]));
        assert_eq!(existing.field("name"), Some(&b"ann"[..]));
    }
}

//! Resolved collection model: config validated and flattened for runtime use.

use crate::config::topology::TableTopology;
use crate::config::{EntityKind, FieldType, IdType, ValidationRule};
use crate::error::{AppError, ConfigError};
use crate::service::access::{AccessRule, AccessRules};
use crate::service::hooks::{Hook, HookPoint, Hooks};
use crate::context::Operation;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const DELETED_AT_FIELD: &str = "deletedAt";

#[derive(Clone, Debug)]
pub struct ResolvedField {
    pub name: String,
    pub column: String,
    pub type_: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub unique: bool,
    /// Stored in the i18n table, one row per locale.
    pub localized: bool,
    /// id and timestamp columns, managed by the engine.
    pub system: bool,
    pub validation: Option<ValidationRule>,
}

impl ResolvedField {
    pub fn pg_type(&self) -> &'static str {
        self.type_.pg_type()
    }

    pub(crate) fn system_field(name: &str, column: &str, type_: FieldType) -> Self {
        ResolvedField {
            name: name.to_string(),
            column: column.to_string(),
            type_,
            required: false,
            default: None,
            unique: false,
            localized: false,
            system: true,
            validation: None,
        }
    }
}

/// Compiled relation. Key lists are field names; `local` lives on the source collection,
/// `remote` on the target.
#[derive(Clone, Debug, PartialEq)]
pub enum Relation {
    One {
        local: Vec<String>,
        remote: Vec<String>,
        collection: String,
    },
    Many {
        local: Vec<String>,
        remote: Vec<String>,
        collection: String,
    },
    ManyToMany {
        /// Qualified junction table.
        through: String,
        source_key: String,
        source_column: String,
        target_key: String,
        target_column: String,
        collection: String,
    },
    Polymorphic {
        type_field: String,
        id_field: String,
        /// type value -> collection name
        collections: BTreeMap<String, String>,
    },
}

impl Relation {
    pub fn is_plural(&self) -> bool {
        matches!(self, Relation::Many { .. } | Relation::ManyToMany { .. })
    }

    /// Target collection names (several for polymorphic).
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Relation::One { collection, .. }
            | Relation::Many { collection, .. }
            | Relation::ManyToMany { collection, .. } => vec![collection.as_str()],
            Relation::Polymorphic { collections, .. } => collections.values().map(String::as_str).collect(),
        }
    }

    /// Fields of the source row that must be loaded to resolve this relation.
    pub fn source_fields(&self) -> Vec<&str> {
        match self {
            Relation::One { local, .. } | Relation::Many { local, .. } => local.iter().map(String::as_str).collect(),
            Relation::ManyToMany { source_key, .. } => vec![source_key.as_str()],
            Relation::Polymorphic { type_field, id_field, .. } => vec![type_field.as_str(), id_field.as_str()],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Versioning {
    pub max_versions: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ResolvedCollection {
    pub name: String,
    pub kind: EntityKind,
    pub id_type: IdType,
    /// id first, declared fields, then timestamp columns.
    pub fields: Vec<ResolvedField>,
    pub relations: BTreeMap<String, Relation>,
    pub topology: TableTopology,
    pub timestamps: bool,
    pub soft_delete: bool,
    pub versioning: Option<Versioning>,
    pub access: AccessRules,
    pub hooks: Hooks,
}

impl ResolvedCollection {
    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn id_field(&self) -> &ResolvedField {
        &self.fields[0]
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn is_global(&self) -> bool {
        self.kind == EntityKind::Global
    }

    pub fn is_localized(&self) -> bool {
        self.fields.iter().any(|f| f.localized)
    }

    pub fn is_versioned(&self) -> bool {
        self.versioning.is_some()
    }

    pub fn localized_fields(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields.iter().filter(|f| f.localized)
    }

    /// Fields stored on the main table.
    pub fn main_fields(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields.iter().filter(|f| !f.localized)
    }

    /// Main-table fields copied into version snapshots.
    pub fn versioned_fields(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields
            .iter()
            .filter(|f| !f.localized && f.name != ID_FIELD && f.name != DELETED_AT_FIELD)
    }

    pub fn field_or_bad_request(&self, name: &str) -> Result<&ResolvedField, AppError> {
        self.field(name)
            .ok_or_else(|| AppError::BadRequest(format!("unknown field '{}' on '{}'", name, self.name)))
    }

    /// Register a lifecycle hook.
    pub fn add_hook(&mut self, point: HookPoint, hook: Arc<dyn Hook>) -> &mut Self {
        self.hooks.add(point, hook);
        self
    }

    /// Replace the collection-level rule for `op`.
    pub fn set_access(&mut self, op: Operation, rule: AccessRule) -> &mut Self {
        self.access.set(op, rule);
        self
    }

    /// Replace a field-level rule. Only read, create and update apply to fields.
    pub fn set_field_access(&mut self, field: &str, op: Operation, rule: AccessRule) -> &mut Self {
        self.access.set_field(field, op, rule);
        self
    }
}

/// Explicit collection registry, built once at startup by `resolve`.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    collections: BTreeMap<String, ResolvedCollection>,
}

impl Registry {
    pub(crate) fn insert(&mut self, collection: ResolvedCollection) -> Result<(), ConfigError> {
        if self.collections.contains_key(&collection.name) {
            return Err(ConfigError::DuplicateCollection(collection.name));
        }
        self.collections.insert(collection.name.clone(), collection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedCollection> {
        self.collections.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResolvedCollection> {
        self.collections.get_mut(name)
    }

    /// Lookup used at request time; a missing collection is a 404.
    pub fn require(&self, name: &str) -> Result<&ResolvedCollection, AppError> {
        self.get(name)
            .ok_or_else(|| AppError::NotFound(format!("collection '{}'", name)))
    }

    pub fn collections(&self) -> impl Iterator<Item = &ResolvedCollection> {
        self.collections.values()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

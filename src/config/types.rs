//! Raw declarative types describing one collection or global, as produced by the schema builder (JSON).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    #[default]
    Collection,
    /// Exactly one row, created lazily on first read.
    Global,
}

/// Primary key type of the main table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdType {
    #[default]
    Uuid,
    Serial,
    Text,
}

impl IdType {
    pub fn pg_type(&self) -> &'static str {
        match self {
            IdType::Uuid => "uuid",
            IdType::Serial => "bigint",
            IdType::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Boolean,
    Timestamp,
    Date,
    Uuid,
    Json,
    TextArray,
    IntegerArray,
}

impl FieldType {
    /// PostgreSQL type name, used both in DDL and in `$n::type` parameter casts.
    pub fn pg_type(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "bigint",
            FieldType::Number => "double precision",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamptz",
            FieldType::Date => "date",
            FieldType::Uuid => "uuid",
            FieldType::Json => "jsonb",
            FieldType::TextArray => "text[]",
            FieldType::IntegerArray => "bigint[]",
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::TextArray | FieldType::IntegerArray)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub type_: FieldType,
    /// Column name; defaults to the snake_case form of the field name.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub validation: Option<ValidationRule>,
}

fn default_id_key() -> String {
    "id".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelationConfig {
    /// Local foreign key: `fields` on this collection reference `references` on the target.
    One {
        fields: Vec<String>,
        references: Vec<String>,
        collection: String,
    },
    /// Plural. Without local `fields`, the foreign key is found through the
    /// target's reverse `one` relation (optionally picked by `relation_name`).
    Many {
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        references: Vec<String>,
        collection: String,
        #[serde(default)]
        relation_name: Option<String>,
    },
    ManyToMany {
        through: String,
        #[serde(default = "default_id_key")]
        source_key: String,
        source_field: String,
        #[serde(default = "default_id_key")]
        target_key: String,
        target_field: String,
        collection: String,
    },
    Polymorphic {
        type_field: String,
        id_field: String,
        collections: BTreeMap<String, String>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersioningConfig {
    #[serde(default)]
    pub max_versions: Option<u32>,
}

/// `versioning: true` or `versioning: { "maxVersions": 3 }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersioningOption {
    Enabled(bool),
    Settings(VersioningConfig),
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsConfig {
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub versioning: Option<VersioningOption>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        OptionsConfig {
            timestamps: true,
            soft_delete: false,
            versioning: None,
        }
    }
}

/// Declarative access rule: a literal or a role name. Check functions are attached after resolve.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessRuleConfig {
    Literal(bool),
    Role(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldAccessConfig {
    #[serde(default)]
    pub read: Option<AccessRuleConfig>,
    #[serde(default)]
    pub create: Option<AccessRuleConfig>,
    #[serde(default)]
    pub update: Option<AccessRuleConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub read: Option<AccessRuleConfig>,
    #[serde(default)]
    pub create: Option<AccessRuleConfig>,
    #[serde(default)]
    pub update: Option<AccessRuleConfig>,
    #[serde(default)]
    pub delete: Option<AccessRuleConfig>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldAccessConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub name: String,
    #[serde(default)]
    pub kind: EntityKind,
    /// Main table name; defaults to the snake_case collection name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub id_type: IdType,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub localized: BTreeSet<String>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_collection_with_relations_and_versioning() {
        let cfg: CollectionConfig = serde_json::from_value(json!({
            "name": "posts",
            "fields": {
                "title": { "type": "text", "required": true },
                "authorId": { "type": "uuid" }
            },
            "localized": ["title"],
            "relations": {
                "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" },
                "tags": {
                    "kind": "manyToMany", "through": "posts_tags",
                    "sourceField": "post_id", "targetField": "tag_id", "collection": "tags"
                }
            },
            "options": { "versioning": { "maxVersions": 3 } },
            "access": { "read": true, "update": "editor" }
        }))
        .unwrap();
        assert_eq!(cfg.kind, EntityKind::Collection);
        assert!(cfg.options.timestamps);
        assert!(matches!(
            cfg.options.versioning,
            Some(VersioningOption::Settings(VersioningConfig { max_versions: Some(3) }))
        ));
        match &cfg.relations["tags"] {
            RelationConfig::ManyToMany { source_key, target_key, .. } => {
                assert_eq!(source_key, "id");
                assert_eq!(target_key, "id");
            }
            other => panic!("unexpected relation {:?}", other),
        }
        assert!(matches!(cfg.access.update, Some(AccessRuleConfig::Role(ref r)) if r == "editor"));
    }

    #[test]
    fn versioning_accepts_bare_bool() {
        let opts: OptionsConfig = serde_json::from_value(json!({ "versioning": true, "softDelete": true })).unwrap();
        assert!(matches!(opts.versioning, Some(VersioningOption::Enabled(true))));
        assert!(opts.soft_delete);
    }
}

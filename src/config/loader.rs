//! Load collection configs from JSON files and compile them into a `Registry`.

use crate::case::to_snake_case;
use crate::config::resolved::{
    Registry, Relation, ResolvedCollection, ResolvedField, Versioning, CREATED_AT_FIELD, DELETED_AT_FIELD,
    ID_FIELD, UPDATED_AT_FIELD,
};
use crate::config::topology::TableTopology;
use crate::config::types::*;
use crate::config::validator::{reverse_one_candidates, validate};
use crate::error::ConfigError;
use crate::service::access::AccessRules;
use crate::service::hooks::Hooks;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const DEFAULT_DB_SCHEMA: &str = "public";

/// Build the registry in the `public` schema (validates first).
pub fn resolve(configs: &[CollectionConfig]) -> Result<Registry, ConfigError> {
    resolve_in_schema(configs, DEFAULT_DB_SCHEMA)
}

pub fn resolve_in_schema(configs: &[CollectionConfig], db_schema: &str) -> Result<Registry, ConfigError> {
    validate(configs)?;
    let by_name: HashMap<&str, &CollectionConfig> = configs.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut registry = Registry::default();
    for c in configs {
        let fields = resolve_fields(c);
        let localized = fields.iter().any(|f| f.localized);
        let versioning = match &c.options.versioning {
            None | Some(VersioningOption::Enabled(false)) => None,
            Some(VersioningOption::Enabled(true)) => Some(Versioning::default()),
            Some(VersioningOption::Settings(v)) => Some(Versioning {
                max_versions: v.max_versions,
            }),
        };
        let table = c.table.clone().unwrap_or_else(|| to_snake_case(&c.name));
        let topology = TableTopology::derive(db_schema, &table, localized, versioning.is_some());

        let mut relations = BTreeMap::new();
        for (name, rel) in &c.relations {
            relations.insert(name.clone(), resolve_relation(c, name, rel, &by_name, db_schema)?);
        }

        registry.insert(ResolvedCollection {
            name: c.name.clone(),
            kind: c.kind,
            id_type: c.id_type,
            fields,
            relations,
            topology,
            timestamps: c.options.timestamps,
            soft_delete: c.options.soft_delete,
            versioning,
            access: AccessRules::from_config(&c.access),
            hooks: Hooks::default(),
        })?;
    }
    tracing::debug!(collections = registry.len(), "registry resolved");
    Ok(registry)
}

fn resolve_fields(c: &CollectionConfig) -> Vec<ResolvedField> {
    let id_type = match c.id_type {
        IdType::Uuid => FieldType::Uuid,
        IdType::Serial => FieldType::Integer,
        IdType::Text => FieldType::Text,
    };
    let mut id = ResolvedField::system_field(ID_FIELD, "id", id_type);
    id.required = c.id_type == IdType::Text;
    let mut fields = vec![id];

    for (name, spec) in &c.fields {
        fields.push(ResolvedField {
            name: name.clone(),
            column: spec.column.clone().unwrap_or_else(|| to_snake_case(name)),
            type_: spec.type_,
            required: spec.required,
            default: spec.default.clone(),
            unique: spec.unique,
            localized: c.localized.contains(name),
            system: false,
            validation: spec.validation.clone(),
        });
    }
    if c.options.timestamps {
        fields.push(ResolvedField::system_field(CREATED_AT_FIELD, "created_at", FieldType::Timestamp));
        fields.push(ResolvedField::system_field(UPDATED_AT_FIELD, "updated_at", FieldType::Timestamp));
    }
    if c.options.soft_delete {
        fields.push(ResolvedField::system_field(DELETED_AT_FIELD, "deleted_at", FieldType::Timestamp));
    }
    fields
}

fn resolve_relation(
    c: &CollectionConfig,
    name: &str,
    rel: &RelationConfig,
    by_name: &HashMap<&str, &CollectionConfig>,
    db_schema: &str,
) -> Result<Relation, ConfigError> {
    Ok(match rel {
        RelationConfig::One {
            fields,
            references,
            collection,
        } => Relation::One {
            local: fields.clone(),
            remote: references.clone(),
            collection: collection.clone(),
        },
        RelationConfig::Many {
            fields,
            references,
            collection,
            relation_name,
        } => {
            if !fields.is_empty() {
                Relation::Many {
                    local: fields.clone(),
                    remote: references.clone(),
                    collection: collection.clone(),
                }
            } else {
                // The reverse one holds the foreign key on the target: its `fields` are our remote keys.
                let target = by_name.get(collection.as_str()).ok_or_else(|| ConfigError::MissingReference {
                    kind: "collection",
                    id: collection.clone(),
                })?;
                let candidates = reverse_one_candidates(target, &c.name, relation_name.as_deref());
                match candidates.first() {
                    Some((_, RelationConfig::One { fields, references, .. })) => Relation::Many {
                        local: references.clone(),
                        remote: fields.clone(),
                        collection: collection.clone(),
                    },
                    _ => {
                        return Err(ConfigError::InvalidRelation {
                            collection: c.name.clone(),
                            relation: name.to_string(),
                            message: "reverse relation not found".into(),
                        })
                    }
                }
            }
        }
        RelationConfig::ManyToMany {
            through,
            source_key,
            source_field,
            target_key,
            target_field,
            collection,
        } => Relation::ManyToMany {
            through: crate::sql::qualified_table(db_schema, through),
            source_key: source_key.clone(),
            source_column: source_field.clone(),
            target_key: target_key.clone(),
            target_column: target_field.clone(),
            collection: collection.clone(),
        },
        RelationConfig::Polymorphic {
            type_field,
            id_field,
            collections,
        } => Relation::Polymorphic {
            type_field: type_field.clone(),
            id_field: id_field.clone(),
            collections: collections.clone(),
        },
    })
}

/// Parse every `*.json` file in `dir`. A file holds one collection or an array of them.
pub async fn load_from_path(dir: impl AsRef<Path>) -> Result<Vec<CollectionConfig>, ConfigError> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let parsed: Vec<CollectionConfig> = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|c| vec![c])
        }
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), count = parsed.len(), "loaded collection config");
        out.extend(parsed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configs() -> Vec<CollectionConfig> {
        serde_json::from_value(json!([
            {
                "name": "users",
                "idType": "serial",
                "fields": { "name": { "type": "text" } },
                "relations": { "posts": { "kind": "many", "collection": "posts" } }
            },
            {
                "name": "posts",
                "fields": {
                    "title": { "type": "text", "required": true },
                    "authorId": { "type": "integer" }
                },
                "localized": ["title"],
                "relations": {
                    "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" }
                },
                "options": { "softDelete": true, "versioning": true }
            }
        ]))
        .unwrap()
    }

    #[test]
    fn appends_system_fields_and_snake_case_columns() {
        let registry = resolve(&configs()).unwrap();
        let posts = registry.get("posts").unwrap();
        let names: Vec<&str> = posts.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "authorId", "title", "createdAt", "updatedAt", "deletedAt"]);
        assert_eq!(posts.field("authorId").unwrap().column, "author_id");
        assert!(posts.field("title").unwrap().localized);
        assert_eq!(posts.topology.i18n_versions.as_deref(), Some("posts_i18n_versions"));
        assert_eq!(posts.id_field().type_, FieldType::Uuid);
        assert_eq!(registry.get("users").unwrap().id_field().type_, FieldType::Integer);
    }

    #[test]
    fn many_is_compiled_from_reverse_one() {
        let registry = resolve(&configs()).unwrap();
        let users = registry.get("users").unwrap();
        assert_eq!(
            users.relation("posts"),
            Some(&Relation::Many {
                local: vec!["id".into()],
                remote: vec!["authorId".into()],
                collection: "posts".into(),
            })
        );
    }

    #[tokio::test]
    async fn load_from_path_reads_json_files() {
        let dir = std::env::temp_dir().join(format!("architect-cms-load-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("a.json"), r#"{ "name": "tags", "fields": { "label": { "type": "text" } } }"#)
            .await
            .unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();
        let loaded = load_from_path(&dir).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "tags");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}

//! Config validation: referential integrity of fields, localization and relations.

use crate::config::resolved::{CREATED_AT_FIELD, DELETED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::config::{CollectionConfig, RelationConfig};
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

const SYSTEM_FIELDS: [&str; 4] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD, DELETED_AT_FIELD];

/// Declared fields plus the system fields the collection's options enable.
pub fn has_field(config: &CollectionConfig, name: &str) -> bool {
    if config.fields.contains_key(name) || name == ID_FIELD {
        return true;
    }
    match name {
        CREATED_AT_FIELD | UPDATED_AT_FIELD => config.options.timestamps,
        DELETED_AT_FIELD => config.options.soft_delete,
        _ => false,
    }
}

fn relation_error(config: &CollectionConfig, relation: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidRelation {
        collection: config.name.clone(),
        relation: relation.to_string(),
        message: message.into(),
    }
}

/// Reverse `one` relations on `target` that point back at `source`, optionally restricted by name.
pub fn reverse_one_candidates<'a>(
    target: &'a CollectionConfig,
    source: &str,
    relation_name: Option<&str>,
) -> Vec<(&'a String, &'a RelationConfig)> {
    target
        .relations
        .iter()
        .filter(|(name, rel)| {
            matches!(rel, RelationConfig::One { collection, .. } if collection == source)
                && relation_name.map_or(true, |n| n == name.as_str())
        })
        .collect()
}

pub fn validate(configs: &[CollectionConfig]) -> Result<(), ConfigError> {
    let mut by_name: HashMap<&str, &CollectionConfig> = HashMap::new();
    for c in configs {
        if c.name.is_empty() {
            return Err(ConfigError::Validation("collection name must not be empty".into()));
        }
        if by_name.insert(c.name.as_str(), c).is_some() {
            return Err(ConfigError::DuplicateCollection(c.name.clone()));
        }
    }

    let mut tables = HashSet::new();
    for c in configs {
        let table = c.table.clone().unwrap_or_else(|| crate::case::to_snake_case(&c.name));
        if !tables.insert(table.clone()) {
            return Err(ConfigError::Validation(format!("table '{}' is used by more than one collection", table)));
        }

        for name in c.fields.keys() {
            if SYSTEM_FIELDS.contains(&name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "collection {}: field '{}' is reserved",
                    c.name, name
                )));
            }
        }
        for name in &c.localized {
            if !c.fields.contains_key(name) {
                return Err(ConfigError::UnknownLocalizedField {
                    collection: c.name.clone(),
                    field: name.clone(),
                });
            }
        }
        if let Some(crate::config::VersioningOption::Settings(v)) = &c.options.versioning {
            if v.max_versions == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "collection {}: maxVersions must be at least 1",
                    c.name
                )));
            }
        }
        for field in c.access.fields.keys() {
            if !has_field(c, field) {
                return Err(ConfigError::Validation(format!(
                    "collection {}: access rule for unknown field '{}'",
                    c.name, field
                )));
            }
        }

        for (rel_name, rel) in &c.relations {
            if has_field(c, rel_name) {
                return Err(ConfigError::RelationCollision {
                    collection: c.name.clone(),
                    name: rel_name.clone(),
                });
            }
            validate_relation(c, rel_name, rel, &by_name)?;
        }
    }
    Ok(())
}

fn target<'a>(
    by_name: &HashMap<&str, &'a CollectionConfig>,
    name: &str,
) -> Result<&'a CollectionConfig, ConfigError> {
    by_name.get(name).copied().ok_or_else(|| ConfigError::MissingReference {
        kind: "collection",
        id: name.to_string(),
    })
}

fn validate_key_pairs(
    source: &CollectionConfig,
    rel_name: &str,
    fields: &[String],
    target: &CollectionConfig,
    references: &[String],
) -> Result<(), ConfigError> {
    if fields.is_empty() || fields.len() != references.len() {
        return Err(relation_error(source, rel_name, "fields and references must be non-empty and of equal length"));
    }
    for f in fields {
        if !has_field(source, f) || source.localized.contains(f) {
            return Err(relation_error(source, rel_name, format!("unknown key field '{}'", f)));
        }
    }
    for r in references {
        if !has_field(target, r) || target.localized.contains(r) {
            return Err(relation_error(
                source,
                rel_name,
                format!("unknown referenced field '{}' on '{}'", r, target.name),
            ));
        }
    }
    Ok(())
}

fn validate_relation(
    c: &CollectionConfig,
    rel_name: &str,
    rel: &RelationConfig,
    by_name: &HashMap<&str, &CollectionConfig>,
) -> Result<(), ConfigError> {
    match rel {
        RelationConfig::One {
            fields,
            references,
            collection,
        } => {
            let t = target(by_name, collection)?;
            validate_key_pairs(c, rel_name, fields, t, references)
        }
        RelationConfig::Many {
            fields,
            references,
            collection,
            relation_name,
        } => {
            let t = target(by_name, collection)?;
            if !fields.is_empty() || !references.is_empty() {
                return validate_key_pairs(c, rel_name, fields, t, references);
            }
            match reverse_one_candidates(t, &c.name, relation_name.as_deref()).len() {
                1 => Ok(()),
                0 => Err(relation_error(
                    c,
                    rel_name,
                    format!("no reverse 'one' relation on '{}' points back to '{}'", t.name, c.name),
                )),
                _ => Err(relation_error(
                    c,
                    rel_name,
                    format!("ambiguous reverse relation on '{}'; set relationName", t.name),
                )),
            }
        }
        RelationConfig::ManyToMany {
            through,
            source_key,
            source_field,
            target_key,
            target_field,
            collection,
        } => {
            let t = target(by_name, collection)?;
            if through.is_empty() || source_field.is_empty() || target_field.is_empty() || source_field == target_field {
                return Err(relation_error(c, rel_name, "junction table and distinct junction columns are required"));
            }
            if !has_field(c, source_key) || c.localized.contains(source_key) {
                return Err(relation_error(c, rel_name, format!("unknown source key '{}'", source_key)));
            }
            if !has_field(t, target_key) || t.localized.contains(target_key) {
                return Err(relation_error(c, rel_name, format!("unknown target key '{}'", target_key)));
            }
            Ok(())
        }
        RelationConfig::Polymorphic {
            type_field,
            id_field,
            collections,
        } => {
            for f in [type_field, id_field] {
                if !c.fields.contains_key(f) || c.localized.contains(f) {
                    return Err(relation_error(c, rel_name, format!("unknown key field '{}'", f)));
                }
            }
            if collections.is_empty() {
                return Err(relation_error(c, rel_name, "at least one target collection is required"));
            }
            for name in collections.values() {
                target(by_name, name)?;
            }
            Ok(())
        }
    }
}

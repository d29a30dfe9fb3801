//! Apply the registry to the database: DDL for schemas, main, i18n, version and junction tables.
//! Statements are idempotent (IF NOT EXISTS) so the migration can be re-run after config changes
//! that only add collections.

use crate::config::topology::{
    I18N_PARENT_COLUMN, LOCALE_COLUMN, VERSION_CREATED_AT_COLUMN, VERSION_ID_COLUMN, VERSION_NUMBER_COLUMN,
    VERSION_OPERATION_COLUMN, VERSION_USER_COLUMN,
};
use crate::config::{EntityKind, IdType, Registry, Relation, ResolvedCollection, ResolvedField, ID_FIELD};
use crate::error::AppError;
use crate::sql::{quoted, QueryBuf};
use crate::store::{rollback_quietly, Database};
use std::collections::BTreeSet;

fn id_column(coll: &ResolvedCollection) -> String {
    let name = quoted(&coll.id_field().column);
    match coll.id_type {
        IdType::Uuid => format!("{} uuid PRIMARY KEY DEFAULT gen_random_uuid()", name),
        IdType::Serial => format!("{} bigserial PRIMARY KEY", name),
        IdType::Text => format!("{} text PRIMARY KEY", name),
    }
}

fn field_column(coll: &ResolvedCollection, f: &ResolvedField) -> String {
    if f.system {
        let nullable = f.name == crate::config::DELETED_AT_FIELD;
        return if nullable {
            format!("{} {}", quoted(&f.column), f.pg_type())
        } else {
            format!("{} {} NOT NULL DEFAULT NOW()", quoted(&f.column), f.pg_type())
        };
    }
    let mut def = format!("{} {}", quoted(&f.column), f.pg_type());
    // Globals are created empty, so required is enforced by validation only.
    if f.required && coll.kind == EntityKind::Collection {
        def.push_str(" NOT NULL");
    }
    if f.unique {
        def.push_str(" UNIQUE");
    }
    def
}

/// Column definition with the field's type and no constraints (for snapshot tables).
fn plain_column(f: &ResolvedField) -> String {
    format!("{} {}", quoted(&f.column), f.pg_type())
}

fn create_table(table: &str, defs: &[String]) -> String {
    format!("CREATE TABLE IF NOT EXISTS {} (\n  {}\n)", table, defs.join(",\n  "))
}

fn collection_tables(coll: &ResolvedCollection, out: &mut Vec<String>) {
    let topology = &coll.topology;
    let id = coll.id_field();
    let id_type = id.pg_type();
    let main = topology.main_table();

    let mut defs = vec![id_column(coll)];
    defs.extend(
        coll.main_fields()
            .filter(|f| f.name != ID_FIELD)
            .map(|f| field_column(coll, f)),
    );
    out.push(create_table(&main, &defs));

    if let Some(i18n) = topology.i18n_table() {
        let mut defs = vec![
            format!(
                "{} {} NOT NULL REFERENCES {} ({}) ON DELETE CASCADE",
                quoted(I18N_PARENT_COLUMN),
                id_type,
                main,
                quoted(&id.column)
            ),
            format!("{} text NOT NULL", quoted(LOCALE_COLUMN)),
        ];
        defs.extend(coll.localized_fields().map(plain_column));
        defs.push(format!("UNIQUE ({}, {})", quoted(I18N_PARENT_COLUMN), quoted(LOCALE_COLUMN)));
        out.push(create_table(&i18n, &defs));
    }

    if let Some(versions) = topology.versions_table() {
        let mut defs = vec![
            format!("{} uuid PRIMARY KEY", quoted(VERSION_ID_COLUMN)),
            format!("{} {} NOT NULL", quoted(&id.column), id_type),
            format!("{} bigint NOT NULL", quoted(VERSION_NUMBER_COLUMN)),
            format!("{} text NOT NULL", quoted(VERSION_OPERATION_COLUMN)),
            format!("{} text", quoted(VERSION_USER_COLUMN)),
            format!("{} timestamptz NOT NULL DEFAULT NOW()", quoted(VERSION_CREATED_AT_COLUMN)),
        ];
        defs.extend(coll.versioned_fields().map(plain_column));
        defs.push(format!("UNIQUE ({}, {})", quoted(&id.column), quoted(VERSION_NUMBER_COLUMN)));
        out.push(create_table(&versions, &defs));
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({}, {} DESC)",
            quoted(&format!("{}_versions_by_id", topology.main)),
            versions,
            quoted(&id.column),
            quoted(VERSION_NUMBER_COLUMN)
        ));
    }

    if let Some(i18n_versions) = topology.i18n_versions_table() {
        let mut defs = vec![
            format!("{} {} NOT NULL", quoted(I18N_PARENT_COLUMN), id_type),
            format!("{} bigint NOT NULL", quoted(VERSION_NUMBER_COLUMN)),
            format!("{} text NOT NULL", quoted(LOCALE_COLUMN)),
        ];
        defs.extend(coll.localized_fields().map(plain_column));
        defs.push(format!(
            "PRIMARY KEY ({}, {}, {})",
            quoted(I18N_PARENT_COLUMN),
            quoted(VERSION_NUMBER_COLUMN),
            quoted(LOCALE_COLUMN)
        ));
        out.push(create_table(&i18n_versions, &defs));
    }
}

fn junction_table(registry: &Registry, coll: &ResolvedCollection, rel: &Relation) -> Option<String> {
    let Relation::ManyToMany {
        through,
        source_key,
        source_column,
        target_key,
        target_column,
        collection,
    } = rel
    else {
        return None;
    };
    let source = coll.field(source_key)?;
    let Some(target) = registry.get(collection).and_then(|t| t.field(target_key)) else {
        tracing::warn!(through = %through, collection = %collection, "junction target key not found; skipped");
        return None;
    };
    let defs = vec![
        format!("{} {} NOT NULL", quoted(source_column), source.pg_type()),
        format!("{} {} NOT NULL", quoted(target_column), target.pg_type()),
        format!("PRIMARY KEY ({}, {})", quoted(source_column), quoted(target_column)),
    ];
    Some(create_table(through, &defs))
}

/// `one` relations onto a target's id get a foreign key. Postgres has no
/// `ADD CONSTRAINT IF NOT EXISTS`, so the duplicate error is swallowed in a DO block.
fn foreign_key(registry: &Registry, coll: &ResolvedCollection, name: &str, rel: &Relation) -> Option<String> {
    let Relation::One {
        local,
        remote,
        collection,
    } = rel
    else {
        return None;
    };
    if remote.len() != 1 || remote[0] != ID_FIELD || local.len() != 1 {
        return None;
    }
    let target = registry.get(collection)?;
    let local = coll.field(&local[0])?;
    if local.localized {
        return None;
    }
    let constraint = format!("{}_{}_fkey", coll.topology.main, crate::case::to_snake_case(name));
    Some(format!(
        "DO $$ BEGIN ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE SET NULL; \
         EXCEPTION WHEN duplicate_object THEN NULL; END $$",
        coll.topology.main_table(),
        quoted(&constraint),
        quoted(&local.column),
        target.topology.main_table(),
        quoted(&target.id_field().column)
    ))
}

/// DDL for every collection in dependency order: schemas, tables, junctions, then foreign keys.
pub fn migration_statements(registry: &Registry) -> Vec<String> {
    let mut out = Vec::new();
    let schemas: BTreeSet<&str> = registry.collections().map(|c| c.topology.schema.as_str()).collect();
    for schema in schemas {
        out.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)));
    }
    for coll in registry.collections() {
        collection_tables(coll, &mut out);
    }
    let mut junctions = BTreeSet::new();
    for coll in registry.collections() {
        for rel in coll.relations.values() {
            if let Relation::ManyToMany { through, .. } = rel {
                if !junctions.insert(through.clone()) {
                    continue;
                }
            }
            if let Some(sql) = junction_table(registry, coll, rel) {
                out.push(sql);
            }
        }
    }
    for coll in registry.collections() {
        for (name, rel) in &coll.relations {
            if let Some(sql) = foreign_key(registry, coll, name, rel) {
                out.push(sql);
            }
        }
    }
    out
}

/// Run every statement in one transaction. Returns the number of statements applied.
pub async fn apply_migrations(db: &dyn Database, registry: &Registry) -> Result<usize, AppError> {
    let statements = migration_statements(registry);
    let mut tx = db.begin().await?;
    for sql in &statements {
        let mut q = QueryBuf::new();
        q.sql = sql.clone();
        if let Err(e) = tx.execute(&q).await {
            rollback_quietly(tx, &e).await;
            return Err(e);
        }
    }
    tx.commit().await?;
    tracing::info!(
        statements = statements.len(),
        collections = registry.len(),
        "migrations applied"
    );
    Ok(statements.len())
}

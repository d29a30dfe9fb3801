//! Row writes: split a payload into main, localized and relation parts, then apply them in
//! order (relation pre-writes, main row, i18n row, snapshot, relation post-writes).

use crate::config::{Relation, ResolvedCollection, ResolvedField, ID_FIELD};
use crate::context::{Operation, Record};
use crate::error::AppError;
use crate::service::validation::RequestValidator;
use crate::service::{nested, reader, versions, Runtime};
use crate::sql::{insert_row, update_row, upsert_i18n};
use crate::store::Executor;
use async_recursion::async_recursion;
use serde_json::Value;

pub(crate) type FieldValues<'c> = Vec<(&'c ResolvedField, Value)>;

/// A write payload sorted by destination.
pub(crate) struct SplitInput<'c> {
    pub main: FieldValues<'c>,
    pub localized: FieldValues<'c>,
    pub relations: Vec<(&'c str, &'c Relation, Value)>,
}

impl<'c> SplitInput<'c> {
    /// Field values as one record, for validation.
    fn body(&self) -> Record {
        self.main
            .iter()
            .chain(self.localized.iter())
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect()
    }
}

/// Engine-managed fields (timestamps, and id on update) are dropped. Unknown keys are rejected.
pub(crate) fn split_input<'c>(
    coll: &'c ResolvedCollection,
    input: &Record,
    op: Operation,
) -> Result<SplitInput<'c>, AppError> {
    let mut split = SplitInput {
        main: Vec::new(),
        localized: Vec::new(),
        relations: Vec::new(),
    };
    for (key, value) in input {
        if let Some(f) = coll.field(key) {
            if f.system {
                if f.name == ID_FIELD && op == Operation::Create && !value.is_null() {
                    split.main.push((f, value.clone()));
                }
                continue;
            }
            if f.localized {
                split.localized.push((f, value.clone()));
            } else {
                split.main.push((f, value.clone()));
            }
        } else if let Some((name, rel)) = coll.relations.get_key_value(key) {
            split.relations.push((name.as_str(), rel, value.clone()));
        } else {
            return Err(AppError::BadRequest(format!(
                "unknown field '{}' on '{}'",
                key, coll.name
            )));
        }
    }
    Ok(split)
}

pub(crate) fn set_value<'c>(values: &mut FieldValues<'c>, field: &'c ResolvedField, value: Value) {
    match values.iter_mut().find(|(f, _)| f.name == field.name) {
        Some(slot) => slot.1 = value,
        None => values.push((field, value)),
    }
}

async fn write_localized(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    localized: &FieldValues<'_>,
) -> Result<(), AppError> {
    let pairs: Vec<(&ResolvedField, &Value)> = localized.iter().map(|(f, v)| (*f, v)).collect();
    if let Some(q) = upsert_i18n(coll, id, rt.ctx.locale(), &pairs) {
        exec.execute(&q).await?;
    }
    Ok(())
}

async fn after_main_write(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    split: &SplitInput<'_>,
    operation: Operation,
) -> Result<(), AppError> {
    write_localized(rt, exec, coll, id, &split.localized).await?;
    if coll.is_versioned() {
        versions::snapshot(exec, coll, id, operation, rt.ctx).await?;
    }
    if split.relations.iter().any(|(_, rel, _)| rel.is_plural()) {
        let parent = reader::load_by_id(rt, exec, coll, id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("'{}' row vanished during write", coll.name)))?;
        nested::apply_after(rt, exec, coll, &split.relations, &parent).await?;
    }
    Ok(())
}

/// Insert one record with its localized values and nested relation writes. Returns the new id.
/// `relaxed` skips required-field checks (lazily created globals).
#[async_recursion]
pub(crate) async fn insert_record(
    rt: Runtime<'async_recursion>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    input: &Record,
    relaxed: bool,
) -> Result<Value, AppError> {
    let mut data = input.clone();
    for f in coll.fields.iter().filter(|f| !f.system) {
        if let Some(d) = &f.default {
            data.entry(f.name.clone()).or_insert_with(|| d.clone());
        }
    }
    let mut split = split_input(coll, &data, Operation::Create)?;
    nested::apply_before(rt, exec, coll, &split.relations, &mut split.main).await?;
    let body = split.body();
    if relaxed {
        RequestValidator::validate_partial(&body, coll)?;
    } else {
        RequestValidator::validate(&body, coll)?;
    }

    let pairs: Vec<(&ResolvedField, &Value)> = split.main.iter().map(|(f, v)| (*f, v)).collect();
    let q = insert_row(coll, &pairs);
    let id = exec
        .fetch_optional(&q)
        .await?
        .and_then(|mut r| r.remove(ID_FIELD))
        .ok_or_else(|| AppError::Internal(format!("insert into '{}' returned no row", coll.name)))?;
    after_main_write(rt, exec, coll, &id, &split, Operation::Create).await?;
    Ok(id)
}

/// Update one live record by id. A missing (or soft-deleted) row is NotFound.
#[async_recursion]
pub(crate) async fn update_record(
    rt: Runtime<'async_recursion>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    input: &Record,
) -> Result<(), AppError> {
    let mut split = split_input(coll, input, Operation::Update)?;
    nested::apply_before(rt, exec, coll, &split.relations, &mut split.main).await?;
    RequestValidator::validate_partial(&split.body(), coll)?;

    let pairs: Vec<(&ResolvedField, &Value)> = split.main.iter().map(|(f, v)| (*f, v)).collect();
    let q = update_row(coll, id, &pairs);
    if exec.fetch_optional(&q).await?.is_none() {
        return Err(AppError::NotFound(format!("'{}' {}", coll.name, id)));
    }
    after_main_write(rt, exec, coll, id, &split, Operation::Update).await
}

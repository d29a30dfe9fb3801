//! Relation loading: one batched query per relation per level, never one per parent row.

use crate::config::topology::col;
use crate::config::{FieldType, Relation, ResolvedCollection, ResolvedField, ID_FIELD};
use crate::context::{Operation, Record};
use crate::error::AppError;
use crate::query::{AggregateSpec, WithOptions, With};
use crate::service::access::AccessEnforcer;
use crate::service::reader::{load_rows, projection, relation_key_fields, strip_hidden, ReadPlan};
use crate::service::{i18n, Runtime};
use crate::sql::where_clause::{Scope, Where};
use crate::sql::{
    field_expr, from_clause, json_to_text, key_in_predicate, live_rows_predicate, quoted, QueryBuf, Window,
    MAIN_ALIAS,
};
use crate::store::Executor;
use async_recursion::async_recursion;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

const JUNCTION_ALIAS: &str = "j";

/// Stable text key for a tuple of key values. Strings and numbers of equal text compare equal.
pub fn key_string(values: &[Value]) -> String {
    values.iter().map(json_to_text).collect::<Vec<_>>().join("\u{1f}")
}

fn key_of(row: &Record, fields: &[String]) -> Option<(String, Vec<Value>)> {
    let mut values = Vec::with_capacity(fields.len());
    for f in fields {
        match row.get(f) {
            Some(v) if !v.is_null() => values.push(v.clone()),
            _ => return None,
        }
    }
    Some((key_string(&values), values))
}

fn distinct_keys<'r>(rows: impl IntoIterator<Item = &'r Record>, fields: &[String]) -> Vec<Vec<Value>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if let Some((k, values)) = key_of(row, fields) {
            if seen.insert(k) {
                out.push(values);
            }
        }
    }
    out
}

fn empty_value(plural: bool) -> Value {
    if plural {
        Value::Array(Vec::new())
    } else {
        Value::Null
    }
}

/// Key filter as a raw predicate, so it composes with the caller's `where`.
fn key_filter(fields: Vec<ResolvedField>, keys: Vec<Vec<Value>>) -> Where {
    Where::raw(move |t, q| {
        let refs: Vec<&ResolvedField> = fields.iter().collect();
        key_in_predicate(q, t.alias, &refs, &keys)
    })
}

fn can_read<'r>(rt: Runtime<'r>, target: &'r ResolvedCollection) -> AccessEnforcer<'r> {
    AccessEnforcer::new(&target.access, rt.ctx, rt.db)
}

/// Attach every relation named in `with` to `rows`, recursing into nested includes.
#[async_recursion]
pub async fn resolve(
    rt: Runtime<'async_recursion>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    rows: &mut [Record],
    with: &With,
    depth: usize,
) -> Result<(), AppError> {
    if with.is_empty() || rows.is_empty() {
        return Ok(());
    }
    if depth >= rt.max_depth {
        return Err(AppError::BadRequest(format!(
            "relation includes nested deeper than {}",
            rt.max_depth
        )));
    }
    for (name, opts) in with.iter() {
        let relation = coll.relation(name).ok_or_else(|| {
            AppError::BadRequest(format!("unknown relation '{}' on '{}'", name, coll.name))
        })?;
        if let Some(spec) = opts.aggregate.as_ref().filter(|s| !s.is_empty()) {
            if !relation.is_plural() {
                return Err(AppError::BadRequest(format!(
                    "aggregates need a plural relation; '{}' is singular",
                    name
                )));
            }
            aggregate(rt, exec, coll, rows, name, relation, opts, spec).await?;
            continue;
        }
        match relation {
            Relation::One { local, remote, collection } => {
                load_direct(rt, exec, rows, name, local, remote, collection, opts, false, depth)
                    .await?
            }
            Relation::Many { local, remote, collection } => {
                load_direct(rt, exec, rows, name, local, remote, collection, opts, true, depth)
                    .await?
            }
            Relation::ManyToMany { .. } => load_many_to_many(rt, exec, coll, rows, name, relation, opts, depth).await?,
            Relation::Polymorphic {
                type_field,
                id_field,
                collections,
            } => {
                load_polymorphic(rt, exec, rows, name, type_field, id_field, collections, opts, depth)
                    .await?
            }
        }
    }
    Ok(())
}

/// Load target rows whose `remote` fields match `keys`, resolve their own includes, apply
/// field read rules. Returns each row with its key.
#[allow(clippy::too_many_arguments)]
async fn load_keyed(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    remote: &[String],
    keys: Vec<Vec<Value>>,
    opts: &WithOptions,
    per_parent: bool,
    depth: usize,
) -> Result<Vec<(String, Record)>, AppError> {
    let remote_fields = remote
        .iter()
        .map(|f| target.field_or_bad_request(f).cloned())
        .collect::<Result<Vec<_>, _>>()?;
    let mut filters = vec![key_filter(remote_fields, keys)];
    if let Some(w) = &opts.where_ {
        filters.push(w.clone());
    }
    let mut extra: Vec<String> = remote.to_vec();
    for f in relation_key_fields(target, opts.with.as_ref()) {
        if !extra.contains(&f) {
            extra.push(f);
        }
    }
    let window = if per_parent && (opts.limit.is_some() || opts.offset.is_some()) {
        Window::PerParent {
            keys: remote.to_vec(),
            limit: opts.limit,
            offset: opts.offset.unwrap_or(0),
        }
    } else {
        Window::Page { limit: None, offset: 0 }
    };
    let plan = ReadPlan {
        filter: Some(Where::and(filters)),
        columns: opts.columns.as_deref(),
        extra_fields: extra,
        order_by: &opts.order_by,
        window,
        include_deleted: false,
    };
    let (_, hidden) = projection(target, plan.columns, &plan.extra_fields)?;
    let mut rows = load_rows(rt, exec, target, &plan).await?;
    let keys: Vec<Option<String>> = rows.iter().map(|r| key_of(r, remote).map(|(k, _)| k)).collect();

    if let Some(nested) = &opts.with {
        resolve(rt, exec, target, &mut rows, nested, depth + 1).await?;
    }
    let enforcer = can_read(rt, target);
    for row in rows.iter_mut() {
        enforcer.filter_readable_fields(row).await;
    }
    strip_hidden(&mut rows, &hidden);
    Ok(keys
        .into_iter()
        .zip(rows)
        .filter_map(|(k, r)| k.map(|k| (k, r)))
        .collect())
}

#[allow(clippy::too_many_arguments)]
async fn load_direct(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    rows: &mut [Record],
    name: &str,
    local: &[String],
    remote: &[String],
    collection: &str,
    opts: &WithOptions,
    plural: bool,
    depth: usize,
) -> Result<(), AppError> {
    let target = rt.registry.require(collection)?;
    let keys = distinct_keys(rows.iter(), local);
    let allowed = can_read(rt, target).authorize(Operation::Read, None, None).await;
    if keys.is_empty() || !allowed {
        for row in rows.iter_mut() {
            row.insert(name.to_string(), empty_value(plural));
        }
        return Ok(());
    }
    let loaded = load_keyed(rt, exec, target, remote, keys, opts, plural, depth).await?;
    let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
    for (k, r) in loaded {
        grouped.entry(k).or_default().push(r);
    }
    for row in rows.iter_mut() {
        let related = key_of(row, local).and_then(|(k, _)| grouped.get(&k));
        let value = match (related, plural) {
            (Some(list), true) => Value::Array(list.iter().cloned().map(Value::Object).collect()),
            (Some(list), false) => list.first().cloned().map(Value::Object).unwrap_or(Value::Null),
            (None, p) => empty_value(p),
        };
        row.insert(name.to_string(), value);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn load_many_to_many(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    rows: &mut [Record],
    name: &str,
    relation: &Relation,
    opts: &WithOptions,
    depth: usize,
) -> Result<(), AppError> {
    let Relation::ManyToMany {
        through,
        source_key,
        source_column,
        target_key,
        target_column,
        collection,
    } = relation
    else {
        return Err(AppError::Internal("expected a many-to-many relation".into()));
    };
    let target = rt.registry.require(collection)?;
    let source_keys = distinct_keys(rows.iter(), std::slice::from_ref(source_key));
    let allowed = can_read(rt, target).authorize(Operation::Read, None, None).await;
    if source_keys.is_empty() || !allowed {
        for row in rows.iter_mut() {
            row.insert(name.to_string(), empty_value(true));
        }
        return Ok(());
    }

    let sk = coll.field_or_bad_request(source_key)?;
    let mut q = QueryBuf::new();
    let placeholders: Vec<String> = source_keys.iter().map(|k| q.bind_field(&k[0], sk)).collect();
    q.sql = format!(
        "SELECT {} AS \"__source\", {} AS \"__target\" FROM {} AS {} WHERE {} IN ({}) ORDER BY {}, {}.ctid",
        col(JUNCTION_ALIAS, source_column),
        col(JUNCTION_ALIAS, target_column),
        through,
        JUNCTION_ALIAS,
        col(JUNCTION_ALIAS, source_column),
        placeholders.join(", "),
        col(JUNCTION_ALIAS, source_column),
        JUNCTION_ALIAS
    );
    let links = exec.fetch_all(&q).await?;

    let mut per_source: HashMap<String, Vec<String>> = HashMap::new();
    let mut target_keys = Vec::new();
    let mut seen = HashSet::new();
    for link in &links {
        let (Some(s), Some(t)) = (link.get("__source"), link.get("__target")) else { continue };
        if s.is_null() || t.is_null() {
            continue;
        }
        let tk = key_string(std::slice::from_ref(t));
        per_source.entry(key_string(std::slice::from_ref(s))).or_default().push(tk.clone());
        if seen.insert(tk) {
            target_keys.push(vec![t.clone()]);
        }
    }

    let mut targets: HashMap<String, (usize, Record)> = HashMap::new();
    if !target_keys.is_empty() {
        let unpaged = WithOptions {
            limit: None,
            offset: None,
            ..opts.clone()
        };
        let loaded = load_keyed(rt, exec, target, std::slice::from_ref(target_key), target_keys, &unpaged, false, depth)
            .await?;
        for (i, (k, r)) in loaded.into_iter().enumerate() {
            targets.entry(k).or_insert((i, r));
        }
    }

    let offset = opts.offset.unwrap_or(0) as usize;
    let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    for row in rows.iter_mut() {
        let mut emitted = HashSet::new();
        let mut related: Vec<&(usize, Record)> = key_of(row, std::slice::from_ref(source_key))
            .and_then(|(k, _)| per_source.get(&k))
            .map(|tks| {
                tks.iter()
                    .filter(|tk| emitted.insert(*tk))
                    .filter_map(|tk| targets.get(tk))
                    .collect()
            })
            .unwrap_or_default();
        // Junction order unless the caller asked for an explicit sort.
        if !opts.order_by.is_empty() {
            related.sort_by_key(|(i, _)| *i);
        }
        let list: Vec<Value> = related
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, r)| Value::Object(r.clone()))
            .collect();
        row.insert(name.to_string(), Value::Array(list));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn load_polymorphic(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    rows: &mut [Record],
    name: &str,
    type_field: &str,
    id_field: &str,
    collections: &BTreeMap<String, String>,
    opts: &WithOptions,
    depth: usize,
) -> Result<(), AppError> {
    let mut ids_by_type: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for row in rows.iter() {
        let (Some(Value::String(t)), Some(id)) = (row.get(type_field), row.get(id_field)) else { continue };
        if id.is_null() {
            continue;
        }
        let mut key_row = Record::new();
        key_row.insert(ID_FIELD.into(), id.clone());
        ids_by_type.entry(t.clone()).or_default().push(key_row);
    }

    let id_key = vec![ID_FIELD.to_string()];
    let mut found: HashMap<(String, String), Record> = HashMap::new();
    for (type_value, id_rows) in &ids_by_type {
        let Some(collection) = collections.get(type_value) else {
            tracing::debug!(relation = name, type_value = %type_value, "unknown polymorphic type");
            continue;
        };
        let target = rt.registry.require(collection)?;
        if !can_read(rt, target).authorize(Operation::Read, None, None).await {
            continue;
        }
        let keys = distinct_keys(id_rows.iter(), &id_key);
        let loaded = load_keyed(rt, exec, target, &id_key, keys, opts, false, depth).await?;
        for (k, r) in loaded {
            found.entry((type_value.clone(), k)).or_insert(r);
        }
    }

    for row in rows.iter_mut() {
        let value = match (row.get(type_field), row.get(id_field)) {
            (Some(Value::String(t)), Some(id)) if !id.is_null() => found
                .get(&(t.clone(), key_string(std::slice::from_ref(id))))
                .cloned()
                .map(Value::Object)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        row.insert(name.to_string(), value);
    }
    Ok(())
}

/// One grouped query per relation. Parents with no related rows get `_count: 0` and null
/// for the other aggregates.
#[allow(clippy::too_many_arguments)]
async fn aggregate(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    rows: &mut [Record],
    name: &str,
    relation: &Relation,
    opts: &WithOptions,
    spec: &AggregateSpec,
) -> Result<(), AppError> {
    let (target, local, key_exprs, key_fields, join_clause) = match relation {
        Relation::Many { local, remote, collection, .. } => {
            let target = rt.registry.require(collection)?;
            let mut exprs = Vec::new();
            let mut fields = Vec::new();
            for r in remote {
                let f = target.field_or_bad_request(r)?;
                exprs.push(field_expr(f, MAIN_ALIAS));
                fields.push(f.clone());
            }
            (target, local.clone(), exprs, fields, String::new())
        }
        Relation::ManyToMany {
            through,
            source_key,
            source_column,
            target_key,
            target_column,
            collection,
        } => {
            let target = rt.registry.require(collection)?;
            let tk = target.field_or_bad_request(target_key)?;
            let mut sk = coll.field_or_bad_request(source_key)?.clone();
            // Keys are matched on the junction column, typed like the source key.
            sk.column = source_column.clone();
            sk.localized = false;
            let join = format!(
                " JOIN {} AS {} ON {} = {}",
                through,
                JUNCTION_ALIAS,
                field_expr(tk, MAIN_ALIAS),
                col(JUNCTION_ALIAS, target_column)
            );
            (
                target,
                vec![source_key.clone()],
                vec![col(JUNCTION_ALIAS, source_column)],
                vec![sk],
                join,
            )
        }
        _ => return Err(AppError::BadRequest(format!("aggregates need a plural relation ('{}')", name))),
    };

    let allowed = can_read(rt, target).authorize(Operation::Read, None, None).await;
    let keys = distinct_keys(rows.iter(), &local);
    let mut results: HashMap<String, Record> = HashMap::new();
    if allowed && !keys.is_empty() {
        let mut q = QueryBuf::new();
        let mut locale = i18n::locale_join(target, rt.ctx);
        if let Some(l) = locale.as_mut() {
            l.fallback = None;
        }
        let from = from_clause(&mut q, target, MAIN_ALIAS, locale.as_ref());

        let mut select = Vec::new();
        for (i, e) in key_exprs.iter().enumerate() {
            select.push(format!("{} AS {}", e, quoted(&format!("__key{}", i))));
        }
        if spec.count {
            select.push("COUNT(*) AS \"_count\"".to_string());
        }
        for (func, fields, numeric) in [
            ("SUM", &spec.sum, true),
            ("AVG", &spec.avg, true),
            ("MIN", &spec.min, false),
            ("MAX", &spec.max, false),
        ] {
            for f in fields {
                let field = target.field_or_bad_request(f)?;
                if field.localized {
                    return Err(AppError::BadRequest(format!("cannot aggregate localized field '{}'", f)));
                }
                if numeric && !matches!(field.type_, FieldType::Integer | FieldType::Number) {
                    return Err(AppError::BadRequest(format!("{} needs a numeric field; '{}' is not", func, f)));
                }
                let expr = format!("{}({})", func, field_expr(field, MAIN_ALIAS));
                let expr = if numeric { format!("{}::float8", expr) } else { expr };
                let alias = format!("_{}_{}", func.to_lowercase(), f);
                select.push(format!("{} AS {}", expr, quoted(&alias)));
            }
        }

        let mut preds = Vec::new();
        {
            // Key columns live on the junction for many-to-many, on the target otherwise.
            let refs: Vec<&ResolvedField> = key_fields.iter().collect();
            let key_alias = if join_clause.is_empty() { MAIN_ALIAS } else { JUNCTION_ALIAS };
            preds.push(key_in_predicate(&mut q, key_alias, &refs, &keys));
        }
        if let Some(live) = live_rows_predicate(target, MAIN_ALIAS, false) {
            preds.push(live);
        }
        if let Some(w) = &opts.where_ {
            if let Some(p) = rt.compiler().compile(&mut q, w, &Scope::new(target, MAIN_ALIAS))? {
                preds.push(p);
            }
        }
        q.sql = format!(
            "SELECT {} FROM {}{} WHERE {} GROUP BY {}",
            select.join(", "),
            from,
            join_clause,
            preds.join(" AND "),
            key_exprs.join(", ")
        );
        for group in exec.fetch_all(&q).await? {
            let key_values: Vec<Value> = (0..key_exprs.len())
                .map(|i| group.get(&format!("__key{}", i)).cloned().unwrap_or(Value::Null))
                .collect();
            results.insert(key_string(&key_values), group);
        }
    }

    for row in rows.iter_mut() {
        let group = key_of(row, &local).and_then(|(k, _)| results.get(&k));
        row.insert(name.to_string(), Value::Object(aggregate_result(spec, group)));
    }
    Ok(())
}

fn aggregate_result(spec: &AggregateSpec, group: Option<&Record>) -> Record {
    let mut out = Record::new();
    if spec.count {
        let n = group.and_then(|g| g.get("_count")).cloned().unwrap_or(json!(0));
        out.insert("_count".into(), n);
    }
    for (func, fields) in [("sum", &spec.sum), ("avg", &spec.avg), ("min", &spec.min), ("max", &spec.max)] {
        if fields.is_empty() {
            continue;
        }
        let mut values = Record::new();
        for f in fields {
            let v = group
                .and_then(|g| g.get(&format!("_{}_{}", func, f)))
                .cloned()
                .unwrap_or(Value::Null);
            values.insert(f.clone(), v);
        }
        out.insert(format!("_{}", func), Value::Object(values));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve as resolve_configs, CollectionConfig, Registry};
    use crate::context::CrudContext;
    use crate::query::{AggregateSpec, OrderBy};
    use crate::store::mock::{rec, rows, MockDatabase, Reply};
    use crate::store::Database;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        let c: Vec<CollectionConfig> = serde_json::from_value(json!([
            {
                "name": "users",
                "idType": "serial",
                "fields": { "name": { "type": "text" } },
                "relations": {
                    "posts": { "kind": "many", "collection": "posts" },
                    "tags": {
                        "kind": "manyToMany", "through": "users_tags",
                        "sourceField": "user_id", "targetField": "tag_id", "collection": "tags"
                    }
                }
            },
            {
                "name": "posts",
                "idType": "serial",
                "fields": { "title": { "type": "text" }, "authorId": { "type": "integer" }, "likes": { "type": "integer" } },
                "relations": {
                    "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" }
                }
            },
            { "name": "tags", "idType": "serial", "fields": { "label": { "type": "text" } } },
            {
                "name": "comments",
                "idType": "serial",
                "fields": { "kind": { "type": "text" }, "refId": { "type": "text" } },
                "relations": {
                    "target": { "kind": "polymorphic", "typeField": "kind", "idField": "refId",
                                "collections": { "post": "posts", "user": "users" } }
                }
            }
        ]))
        .unwrap();
        resolve_configs(&c).unwrap()
    }

    fn rt<'a>(reg: &'a Registry, db: &'a MockDatabase, ctx: &'a CrudContext) -> Runtime<'a> {
        Runtime {
            registry: reg,
            db,
            ctx,
            max_depth: 16,
        }
    }

    #[tokio::test]
    async fn one_relation_is_a_single_batched_query() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("FROM \"public\".\"users\"") {
                rows(vec![json!({ "id": 1, "name": "Ann" }), json!({ "id": 2, "name": "Bob" })])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut posts: Vec<Record> = (0..10)
            .map(|i| rec(json!({ "id": i, "authorId": (i % 2) + 1 })))
            .collect();
        posts.push(rec(json!({ "id": 99, "authorId": null })));
        let with = With::new().include("author");
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("posts").unwrap(), &mut posts, &with, 0)
            .await
            .unwrap();
        assert_eq!(db.queries().len(), 1);
        assert!(db.sql()[0].contains("m.\"id\" IN ($1::bigint, $2::bigint)"));
        assert_eq!(posts[0]["author"]["name"], json!("Ann"));
        assert_eq!(posts[1]["author"]["name"], json!("Bob"));
        assert_eq!(posts[10]["author"], Value::Null);
    }

    #[tokio::test]
    async fn many_to_many_has_no_phantom_rows() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("\"users_tags\" AS j") {
                rows(vec![
                    json!({ "__source": 1, "__target": 10 }),
                    json!({ "__source": 1, "__target": 11 }),
                ])
            } else if sql.contains("FROM \"public\".\"tags\"") {
                rows(vec![json!({ "id": 10, "label": "a" }), json!({ "id": 11, "label": "b" })])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 })), rec(json!({ "id": 2 }))];
        let with = With::new().include("tags");
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert_eq!(users[0]["tags"].as_array().unwrap().len(), 2);
        assert_eq!(users[1]["tags"], json!([]));
        assert_eq!(db.queries().len(), 2);
    }

    fn tag_ids(v: &Value) -> Vec<i64> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_i64().unwrap())
            .collect()
    }

    fn tags_db() -> MockDatabase {
        MockDatabase::new(|sql, _| {
            if sql.contains("\"users_tags\" AS j") {
                rows(vec![
                    json!({ "__source": 1, "__target": 11 }),
                    json!({ "__source": 1, "__target": 10 }),
                    json!({ "__source": 1, "__target": 11 }),
                ])
            } else if sql.contains("FROM \"public\".\"tags\"") {
                rows(vec![json!({ "id": 10, "label": "a" }), json!({ "id": 11, "label": "b" })])
            } else {
                Reply::Rows(vec![])
            }
        })
    }

    #[tokio::test]
    async fn many_to_many_keeps_junction_order() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = tags_db();
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 }))];
        let with = With::new().include("tags");
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert_eq!(tag_ids(&users[0]["tags"]), vec![11, 10]);
        assert!(db.sql()[0].ends_with("ORDER BY j.\"user_id\", j.ctid"));
    }

    #[tokio::test]
    async fn many_to_many_order_by_follows_target_query() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = tags_db();
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 }))];
        let with = With::new().include_with(
            "tags",
            WithOptions {
                order_by: vec![OrderBy::asc("label")],
                ..Default::default()
            },
        );
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert_eq!(tag_ids(&users[0]["tags"]), vec![10, 11]);
    }

    #[tokio::test]
    async fn many_groups_children_by_foreign_key_in_one_query() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("FROM \"public\".\"posts\"") {
                rows(vec![
                    json!({ "id": 100, "authorId": 1 }),
                    json!({ "id": 101, "authorId": 2 }),
                    json!({ "id": 102, "authorId": 1 }),
                ])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 })), rec(json!({ "id": 2 })), rec(json!({ "id": 3 }))];
        let with = With::new().include("posts");
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert_eq!(db.queries().len(), 1);
        let sizes: Vec<usize> = users.iter().map(|u| u["posts"].as_array().unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1, 0]);
        assert_eq!(users[2]["posts"], json!([]));
    }

    #[tokio::test]
    async fn many_limit_and_offset_apply_per_parent() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("FROM \"public\".\"posts\"") {
                rows(vec![json!({ "id": 101, "authorId": 1 }), json!({ "id": 201, "authorId": 2 })])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 })), rec(json!({ "id": 2 }))];
        let with = With::new().include_with(
            "posts",
            WithOptions {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            },
        );
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        let sql = &db.sql()[0];
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY m.\"author_id\""));
        assert!(sql.contains("\"w\".\"__rn\" > 1 AND \"w\".\"__rn\" <= 2"));
        assert_eq!(users[0]["posts"][0]["id"], json!(101));
        assert_eq!(users[1]["posts"][0]["id"], json!(201));
        assert_eq!(db.queries().len(), 1);
    }

    #[tokio::test]
    async fn count_defaults_to_zero_for_parents_without_rows() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("GROUP BY") {
                rows(vec![json!({ "__key0": 1, "_count": 3 })])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 })), rec(json!({ "id": 2 }))];
        let with = With::new().include_with(
            "posts",
            WithOptions {
                aggregate: Some(AggregateSpec::count()),
                ..Default::default()
            },
        );
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert_eq!(users[0]["posts"], json!({ "_count": 3 }));
        assert_eq!(users[1]["posts"], json!({ "_count": 0 }));
        let sql = &db.sql()[0];
        assert!(sql.starts_with("SELECT m.\"author_id\" AS \"__key0\", COUNT(*) AS \"_count\" FROM \"public\".\"posts\" AS m"));
        assert!(sql.ends_with("GROUP BY m.\"author_id\""));
    }

    #[tokio::test]
    async fn sum_and_avg_are_cast_to_float8() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|_, _| Reply::Rows(vec![]));
        let mut conn = db.connection().await.unwrap();
        let mut users = vec![rec(json!({ "id": 1 }))];
        let spec = AggregateSpec {
            sum: vec!["likes".into()],
            avg: vec!["likes".into()],
            ..Default::default()
        };
        let with = With::new().include_with(
            "posts",
            WithOptions {
                aggregate: Some(spec),
                ..Default::default()
            },
        );
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut users, &with, 0)
            .await
            .unwrap();
        assert!(db.sql()[0].contains("SUM(m.\"likes\")::float8 AS \"_sum_likes\""));
        assert_eq!(users[0]["posts"], json!({ "_sum": { "likes": null }, "_avg": { "likes": null } }));
    }

    #[tokio::test]
    async fn polymorphic_partitions_by_type() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.contains("FROM \"public\".\"posts\"") {
                rows(vec![json!({ "id": 5, "title": "P" })])
            } else if sql.contains("FROM \"public\".\"users\"") {
                rows(vec![json!({ "id": 7, "name": "U" })])
            } else {
                Reply::Rows(vec![])
            }
        });
        let mut conn = db.connection().await.unwrap();
        let mut comments = vec![
            rec(json!({ "id": 1, "kind": "post", "refId": "5" })),
            rec(json!({ "id": 2, "kind": "user", "refId": "7" })),
            rec(json!({ "id": 3, "kind": "video", "refId": "9" })),
        ];
        let with = With::new().include("target");
        resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("comments").unwrap(), &mut comments, &with, 0)
            .await
            .unwrap();
        assert_eq!(comments[0]["target"]["title"], json!("P"));
        assert_eq!(comments[1]["target"]["name"], json!("U"));
        assert_eq!(comments[2]["target"], Value::Null);
        assert_eq!(db.queries().len(), 2);
    }

    #[tokio::test]
    async fn unknown_relation_is_bad_request() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|_, _| Reply::Rows(vec![]));
        let mut conn = db.connection().await.unwrap();
        let mut rows_ = vec![rec(json!({ "id": 1 }))];
        let with = With::new().include("nope");
        let err = resolve(rt(&reg, &db, &ctx), &mut *conn, reg.get("users").unwrap(), &mut rows_, &with, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}

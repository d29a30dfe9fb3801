//! Nested relation writes inside a create or update payload:
//! `{ "author": { "connect": 7 } }`, `{ "tags": { "connectOrCreate": [{ "where": {...}, "create": {...} }] } }`.
//!
//! Singular relations (one, polymorphic) are written before the main row so their keys can be
//! stored on it; plural relations (many, manyToMany) after it, keyed by the parent.

use crate::config::{FieldType, Relation, ResolvedCollection, ResolvedField, ID_FIELD};
use crate::context::{Operation, Record};
use crate::error::AppError;
use crate::service::hooks::{HookArgs, HookPoint};
use crate::service::reader::{self, ReadPlan};
use crate::service::writer::{insert_record, set_value, update_record, FieldValues};
use crate::service::Runtime;
use crate::sql::where_clause::Where;
use crate::sql::{json_to_text, quoted, QueryBuf, Window};
use crate::store::Executor;
use serde_json::Value;

#[derive(Debug)]
enum NestedOp {
    /// Scalar id or an object of field equalities.
    Connect(Value),
    Create(Record),
    ConnectOrCreate { where_: Value, create: Record },
}

fn as_record(relation: &str, v: &Value) -> Result<Record, AppError> {
    match v {
        Value::Object(m) => Ok(m.clone()),
        _ => Err(AppError::BadRequest(format!("'{}': create data must be an object", relation))),
    }
}

fn parse_op(relation: &str, key: &str, v: &Value) -> Result<NestedOp, AppError> {
    match key {
        "connect" => Ok(NestedOp::Connect(v.clone())),
        "create" => Ok(NestedOp::Create(as_record(relation, v)?)),
        "connectOrCreate" => {
            let obj = as_record(relation, v)?;
            let where_ = obj
                .get("where")
                .cloned()
                .ok_or_else(|| AppError::BadRequest(format!("'{}': connectOrCreate needs 'where'", relation)))?;
            let create = as_record(relation, obj.get("create").unwrap_or(&Value::Null))?;
            Ok(NestedOp::ConnectOrCreate { where_, create })
        }
        other => Err(AppError::BadRequest(format!(
            "'{}': unknown nested operation '{}'",
            relation, other
        ))),
    }
}

/// Parse `{ connect | create | connectOrCreate, type? }`. Plural relations accept arrays.
fn parse_ops(relation: &str, v: &Value, plural: bool) -> Result<(Option<String>, Vec<NestedOp>), AppError> {
    let Value::Object(map) = v else {
        return Err(AppError::BadRequest(format!(
            "'{}': nested write must be an object",
            relation
        )));
    };
    let mut type_value = None;
    let mut ops = Vec::new();
    for (key, value) in map {
        if key == "type" {
            type_value = value.as_str().map(str::to_string);
            continue;
        }
        match value {
            Value::Array(items) if plural => {
                for item in items {
                    ops.push(parse_op(relation, key, item)?);
                }
            }
            _ => ops.push(parse_op(relation, key, value)?),
        }
    }
    if !plural && ops.len() != 1 {
        return Err(AppError::BadRequest(format!(
            "'{}': a singular relation takes exactly one nested operation",
            relation
        )));
    }
    Ok((type_value, ops))
}

fn selector(v: &Value) -> Where {
    match v {
        Value::Object(m) => Where::and(m.iter().map(|(k, v)| Where::eq(k, v.clone())).collect()),
        scalar => Where::eq(ID_FIELD, scalar.clone()),
    }
}

async fn find_target(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    sel: &Value,
) -> Result<Option<Record>, AppError> {
    let plan = ReadPlan {
        filter: Some(selector(sel)),
        columns: None,
        extra_fields: Vec::new(),
        order_by: &[],
        window: Window::Page {
            limit: Some(1),
            offset: 0,
        },
        include_deleted: false,
    };
    Ok(reader::load_rows(rt, exec, target, &plan).await?.into_iter().next())
}

/// Nested targets run their change hooks inside the parent's transaction.
async fn run_target_hook(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    point: HookPoint,
    operation: Operation,
    data: Option<&Record>,
    input: &mut Record,
) -> Result<(), AppError> {
    if !target.hooks.has(point) {
        return Ok(());
    }
    let mut args = HookArgs {
        operation,
        data,
        input,
        context: rt.ctx,
        db: exec,
    };
    target.hooks.run(point, &mut args).await
}

async fn load_written(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    id: &Value,
) -> Result<Record, AppError> {
    reader::load_by_id(rt, exec, target, id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("written '{}' row not readable", target.name)))
}

async fn create_target(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    data: &Record,
) -> Result<Record, AppError> {
    let enforcer = rt.enforcer(target);
    enforcer.require(Operation::Create, &target.name, None, Some(data)).await?;
    let mut input = data.clone();
    run_target_hook(rt, exec, target, HookPoint::BeforeChange, Operation::Create, None, &mut input).await?;
    enforcer.validate_writeable_fields(Operation::Create, &input, None).await?;
    let id = insert_record(rt, exec, target, &input, false).await?;
    let row = load_written(rt, exec, target, &id).await?;
    run_target_hook(rt, exec, target, HookPoint::AfterChange, Operation::Create, Some(&row), &mut input).await?;
    Ok(row)
}

/// Rewrite the foreign key of an existing target through the regular update path.
async fn repoint_target(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    target: &ResolvedCollection,
    row: &Record,
    changes: Record,
) -> Result<(), AppError> {
    let target_id = row.get(ID_FIELD).cloned().unwrap_or(Value::Null);
    let enforcer = rt.enforcer(target);
    enforcer
        .require(Operation::Update, &target.name, Some(row), Some(&changes))
        .await?;
    let mut input = changes;
    run_target_hook(rt, exec, target, HookPoint::BeforeChange, Operation::Update, Some(row), &mut input).await?;
    enforcer
        .validate_writeable_fields(Operation::Update, &input, Some(row))
        .await?;
    update_record(rt, exec, target, &target_id, &input).await?;
    if target.hooks.has(HookPoint::AfterChange) {
        let written = load_written(rt, exec, target, &target_id).await?;
        run_target_hook(rt, exec, target, HookPoint::AfterChange, Operation::Update, Some(&written), &mut input)
            .await?;
    }
    Ok(())
}

/// Resolve one op to an existing or newly created target row.
async fn target_row(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    relation: &str,
    target: &ResolvedCollection,
    op: &NestedOp,
) -> Result<(Record, bool), AppError> {
    match op {
        NestedOp::Connect(sel) => find_target(rt, exec, target, sel)
            .await?
            .map(|r| (r, false))
            .ok_or_else(|| AppError::BadRequest(format!("'{}': connect target not found in '{}'", relation, target.name))),
        NestedOp::Create(data) => Ok((create_target(rt, exec, target, data).await?, true)),
        NestedOp::ConnectOrCreate { where_, create } => match find_target(rt, exec, target, where_).await? {
            Some(r) => Ok((r, false)),
            None => Ok((create_target(rt, exec, target, create).await?, true)),
        },
    }
}

/// Singular relations: write or find the target, then store its key on the main row values.
pub(crate) async fn apply_before<'c>(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &'c ResolvedCollection,
    relations: &[(&'c str, &'c Relation, Value)],
    main: &mut FieldValues<'c>,
) -> Result<(), AppError> {
    for (name, relation, value) in relations {
        match relation {
            Relation::One { local, remote, collection } => {
                let target = rt.registry.require(collection)?;
                let (_, ops) = parse_ops(name, value, false)?;
                let (row, _) = target_row(rt, exec, name, target, &ops[0]).await?;
                for (l, r) in local.iter().zip(remote) {
                    let field = coll.field_or_bad_request(l)?;
                    set_value(main, field, row.get(r).cloned().unwrap_or(Value::Null));
                }
            }
            Relation::Polymorphic {
                type_field,
                id_field,
                collections,
            } => {
                let (type_value, ops) = parse_ops(name, value, false)?;
                let type_value = type_value
                    .ok_or_else(|| AppError::BadRequest(format!("'{}': polymorphic writes need 'type'", name)))?;
                let collection = collections.get(&type_value).ok_or_else(|| {
                    AppError::BadRequest(format!("'{}': unknown type '{}'", name, type_value))
                })?;
                let target = rt.registry.require(collection)?;
                let (row, _) = target_row(rt, exec, name, target, &ops[0]).await?;
                let id = row.get(ID_FIELD).cloned().unwrap_or(Value::Null);
                let id_f = coll.field_or_bad_request(id_field)?;
                let id = if id_f.type_ == FieldType::Text && !id.is_null() {
                    Value::String(json_to_text(&id))
                } else {
                    id
                };
                set_value(main, coll.field_or_bad_request(type_field)?, Value::String(type_value));
                set_value(main, id_f, id);
            }
            _ => {}
        }
    }
    Ok(())
}

fn junction_insert(
    through: &str,
    source_column: &str,
    target_column: &str,
    source: (&Value, &ResolvedField),
    target: (&Value, &ResolvedField),
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let s = q.bind_field(source.0, source.1);
    let t = q.bind_field(target.0, target.1);
    q.sql = format!(
        "INSERT INTO {} ({}, {}) VALUES ({}, {}) ON CONFLICT DO NOTHING",
        through,
        quoted(source_column),
        quoted(target_column),
        s,
        t
    );
    q
}

/// Plural relations: point targets at the (already written) parent row.
pub(crate) async fn apply_after(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    relations: &[(&str, &Relation, Value)],
    parent: &Record,
) -> Result<(), AppError> {
    for (name, relation, value) in relations {
        match relation {
            Relation::Many { local, remote, collection } => {
                let target = rt.registry.require(collection)?;
                let (_, ops) = parse_ops(name, value, true)?;
                let keys: Vec<(&ResolvedField, Value)> = local
                    .iter()
                    .zip(remote)
                    .map(|(l, r)| Ok((target.field_or_bad_request(r)?, parent.get(l).cloned().unwrap_or(Value::Null))))
                    .collect::<Result<_, AppError>>()?;
                for op in &ops {
                    let op = match op {
                        NestedOp::Create(data) => {
                            let mut data = data.clone();
                            for (f, v) in &keys {
                                data.insert(f.name.clone(), v.clone());
                            }
                            NestedOp::Create(data)
                        }
                        NestedOp::ConnectOrCreate { where_, create } => {
                            let mut create = create.clone();
                            for (f, v) in &keys {
                                create.insert(f.name.clone(), v.clone());
                            }
                            NestedOp::ConnectOrCreate {
                                where_: where_.clone(),
                                create,
                            }
                        }
                        NestedOp::Connect(sel) => NestedOp::Connect(sel.clone()),
                    };
                    let (row, created) = target_row(rt, exec, name, target, &op).await?;
                    if created {
                        continue;
                    }
                    let mut changes = Record::new();
                    for (f, v) in &keys {
                        changes.insert(f.name.clone(), v.clone());
                    }
                    repoint_target(rt, exec, target, &row, changes).await?;
                }
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
                let (_, ops) = parse_ops(name, value, true)?;
                let sk = coll.field_or_bad_request(source_key)?;
                let tk = target.field_or_bad_request(target_key)?;
                let source_value = parent.get(source_key).cloned().unwrap_or(Value::Null);
                for op in &ops {
                    let (row, _) = target_row(rt, exec, name, target, op).await?;
                    let target_value = row.get(target_key).cloned().unwrap_or(Value::Null);
                    let q = junction_insert(through, source_column, target_column, (&source_value, sk), (&target_value, tk));
                    tracing::debug!(relation = %name, through = %through, "link");
                    exec.execute(&q).await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CollectionConfig, Registry};
    use crate::context::CrudContext;
    use crate::store::mock::{rec, rows, MockDatabase, Reply};
    use crate::store::Database;
    use serde_json::json;

    fn registry() -> Registry {
        let c: Vec<CollectionConfig> = serde_json::from_value(json!([
            {
                "name": "users",
                "idType": "serial",
                "fields": { "email": { "type": "text" } },
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
                "fields": { "title": { "type": "text" }, "authorId": { "type": "integer" } },
                "options": { "versioning": true },
                "relations": {
                    "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" }
                }
            },
            { "name": "tags", "idType": "serial", "fields": { "label": { "type": "text" } } }
        ]))
        .unwrap();
        resolve(&c).unwrap()
    }

    #[test]
    fn singular_relations_take_one_operation() {
        assert!(parse_ops("author", &json!({ "connect": 1, "create": {} }), false).is_err());
        assert!(parse_ops("author", &json!({ "disconnect": true }), false).is_err());
        let (_, ops) = parse_ops("tags", &json!({ "connect": [1, 2], "create": { "label": "x" } }), true).unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[tokio::test]
    async fn connect_to_missing_target_is_bad_request() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|_, _| Reply::Rows(vec![]));
        let rt = Runtime {
            registry: &reg,
            db: &db,
            ctx: &ctx,
            max_depth: 16,
        };
        let mut tx = db.begin().await.unwrap();
        let posts = reg.get("posts").unwrap();
        let rel = posts.relation("author").unwrap();
        let mut main = Vec::new();
        let err = apply_before(rt, &mut *tx, posts, &[("author", rel, json!({ "connect": 404 }))], &mut main)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn many_to_many_links_connected_and_created_targets() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.starts_with("INSERT INTO \"public\".\"tags\"") {
                rows(vec![json!({ "id": 12 })])
            } else if sql.starts_with("SELECT") {
                rows(vec![json!({ "id": 11, "label": "a" })])
            } else {
                Reply::Affected(1)
            }
        });
        let rt = Runtime {
            registry: &reg,
            db: &db,
            ctx: &ctx,
            max_depth: 16,
        };
        let mut tx = db.begin().await.unwrap();
        let users = reg.get("users").unwrap();
        let rel = users.relation("tags").unwrap();
        let parent = rec(json!({ "id": 1 }));
        apply_after(
            rt,
            &mut *tx,
            users,
            &[("tags", rel, json!({ "connect": 11, "create": { "label": "b" } }))],
            &parent,
        )
        .await
        .unwrap();
        let links: Vec<_> = db
            .queries()
            .into_iter()
            .filter(|l| l.sql.starts_with("INSERT INTO \"public\".\"users_tags\""))
            .collect();
        assert_eq!(links.len(), 2);
        assert!(links[0].sql.ends_with("VALUES ($1::bigint, $2::bigint) ON CONFLICT DO NOTHING"));
    }

    #[tokio::test]
    async fn many_connect_points_the_foreign_key_at_the_parent() {
        let reg = registry();
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.starts_with("SELECT COALESCE") {
                rows(vec![json!({ "next": 2 })])
            } else if sql.starts_with("SELECT") {
                rows(vec![json!({ "id": 70, "title": "t", "authorId": null })])
            } else {
                rows(vec![json!({ "id": 70 })])
            }
        });
        let rt = Runtime {
            registry: &reg,
            db: &db,
            ctx: &ctx,
            max_depth: 16,
        };
        let mut tx = db.begin().await.unwrap();
        let users = reg.get("users").unwrap();
        let rel = users.relation("posts").unwrap();
        apply_after(rt, &mut *tx, users, &[("posts", rel, json!({ "connect": 70 }))], &rec(json!({ "id": 3 })))
            .await
            .unwrap();
        let sql = db.sql();
        assert!(sql[1].starts_with("UPDATE \"public\".\"posts\" SET \"author_id\" = $1::bigint"));
        assert!(sql.iter().any(|s| s.starts_with("INSERT INTO \"public\".\"posts_versions\"")));
        assert!(db.queries().iter().all(|q| q.in_tx));
    }

    struct Stamp;

    #[async_trait::async_trait]
    impl crate::service::hooks::Hook for Stamp {
        async fn run(&self, args: &mut HookArgs<'_>) -> Result<(), AppError> {
            args.input.insert("title".into(), json!("stamped"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn connected_targets_run_their_change_hooks() {
        let mut reg = registry();
        reg.get_mut("posts")
            .unwrap()
            .add_hook(HookPoint::BeforeChange, std::sync::Arc::new(Stamp));
        let ctx = CrudContext::system();
        let db = MockDatabase::new(|sql, _| {
            if sql.starts_with("SELECT COALESCE") {
                rows(vec![json!({ "next": 1 })])
            } else if sql.starts_with("SELECT") {
                rows(vec![json!({ "id": 70, "title": "t", "authorId": null })])
            } else {
                rows(vec![json!({ "id": 70 })])
            }
        });
        let rt = Runtime {
            registry: &reg,
            db: &db,
            ctx: &ctx,
            max_depth: 16,
        };
        let mut tx = db.begin().await.unwrap();
        let users = reg.get("users").unwrap();
        let rel = users.relation("posts").unwrap();
        apply_after(rt, &mut *tx, users, &[("posts", rel, json!({ "connect": 70 }))], &rec(json!({ "id": 3 })))
            .await
            .unwrap();
        let update = db
            .sql()
            .into_iter()
            .find(|s| s.starts_with("UPDATE \"public\".\"posts\""))
            .unwrap();
        assert!(update.contains("\"title\" = "));
    }
}

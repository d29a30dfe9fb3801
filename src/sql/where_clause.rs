//! Compiles a declarative filter tree into a parameterized SQL predicate.
//!
//! Field keys compare columns; relation keys become correlated `EXISTS` subqueries
//! over the related table. Every value is bound as a parameter.

use crate::config::topology::{col, I18N_PARENT_COLUMN, LOCALE_COLUMN};
use crate::config::{FieldType, Registry, Relation, ResolvedCollection, ResolvedField};
use crate::error::AppError;
use crate::sql::builder::{field_expr, i18n_alias, QueryBuf};
use crate::sql::params::PgBindValue;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Default nesting limit for filters and includes.
pub const MAX_DEPTH: usize = 16;

const OPERATORS: &[&str] = &[
    "eq",
    "ne",
    "gt",
    "gte",
    "lt",
    "lte",
    "in",
    "notIn",
    "like",
    "ilike",
    "notLike",
    "notIlike",
    "contains",
    "startsWith",
    "endsWith",
    "isNull",
    "isNotNull",
    "arrayOverlaps",
    "arrayContains",
    "arrayContained",
];

const QUANTIFIERS: &[&str] = &["is", "isNot", "some", "none", "every"];

/// Table a raw predicate is evaluated against.
pub struct TableRef<'a> {
    pub alias: &'a str,
    pub table: &'a str,
    pub collection: &'a str,
}

type RawFn = dyn Fn(&TableRef<'_>, &mut QueryBuf) -> String + Send + Sync;

/// Caller-supplied SQL fragment. The closure must bind values through the `QueryBuf`.
#[derive(Clone)]
pub struct RawPredicate(Arc<RawFn>);

impl RawPredicate {
    pub fn new(f: impl Fn(&TableRef<'_>, &mut QueryBuf) -> String + Send + Sync + 'static) -> Self {
        RawPredicate(Arc::new(f))
    }
}

impl fmt::Debug for RawPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawPredicate(..)")
    }
}

#[derive(Clone, Debug)]
pub enum Where {
    And(Vec<Where>),
    Or(Vec<Where>),
    Not(Box<Where>),
    Raw(RawPredicate),
    /// Field or relation key, decided against the schema at compile time.
    Key(String, Value),
    Relation(String, RelationFilter),
}

#[derive(Clone, Debug)]
pub enum RelationFilter {
    /// Singular: related row exists and matches; `None` means no related row.
    Is(Option<Box<Where>>),
    IsNot(Option<Box<Where>>),
    /// Plural quantifiers.
    AnyMatch(Box<Where>),
    NoneMatch(Box<Where>),
    EveryMatch(Box<Where>),
    /// Bare nested filter: some related row matches.
    Matches(Box<Where>),
}

impl RelationFilter {
    fn from_json(v: &Value, plural: bool) -> Result<Vec<RelationFilter>, AppError> {
        let nested = |v: &Value| Where::from_json(v).map(Box::new);
        match v {
            Value::Null if !plural => Ok(vec![RelationFilter::Is(None)]),
            Value::Object(map) if map.keys().any(|k| QUANTIFIERS.contains(&k.as_str())) => {
                let mut out = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let filter = match (k.as_str(), v) {
                        ("is", Value::Null) => RelationFilter::Is(None),
                        ("isNot", Value::Null) => RelationFilter::IsNot(None),
                        ("is", v) => RelationFilter::Is(Some(nested(v)?)),
                        ("isNot", v) => RelationFilter::IsNot(Some(nested(v)?)),
                        ("some", v) => RelationFilter::AnyMatch(nested(v)?),
                        ("none", v) => RelationFilter::NoneMatch(nested(v)?),
                        ("every", v) => RelationFilter::EveryMatch(nested(v)?),
                        (other, _) => {
                            return Err(AppError::BadRequest(format!(
                                "'{}' cannot be mixed with relation quantifiers",
                                other
                            )))
                        }
                    };
                    out.push(filter);
                }
                Ok(out)
            }
            Value::Object(_) => Ok(vec![RelationFilter::Matches(nested(v)?)]),
            _ => Err(AppError::BadRequest("relation filter must be an object".into())),
        }
    }

    fn check_arity(&self, relation: &str, plural: bool) -> Result<(), AppError> {
        let ok = match self {
            RelationFilter::Is(_) | RelationFilter::IsNot(_) => !plural,
            RelationFilter::AnyMatch(_) | RelationFilter::NoneMatch(_) | RelationFilter::EveryMatch(_) => plural,
            RelationFilter::Matches(_) => true,
        };
        if ok {
            Ok(())
        } else if plural {
            Err(AppError::BadRequest(format!(
                "relation '{}' is plural; use some, none or every",
                relation
            )))
        } else {
            Err(AppError::BadRequest(format!("relation '{}' is singular; use is or isNot", relation)))
        }
    }
}

impl Where {
    pub fn and(items: Vec<Where>) -> Self {
        Where::And(items)
    }

    pub fn or(items: Vec<Where>) -> Self {
        Where::Or(items)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Where) -> Self {
        Where::Not(Box::new(inner))
    }

    /// Scalar equality (or `IS NULL` for null).
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Where::Key(field.to_string(), value.into())
    }

    /// `{ field: { op: value } }`.
    pub fn op(field: &str, op: &str, value: impl Into<Value>) -> Self {
        let mut ops = serde_json::Map::new();
        ops.insert(op.to_string(), value.into());
        Where::Key(field.to_string(), Value::Object(ops))
    }

    pub fn relation(name: &str, filter: RelationFilter) -> Self {
        Where::Relation(name.to_string(), filter)
    }

    pub fn raw(f: impl Fn(&TableRef<'_>, &mut QueryBuf) -> String + Send + Sync + 'static) -> Self {
        Where::Raw(RawPredicate::new(f))
    }

    /// `{ "AND": [...], "OR": [...], "NOT": {...}, key: value, ... }`; sibling keys are ANDed.
    pub fn from_json(v: &Value) -> Result<Where, AppError> {
        match v {
            Value::Array(items) => Ok(Where::And(items.iter().map(Where::from_json).collect::<Result<_, _>>()?)),
            Value::Object(map) => {
                let mut parts = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let part = match k.as_str() {
                        "AND" => match v {
                            Value::Array(items) => {
                                Where::And(items.iter().map(Where::from_json).collect::<Result<_, _>>()?)
                            }
                            other => Where::from_json(other)?,
                        },
                        "OR" => match v {
                            Value::Array(items) => {
                                Where::Or(items.iter().map(Where::from_json).collect::<Result<_, _>>()?)
                            }
                            _ => return Err(AppError::BadRequest("OR must be an array".into())),
                        },
                        "NOT" => Where::not(Where::from_json(v)?),
                        _ => Where::Key(k.clone(), v.clone()),
                    };
                    parts.push(part);
                }
                Ok(if parts.len() == 1 {
                    parts.remove(0)
                } else {
                    Where::And(parts)
                })
            }
            _ => Err(AppError::BadRequest("where must be an object or array".into())),
        }
    }
}

/// Rows a predicate is compiled against: `alias` for main-table columns, and the
/// i18n join (if any) for localized columns.
#[derive(Clone, Debug)]
pub struct Scope<'a> {
    pub collection: &'a ResolvedCollection,
    pub alias: String,
}

impl<'a> Scope<'a> {
    pub fn new(collection: &'a ResolvedCollection, alias: &str) -> Self {
        Scope {
            collection,
            alias: alias.to_string(),
        }
    }
}

pub struct WhereCompiler<'a> {
    registry: &'a Registry,
    locale: &'a str,
    max_depth: usize,
    next_alias: usize,
}

impl<'a> WhereCompiler<'a> {
    /// `locale` is the locale used for i18n joins inside relation subqueries.
    pub fn new(registry: &'a Registry, locale: &'a str) -> Self {
        WhereCompiler {
            registry,
            locale,
            max_depth: MAX_DEPTH,
            next_alias: 0,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Compile `w`. `None` means the filter imposes no condition.
    pub fn compile(&mut self, q: &mut QueryBuf, w: &Where, scope: &Scope<'_>) -> Result<Option<String>, AppError> {
        self.node(q, w, scope, 0)
    }

    fn node(&mut self, q: &mut QueryBuf, w: &Where, scope: &Scope<'_>, depth: usize) -> Result<Option<String>, AppError> {
        if depth > self.max_depth {
            return Err(AppError::BadRequest(format!(
                "where clause nested deeper than {}",
                self.max_depth
            )));
        }
        match w {
            Where::And(items) => self.join(q, items, " AND ", scope, depth),
            Where::Or(items) => self.join(q, items, " OR ", scope, depth),
            Where::Not(inner) => Ok(self.node(q, inner, scope, depth + 1)?.map(|p| format!("NOT ({})", p))),
            Where::Raw(raw) => {
                let table = scope.collection.topology.main_table();
                let t = TableRef {
                    alias: &scope.alias,
                    table: &table,
                    collection: &scope.collection.name,
                };
                Ok(Some(format!("({})", (raw.0)(&t, q))))
            }
            Where::Key(key, value) => {
                let coll = scope.collection;
                if let Some(field) = coll.field(key) {
                    self.field(q, field, value, scope).map(Some)
                } else if let Some(relation) = coll.relation(key) {
                    let filters = RelationFilter::from_json(value, relation.is_plural())?;
                    let mut parts = Vec::with_capacity(filters.len());
                    for f in &filters {
                        if let Some(p) = self.relation(q, key, relation, f, scope, depth)? {
                            parts.push(p);
                        }
                    }
                    Ok(combine(parts, " AND "))
                } else {
                    Err(AppError::BadRequest(format!(
                        "unknown field or relation '{}' on '{}'",
                        key, coll.name
                    )))
                }
            }
            Where::Relation(name, filter) => {
                let relation = scope.collection.relation(name).ok_or_else(|| {
                    AppError::BadRequest(format!("unknown relation '{}' on '{}'", name, scope.collection.name))
                })?;
                self.relation(q, name, relation, filter, scope, depth)
            }
        }
    }

    fn join(
        &mut self,
        q: &mut QueryBuf,
        items: &[Where],
        sep: &str,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<Option<String>, AppError> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            if let Some(p) = self.node(q, item, scope, depth + 1)? {
                parts.push(p);
            }
        }
        Ok(combine(parts, sep))
    }

    fn field(
        &mut self,
        q: &mut QueryBuf,
        field: &ResolvedField,
        value: &Value,
        scope: &Scope<'_>,
    ) -> Result<String, AppError> {
        if field.localized && scope.collection.topology.i18n.is_none() {
            return Err(AppError::Internal(format!("localized field '{}' without i18n table", field.name)));
        }
        let expr = field_expr(field, &scope.alias);
        match value {
            Value::Object(ops) if ops.keys().any(|k| OPERATORS.contains(&k.as_str())) => {
                let mut parts = Vec::with_capacity(ops.len());
                for (op, v) in ops {
                    if let Some(p) = operator(q, field, &expr, op, v)? {
                        parts.push(p);
                    }
                }
                Ok(combine(parts, " AND ").unwrap_or_else(|| "TRUE".into()))
            }
            Value::Object(_) if field.type_ != FieldType::Json => Err(AppError::BadRequest(format!(
                "invalid filter for field '{}'",
                field.name
            ))),
            Value::Null => Ok(format!("{} IS NULL", expr)),
            v => Ok(format!("{} = {}", expr, q.bind_field(v, field))),
        }
    }

    fn relation(
        &mut self,
        q: &mut QueryBuf,
        name: &str,
        relation: &Relation,
        filter: &RelationFilter,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<Option<String>, AppError> {
        filter.check_arity(name, relation.is_plural())?;
        let (nested, negate_nested, negate_exists) = match filter {
            RelationFilter::Is(n) => (n.as_deref(), false, n.is_none()),
            RelationFilter::IsNot(n) => (n.as_deref(), false, n.is_some()),
            RelationFilter::AnyMatch(n) | RelationFilter::Matches(n) => (Some(n.as_ref()), false, false),
            RelationFilter::NoneMatch(n) => (Some(n.as_ref()), false, true),
            RelationFilter::EveryMatch(n) => (Some(n.as_ref()), true, true),
        };
        let exists = self.exists(q, relation, scope, nested, negate_nested, depth)?;
        Ok(match exists {
            None => None,
            Some(e) if negate_exists => Some(format!("NOT {}", e)),
            Some(e) => Some(e),
        })
    }

    fn fresh_alias(&mut self) -> String {
        self.next_alias += 1;
        format!("r{}", self.next_alias)
    }

    /// `LEFT JOIN` of the target's i18n table under the subquery alias, in the request locale.
    fn i18n_join(&self, q: &mut QueryBuf, target: &ResolvedCollection, alias: &str) -> String {
        match target.topology.i18n_table() {
            Some(table) => {
                let ia = i18n_alias(alias);
                format!(
                    " LEFT JOIN {} AS {} ON {} = {} AND {} = {}",
                    table,
                    ia,
                    col(&ia, I18N_PARENT_COLUMN),
                    col(alias, &target.id_field().column),
                    col(&ia, LOCALE_COLUMN),
                    q.bind_text(self.locale)
                )
            }
            None => String::new(),
        }
    }

    /// Correlated `EXISTS (...)`. Returns `None` when the condition is vacuous
    /// (an `every` whose nested filter imposes nothing).
    fn exists(
        &mut self,
        q: &mut QueryBuf,
        relation: &Relation,
        scope: &Scope<'_>,
        nested: Option<&Where>,
        negate_nested: bool,
        depth: usize,
    ) -> Result<Option<String>, AppError> {
        let source = scope.collection;
        match relation {
            Relation::One { local, remote, collection } | Relation::Many { local, remote, collection } => {
                let target = self.registry.require(collection)?;
                let alias = self.fresh_alias();
                let join = self.i18n_join(q, target, &alias);
                let mut conds = Vec::with_capacity(local.len() + 1);
                for (l, r) in local.iter().zip(remote) {
                    let lf = source.field_or_bad_request(l)?;
                    let rf = target.field_or_bad_request(r)?;
                    conds.push(format!("{} = {}", field_expr(rf, &alias), field_expr(lf, &scope.alias)));
                }
                let Some(conds) = self.with_nested(q, conds, target, &alias, nested, negate_nested, depth)? else {
                    return Ok(None);
                };
                Ok(Some(format!(
                    "EXISTS (SELECT 1 FROM {} AS {}{} WHERE {})",
                    target.topology.main_table(),
                    alias,
                    join,
                    conds
                )))
            }
            Relation::ManyToMany {
                through,
                source_key,
                source_column,
                target_key,
                target_column,
                collection,
            } => {
                let target = self.registry.require(collection)?;
                let alias = self.fresh_alias();
                let junction = format!("{}j", alias);
                let sk = source.field_or_bad_request(source_key)?;
                let tk = target.field_or_bad_request(target_key)?;
                let join = self.i18n_join(q, target, &alias);
                let conds = vec![format!("{} = {}", col(&junction, source_column), field_expr(sk, &scope.alias))];
                let Some(conds) = self.with_nested(q, conds, target, &alias, nested, negate_nested, depth)? else {
                    return Ok(None);
                };
                Ok(Some(format!(
                    "EXISTS (SELECT 1 FROM {} AS {} JOIN {} AS {} ON {} = {}{} WHERE {})",
                    through,
                    junction,
                    target.topology.main_table(),
                    alias,
                    field_expr(tk, &alias),
                    col(&junction, target_column),
                    join,
                    conds
                )))
            }
            Relation::Polymorphic {
                type_field,
                id_field,
                collections,
            } => {
                let tf = source.field_or_bad_request(type_field)?;
                let idf = source.field_or_bad_request(id_field)?;
                let mut branches = Vec::with_capacity(collections.len());
                for (type_value, collection) in collections {
                    let target = self.registry.require(collection)?;
                    let alias = self.fresh_alias();
                    let type_ph = format!("${}", q.push_param(PgBindValue::String(type_value.clone())));
                    let join = self.i18n_join(q, target, &alias);
                    let conds = vec![format!(
                        "{}::text = {}::text",
                        col(&alias, &target.id_field().column),
                        field_expr(idf, &scope.alias)
                    )];
                    let Some(conds) = self.with_nested(q, conds, target, &alias, nested, negate_nested, depth)? else {
                        return Ok(None);
                    };
                    branches.push(format!(
                        "({} = {}::text AND EXISTS (SELECT 1 FROM {} AS {}{} WHERE {}))",
                        field_expr(tf, &scope.alias),
                        type_ph,
                        target.topology.main_table(),
                        alias,
                        join,
                        conds
                    ));
                }
                Ok(combine(branches, " OR "))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn with_nested(
        &mut self,
        q: &mut QueryBuf,
        mut conds: Vec<String>,
        target: &ResolvedCollection,
        alias: &str,
        nested: Option<&Where>,
        negate_nested: bool,
        depth: usize,
    ) -> Result<Option<String>, AppError> {
        if let Some(n) = nested {
            let inner_scope = Scope::new(target, alias);
            match self.node(q, n, &inner_scope, depth + 1)? {
                Some(p) if negate_nested => conds.push(format!("NOT ({})", p)),
                Some(p) => conds.push(format!("({})", p)),
                None if negate_nested => return Ok(None),
                None => {}
            }
        }
        Ok(Some(conds.join(" AND ")))
    }
}

fn combine(parts: Vec<String>, sep: &str) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(format!("({})", parts.join(sep))),
    }
}

/// Escape LIKE metacharacters so user text matches literally.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn text_expr(field: &ResolvedField, expr: &str) -> String {
    if field.type_ == FieldType::Text {
        expr.to_string()
    } else {
        format!("{}::text", expr)
    }
}

fn operator(
    q: &mut QueryBuf,
    field: &ResolvedField,
    expr: &str,
    op: &str,
    v: &Value,
) -> Result<Option<String>, AppError> {
    let bad = |msg: &str| AppError::BadRequest(format!("{} ('{}' on '{}')", msg, op, field.name));
    let cmp = |q: &mut QueryBuf, sym: &str| format!("{} {} {}", expr, sym, q.bind_field(v, field));
    Ok(Some(match op {
        "eq" if v.is_null() => format!("{} IS NULL", expr),
        "ne" if v.is_null() => format!("{} IS NOT NULL", expr),
        "eq" => cmp(q, "="),
        "ne" => cmp(q, "<>"),
        "gt" => cmp(q, ">"),
        "gte" => cmp(q, ">="),
        "lt" => cmp(q, "<"),
        "lte" => cmp(q, "<="),
        "in" | "notIn" => {
            let Value::Array(items) = v else {
                return Err(bad("expected an array"));
            };
            let items: Vec<&Value> = items.iter().filter(|i| !i.is_null()).collect();
            if items.is_empty() {
                return Ok(if op == "in" { Some("FALSE".into()) } else { None });
            }
            let phs: Vec<String> = items.iter().map(|i| q.bind_field(i, field)).collect();
            let kw = if op == "in" { "IN" } else { "NOT IN" };
            format!("{} {} ({})", expr, kw, phs.join(", "))
        }
        "like" | "ilike" | "notLike" | "notIlike" => {
            let Some(pattern) = v.as_str() else {
                return Err(bad("expected a string"));
            };
            let kw = match op {
                "like" => "LIKE",
                "ilike" => "ILIKE",
                "notLike" => "NOT LIKE",
                _ => "NOT ILIKE",
            };
            format!("{} {} {}", text_expr(field, expr), kw, q.bind_text(pattern))
        }
        "contains" | "startsWith" | "endsWith" => {
            let Some(s) = v.as_str() else {
                return Err(bad("expected a string"));
            };
            let escaped = escape_like(s);
            let pattern = match op {
                "contains" => format!("%{}%", escaped),
                "startsWith" => format!("{}%", escaped),
                _ => format!("%{}", escaped),
            };
            format!("{} LIKE {}", text_expr(field, expr), q.bind_text(&pattern))
        }
        "isNull" | "isNotNull" => {
            let Some(flag) = v.as_bool() else {
                return Err(bad("expected a boolean"));
            };
            if flag == (op == "isNull") {
                format!("{} IS NULL", expr)
            } else {
                format!("{} IS NOT NULL", expr)
            }
        }
        "arrayOverlaps" | "arrayContains" | "arrayContained" => {
            if !field.type_.is_array() {
                return Err(bad("array operator on a non-array field"));
            }
            if !v.is_array() {
                return Err(bad("expected an array"));
            }
            let sym = match op {
                "arrayOverlaps" => "&&",
                "arrayContains" => "@>",
                _ => "<@",
            };
            cmp(q, sym)
        }
        other => return Err(AppError::BadRequest(format!("unknown operator '{}'", other))),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CollectionConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> Registry {
        let configs: Vec<CollectionConfig> = serde_json::from_value(json!([
            {
                "name": "users",
                "fields": { "name": { "type": "text" }, "tags": { "type": "textArray" } },
                "relations": {
                    "posts": { "kind": "many", "collection": "posts" },
                    "groups": {
                        "kind": "manyToMany", "through": "users_groups",
                        "sourceField": "user_id", "targetField": "group_id", "collection": "groups"
                    }
                }
            },
            {
                "name": "posts",
                "fields": {
                    "title": { "type": "text" },
                    "likes": { "type": "integer" },
                    "authorId": { "type": "uuid" }
                },
                "localized": ["title"],
                "relations": {
                    "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" }
                }
            },
            { "name": "groups", "fields": { "label": { "type": "text" } } },
            {
                "name": "comments",
                "fields": { "targetType": { "type": "text" }, "targetId": { "type": "text" } },
                "relations": {
                    "target": {
                        "kind": "polymorphic", "typeField": "targetType", "idField": "targetId",
                        "collections": { "post": "posts", "user": "users" }
                    }
                }
            }
        ]))
        .unwrap();
        resolve(&configs).unwrap()
    }

    fn compile(reg: &Registry, coll: &str, w: Value) -> Result<(Option<String>, QueryBuf), AppError> {
        let c = reg.get(coll).unwrap();
        let mut q = QueryBuf::new();
        let w = Where::from_json(&w)?;
        let sql = WhereCompiler::new(reg, "en").compile(&mut q, &w, &Scope::new(c, "m"))?;
        Ok((sql, q))
    }

    #[test]
    fn scalar_and_operators_bind_with_casts() {
        let reg = registry();
        let (sql, q) = compile(&reg, "posts", json!({ "likes": { "gte": 3, "lt": 10 }, "authorId": null })).unwrap();
        assert_eq!(
            sql.unwrap(),
            "(m.\"author_id\" IS NULL AND (m.\"likes\" >= $1::bigint AND m.\"likes\" < $2::bigint))"
        );
        assert_eq!(q.params, vec![PgBindValue::I64(3), PgBindValue::I64(10)]);
    }

    #[test]
    fn localized_field_routes_to_i18n_alias() {
        let reg = registry();
        let (sql, _) = compile(&reg, "posts", json!({ "title": { "contains": "50%_off" } })).unwrap();
        assert_eq!(sql.unwrap(), "mi.\"title\" LIKE $1::text");
        let (_, q) = compile(&reg, "posts", json!({ "title": { "contains": "50%_off" } })).unwrap();
        assert_eq!(q.params, vec![PgBindValue::String("%50\\%\\_off%".into())]);
    }

    #[test]
    fn empty_in_is_false_and_empty_not_in_is_omitted() {
        let reg = registry();
        let (sql, _) = compile(&reg, "posts", json!({ "likes": { "in": [] } })).unwrap();
        assert_eq!(sql.unwrap(), "FALSE");
        let (sql, _) = compile(&reg, "posts", json!({ "likes": { "notIn": [] } })).unwrap();
        assert_eq!(sql.unwrap(), "TRUE");
    }

    #[test]
    fn logical_combinators() {
        let reg = registry();
        let (sql, _) = compile(
            &reg,
            "posts",
            json!({ "OR": [{ "likes": 1 }, { "NOT": { "likes": 2 } }] }),
        )
        .unwrap();
        assert_eq!(sql.unwrap(), "(m.\"likes\" = $1::bigint OR NOT (m.\"likes\" = $2::bigint))");
    }

    #[test]
    fn one_relation_becomes_correlated_exists() {
        let reg = registry();
        let (sql, _) = compile(&reg, "posts", json!({ "author": { "is": { "name": "Ann" } } })).unwrap();
        assert_eq!(
            sql.unwrap(),
            "EXISTS (SELECT 1 FROM \"public\".\"users\" AS r1 WHERE r1.\"id\" = m.\"author_id\" AND (r1.\"name\" = $1::text))"
        );
        let (sql, _) = compile(&reg, "posts", json!({ "author": null })).unwrap();
        assert_eq!(
            sql.unwrap(),
            "NOT EXISTS (SELECT 1 FROM \"public\".\"users\" AS r1 WHERE r1.\"id\" = m.\"author_id\")"
        );
    }

    #[test]
    fn many_every_negates_nested_and_joins_i18n() {
        let reg = registry();
        let (sql, q) = compile(&reg, "users", json!({ "posts": { "every": { "title": "Hi" } } })).unwrap();
        assert_eq!(
            sql.unwrap(),
            "NOT EXISTS (SELECT 1 FROM \"public\".\"posts\" AS r1 \
             LEFT JOIN \"public\".\"posts_i18n\" AS r1i ON r1i.\"parent_id\" = r1.\"id\" AND r1i.\"locale\" = $1::text \
             WHERE r1.\"author_id\" = m.\"id\" AND NOT (r1i.\"title\" = $2::text))"
        );
        assert_eq!(q.params[0], PgBindValue::String("en".into()));
    }

    #[test]
    fn many_to_many_goes_through_junction() {
        let reg = registry();
        let (sql, _) = compile(&reg, "users", json!({ "groups": { "some": { "label": "ops" } } })).unwrap();
        assert_eq!(
            sql.unwrap(),
            "EXISTS (SELECT 1 FROM \"public\".\"users_groups\" AS r1j JOIN \"public\".\"groups\" AS r1 ON r1.\"id\" = r1j.\"group_id\" \
             WHERE r1j.\"user_id\" = m.\"id\" AND (r1.\"label\" = $1::text))"
        );
    }

    #[test]
    fn polymorphic_ors_over_target_types() {
        let reg = registry();
        let (sql, _) = compile(&reg, "comments", json!({ "target": { "is": {} } })).unwrap();
        let sql = sql.unwrap();
        assert!(sql.starts_with("((m.\"target_type\" = $1::text AND EXISTS (SELECT 1 FROM \"public\".\"posts\" AS r1"));
        assert!(sql.contains(" OR (m.\"target_type\" = $"));
        assert!(sql.contains("r2.\"id\"::text = m.\"target_id\"::text"));
    }

    #[test]
    fn quantifier_arity_is_checked() {
        let reg = registry();
        assert!(compile(&reg, "users", json!({ "posts": { "is": {} } })).is_err());
        assert!(compile(&reg, "posts", json!({ "author": { "some": {} } })).is_err());
    }

    #[test]
    fn unknown_keys_and_bad_operators_are_rejected() {
        let reg = registry();
        assert!(matches!(compile(&reg, "posts", json!({ "nope": 1 })), Err(AppError::BadRequest(_))));
        assert!(matches!(
            compile(&reg, "posts", json!({ "likes": { "gt": 1, "between": [1, 2] } })),
            Err(AppError::BadRequest(_))
        ));
        assert!(compile(&reg, "posts", json!({ "likes": { "arrayContains": [1] } })).is_err());
    }

    #[test]
    fn array_operators_on_array_fields() {
        let reg = registry();
        let (sql, q) = compile(&reg, "users", json!({ "tags": { "arrayOverlaps": ["a", "b"] } })).unwrap();
        assert_eq!(sql.unwrap(), "m.\"tags\" && $1::text[]");
        assert_eq!(q.params, vec![PgBindValue::TextArray(vec!["a".into(), "b".into()])]);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let reg = registry();
        let c = reg.get("posts").unwrap();
        let mut w = Where::eq("likes", 1);
        for _ in 0..20 {
            w = Where::not(w);
        }
        let mut q = QueryBuf::new();
        let err = WhereCompiler::new(&reg, "en")
            .compile(&mut q, &w, &Scope::new(c, "m"))
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn raw_predicate_sees_alias() {
        let reg = registry();
        let c = reg.get("posts").unwrap();
        let w = Where::raw(|t, q| format!("{}.\"likes\" % {}::bigint = 0", t.alias, q.bind(&json!(2))));
        let mut q = QueryBuf::new();
        let sql = WhereCompiler::new(&reg, "en").compile(&mut q, &w, &Scope::new(c, "m")).unwrap();
        assert_eq!(sql.unwrap(), "(m.\"likes\" % $1::bigint = 0)");
    }
}

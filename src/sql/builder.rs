//! Builds parameterized SELECT, INSERT, UPDATE, DELETE from a resolved collection.

use crate::config::topology::{col, I18N_PARENT_COLUMN, LOCALE_COLUMN};
use crate::config::{ResolvedCollection, ResolvedField, DELETED_AT_FIELD, UPDATED_AT_FIELD};
use crate::error::AppError;
use crate::query::{Direction, OrderBy};
use crate::sql::params::PgBindValue;
use serde_json::Value;

pub const MAIN_ALIAS: &str = "m";
/// Prefix of per-parent window columns; stripped from decoded rows.
pub const ROW_NUMBER_COLUMN: &str = "__rn";
pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 1000;

/// Quote identifier for PostgreSQL (safe: only from config).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

/// Alias of the i18n join for rows aliased `alias`.
pub fn i18n_alias(alias: &str) -> String {
    format!("{}i", alias)
}

/// Alias of the default-locale fallback join for rows aliased `alias`.
pub fn fallback_alias(alias: &str) -> String {
    format!("{}f", alias)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf::default()
    }

    pub fn push_param(&mut self, v: PgBindValue) -> u32 {
        self.params.push(v);
        self.params.len() as u32
    }

    /// Bare `$n` placeholder, for raw predicates that cast themselves.
    pub fn bind(&mut self, v: &Value) -> String {
        format!("${}", self.push_param(PgBindValue::from_json(v)))
    }

    pub fn bind_cast(&mut self, v: &Value, pg_type: &str) -> String {
        format!("${}::{}", self.push_param(PgBindValue::from_json(v)), pg_type)
    }

    /// `$n::type` using the field's declared type.
    pub fn bind_field(&mut self, v: &Value, field: &ResolvedField) -> String {
        format!(
            "${}::{}",
            self.push_param(PgBindValue::for_field(v, field.type_)),
            field.pg_type()
        )
    }

    pub fn bind_text(&mut self, s: &str) -> String {
        format!("${}::text", self.push_param(PgBindValue::String(s.to_string())))
    }
}

/// Locale joins for one read: the requested locale, plus the default locale when fallback applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocaleJoin {
    pub locale: String,
    pub fallback: Option<String>,
}

/// Per-query row window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Window {
    /// Plain LIMIT/OFFSET over the whole result.
    Page { limit: Option<u32>, offset: u32 },
    /// LIMIT/OFFSET applied per group of `keys` (one group per parent row).
    PerParent {
        keys: Vec<String>,
        limit: Option<u32>,
        offset: u32,
    },
}

/// Main table plus i18n joins, e.g. `"public"."posts" AS m LEFT JOIN ... AS mi ON ...`.
pub fn from_clause(
    q: &mut QueryBuf,
    coll: &ResolvedCollection,
    alias: &str,
    locale: Option<&LocaleJoin>,
) -> String {
    let mut from = format!("{} AS {}", coll.topology.main_table(), alias);
    if let (Some(i18n), Some(join)) = (coll.topology.i18n_table(), locale) {
        let id_col = col(alias, &coll.id_field().column);
        let ia = i18n_alias(alias);
        from.push_str(&format!(
            " LEFT JOIN {} AS {} ON {} = {} AND {} = {}",
            i18n,
            ia,
            col(&ia, I18N_PARENT_COLUMN),
            id_col,
            col(&ia, LOCALE_COLUMN),
            q.bind_text(&join.locale)
        ));
        if let Some(fallback) = &join.fallback {
            let fa = fallback_alias(alias);
            from.push_str(&format!(
                " LEFT JOIN {} AS {} ON {} = {} AND {} = {}",
                i18n,
                fa,
                col(&fa, I18N_PARENT_COLUMN),
                id_col,
                col(&fa, LOCALE_COLUMN),
                q.bind_text(fallback)
            ));
        }
    }
    from
}

/// SELECT list. Localized values come back as `_i18n_<field>` / `_i18n_fallback_<field>`
/// and are merged by the localization layer.
pub fn projection(fields: &[&ResolvedField], alias: &str, locale: Option<&LocaleJoin>) -> Vec<String> {
    let mut out = Vec::with_capacity(fields.len());
    for f in fields {
        if f.localized {
            let Some(join) = locale else { continue };
            out.push(format!(
                "{} AS {}",
                col(&i18n_alias(alias), &f.column),
                quoted(&format!("_i18n_{}", f.name))
            ));
            if join.fallback.is_some() {
                out.push(format!(
                    "{} AS {}",
                    col(&fallback_alias(alias), &f.column),
                    quoted(&format!("_i18n_fallback_{}", f.name))
                ));
            }
        } else {
            out.push(format!("{} AS {}", col(alias, &f.column), quoted(&f.name)));
        }
    }
    out
}

/// Column expression for a field under `alias`, routed to the i18n join when localized.
pub fn field_expr(field: &ResolvedField, alias: &str) -> String {
    if field.localized {
        col(&i18n_alias(alias), &field.column)
    } else {
        col(alias, &field.column)
    }
}

/// Soft-delete filter, when the collection has one and deleted rows are not requested.
pub fn live_rows_predicate(coll: &ResolvedCollection, alias: &str, include_deleted: bool) -> Option<String> {
    if include_deleted || !coll.soft_delete {
        return None;
    }
    coll.field(DELETED_AT_FIELD)
        .map(|f| format!("{} IS NULL", col(alias, &f.column)))
}

fn order_clause(coll: &ResolvedCollection, alias: &str, order_by: &[OrderBy]) -> Result<String, AppError> {
    let mut parts = Vec::with_capacity(order_by.len() + 1);
    for o in order_by {
        let f = coll.field_or_bad_request(&o.field)?;
        let dir = match o.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        parts.push(format!("{} {}", field_expr(f, alias), dir));
    }
    let id = coll.id_field();
    if !order_by.iter().any(|o| o.field == id.name) {
        parts.push(format!("{} ASC", col(alias, &id.column)));
    }
    Ok(parts.join(", "))
}

/// SELECT rows of `coll`. `predicate` was compiled into the same `q` against alias `m`.
pub fn select_rows(
    q: &mut QueryBuf,
    coll: &ResolvedCollection,
    fields: &[&ResolvedField],
    locale: Option<&LocaleJoin>,
    predicate: Option<&str>,
    order_by: &[OrderBy],
    window: &Window,
) -> Result<(), AppError> {
    let from = from_clause(q, coll, MAIN_ALIAS, locale);
    let cols = projection(fields, MAIN_ALIAS, locale);
    let where_clause = predicate.map(|p| format!(" WHERE {}", p)).unwrap_or_default();
    let order = order_clause(coll, MAIN_ALIAS, order_by)?;

    q.sql = match window {
        Window::Page { limit, offset } => {
            let limit_clause = limit.map(|n| format!(" LIMIT {}", n.min(MAX_LIMIT))).unwrap_or_default();
            let offset_clause = if *offset > 0 { format!(" OFFSET {}", offset) } else { String::new() };
            format!(
                "SELECT {} FROM {}{} ORDER BY {}{}{}",
                cols.join(", "),
                from,
                where_clause,
                order,
                limit_clause,
                offset_clause
            )
        }
        Window::PerParent { keys, limit, offset } => {
            let mut partition = Vec::with_capacity(keys.len());
            for k in keys {
                partition.push(field_expr(coll.field_or_bad_request(k)?, MAIN_ALIAS));
            }
            let names: Vec<String> = cols
                .iter()
                .filter_map(|c| c.rsplit(" AS ").next())
                .map(|alias| format!("\"w\".{}", alias))
                .collect();
            let mut bounds = format!("\"w\".{} > {}", quoted(ROW_NUMBER_COLUMN), offset);
            if let Some(n) = limit {
                bounds.push_str(&format!(
                    " AND \"w\".{} <= {}",
                    quoted(ROW_NUMBER_COLUMN),
                    u64::from(*offset) + u64::from((*n).min(MAX_LIMIT))
                ));
            }
            format!(
                "SELECT {} FROM (SELECT {}, ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}) AS {} FROM {}{}) AS \"w\" WHERE {} ORDER BY \"w\".{}",
                names.join(", "),
                cols.join(", "),
                partition.join(", "),
                order,
                quoted(ROW_NUMBER_COLUMN),
                from,
                where_clause,
                bounds,
                quoted(ROW_NUMBER_COLUMN)
            )
        }
    };
    Ok(())
}

/// SELECT COUNT(*) with the same joins and predicate as a find.
pub fn count_rows(q: &mut QueryBuf, coll: &ResolvedCollection, locale: Option<&LocaleJoin>, predicate: Option<&str>) {
    let from = from_clause(q, coll, MAIN_ALIAS, locale);
    let where_clause = predicate.map(|p| format!(" WHERE {}", p)).unwrap_or_default();
    q.sql = format!("SELECT COUNT(*) AS \"count\" FROM {}{}", from, where_clause);
}

/// `alias.key IN (...)`, or OR-of-tuples for composite keys. Empty key set yields FALSE.
pub fn key_in_predicate(q: &mut QueryBuf, alias: &str, fields: &[&ResolvedField], keys: &[Vec<Value>]) -> String {
    if keys.is_empty() || fields.is_empty() {
        return "FALSE".into();
    }
    if let [field] = fields {
        let placeholders: Vec<String> = keys.iter().map(|k| q.bind_field(&k[0], field)).collect();
        return format!("{} IN ({})", field_expr(field, alias), placeholders.join(", "));
    }
    let tuples: Vec<String> = keys
        .iter()
        .map(|k| {
            let eqs: Vec<String> = fields
                .iter()
                .zip(k)
                .map(|(f, v)| format!("{} = {}", field_expr(f, alias), q.bind_field(v, f)))
                .collect();
            format!("({})", eqs.join(" AND "))
        })
        .collect();
    format!("({})", tuples.join(" OR "))
}

fn returning_id(coll: &ResolvedCollection) -> String {
    let id = coll.id_field();
    format!("{} AS {}", quoted(&id.column), quoted(&id.name))
}

fn id_predicate(q: &mut QueryBuf, coll: &ResolvedCollection, id: &Value) -> String {
    let id_field = coll.id_field();
    format!("{} = {}", quoted(&id_field.column), q.bind_field(id, id_field))
}

/// INSERT into the main table. Columns absent from `values` take their DB default.
pub fn insert_row(coll: &ResolvedCollection, values: &[(&ResolvedField, &Value)]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let table = coll.topology.main_table();
    if values.is_empty() {
        q.sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning_id(coll));
        return q;
    }
    let mut cols = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (f, v) in values {
        cols.push(quoted(&f.column));
        placeholders.push(q.bind_field(v, f));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
        table,
        cols.join(", "),
        placeholders.join(", "),
        returning_id(coll)
    );
    q
}

/// UPDATE by id: SET only the given columns plus `updated_at`. Excludes soft-deleted rows.
/// With nothing to set, falls back to a SELECT of the id so the caller can still detect a missing row.
pub fn update_row(coll: &ResolvedCollection, id: &Value, values: &[(&ResolvedField, &Value)]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let table = coll.topology.main_table();
    let mut sets = Vec::new();
    for (f, v) in values {
        sets.push(format!("{} = {}", quoted(&f.column), q.bind_field(v, f)));
    }
    if let Some(f) = coll.field(UPDATED_AT_FIELD) {
        sets.push(format!("{} = NOW()", quoted(&f.column)));
    }
    let mut where_clause = id_predicate(&mut q, coll, id);
    if let Some(f) = coll.field(DELETED_AT_FIELD) {
        where_clause.push_str(&format!(" AND {} IS NULL", quoted(&f.column)));
    }
    q.sql = if sets.is_empty() {
        format!("SELECT {} FROM {} WHERE {}", returning_id(coll), table, where_clause)
    } else {
        format!(
            "UPDATE {} SET {} WHERE {} RETURNING {}",
            table,
            sets.join(", "),
            where_clause,
            returning_id(coll)
        )
    };
    q
}

/// INSERT ... ON CONFLICT (parent_id, locale) DO UPDATE for the given localized values.
pub fn upsert_i18n(
    coll: &ResolvedCollection,
    parent_id: &Value,
    locale: &str,
    values: &[(&ResolvedField, &Value)],
) -> Option<QueryBuf> {
    let table = coll.topology.i18n_table()?;
    if values.is_empty() {
        return None;
    }
    let mut q = QueryBuf::new();
    let mut cols = vec![quoted(I18N_PARENT_COLUMN), quoted(LOCALE_COLUMN)];
    let mut placeholders = vec![q.bind_field(parent_id, coll.id_field()), q.bind_text(locale)];
    let mut updates = Vec::with_capacity(values.len());
    for (f, v) in values {
        cols.push(quoted(&f.column));
        placeholders.push(q.bind_field(v, f));
        updates.push(format!("{} = EXCLUDED.{}", quoted(&f.column), quoted(&f.column)));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}, {}) DO UPDATE SET {}",
        table,
        cols.join(", "),
        placeholders.join(", "),
        quoted(I18N_PARENT_COLUMN),
        quoted(LOCALE_COLUMN),
        updates.join(", ")
    );
    Some(q)
}

/// DELETE by id.
pub fn delete_row(coll: &ResolvedCollection, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let pred = id_predicate(&mut q, coll, id);
    q.sql = format!(
        "DELETE FROM {} WHERE {} RETURNING {}",
        coll.topology.main_table(),
        pred,
        returning_id(coll)
    );
    q
}

/// Mark deleted. Rows already deleted are left alone.
pub fn soft_delete_row(coll: &ResolvedCollection, id: &Value) -> Option<QueryBuf> {
    let deleted_at = coll.field(DELETED_AT_FIELD)?;
    let mut q = QueryBuf::new();
    let pred = id_predicate(&mut q, coll, id);
    q.sql = format!(
        "UPDATE {} SET {} = NOW() WHERE {} AND {} IS NULL RETURNING {}",
        coll.topology.main_table(),
        quoted(&deleted_at.column),
        pred,
        quoted(&deleted_at.column),
        returning_id(coll)
    );
    Some(q)
}

pub fn restore_row(coll: &ResolvedCollection, id: &Value) -> Option<QueryBuf> {
    let deleted_at = coll.field(DELETED_AT_FIELD)?;
    let mut q = QueryBuf::new();
    let pred = id_predicate(&mut q, coll, id);
    q.sql = format!(
        "UPDATE {} SET {} = NULL WHERE {} RETURNING {}",
        coll.topology.main_table(),
        quoted(&deleted_at.column),
        pred,
        returning_id(coll)
    );
    Some(q)
}

/// DELETE all rows keyed by `id` from a side table (i18n or versions).
pub fn delete_by_parent(table: &str, parent_column: &str, coll: &ResolvedCollection, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = q.bind_field(id, coll.id_field());
    q.sql = format!("DELETE FROM {} WHERE {} = {}", table, quoted(parent_column), ph);
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CollectionConfig};
    use crate::query::OrderBy;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn posts() -> ResolvedCollection {
        let configs: Vec<CollectionConfig> = serde_json::from_value(json!([{
            "name": "posts",
            "fields": {
                "title": { "type": "text" },
                "likes": { "type": "integer" },
                "authorId": { "type": "uuid" }
            },
            "localized": ["title"],
            "options": { "softDelete": true }
        }]))
        .unwrap();
        resolve(&configs).unwrap().get("posts").unwrap().clone()
    }

    #[test]
    fn select_joins_locale_and_fallback() {
        let coll = posts();
        let fields: Vec<&ResolvedField> = coll.fields.iter().collect();
        let join = LocaleJoin {
            locale: "sk".into(),
            fallback: Some("en".into()),
        };
        let mut q = QueryBuf::new();
        select_rows(
            &mut q,
            &coll,
            &fields,
            Some(&join),
            live_rows_predicate(&coll, MAIN_ALIAS, false).as_deref(),
            &[OrderBy::desc("likes")],
            &Window::Page { limit: Some(10), offset: 20 },
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT m.\"id\" AS \"id\", m.\"author_id\" AS \"authorId\", m.\"likes\" AS \"likes\", \
             mi.\"title\" AS \"_i18n_title\", mf.\"title\" AS \"_i18n_fallback_title\", \
             m.\"created_at\" AS \"createdAt\", m.\"updated_at\" AS \"updatedAt\", m.\"deleted_at\" AS \"deletedAt\" \
             FROM \"public\".\"posts\" AS m \
             LEFT JOIN \"public\".\"posts_i18n\" AS mi ON mi.\"parent_id\" = m.\"id\" AND mi.\"locale\" = $1::text \
             LEFT JOIN \"public\".\"posts_i18n\" AS mf ON mf.\"parent_id\" = m.\"id\" AND mf.\"locale\" = $2::text \
             WHERE m.\"deleted_at\" IS NULL ORDER BY m.\"likes\" DESC, m.\"id\" ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            q.params,
            vec![PgBindValue::String("sk".into()), PgBindValue::String("en".into())]
        );
    }

    #[test]
    fn per_parent_window_uses_row_number() {
        let coll = posts();
        let fields = vec![coll.field("id").unwrap(), coll.field("authorId").unwrap()];
        let mut q = QueryBuf::new();
        select_rows(
            &mut q,
            &coll,
            &fields,
            None,
            None,
            &[],
            &Window::PerParent {
                keys: vec!["authorId".into()],
                limit: Some(2),
                offset: 1,
            },
        )
        .unwrap();
        assert!(q.sql.starts_with("SELECT \"w\".\"id\", \"w\".\"authorId\" FROM (SELECT"));
        assert!(q.sql.contains("ROW_NUMBER() OVER (PARTITION BY m.\"author_id\" ORDER BY m.\"id\" ASC)"));
        assert!(q.sql.ends_with("WHERE \"w\".\"__rn\" > 1 AND \"w\".\"__rn\" <= 3 ORDER BY \"w\".\"__rn\""));
    }

    #[test]
    fn unknown_order_field_is_bad_request() {
        let coll = posts();
        let mut q = QueryBuf::new();
        let err = select_rows(&mut q, &coll, &[], None, None, &[OrderBy::asc("nope")], &Window::Page { limit: None, offset: 0 })
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn update_without_values_still_touches_updated_at() {
        let coll = posts();
        let q = update_row(&coll, &json!("a1"), &[]);
        assert_eq!(
            q.sql,
            "UPDATE \"public\".\"posts\" SET \"updated_at\" = NOW() WHERE \"id\" = $1::uuid AND \"deleted_at\" IS NULL RETURNING \"id\" AS \"id\""
        );
    }

    #[test]
    fn composite_keys_become_or_of_tuples() {
        let coll = posts();
        let fields = vec![coll.field("authorId").unwrap(), coll.field("likes").unwrap()];
        let mut q = QueryBuf::new();
        let sql = key_in_predicate(&mut q, "m", &fields, &[vec![json!("a"), json!(1)], vec![json!("b"), json!(2)]]);
        assert_eq!(
            sql,
            "((m.\"author_id\" = $1::uuid AND m.\"likes\" = $2::bigint) OR (m.\"author_id\" = $3::uuid AND m.\"likes\" = $4::bigint))"
        );
        assert_eq!(key_in_predicate(&mut q, "m", &fields, &[]), "FALSE");
    }

    #[test]
    fn i18n_upsert_updates_only_given_columns() {
        let coll = posts();
        let title = coll.field("title").unwrap();
        let v = json!("Ahoj");
        let q = upsert_i18n(&coll, &json!("p1"), "sk", &[(title, &v)]).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"public\".\"posts_i18n\" (\"parent_id\", \"locale\", \"title\") VALUES ($1::uuid, $2::text, $3::text) \
             ON CONFLICT (\"parent_id\", \"locale\") DO UPDATE SET \"title\" = EXCLUDED.\"title\""
        );
    }
}

//! Row loading shared by finds, relation loads and write read-backs.

use crate::config::{ResolvedCollection, ResolvedField, ID_FIELD};
use crate::context::Record;
use crate::error::AppError;
use crate::query::{OrderBy, With};
use crate::service::{i18n, Runtime};
use crate::sql::where_clause::{Scope, Where};
use crate::sql::{count_rows, live_rows_predicate, select_rows, QueryBuf, Window, MAIN_ALIAS};
use crate::store::Executor;
use serde_json::Value;

pub struct ReadPlan<'p> {
    pub filter: Option<Where>,
    /// Requested fields; `None` selects every field.
    pub columns: Option<&'p [String]>,
    /// Fields loaded for internal use (relation keys) even when not requested.
    pub extra_fields: Vec<String>,
    pub order_by: &'p [OrderBy],
    pub window: Window,
    pub include_deleted: bool,
}

impl<'p> ReadPlan<'p> {
    /// Single row by id, deleted or not, all fields.
    pub fn by_id(id: &Value) -> Self {
        ReadPlan {
            filter: Some(Where::eq(ID_FIELD, id.clone())),
            columns: None,
            extra_fields: Vec::new(),
            order_by: &[],
            window: Window::Page {
                limit: Some(1),
                offset: 0,
            },
            include_deleted: true,
        }
    }
}

/// Fields to select plus the names to strip before returning (loaded only for internal use).
pub fn projection<'c>(
    coll: &'c ResolvedCollection,
    columns: Option<&[String]>,
    extra: &[String],
) -> Result<(Vec<&'c ResolvedField>, Vec<String>), AppError> {
    let Some(columns) = columns else {
        return Ok((coll.fields.iter().collect(), Vec::new()));
    };
    for c in columns {
        coll.field_or_bad_request(c)?;
    }
    let mut hidden = Vec::new();
    for e in extra {
        coll.field_or_bad_request(e)?;
        if e != ID_FIELD && !columns.contains(e) && !hidden.contains(e) {
            hidden.push(e.clone());
        }
    }
    let fields = coll
        .fields
        .iter()
        .filter(|f| f.name == ID_FIELD || columns.contains(&f.name) || hidden.contains(&f.name))
        .collect();
    Ok((fields, hidden))
}

/// Source fields the requested relations need, so they are loaded even under a column projection.
pub fn relation_key_fields(coll: &ResolvedCollection, with: Option<&With>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Some(with) = with else { return out };
    for (name, _) in with.iter() {
        if let Some(rel) = coll.relation(name) {
            for f in rel.source_fields() {
                if !out.iter().any(|o| o == f) {
                    out.push(f.to_string());
                }
            }
        }
    }
    out
}

pub fn strip_hidden(rows: &mut [Record], hidden: &[String]) {
    if hidden.is_empty() {
        return;
    }
    for row in rows {
        for h in hidden {
            row.remove(h);
        }
    }
}

fn predicate(
    rt: Runtime<'_>,
    q: &mut QueryBuf,
    coll: &ResolvedCollection,
    filter: Option<&Where>,
    include_deleted: bool,
) -> Result<Option<String>, AppError> {
    let mut parts = Vec::new();
    if let Some(live) = live_rows_predicate(coll, MAIN_ALIAS, include_deleted) {
        parts.push(live);
    }
    if let Some(w) = filter {
        if let Some(p) = rt.compiler().compile(q, w, &Scope::new(coll, MAIN_ALIAS))? {
            parts.push(p);
        }
    }
    Ok(if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    })
}

/// Load rows with localized fields merged. Relations are not resolved here.
pub async fn load_rows(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    plan: &ReadPlan<'_>,
) -> Result<Vec<Record>, AppError> {
    let (fields, _) = projection(coll, plan.columns, &plan.extra_fields)?;
    let join = i18n::locale_join(coll, rt.ctx);
    let mut q = QueryBuf::new();
    let pred = predicate(rt, &mut q, coll, plan.filter.as_ref(), plan.include_deleted)?;
    select_rows(
        &mut q,
        coll,
        &fields,
        join.as_ref(),
        pred.as_deref(),
        plan.order_by,
        &plan.window,
    )?;
    let mut rows = exec.fetch_all(&q).await?;
    i18n::merge_rows(&mut rows, coll);
    Ok(rows)
}

pub async fn load_by_id(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
) -> Result<Option<Record>, AppError> {
    Ok(load_rows(rt, exec, coll, &ReadPlan::by_id(id)).await?.into_iter().next())
}

pub async fn count(
    rt: Runtime<'_>,
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    filter: Option<&Where>,
    include_deleted: bool,
) -> Result<u64, AppError> {
    let join = i18n::locale_join(coll, rt.ctx).map(|mut j| {
        j.fallback = None;
        j
    });
    let mut q = QueryBuf::new();
    let pred = predicate(rt, &mut q, coll, filter, include_deleted)?;
    count_rows(&mut q, coll, join.as_ref(), pred.as_deref());
    let row = exec.fetch_optional(&q).await?;
    Ok(row
        .and_then(|r| r.get("count").and_then(Value::as_u64))
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CollectionConfig};
    use serde_json::json;

    fn posts() -> ResolvedCollection {
        let c: Vec<CollectionConfig> = serde_json::from_value(json!([
            {
                "name": "posts",
                "fields": { "title": { "type": "text" }, "authorId": { "type": "uuid" } },
                "relations": { "author": { "kind": "one", "fields": ["authorId"], "references": ["id"], "collection": "users" } }
            },
            { "name": "users" }
        ]))
        .unwrap();
        resolve(&c).unwrap().get("posts").unwrap().clone()
    }

    #[test]
    fn projection_adds_hidden_relation_keys() {
        let coll = posts();
        let with = With::new().include("author");
        let extra = relation_key_fields(&coll, Some(&with));
        assert_eq!(extra, vec!["authorId".to_string()]);
        let cols = vec!["title".to_string()];
        let (fields, hidden) = projection(&coll, Some(&cols), &extra).unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "authorId", "title"]);
        assert_eq!(hidden, vec!["authorId".to_string()]);
    }

    #[test]
    fn projection_rejects_unknown_columns() {
        let coll = posts();
        let cols = vec!["nope".to_string()];
        assert!(matches!(projection(&coll, Some(&cols), &[]), Err(AppError::BadRequest(_))));
    }
}

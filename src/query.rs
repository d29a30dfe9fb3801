//! Request-side argument types: find options, relation includes, ordering, version selectors.

use crate::error::AppError;
use crate::sql::where_clause::Where;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        OrderBy {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        OrderBy {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }

    /// `"-createdAt"` sorts descending.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('-') {
            Some(field) => OrderBy::desc(field),
            None => OrderBy::asc(s),
        }
    }

    /// Accepts `"field"`, `"-field"`, `{ "field": "asc" | "desc" }` or an array of those.
    pub fn list_from_json(v: &Value) -> Result<Vec<OrderBy>, AppError> {
        match v {
            Value::Null => Ok(Vec::new()),
            Value::String(s) => Ok(vec![OrderBy::parse(s)]),
            Value::Array(items) => {
                let mut out = Vec::new();
                for i in items {
                    out.extend(OrderBy::list_from_json(i)?);
                }
                Ok(out)
            }
            Value::Object(map) => map
                .iter()
                .map(|(field, dir)| match dir.as_str().map(str::to_ascii_lowercase).as_deref() {
                    Some("asc") => Ok(OrderBy::asc(field)),
                    Some("desc") => Ok(OrderBy::desc(field)),
                    _ => Err(AppError::BadRequest(format!("invalid sort direction for '{}'", field))),
                })
                .collect(),
            _ => Err(AppError::BadRequest("orderBy must be a string, object or array".into())),
        }
    }
}

/// Aggregates computed per parent for a plural relation, instead of loading rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateSpec {
    pub count: bool,
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
}

impl AggregateSpec {
    pub fn count() -> Self {
        AggregateSpec {
            count: true,
            ..Default::default()
        }
    }

    fn field_list(v: Option<&Value>) -> Result<Vec<String>, AppError> {
        match v {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|i| {
                    i.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| AppError::BadRequest("aggregate field names must be strings".into()))
                })
                .collect(),
            Some(Value::Object(map)) => Ok(map
                .iter()
                .filter(|(_, on)| on.as_bool().unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect()),
            Some(_) => Err(AppError::BadRequest("aggregate must list field names".into())),
        }
    }

    pub fn from_json(v: &Value) -> Result<Self, AppError> {
        let Value::Object(map) = v else {
            return Err(AppError::BadRequest("_aggregate must be an object".into()));
        };
        for key in map.keys() {
            if !matches!(key.as_str(), "_count" | "_sum" | "_avg" | "_min" | "_max") {
                return Err(AppError::BadRequest(format!("unknown aggregate '{}'", key)));
            }
        }
        Ok(AggregateSpec {
            count: map.get("_count").and_then(Value::as_bool).unwrap_or(false),
            sum: Self::field_list(map.get("_sum"))?,
            avg: Self::field_list(map.get("_avg"))?,
            min: Self::field_list(map.get("_min"))?,
            max: Self::field_list(map.get("_max"))?,
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.count && self.sum.is_empty() && self.avg.is_empty() && self.min.is_empty() && self.max.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct WithOptions {
    pub where_: Option<Where>,
    pub columns: Option<Vec<String>>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub with: Option<With>,
    pub aggregate: Option<AggregateSpec>,
}

impl WithOptions {
    fn from_json(v: &Value) -> Result<Self, AppError> {
        let Value::Object(map) = v else {
            return Err(AppError::BadRequest("relation options must be an object".into()));
        };
        let mut opts = WithOptions::default();
        for (key, value) in map {
            match key.as_str() {
                "where" => opts.where_ = Some(Where::from_json(value)?),
                "columns" => opts.columns = Some(columns_from_json(value)?),
                "orderBy" => opts.order_by = OrderBy::list_from_json(value)?,
                "limit" => opts.limit = Some(u32_from_json(key, value)?),
                "offset" => opts.offset = Some(u32_from_json(key, value)?),
                "with" => opts.with = Some(With::from_json(value)?),
                "_count" => {
                    if value.as_bool().unwrap_or(false) {
                        opts.aggregate.get_or_insert_with(AggregateSpec::default).count = true;
                    }
                }
                "_aggregate" => {
                    let spec = AggregateSpec::from_json(value)?;
                    let count = opts.aggregate.as_ref().map_or(false, |a| a.count);
                    opts.aggregate = Some(AggregateSpec {
                        count: spec.count || count,
                        ..spec
                    });
                }
                other => return Err(AppError::BadRequest(format!("unknown relation option '{}'", other))),
            }
        }
        Ok(opts)
    }
}

/// Relation includes: name -> options. `true` selects with defaults; `false` is dropped.
#[derive(Clone, Debug, Default)]
pub struct With(pub BTreeMap<String, WithOptions>);

impl With {
    pub fn new() -> Self {
        With::default()
    }

    pub fn include(mut self, relation: &str) -> Self {
        self.0.insert(relation.to_string(), WithOptions::default());
        self
    }

    pub fn include_with(mut self, relation: &str, options: WithOptions) -> Self {
        self.0.insert(relation.to_string(), options);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WithOptions)> {
        self.0.iter()
    }

    pub fn from_json(v: &Value) -> Result<Self, AppError> {
        let Value::Object(map) = v else {
            return Err(AppError::BadRequest("with must be an object".into()));
        };
        let mut out = With::new();
        for (name, entry) in map {
            match entry {
                Value::Bool(true) => {
                    out.0.insert(name.clone(), WithOptions::default());
                }
                Value::Bool(false) | Value::Null => {}
                other => {
                    out.0.insert(name.clone(), WithOptions::from_json(other)?);
                }
            }
        }
        Ok(out)
    }
}

fn u32_from_json(key: &str, v: &Value) -> Result<u32, AppError> {
    v.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AppError::BadRequest(format!("{} must be a non-negative integer", key)))
}

/// `["a", "b"]` or `{ "a": true, "b": true }`.
fn columns_from_json(v: &Value) -> Result<Vec<String>, AppError> {
    match v {
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::BadRequest("columns must be strings".into()))
            })
            .collect(),
        Value::Object(map) => Ok(map
            .iter()
            .filter(|(_, on)| on.as_bool().unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()),
        _ => Err(AppError::BadRequest("columns must be an array or object".into())),
    }
}

/// Arguments of `find` / `find_one`. Locale and soft-delete overrides apply to this call only.
#[derive(Clone, Debug, Default)]
pub struct FindArgs {
    pub where_: Option<Where>,
    pub columns: Option<Vec<String>>,
    pub with: Option<With>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub locale: Option<String>,
    pub locale_fallback: Option<bool>,
    pub include_deleted: Option<bool>,
}

impl FindArgs {
    pub fn new() -> Self {
        FindArgs::default()
    }

    pub fn filter(mut self, w: Where) -> Self {
        self.where_ = Some(w);
        self
    }

    pub fn with(mut self, with: With) -> Self {
        self.with = Some(with);
        self
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_string());
        self
    }

    pub fn from_json(v: &Value) -> Result<Self, AppError> {
        let Value::Object(map) = v else {
            return Err(AppError::BadRequest("find arguments must be an object".into()));
        };
        let mut args = FindArgs::default();
        for (key, value) in map {
            match key.as_str() {
                "where" => args.where_ = Some(Where::from_json(value)?),
                "columns" => args.columns = Some(columns_from_json(value)?),
                "with" => args.with = Some(With::from_json(value)?),
                "orderBy" => args.order_by = OrderBy::list_from_json(value)?,
                "limit" => args.limit = Some(u32_from_json(key, value)?),
                "offset" => args.offset = Some(u32_from_json(key, value)?),
                "locale" => args.locale = value.as_str().map(str::to_string),
                "localeFallback" => args.locale_fallback = value.as_bool(),
                "includeDeleted" => args.include_deleted = value.as_bool(),
                other => return Err(AppError::BadRequest(format!("unknown find argument '{}'", other))),
            }
        }
        Ok(args)
    }
}

/// Which version to revert to: exactly one of the two.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionSelector {
    pub version_number: Option<i64>,
    pub version_id: Option<String>,
}

impl VersionSelector {
    pub fn number(n: i64) -> Self {
        VersionSelector {
            version_number: Some(n),
            version_id: None,
        }
    }

    pub fn id(id: &str) -> Self {
        VersionSelector {
            version_number: None,
            version_id: Some(id.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindVersionsArgs {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub locale: Option<String>,
}

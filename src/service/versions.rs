//! Version snapshots: one row per mutation, pruned to `maxVersions`, reverted additively.

use crate::case::to_camel_case;
use crate::config::topology::{
    col, I18N_PARENT_COLUMN, LOCALE_COLUMN, VERSION_CREATED_AT_COLUMN, VERSION_ID_COLUMN, VERSION_NUMBER_COLUMN,
    VERSION_OPERATION_COLUMN, VERSION_USER_COLUMN,
};
use crate::config::{ResolvedCollection, ResolvedField, UPDATED_AT_FIELD};
use crate::context::{CrudContext, Operation, Record};
use crate::error::AppError;
use crate::query::{FindVersionsArgs, VersionSelector};
use crate::service::i18n;
use crate::sql::{
    fallback_alias, i18n_alias, json_to_text, quoted, LocaleJoin, QueryBuf, DEFAULT_LIMIT, MAX_LIMIT,
};
use crate::store::Executor;
use serde_json::{json, Value};

const VERSION_ALIAS: &str = "v";

fn not_versioned(coll: &ResolvedCollection) -> AppError {
    AppError::NotImplemented(format!("versioning is not enabled for '{}'", coll.name))
}

fn user_id_param(q: &mut QueryBuf, ctx: &CrudContext) -> String {
    match ctx.user.as_ref().map(|u| &u.id) {
        Some(id) if !id.is_null() => q.bind_text(&json_to_text(id)),
        _ => q.bind_cast(&Value::Null, "text"),
    }
}

async fn next_version_number(
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    table: &str,
    id: &Value,
) -> Result<i64, AppError> {
    let mut q = QueryBuf::new();
    let id_field = coll.id_field();
    let ph = q.bind_field(id, id_field);
    q.sql = format!(
        "SELECT COALESCE(MAX({}), 0) + 1 AS \"next\" FROM {} WHERE {} = {}",
        quoted(VERSION_NUMBER_COLUMN),
        table,
        quoted(&id_field.column),
        ph
    );
    let row = exec.fetch_optional(&q).await?;
    Ok(row.and_then(|r| r.get("next").and_then(Value::as_i64)).unwrap_or(1))
}

/// Record the current state of row `id` as a new version. Runs inside the caller's transaction.
/// Returns the new version number.
pub async fn snapshot(
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    operation: Operation,
    ctx: &CrudContext,
) -> Result<i64, AppError> {
    let Some(versions) = coll.topology.versions_table() else {
        return Err(not_versioned(coll));
    };
    let id_field = coll.id_field();
    let next = next_version_number(exec, coll, &versions, id).await?;

    let fields: Vec<&ResolvedField> = coll.versioned_fields().collect();
    let mut q = QueryBuf::new();
    let version_id = q.bind_cast(&json!(uuid::Uuid::new_v4().to_string()), "uuid");
    let number = q.bind_cast(&json!(next), "bigint");
    let op = q.bind_text(operation.as_str());
    let user = user_id_param(&mut q, ctx);
    let id_ph = q.bind_field(id, id_field);
    let mut cols = vec![
        quoted(VERSION_ID_COLUMN),
        quoted(&id_field.column),
        quoted(VERSION_NUMBER_COLUMN),
        quoted(VERSION_OPERATION_COLUMN),
        quoted(VERSION_USER_COLUMN),
        quoted(VERSION_CREATED_AT_COLUMN),
    ];
    let mut select = vec![
        version_id,
        col("m", &id_field.column),
        number,
        op,
        user,
        "NOW()".to_string(),
    ];
    for f in &fields {
        cols.push(quoted(&f.column));
        select.push(col("m", &f.column));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} AS m WHERE {} = {}",
        versions,
        cols.join(", "),
        select.join(", "),
        coll.topology.main_table(),
        col("m", &id_field.column),
        id_ph
    );
    if exec.execute(&q).await? == 0 {
        return Err(AppError::Internal(format!(
            "snapshot of '{}' found no row for id {}",
            coll.name,
            json_to_text(id)
        )));
    }

    if let (Some(i18n), Some(i18n_versions)) = (coll.topology.i18n_table(), coll.topology.i18n_versions_table()) {
        let mut q = QueryBuf::new();
        let number = q.bind_cast(&json!(next), "bigint");
        let parent = q.bind_field(id, id_field);
        let mut cols = vec![
            quoted(I18N_PARENT_COLUMN),
            quoted(VERSION_NUMBER_COLUMN),
            quoted(LOCALE_COLUMN),
        ];
        let mut select = vec![col("i", I18N_PARENT_COLUMN), number, col("i", LOCALE_COLUMN)];
        for f in coll.localized_fields() {
            cols.push(quoted(&f.column));
            select.push(col("i", &f.column));
        }
        q.sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS i WHERE {} = {}",
            i18n_versions,
            cols.join(", "),
            select.join(", "),
            i18n,
            col("i", I18N_PARENT_COLUMN),
            parent
        );
        exec.execute(&q).await?;
    }

    if let Some(max) = coll.versioning.and_then(|v| v.max_versions) {
        let cutoff = next - i64::from(max);
        if cutoff > 0 {
            prune(exec, coll, id, cutoff).await?;
        }
    }
    tracing::debug!(collection = %coll.name, version = next, operation = operation.as_str(), "snapshot");
    Ok(next)
}

/// Delete versions numbered `<= cutoff`, with their localized counterparts.
async fn prune(exec: &mut dyn Executor, coll: &ResolvedCollection, id: &Value, cutoff: i64) -> Result<(), AppError> {
    let id_field = coll.id_field();
    let mut targets = Vec::new();
    if let Some(t) = coll.topology.i18n_versions_table() {
        targets.push((t, I18N_PARENT_COLUMN.to_string()));
    }
    if let Some(t) = coll.topology.versions_table() {
        targets.push((t, id_field.column.clone()));
    }
    for (table, parent_column) in targets {
        let mut q = QueryBuf::new();
        let parent = q.bind_field(id, id_field);
        let limit = q.bind_cast(&json!(cutoff), "bigint");
        q.sql = format!(
            "DELETE FROM {} WHERE {} = {} AND {} <= {}",
            table,
            quoted(&parent_column),
            parent,
            quoted(VERSION_NUMBER_COLUMN),
            limit
        );
        exec.execute(&q).await?;
    }
    Ok(())
}

/// Versions of `id`, newest first, localized fields merged for the requested locale.
pub async fn find_versions(
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    args: &FindVersionsArgs,
    ctx: &CrudContext,
) -> Result<Vec<Record>, AppError> {
    let Some(versions) = coll.topology.versions_table() else {
        return Err(not_versioned(coll));
    };
    let id_field = coll.id_field();
    let v = VERSION_ALIAS;
    let mut q = QueryBuf::new();

    let metadata = [
        VERSION_ID_COLUMN,
        VERSION_NUMBER_COLUMN,
        VERSION_OPERATION_COLUMN,
        VERSION_USER_COLUMN,
        VERSION_CREATED_AT_COLUMN,
    ];
    let mut select: Vec<String> = metadata
        .iter()
        .map(|c| format!("{} AS {}", col(v, c), quoted(&to_camel_case(c))))
        .collect();
    select.insert(1, format!("{} AS {}", col(v, &id_field.column), quoted(&id_field.name)));
    for f in coll.versioned_fields() {
        select.push(format!("{} AS {}", col(v, &f.column), quoted(&f.name)));
    }

    let mut from = format!("{} AS {}", versions, v);
    if let Some(i18n_versions) = coll.topology.i18n_versions_table() {
        let locale = args.locale.clone().unwrap_or_else(|| ctx.locale().to_string());
        let join = LocaleJoin {
            fallback: (ctx.locale_fallback && locale != ctx.default_locale).then(|| ctx.default_locale.clone()),
            locale,
        };
        let mut joins = vec![(i18n_alias(v), join.locale.clone(), i18n::CURRENT_PREFIX)];
        if let Some(fb) = &join.fallback {
            joins.push((fallback_alias(v), fb.clone(), i18n::FALLBACK_PREFIX));
        }
        for (alias, locale, prefix) in joins {
            from.push_str(&format!(
                " LEFT JOIN {} AS {} ON {} = {} AND {} = {} AND {} = {}",
                i18n_versions,
                alias,
                col(&alias, I18N_PARENT_COLUMN),
                col(v, &id_field.column),
                col(&alias, VERSION_NUMBER_COLUMN),
                col(v, VERSION_NUMBER_COLUMN),
                col(&alias, LOCALE_COLUMN),
                q.bind_text(&locale)
            ));
            for f in coll.localized_fields() {
                select.push(format!(
                    "{} AS {}",
                    col(&alias, &f.column),
                    quoted(&format!("{}{}", prefix, f.name))
                ));
            }
        }
    }

    let id_ph = q.bind_field(id, id_field);
    let limit = args.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = args.offset.unwrap_or(0);
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {} ORDER BY {} DESC LIMIT {}{}",
        select.join(", "),
        from,
        col(v, &id_field.column),
        id_ph,
        col(v, VERSION_NUMBER_COLUMN),
        limit,
        if offset > 0 { format!(" OFFSET {}", offset) } else { String::new() }
    );
    let mut rows = exec.fetch_all(&q).await?;
    i18n::merge_rows(&mut rows, coll);
    Ok(rows)
}

/// Version number named by `selector`. Exactly one of number or id must be given.
pub async fn resolve_selector(
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    selector: &VersionSelector,
) -> Result<i64, AppError> {
    let Some(versions) = coll.topology.versions_table() else {
        return Err(not_versioned(coll));
    };
    let id_field = coll.id_field();
    let mut q = QueryBuf::new();
    let id_ph = q.bind_field(id, id_field);
    let condition = match (selector.version_number, selector.version_id.as_deref()) {
        (Some(n), None) => format!("{} = {}", quoted(VERSION_NUMBER_COLUMN), q.bind_cast(&json!(n), "bigint")),
        (None, Some(vid)) => {
            if uuid::Uuid::parse_str(vid).is_err() {
                return Err(AppError::BadRequest(format!("'{}' is not a valid version id", vid)));
            }
            format!("{} = {}", quoted(VERSION_ID_COLUMN), q.bind_cast(&json!(vid), "uuid"))
        }
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest("give either a version number or a version id, not both".into()))
        }
        (None, None) => return Err(AppError::BadRequest("a version number or version id is required".into())),
    };
    q.sql = format!(
        "SELECT {} AS \"versionNumber\" FROM {} WHERE {} = {} AND {}",
        quoted(VERSION_NUMBER_COLUMN),
        versions,
        quoted(&id_field.column),
        id_ph,
        condition
    );
    exec.fetch_optional(&q)
        .await?
        .and_then(|r| r.get("versionNumber").and_then(Value::as_i64))
        .ok_or_else(|| AppError::NotFound(format!("version of '{}' {}", coll.name, json_to_text(id))))
}

/// Copy version `number` back onto the live row: declared main-table fields, and the
/// localized fields of the context locale (replacing the current i18n row).
pub async fn apply_version(
    exec: &mut dyn Executor,
    coll: &ResolvedCollection,
    id: &Value,
    number: i64,
    ctx: &CrudContext,
) -> Result<(), AppError> {
    let Some(versions) = coll.topology.versions_table() else {
        return Err(not_versioned(coll));
    };
    let id_field = coll.id_field();

    let mut sets: Vec<String> = coll
        .versioned_fields()
        .filter(|f| !f.system)
        .map(|f| format!("{} = {}", quoted(&f.column), col(VERSION_ALIAS, &f.column)))
        .collect();
    if let Some(f) = coll.field(UPDATED_AT_FIELD) {
        sets.push(format!("{} = NOW()", quoted(&f.column)));
    }
    let mut q = QueryBuf::new();
    let id_ph = q.bind_field(id, id_field);
    let number_ph = q.bind_cast(&json!(number), "bigint");
    if sets.is_empty() {
        q.sql = format!(
            "SELECT {} FROM {} AS {} WHERE {} = {} AND {} = {}",
            col(VERSION_ALIAS, &id_field.column),
            versions,
            VERSION_ALIAS,
            col(VERSION_ALIAS, &id_field.column),
            id_ph,
            col(VERSION_ALIAS, VERSION_NUMBER_COLUMN),
            number_ph
        );
    } else {
        q.sql = format!(
            "UPDATE {} AS m SET {} FROM {} AS {} WHERE {} = {} AND {} = {} AND {} = {} RETURNING {} AS {}",
            coll.topology.main_table(),
            sets.join(", "),
            versions,
            VERSION_ALIAS,
            col("m", &id_field.column),
            id_ph,
            col(VERSION_ALIAS, &id_field.column),
            col("m", &id_field.column),
            col(VERSION_ALIAS, VERSION_NUMBER_COLUMN),
            number_ph,
            col("m", &id_field.column),
            quoted(&id_field.name)
        );
    }
    if exec.fetch_all(&q).await?.is_empty() {
        return Err(AppError::NotFound(format!("'{}' {}", coll.name, json_to_text(id))));
    }

    if let (Some(i18n), Some(i18n_versions)) = (coll.topology.i18n_table(), coll.topology.i18n_versions_table()) {
        let locale = ctx.locale();
        let mut q = QueryBuf::new();
        let parent = q.bind_field(id, id_field);
        let loc = q.bind_text(locale);
        q.sql = format!(
            "DELETE FROM {} WHERE {} = {} AND {} = {}",
            i18n,
            quoted(I18N_PARENT_COLUMN),
            parent,
            quoted(LOCALE_COLUMN),
            loc
        );
        exec.execute(&q).await?;

        let mut q = QueryBuf::new();
        let parent = q.bind_field(id, id_field);
        let number_ph = q.bind_cast(&json!(number), "bigint");
        let loc = q.bind_text(locale);
        let mut cols = vec![quoted(I18N_PARENT_COLUMN), quoted(LOCALE_COLUMN)];
        let mut select = vec![col("iv", I18N_PARENT_COLUMN), col("iv", LOCALE_COLUMN)];
        for f in coll.localized_fields() {
            cols.push(quoted(&f.column));
            select.push(col("iv", &f.column));
        }
        q.sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS iv WHERE {} = {} AND {} = {} AND {} = {}",
            i18n,
            cols.join(", "),
            select.join(", "),
            i18n_versions,
            col("iv", I18N_PARENT_COLUMN),
            parent,
            col("iv", VERSION_NUMBER_COLUMN),
            number_ph,
            col("iv", LOCALE_COLUMN),
            loc
        );
        exec.execute(&q).await?;
    }
    Ok(())
}

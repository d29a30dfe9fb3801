//! CRUD orchestration: access, hooks, transactions, read-backs and change events.

use crate::config::topology::I18N_PARENT_COLUMN;
use crate::config::{Registry, ResolvedCollection, DELETED_AT_FIELD, ID_FIELD};
use crate::context::{CrudContext, Operation, Record};
use crate::error::AppError;
use crate::query::{FindArgs, FindVersionsArgs, OrderBy, VersionSelector, With};
use crate::realtime::ChangeEvent;
use crate::response::FindResult;
use crate::service::hooks::{HookArgs, HookPoint};
use crate::service::reader::{self, ReadPlan};
use crate::service::{relations, versions, writer, Runtime};
use crate::sql::where_clause::Where;
use crate::sql::{
    delete_by_parent, delete_row, restore_row, soft_delete_row, QueryBuf, Window, DEFAULT_LIMIT, MAX_LIMIT,
};
use crate::state::EngineState;
use crate::store::{rollback_quietly, Executor};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteManyResult {
    pub success: bool,
    pub count: u64,
}

/// Entry point: hands out per-collection and per-global handles over shared engine state.
#[derive(Clone)]
pub struct CrudService {
    state: EngineState,
}

impl CrudService {
    pub fn new(state: EngineState) -> Self {
        CrudService { state }
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Trusted context carrying the configured default locale.
    pub fn system_context(&self) -> CrudContext {
        CrudContext::system().with_default_locale(self.state.default_locale.as_str())
    }

    pub fn collection(&self, name: &str) -> Result<CollectionCrud<'_>, AppError> {
        let coll = self.state.registry.require(name)?;
        if coll.is_global() {
            return Err(AppError::BadRequest(format!("'{}' is a global, not a collection", name)));
        }
        Ok(CollectionCrud { state: &self.state, coll })
    }

    pub fn global(&self, name: &str) -> Result<GlobalCrud<'_>, AppError> {
        let coll = self.state.registry.require(name)?;
        if !coll.is_global() {
            return Err(AppError::BadRequest(format!("'{}' is a collection, not a global", name)));
        }
        Ok(GlobalCrud {
            inner: CollectionCrud { state: &self.state, coll },
        })
    }
}

/// Commit on success, roll back (keeping the original error) on failure.
async fn finish<T>(tx: Box<dyn Executor>, result: Result<T, AppError>) -> Result<T, AppError> {
    match result {
        Ok(v) => {
            tx.commit().await?;
            Ok(v)
        }
        Err(e) => {
            rollback_quietly(tx, &e).await;
            Err(e)
        }
    }
}

fn scoped_context(ctx: &CrudContext, args: &FindArgs) -> CrudContext {
    let mut scoped = ctx.clone();
    if let Some(locale) = &args.locale {
        scoped.locale = Some(locale.clone());
    }
    if let Some(fallback) = args.locale_fallback {
        scoped.locale_fallback = fallback;
    }
    if let Some(include_deleted) = args.include_deleted {
        scoped.include_deleted = include_deleted;
    }
    scoped
}

fn is_deleted(row: &Record) -> bool {
    row.get(DELETED_AT_FIELD).is_some_and(|v| !v.is_null())
}

fn id_of(row: &Record) -> Result<Value, AppError> {
    row.get(ID_FIELD)
        .cloned()
        .ok_or_else(|| AppError::Internal("row without id".into()))
}

/// Operations on one collection. Globals reuse these through `GlobalCrud`.
pub struct CollectionCrud<'s> {
    state: &'s EngineState,
    coll: &'s ResolvedCollection,
}

impl<'s> CollectionCrud<'s> {
    pub fn name(&self) -> &str {
        &self.coll.name
    }

    fn rt<'a>(&'a self, ctx: &'a CrudContext) -> Runtime<'a> {
        Runtime {
            registry: &self.state.registry,
            db: &*self.state.db,
            ctx,
            max_depth: self.state.max_depth,
        }
    }

    async fn run_hook(
        &self,
        point: HookPoint,
        operation: Operation,
        data: Option<&Record>,
        input: &mut Record,
        ctx: &CrudContext,
        exec: &mut dyn Executor,
    ) -> Result<(), AppError> {
        if !self.coll.hooks.has(point) {
            return Ok(());
        }
        let mut args = HookArgs {
            operation,
            data,
            input,
            context: ctx,
            db: exec,
        };
        self.coll.hooks.run(point, &mut args).await
    }

    /// Before-hooks run outside the write transaction, on a pooled connection.
    async fn run_before_hook(
        &self,
        point: HookPoint,
        operation: Operation,
        data: Option<&Record>,
        input: &mut Record,
        ctx: &CrudContext,
    ) -> Result<(), AppError> {
        if !self.coll.hooks.has(point) {
            return Ok(());
        }
        let mut conn = self.state.db.connection().await?;
        self.run_hook(point, operation, data, input, ctx, &mut *conn).await
    }

    /// beforeRead starts from `seed`; whatever it adds or changes becomes an equality filter.
    async fn before_read(
        &self,
        exec: &mut dyn Executor,
        ctx: &CrudContext,
        filter: Option<Where>,
        seed: Record,
    ) -> Result<Option<Where>, AppError> {
        if !self.coll.hooks.has(HookPoint::BeforeRead) {
            return Ok(filter);
        }
        let mut input = seed.clone();
        self.run_hook(HookPoint::BeforeRead, Operation::Read, None, &mut input, ctx, exec)
            .await?;
        let mut parts: Vec<Where> = filter.into_iter().collect();
        for (key, value) in input {
            if seed.get(&key) != Some(&value) {
                parts.push(Where::eq(&key, value));
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Where::and(parts)),
        })
    }

    async fn after_read(
        &self,
        exec: &mut dyn Executor,
        ctx: &CrudContext,
        docs: Vec<Record>,
    ) -> Result<Vec<Record>, AppError> {
        if !self.coll.hooks.has(HookPoint::AfterRead) {
            return Ok(docs);
        }
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut shaped = doc.clone();
            self.run_hook(HookPoint::AfterRead, Operation::Read, Some(&doc), &mut shaped, ctx, &mut *exec)
                .await?;
            out.push(shaped);
        }
        Ok(out)
    }

    /// Load, resolve relations, drop unreadable and internal-only fields.
    #[allow(clippy::too_many_arguments)]
    async fn read_docs(
        &self,
        rt: Runtime<'_>,
        exec: &mut dyn Executor,
        filter: Option<Where>,
        columns: Option<&[String]>,
        with: Option<&With>,
        order_by: &[OrderBy],
        window: Window,
    ) -> Result<Vec<Record>, AppError> {
        let extra = reader::relation_key_fields(self.coll, with);
        let (_, hidden) = reader::projection(self.coll, columns, &extra)?;
        let plan = ReadPlan {
            filter,
            columns,
            extra_fields: extra,
            order_by,
            window,
            include_deleted: rt.ctx.include_deleted,
        };
        let mut rows = reader::load_rows(rt, exec, self.coll, &plan).await?;
        if let Some(with) = with {
            relations::resolve(rt, exec, self.coll, &mut rows, with, 0).await?;
        }
        let enforcer = rt.enforcer(self.coll);
        for row in rows.iter_mut() {
            enforcer.filter_readable_fields(row).await;
        }
        reader::strip_hidden(&mut rows, &hidden);
        Ok(rows)
    }

    /// Post-commit read of one written row on a fresh connection.
    async fn read_back(&self, ctx: &CrudContext, id: &Value, with: Option<&With>) -> Result<Record, AppError> {
        let ctx = ctx.clone().including_deleted();
        let rt = self.rt(&ctx);
        let mut conn = self.state.db.connection().await?;
        let window = Window::Page {
            limit: Some(1),
            offset: 0,
        };
        self.read_docs(rt, &mut *conn, Some(Where::eq(ID_FIELD, id.clone())), None, with, &[], window)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("'{}' {}", self.coll.name, id)))
    }

    async fn existing(&self, rt: Runtime<'_>, id: &Value) -> Result<Record, AppError> {
        let mut conn = self.state.db.connection().await?;
        match reader::load_by_id(rt, &mut *conn, self.coll, id).await? {
            Some(row) if !is_deleted(&row) => Ok(row),
            _ => Err(AppError::NotFound(format!("'{}' {}", self.coll.name, id))),
        }
    }

    /// Ids of live rows matching `filter`, for bulk update and delete.
    async fn matching_ids(&self, rt: Runtime<'_>, filter: Where) -> Result<Vec<Value>, AppError> {
        let mut conn = self.state.db.connection().await?;
        let plan = ReadPlan {
            filter: Some(filter),
            columns: Some(&[]),
            extra_fields: Vec::new(),
            order_by: &[],
            window: Window::Page { limit: None, offset: 0 },
            include_deleted: false,
        };
        let rows = reader::load_rows(rt, &mut *conn, self.coll, &plan).await?;
        rows.iter().map(id_of).collect()
    }

    async fn notify(&self, operation: Operation, id: &Value, payload: &Record, ctx: &CrudContext) {
        let Some(sink) = &self.state.realtime else { return };
        let event = ChangeEvent {
            resource_type: String::from(if self.coll.is_global() { "global" } else { "collection" }),
            resource: self.coll.name.clone(),
            operation: operation.as_str().into(),
            record_id: id.clone(),
            locale: ctx.locale().to_string(),
            payload: Value::Object(payload.clone()),
        };
        if let Err(e) = sink.publish(event).await {
            tracing::warn!(collection = %self.coll.name, error = %e, "realtime delivery failed");
        }
    }

    /// Paginated find. Limit defaults to 100 and is capped at 1000.
    pub async fn find(&self, args: FindArgs, ctx: &CrudContext) -> Result<FindResult, AppError> {
        let ctx = scoped_context(ctx, &args);
        let rt = self.rt(&ctx);
        rt.enforcer(self.coll)
            .require(Operation::Read, &self.coll.name, None, None)
            .await?;
        let mut conn = self.state.db.connection().await?;
        let filter = self.before_read(&mut *conn, &ctx, args.where_, Record::new()).await?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let offset = args.offset.unwrap_or(0);
        let total = reader::count(rt, &mut *conn, self.coll, filter.as_ref(), ctx.include_deleted).await?;
        let window = Window::Page {
            limit: Some(limit),
            offset,
        };
        let docs = self
            .read_docs(rt, &mut *conn, filter, args.columns.as_deref(), args.with.as_ref(), &args.order_by, window)
            .await?;
        let docs = self.after_read(&mut *conn, &ctx, docs).await?;
        Ok(FindResult::new(docs, total, limit, offset))
    }

    /// First match, or `None`. Limit and offset in `args` are ignored.
    pub async fn find_one(&self, args: FindArgs, ctx: &CrudContext) -> Result<Option<Record>, AppError> {
        let ctx = scoped_context(ctx, &args);
        let rt = self.rt(&ctx);
        rt.enforcer(self.coll)
            .require(Operation::Read, &self.coll.name, None, None)
            .await?;
        let mut conn = self.state.db.connection().await?;
        let filter = self.before_read(&mut *conn, &ctx, args.where_, Record::new()).await?;
        let window = Window::Page {
            limit: Some(1),
            offset: 0,
        };
        let docs = self
            .read_docs(rt, &mut *conn, filter, args.columns.as_deref(), args.with.as_ref(), &args.order_by, window)
            .await?;
        Ok(self.after_read(&mut *conn, &ctx, docs).await?.into_iter().next())
    }

    /// Single record by id. Missing rows are NotFound. Only `columns`, `with` and the
    /// locale overrides of `args` apply.
    pub async fn find_by_id(&self, id: &Value, args: FindArgs, ctx: &CrudContext) -> Result<Record, AppError> {
        let ctx = scoped_context(ctx, &args);
        let rt = self.rt(&ctx);
        rt.enforcer(self.coll)
            .require(Operation::Read, &self.coll.name, None, None)
            .await?;
        let mut conn = self.state.db.connection().await?;
        let mut seed = Record::new();
        seed.insert(ID_FIELD.into(), id.clone());
        let filter = self
            .before_read(&mut *conn, &ctx, Some(Where::eq(ID_FIELD, id.clone())), seed)
            .await?;
        let window = Window::Page {
            limit: Some(1),
            offset: 0,
        };
        let docs = self
            .read_docs(rt, &mut *conn, filter, args.columns.as_deref(), args.with.as_ref(), &[], window)
            .await?;
        self.after_read(&mut *conn, &ctx, docs)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("'{}' {}", self.coll.name, id)))
    }

    pub async fn count(&self, filter: Option<Where>, include_deleted: bool, ctx: &CrudContext) -> Result<u64, AppError> {
        let rt = self.rt(ctx);
        rt.enforcer(self.coll)
            .require(Operation::Read, &self.coll.name, None, None)
            .await?;
        let mut conn = self.state.db.connection().await?;
        let filter = self.before_read(&mut *conn, ctx, filter, Record::new()).await?;
        reader::count(rt, &mut *conn, self.coll, filter.as_ref(), include_deleted).await
    }

    pub async fn create(&self, data: Record, with: Option<&With>, ctx: &CrudContext) -> Result<Record, AppError> {
        let rt = self.rt(ctx);
        let enforcer = rt.enforcer(self.coll);
        enforcer
            .require(Operation::Create, &self.coll.name, None, Some(&data))
            .await?;
        let mut input = data;
        self.run_before_hook(HookPoint::BeforeChange, Operation::Create, None, &mut input, ctx)
            .await?;
        enforcer
            .validate_writeable_fields(Operation::Create, &input, None)
            .await?;

        let mut tx = self.state.db.begin().await?;
        let result = self.create_in(rt, &mut *tx, &input).await;
        let id = finish(tx, result).await?;

        let doc = self.read_back(ctx, &id, with).await?;
        self.notify(Operation::Create, &id, &doc, ctx).await;
        Ok(doc)
    }

    async fn create_in(&self, rt: Runtime<'_>, tx: &mut dyn Executor, input: &Record) -> Result<Value, AppError> {
        let id = writer::insert_record(rt, tx, self.coll, input, false).await?;
        self.after_change(rt, tx, Operation::Create, &id, input).await?;
        Ok(id)
    }

    /// Re-read inside the transaction and hand the result to afterChange.
    async fn after_change(
        &self,
        rt: Runtime<'_>,
        tx: &mut dyn Executor,
        operation: Operation,
        id: &Value,
        input: &Record,
    ) -> Result<(), AppError> {
        if !self.coll.hooks.has(HookPoint::AfterChange) {
            return Ok(());
        }
        let row = reader::load_by_id(rt, tx, self.coll, id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("'{}' {} vanished during write", self.coll.name, id)))?;
        let mut input = input.clone();
        self.run_hook(HookPoint::AfterChange, operation, Some(&row), &mut input, rt.ctx, tx)
            .await
    }

    pub async fn update_by_id(
        &self,
        id: &Value,
        data: Record,
        with: Option<&With>,
        ctx: &CrudContext,
    ) -> Result<Record, AppError> {
        let rt = self.rt(ctx);
        let input = self.prepare_update(rt, id, data).await?;

        let mut tx = self.state.db.begin().await?;
        let result = self.update_in(rt, &mut *tx, id, &input).await;
        finish(tx, result).await?;

        let doc = self.read_back(ctx, id, with).await?;
        self.notify(Operation::Update, id, &doc, ctx).await;
        Ok(doc)
    }

    /// Access checks and beforeChange for one row. Field rules see the hook's output.
    async fn prepare_update(&self, rt: Runtime<'_>, id: &Value, data: Record) -> Result<Record, AppError> {
        let existing = self.existing(rt, id).await?;
        let enforcer = rt.enforcer(self.coll);
        enforcer
            .require(Operation::Update, &self.coll.name, Some(&existing), Some(&data))
            .await?;
        let mut input = data;
        self.run_before_hook(HookPoint::BeforeChange, Operation::Update, Some(&existing), &mut input, rt.ctx)
            .await?;
        enforcer
            .validate_writeable_fields(Operation::Update, &input, Some(&existing))
            .await?;
        Ok(input)
    }

    async fn update_in(&self, rt: Runtime<'_>, tx: &mut dyn Executor, id: &Value, input: &Record) -> Result<(), AppError> {
        writer::update_record(rt, tx, self.coll, id, input).await?;
        self.after_change(rt, tx, Operation::Update, id, input).await
    }

    /// Update every live row matching `filter` in one transaction. Any failing row
    /// rolls back the whole batch.
    pub async fn update(
        &self,
        filter: Where,
        data: Record,
        with: Option<&With>,
        ctx: &CrudContext,
    ) -> Result<Vec<Record>, AppError> {
        let rt = self.rt(ctx);
        let ids = self.matching_ids(rt, filter).await?;
        let mut inputs = Vec::with_capacity(ids.len());
        for id in &ids {
            inputs.push(self.prepare_update(rt, id, data.clone()).await?);
        }

        let mut tx = self.state.db.begin().await?;
        let result = self.update_all_in(rt, &mut *tx, &ids, &inputs).await;
        finish(tx, result).await?;

        let mut docs = Vec::with_capacity(ids.len());
        for id in &ids {
            let doc = self.read_back(ctx, id, with).await?;
            self.notify(Operation::Update, id, &doc, ctx).await;
            docs.push(doc);
        }
        Ok(docs)
    }

    async fn update_all_in(
        &self,
        rt: Runtime<'_>,
        tx: &mut dyn Executor,
        ids: &[Value],
        inputs: &[Record],
    ) -> Result<(), AppError> {
        for (id, input) in ids.iter().zip(inputs) {
            self.update_in(rt, tx, id, input).await?;
        }
        Ok(())
    }

    pub async fn delete_by_id(&self, id: &Value, ctx: &CrudContext) -> Result<DeleteResult, AppError> {
        let rt = self.rt(ctx);
        let (existing, mut input) = self.prepare_delete(rt, id).await?;

        let mut tx = self.state.db.begin().await?;
        let result = self.delete_in(&mut *tx, id, &existing, &mut input, ctx).await;
        finish(tx, result).await?;

        self.notify(Operation::Delete, id, &existing, ctx).await;
        Ok(DeleteResult { success: true })
    }

    async fn prepare_delete(&self, rt: Runtime<'_>, id: &Value) -> Result<(Record, Record), AppError> {
        let existing = self.existing(rt, id).await?;
        rt.enforcer(self.coll)
            .require(Operation::Delete, &self.coll.name, Some(&existing), None)
            .await?;
        let mut input = Record::new();
        input.insert(ID_FIELD.into(), id.clone());
        self.run_before_hook(HookPoint::BeforeDelete, Operation::Delete, Some(&existing), &mut input, rt.ctx)
            .await?;
        Ok((existing, input))
    }

    async fn delete_in(
        &self,
        tx: &mut dyn Executor,
        id: &Value,
        existing: &Record,
        input: &mut Record,
        ctx: &CrudContext,
    ) -> Result<(), AppError> {
        let soft = if self.coll.soft_delete {
            soft_delete_row(self.coll, id)
        } else {
            None
        };
        let removed = match soft {
            Some(q) => tx.fetch_optional(&q).await?,
            None => {
                let topology = &self.coll.topology;
                for table in [topology.i18n_versions_table(), topology.i18n_table()].into_iter().flatten() {
                    tx.execute(&delete_by_parent(&table, I18N_PARENT_COLUMN, self.coll, id)).await?;
                }
                if let Some(table) = topology.versions_table() {
                    tx.execute(&delete_by_parent(&table, &self.coll.id_field().column, self.coll, id))
                        .await?;
                }
                tx.fetch_optional(&delete_row(self.coll, id)).await?
            }
        };
        if removed.is_none() {
            return Err(AppError::NotFound(format!("'{}' {}", self.coll.name, id)));
        }
        self.run_hook(HookPoint::AfterDelete, Operation::Delete, Some(existing), input, ctx, tx)
            .await
    }

    /// Delete every live row matching `filter` in one transaction.
    pub async fn delete(&self, filter: Where, ctx: &CrudContext) -> Result<DeleteManyResult, AppError> {
        let rt = self.rt(ctx);
        let ids = self.matching_ids(rt, filter).await?;
        let mut prepared = Vec::with_capacity(ids.len());
        for id in &ids {
            prepared.push(self.prepare_delete(rt, id).await?);
        }

        let mut tx = self.state.db.begin().await?;
        let result = self.delete_all_in(&mut *tx, &ids, &mut prepared, ctx).await;
        finish(tx, result).await?;

        for (id, (existing, _)) in ids.iter().zip(&prepared) {
            self.notify(Operation::Delete, id, existing, ctx).await;
        }
        Ok(DeleteManyResult {
            success: true,
            count: ids.len() as u64,
        })
    }

    async fn delete_all_in(
        &self,
        tx: &mut dyn Executor,
        ids: &[Value],
        prepared: &mut [(Record, Record)],
        ctx: &CrudContext,
    ) -> Result<(), AppError> {
        for (id, (existing, input)) in ids.iter().zip(prepared.iter_mut()) {
            self.delete_in(tx, id, existing, input, ctx).await?;
        }
        Ok(())
    }

    /// Clear `deletedAt`. Collections without soft delete are a BadRequest.
    pub async fn restore_by_id(&self, id: &Value, with: Option<&With>, ctx: &CrudContext) -> Result<Record, AppError> {
        let Some(q) = restore_row(self.coll, id).filter(|_| self.coll.soft_delete) else {
            return Err(AppError::BadRequest(format!(
                "'{}' does not use soft delete",
                self.coll.name
            )));
        };
        let rt = self.rt(ctx);
        rt.enforcer(self.coll)
            .require(Operation::Update, &self.coll.name, None, None)
            .await?;
        let mut tx = self.state.db.begin().await?;
        let result = match tx.fetch_optional(&q).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(AppError::NotFound(format!("'{}' {}", self.coll.name, id))),
            Err(e) => Err(e),
        };
        finish(tx, result).await?;

        let doc = self.read_back(ctx, id, with).await?;
        self.notify(Operation::Update, id, &doc, ctx).await;
        Ok(doc)
    }

    pub async fn find_versions(
        &self,
        id: &Value,
        args: &FindVersionsArgs,
        ctx: &CrudContext,
    ) -> Result<Vec<Record>, AppError> {
        let mut ctx = ctx.clone();
        if let Some(locale) = &args.locale {
            ctx.locale = Some(locale.clone());
        }
        self.rt(&ctx)
            .enforcer(self.coll)
            .require(Operation::Read, &self.coll.name, None, None)
            .await?;
        let mut conn = self.state.db.connection().await?;
        versions::find_versions(&mut *conn, self.coll, id, args, &ctx).await
    }

    /// Restore a snapshot into the live row, then record the result as a new version.
    pub async fn revert_to_version(
        &self,
        id: &Value,
        selector: &VersionSelector,
        with: Option<&With>,
        ctx: &CrudContext,
    ) -> Result<Record, AppError> {
        if !self.coll.is_versioned() {
            return Err(AppError::NotImplemented(format!(
                "versioning is not enabled for '{}'",
                self.coll.name
            )));
        }
        let rt = self.rt(ctx);
        let existing = self.existing(rt, id).await?;
        rt.enforcer(self.coll)
            .require(Operation::Update, &self.coll.name, Some(&existing), None)
            .await?;

        let mut tx = self.state.db.begin().await?;
        let result = self.revert_in(&mut *tx, id, selector, ctx).await;
        let version = finish(tx, result).await?;
        tracing::debug!(collection = %self.coll.name, %id, version, "reverted");

        let doc = self.read_back(ctx, id, with).await?;
        self.notify(Operation::Update, id, &doc, ctx).await;
        Ok(doc)
    }

    async fn revert_in(
        &self,
        tx: &mut dyn Executor,
        id: &Value,
        selector: &VersionSelector,
        ctx: &CrudContext,
    ) -> Result<i64, AppError> {
        let number = versions::resolve_selector(tx, self.coll, id, selector).await?;
        versions::apply_version(tx, self.coll, id, number, ctx).await?;
        versions::snapshot(tx, self.coll, id, Operation::Update, ctx).await?;
        Ok(number)
    }
}

/// A single-row collection. The row is created on first access; `get` never returns NotFound.
pub struct GlobalCrud<'s> {
    inner: CollectionCrud<'s>,
}

impl<'s> GlobalCrud<'s> {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Id of the global's row, inserting it (with its create snapshot) when absent.
    async fn ensure_row(&self, ctx: &CrudContext) -> Result<Value, AppError> {
        let rt = self.inner.rt(ctx);
        let mut conn = self.inner.state.db.connection().await?;
        let plan = ReadPlan {
            filter: None,
            columns: Some(&[]),
            extra_fields: Vec::new(),
            order_by: &[],
            window: Window::Page {
                limit: Some(1),
                offset: 0,
            },
            include_deleted: true,
        };
        if let Some(row) = reader::load_rows(rt, &mut *conn, self.inner.coll, &plan).await?.first() {
            return id_of(row);
        }
        drop(conn);

        let mut tx = self.inner.state.db.begin().await?;
        let result = self.create_row_in(rt, &mut *tx, &plan).await;
        let (id, created) = finish(tx, result).await?;
        if created {
            tracing::info!(global = %self.inner.coll.name, %id, "created global row");
        }
        Ok(id)
    }

    /// Concurrent first accesses serialize on an advisory lock keyed by the table, so only
    /// one of them inserts.
    async fn create_row_in(
        &self,
        rt: Runtime<'_>,
        tx: &mut dyn Executor,
        plan: &ReadPlan<'_>,
    ) -> Result<(Value, bool), AppError> {
        let mut lock = QueryBuf::new();
        let key = lock.bind_text(&self.inner.coll.topology.main_table());
        lock.sql = format!("SELECT pg_advisory_xact_lock(hashtext({}))", key);
        tx.execute(&lock).await?;
        if let Some(row) = reader::load_rows(rt, tx, self.inner.coll, plan).await?.first() {
            return Ok((id_of(row)?, false));
        }
        let id = writer::insert_record(rt, tx, self.inner.coll, &Record::new(), true).await?;
        Ok((id, true))
    }

    pub async fn get(&self, args: FindArgs, ctx: &CrudContext) -> Result<Record, AppError> {
        let scoped = scoped_context(ctx, &args);
        self.inner
            .rt(&scoped)
            .enforcer(self.inner.coll)
            .require(Operation::Read, &self.inner.coll.name, None, None)
            .await?;
        let id = self.ensure_row(&scoped).await?;
        self.inner.find_by_id(&id, args, ctx).await
    }

    pub async fn update(&self, data: Record, with: Option<&With>, ctx: &CrudContext) -> Result<Record, AppError> {
        let id = self.ensure_row(ctx).await?;
        self.inner.update_by_id(&id, data, with, ctx).await
    }

    pub async fn find_versions(&self, args: &FindVersionsArgs, ctx: &CrudContext) -> Result<Vec<Record>, AppError> {
        let id = self.ensure_row(ctx).await?;
        self.inner.find_versions(&id, args, ctx).await
    }

    pub async fn revert_to_version(
        &self,
        selector: &VersionSelector,
        with: Option<&With>,
        ctx: &CrudContext,
    ) -> Result<Record, AppError> {
        let id = self.ensure_row(ctx).await?;
        self.inner.revert_to_version(&id, selector, with, ctx).await
    }
}

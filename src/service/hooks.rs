//! Lifecycle hooks.

use crate::context::{CrudContext, Operation, Record};
use crate::error::AppError;
use crate::store::Executor;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeRead,
    AfterRead,
    BeforeChange,
    AfterChange,
    BeforeDelete,
    AfterDelete,
}

/// `input` is mutable: before-hooks may rewrite the payload (or, for reads, add equality
/// filters); afterRead may reshape the returned document.
pub struct HookArgs<'a> {
    pub operation: Operation,
    /// Existing or resulting record, when there is one.
    pub data: Option<&'a Record>,
    pub input: &'a mut Record,
    pub context: &'a CrudContext,
    /// Change and delete hooks that run after the write share its transaction.
    pub db: &'a mut dyn Executor,
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, args: &mut HookArgs<'_>) -> Result<(), AppError>;
}

#[derive(Clone, Default)]
pub struct Hooks {
    before_read: Vec<Arc<dyn Hook>>,
    after_read: Vec<Arc<dyn Hook>>,
    before_change: Vec<Arc<dyn Hook>>,
    after_change: Vec<Arc<dyn Hook>>,
    before_delete: Vec<Arc<dyn Hook>>,
    after_delete: Vec<Arc<dyn Hook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_read", &self.before_read.len())
            .field("after_read", &self.after_read.len())
            .field("before_change", &self.before_change.len())
            .field("after_change", &self.after_change.len())
            .field("before_delete", &self.before_delete.len())
            .field("after_delete", &self.after_delete.len())
            .finish()
    }
}

impl Hooks {
    fn slot(&self, point: HookPoint) -> &Vec<Arc<dyn Hook>> {
        match point {
            HookPoint::BeforeRead => &self.before_read,
            HookPoint::AfterRead => &self.after_read,
            HookPoint::BeforeChange => &self.before_change,
            HookPoint::AfterChange => &self.after_change,
            HookPoint::BeforeDelete => &self.before_delete,
            HookPoint::AfterDelete => &self.after_delete,
        }
    }

    pub fn add(&mut self, point: HookPoint, hook: Arc<dyn Hook>) {
        let slot = match point {
            HookPoint::BeforeRead => &mut self.before_read,
            HookPoint::AfterRead => &mut self.after_read,
            HookPoint::BeforeChange => &mut self.before_change,
            HookPoint::AfterChange => &mut self.after_change,
            HookPoint::BeforeDelete => &mut self.before_delete,
            HookPoint::AfterDelete => &mut self.after_delete,
        };
        slot.push(hook);
    }

    pub fn has(&self, point: HookPoint) -> bool {
        !self.slot(point).is_empty()
    }

    /// Run the hooks registered at `point` in registration order. The first error aborts.
    pub async fn run(&self, point: HookPoint, args: &mut HookArgs<'_>) -> Result<(), AppError> {
        for hook in self.slot(point) {
            hook.run(args).await.map_err(|e| {
                tracing::warn!(hook = ?point, operation = args.operation.as_str(), error = %e, "hook failed");
                e
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::{MockDatabase, Reply};
    use crate::store::Database;
    use serde_json::json;

    struct Stamp(&'static str);

    #[async_trait]
    impl Hook for Stamp {
        async fn run(&self, args: &mut HookArgs<'_>) -> Result<(), AppError> {
            let seen = args.input.get("trail").and_then(|v| v.as_str()).unwrap_or("").to_string();
            args.input.insert("trail".into(), json!(format!("{}{}", seen, self.0)));
            Ok(())
        }
    }

    struct Reject;

    #[async_trait]
    impl Hook for Reject {
        async fn run(&self, _args: &mut HookArgs<'_>) -> Result<(), AppError> {
            Err(AppError::Validation("rejected".into()))
        }
    }

    #[tokio::test]
    async fn runs_in_order_and_stops_at_first_error() {
        let db = MockDatabase::new(|_, _| Reply::Affected(0));
        let mut conn = db.connection().await.unwrap();
        let ctx = CrudContext::system();
        let mut hooks = Hooks::default();
        hooks.add(HookPoint::BeforeChange, Arc::new(Stamp("a")));
        hooks.add(HookPoint::BeforeChange, Arc::new(Stamp("b")));
        let mut input = Record::new();
        let mut args = HookArgs {
            operation: Operation::Create,
            data: None,
            input: &mut input,
            context: &ctx,
            db: &mut *conn,
        };
        hooks.run(HookPoint::BeforeChange, &mut args).await.unwrap();
        assert_eq!(input["trail"], json!("ab"));

        hooks.add(HookPoint::AfterChange, Arc::new(Reject));
        hooks.add(HookPoint::AfterChange, Arc::new(Stamp("c")));
        let mut input = Record::new();
        let mut args = HookArgs {
            operation: Operation::Update,
            data: None,
            input: &mut input,
            context: &ctx,
            db: &mut *conn,
        };
        assert!(hooks.run(HookPoint::AfterChange, &mut args).await.is_err());
        assert!(input.get("trail").is_none());
        assert!(!hooks.has(HookPoint::AfterDelete));
    }
}

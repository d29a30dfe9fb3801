//! Access control: collection-level and field-level rules, evaluated per operation.
//!
//! A missing rule allows. System-mode contexts bypass every rule. A check function
//! that errors denies.

use crate::config::{AccessConfig, AccessRuleConfig};
use crate::context::{CrudContext, Operation, Record, User};
use crate::error::AppError;
use crate::store::Database;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Everything a check function may look at.
pub struct AccessArgs<'a> {
    pub operation: Operation,
    pub user: Option<&'a User>,
    pub session: Option<&'a Value>,
    /// Existing row, for update and delete.
    pub row: Option<&'a Record>,
    /// Write payload, for create and update.
    pub input: Option<&'a Record>,
    pub db: &'a dyn Database,
    pub locale: &'a str,
}

#[async_trait]
pub trait AccessCheck: Send + Sync {
    async fn check(&self, args: AccessArgs<'_>) -> Result<bool, AppError>;
}

#[async_trait]
impl<F> AccessCheck for F
where
    F: Fn(&AccessArgs<'_>) -> bool + Send + Sync,
{
    async fn check(&self, args: AccessArgs<'_>) -> Result<bool, AppError> {
        Ok(self(&args))
    }
}

#[derive(Clone)]
pub enum AccessRule {
    Literal(bool),
    /// Allowed when the user's role equals this name.
    Role(String),
    Check(Arc<dyn AccessCheck>),
}

impl AccessRule {
    pub fn check(f: impl AccessCheck + 'static) -> Self {
        AccessRule::Check(Arc::new(f))
    }
}

impl fmt::Debug for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRule::Literal(b) => write!(f, "Literal({})", b),
            AccessRule::Role(r) => write!(f, "Role({:?})", r),
            AccessRule::Check(_) => f.write_str("Check(..)"),
        }
    }
}

impl From<&AccessRuleConfig> for AccessRule {
    fn from(c: &AccessRuleConfig) -> Self {
        match c {
            AccessRuleConfig::Literal(b) => AccessRule::Literal(*b),
            AccessRuleConfig::Role(r) => AccessRule::Role(r.clone()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FieldAccess {
    pub read: Option<AccessRule>,
    pub create: Option<AccessRule>,
    pub update: Option<AccessRule>,
}

impl FieldAccess {
    fn rule(&self, op: Operation) -> Option<&AccessRule> {
        match op {
            Operation::Read => self.read.as_ref(),
            Operation::Create => self.create.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccessRules {
    pub read: Option<AccessRule>,
    pub create: Option<AccessRule>,
    pub update: Option<AccessRule>,
    pub delete: Option<AccessRule>,
    pub fields: BTreeMap<String, FieldAccess>,
}

impl AccessRules {
    pub fn from_config(c: &AccessConfig) -> Self {
        AccessRules {
            read: c.read.as_ref().map(AccessRule::from),
            create: c.create.as_ref().map(AccessRule::from),
            update: c.update.as_ref().map(AccessRule::from),
            delete: c.delete.as_ref().map(AccessRule::from),
            fields: c
                .fields
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        FieldAccess {
                            read: f.read.as_ref().map(AccessRule::from),
                            create: f.create.as_ref().map(AccessRule::from),
                            update: f.update.as_ref().map(AccessRule::from),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn rule(&self, op: Operation) -> Option<&AccessRule> {
        match op {
            Operation::Read => self.read.as_ref(),
            Operation::Create => self.create.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
        }
    }

    pub fn set(&mut self, op: Operation, rule: AccessRule) {
        let slot = match op {
            Operation::Read => &mut self.read,
            Operation::Create => &mut self.create,
            Operation::Update => &mut self.update,
            Operation::Delete => &mut self.delete,
        };
        *slot = Some(rule);
    }

    pub fn set_field(&mut self, field: &str, op: Operation, rule: AccessRule) {
        let entry = self.fields.entry(field.to_string()).or_default();
        match op {
            Operation::Read => entry.read = Some(rule),
            Operation::Create => entry.create = Some(rule),
            Operation::Update => entry.update = Some(rule),
            Operation::Delete => {
                tracing::warn!(field, "delete rules do not apply to fields; ignored");
            }
        }
    }
}

/// Evaluates one collection's rules for one caller.
pub struct AccessEnforcer<'a> {
    rules: &'a AccessRules,
    ctx: &'a CrudContext,
    db: &'a dyn Database,
}

impl<'a> AccessEnforcer<'a> {
    pub fn new(rules: &'a AccessRules, ctx: &'a CrudContext, db: &'a dyn Database) -> Self {
        AccessEnforcer { rules, ctx, db }
    }

    async fn evaluate(
        &self,
        rule: Option<&AccessRule>,
        op: Operation,
        row: Option<&Record>,
        input: Option<&Record>,
    ) -> bool {
        let Some(rule) = rule else { return true };
        match rule {
            AccessRule::Literal(b) => *b,
            AccessRule::Role(role) => self.ctx.user_role() == Some(role.as_str()),
            AccessRule::Check(f) => {
                let args = AccessArgs {
                    operation: op,
                    user: self.ctx.user.as_ref(),
                    session: self.ctx.session.as_ref(),
                    row,
                    input,
                    db: self.db,
                    locale: self.ctx.locale(),
                };
                match f.check(args).await {
                    Ok(allowed) => allowed,
                    Err(e) => {
                        tracing::warn!(operation = op.as_str(), error = %e, "access check failed; denying");
                        false
                    }
                }
            }
        }
    }

    /// Collection-level rule for `op`.
    pub async fn authorize(&self, op: Operation, row: Option<&Record>, input: Option<&Record>) -> bool {
        if self.ctx.is_system() {
            return true;
        }
        self.evaluate(self.rules.rule(op), op, row, input).await
    }

    /// Like `authorize`, but a denial is a `Forbidden` error.
    pub async fn require(
        &self,
        op: Operation,
        collection: &str,
        row: Option<&Record>,
        input: Option<&Record>,
    ) -> Result<(), AppError> {
        if self.authorize(op, row, input).await {
            Ok(())
        } else {
            Err(AppError::forbidden(format!("not allowed to {} '{}'", op.as_str(), collection)))
        }
    }

    /// Drop fields whose read rule denies.
    pub async fn filter_readable_fields(&self, row: &mut Record) {
        if self.ctx.is_system() || self.rules.fields.is_empty() {
            return;
        }
        for (name, access) in &self.rules.fields {
            if !row.contains_key(name) {
                continue;
            }
            if !self.evaluate(access.rule(Operation::Read), Operation::Read, Some(&*row), None).await {
                row.remove(name);
            }
        }
    }

    /// Every written field must pass its create/update rule; the first denial fails the whole write.
    pub async fn validate_writeable_fields(
        &self,
        op: Operation,
        input: &Record,
        row: Option<&Record>,
    ) -> Result<(), AppError> {
        if self.ctx.is_system() {
            return Ok(());
        }
        for key in input.keys() {
            let Some(access) = self.rules.fields.get(key) else { continue };
            if !self.evaluate(access.rule(op), op, row, Some(input)).await {
                return Err(AppError::forbidden_field(key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::{rec, MockDatabase, Reply};
    use serde_json::json;

    fn db() -> MockDatabase {
        MockDatabase::new(|_, _| Reply::Affected(0))
    }

    fn salary_rules() -> AccessRules {
        let mut rules = AccessRules::from_config(
            &serde_json::from_value(json!({ "read": true, "update": "editor" })).unwrap(),
        );
        let admin_only = AccessRule::check(|args: &AccessArgs<'_>| {
            args.user.and_then(|u| u.role.as_deref()) == Some("admin")
        });
        rules.set_field("salary", Operation::Read, admin_only.clone());
        rules.set_field("salary", Operation::Update, admin_only);
        rules
    }

    #[tokio::test]
    async fn non_admin_never_sees_salary() {
        let rules = salary_rules();
        let db = db();
        let ctx = CrudContext::for_user(User::new("u1", Some("editor")));
        let enforcer = AccessEnforcer::new(&rules, &ctx, &db);
        let mut row = rec(json!({ "id": "e1", "name": "Eve", "salary": 100 }));
        enforcer.filter_readable_fields(&mut row).await;
        assert!(!row.contains_key("salary"));
        assert_eq!(row["name"], json!("Eve"));

        let admin = CrudContext::for_user(User::new("u2", Some("admin")));
        let enforcer = AccessEnforcer::new(&rules, &admin, &db);
        let mut row = rec(json!({ "id": "e1", "salary": 100 }));
        enforcer.filter_readable_fields(&mut row).await;
        assert_eq!(row["salary"], json!(100));
    }

    #[tokio::test]
    async fn field_write_denial_names_the_field() {
        let rules = salary_rules();
        let db = db();
        let ctx = CrudContext::for_user(User::new("u1", Some("editor")));
        let enforcer = AccessEnforcer::new(&rules, &ctx, &db);
        let input = rec(json!({ "name": "x", "salary": 5 }));
        match enforcer.validate_writeable_fields(Operation::Update, &input, None).await {
            Err(AppError::Forbidden { field, .. }) => assert_eq!(field.as_deref(), Some("salary")),
            other => panic!("expected forbidden, got {:?}", other),
        }
        let input = rec(json!({ "name": "x" }));
        enforcer
            .validate_writeable_fields(Operation::Update, &input, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn role_and_missing_rules() {
        let rules = salary_rules();
        let db = db();
        let viewer = CrudContext::for_user(User::new("u3", Some("viewer")));
        let enforcer = AccessEnforcer::new(&rules, &viewer, &db);
        assert!(enforcer.authorize(Operation::Read, None, None).await);
        assert!(!enforcer.authorize(Operation::Update, None, None).await);
        assert!(enforcer.authorize(Operation::Delete, None, None).await);
    }

    struct Failing;

    #[async_trait]
    impl AccessCheck for Failing {
        async fn check(&self, _args: AccessArgs<'_>) -> Result<bool, AppError> {
            Err(AppError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn failing_check_denies_but_system_bypasses() {
        let mut rules = AccessRules::default();
        rules.set(Operation::Create, AccessRule::check(Failing));
        let db = db();
        let user = CrudContext::for_user(User::new("u1", None));
        assert!(!AccessEnforcer::new(&rules, &user, &db).authorize(Operation::Create, None, None).await);
        let system = CrudContext::system();
        assert!(AccessEnforcer::new(&rules, &system, &db).authorize(Operation::Create, None, None).await);
    }
}

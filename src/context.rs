//! Per-call context passed to every CRUD operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One logical record: field name -> JSON value.
pub type Record = serde_json::Map<String, Value>;

/// `System` is the trusted internal path and bypasses every access rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    System,
    User,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Value,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(flatten)]
    pub attributes: Record,
}

impl User {
    pub fn new(id: impl Into<Value>, role: Option<&str>) -> Self {
        User {
            id: id.into(),
            role: role.map(str::to_string),
            attributes: Record::new(),
        }
    }
}

/// Operation kinds, as seen by access rules, hooks and version metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrudContext {
    pub user: Option<User>,
    pub session: Option<Value>,
    pub locale: Option<String>,
    pub default_locale: String,
    pub access_mode: AccessMode,
    pub locale_fallback: bool,
    pub include_deleted: bool,
}

impl Default for CrudContext {
    fn default() -> Self {
        CrudContext {
            user: None,
            session: None,
            locale: None,
            default_locale: "en".into(),
            access_mode: AccessMode::System,
            locale_fallback: true,
            include_deleted: false,
        }
    }
}

impl CrudContext {
    pub fn system() -> Self {
        Self::default()
    }

    /// User-mode context: access rules are enforced.
    pub fn for_user(user: User) -> Self {
        CrudContext {
            user: Some(user),
            access_mode: AccessMode::User,
            ..Self::default()
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    pub fn with_locale_fallback(mut self, enabled: bool) -> Self {
        self.locale_fallback = enabled;
        self
    }

    pub fn with_session(mut self, session: Value) -> Self {
        self.session = Some(session);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn is_system(&self) -> bool {
        self.access_mode == AccessMode::System
    }

    /// Requested locale, or the default locale when none was given.
    pub fn locale(&self) -> &str {
        self.locale.as_deref().unwrap_or(&self.default_locale)
    }

    /// Fallback to the default locale applies only when a different locale is requested.
    pub fn fallback_active(&self) -> bool {
        self.locale_fallback && self.locale() != self.default_locale
    }

    pub fn user_role(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.role.as_deref())
    }
}

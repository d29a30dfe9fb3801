//! CRUD orchestration and the pieces it composes: access, hooks, localization,
//! relation loading, versioning and nested writes.

pub mod access;
pub mod hooks;
pub mod i18n;
pub mod reader;
pub mod relations;
pub mod versions;
mod crud;
mod nested;
mod validation;
mod writer;

pub use crud::{CollectionCrud, CrudService, DeleteManyResult, DeleteResult, GlobalCrud};
pub use validation::RequestValidator;

use crate::config::{Registry, ResolvedCollection};
use crate::context::CrudContext;
use crate::sql::where_clause::WhereCompiler;
use crate::store::Database;
use access::AccessEnforcer;

/// Borrowed state shared by every step of one operation.
#[derive(Clone, Copy)]
pub struct Runtime<'a> {
    pub registry: &'a Registry,
    pub db: &'a dyn Database,
    pub ctx: &'a CrudContext,
    pub max_depth: usize,
}

impl<'a> Runtime<'a> {
    pub fn enforcer<'c>(&self, coll: &'c ResolvedCollection) -> AccessEnforcer<'c>
    where
        'a: 'c,
    {
        AccessEnforcer::new(&coll.access, self.ctx, self.db)
    }

    pub fn compiler(&self) -> WhereCompiler<'a> {
        WhereCompiler::new(self.registry, self.ctx.locale()).with_max_depth(self.max_depth)
    }
}

//! Architect CMS: schema-driven record access over PostgreSQL with localization,
//! versioning, relations and access rules.

pub mod case;
pub mod config;
pub mod context;
pub mod error;
pub mod migration;
pub mod query;
pub mod realtime;
pub mod response;
pub mod service;
pub mod sql;
pub mod state;
pub mod store;

pub use config::{load_from_path, resolve, resolve_in_schema, CollectionConfig, Registry, ResolvedCollection, Settings};
pub use context::{AccessMode, CrudContext, Operation, Record, User};
pub use error::{AppError, ConfigError};
pub use migration::{apply_migrations, migration_statements};
pub use query::{FindArgs, FindVersionsArgs, OrderBy, VersionSelector, With, WithOptions};
pub use realtime::{BroadcastSink, ChangeEvent, RealtimeSink};
pub use response::FindResult;
pub use service::{CollectionCrud, CrudService, DeleteManyResult, DeleteResult, GlobalCrud};
pub use sql::where_clause::Where;
pub use state::EngineState;
pub use store::{Database, Executor, PgDatabase};

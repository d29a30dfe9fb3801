//! Shared engine state: database, collection registry and optional realtime sink.

use crate::config::{Registry, Settings};
use crate::realtime::RealtimeSink;
use crate::sql::where_clause::MAX_DEPTH;
use crate::store::Database;
use std::sync::Arc;

#[derive(Clone)]
pub struct EngineState {
    pub db: Arc<dyn Database>,
    /// Built once at startup; read-only afterwards.
    pub registry: Arc<Registry>,
    pub realtime: Option<Arc<dyn RealtimeSink>>,
    pub max_depth: usize,
    pub default_locale: String,
}

impl EngineState {
    pub fn new(db: Arc<dyn Database>, registry: Registry) -> Self {
        EngineState {
            db,
            registry: Arc::new(registry),
            realtime: None,
            max_depth: MAX_DEPTH,
            default_locale: "en".into(),
        }
    }

    pub fn with_realtime(mut self, sink: Arc<dyn RealtimeSink>) -> Self {
        self.realtime = Some(sink);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Apply process settings (nesting limit and default locale).
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.max_depth = settings.max_depth;
        self.default_locale = settings.default_locale.clone();
        self
    }
}

//! Process settings read from the environment.

use crate::config::loader::DEFAULT_DB_SCHEMA;
use crate::sql::where_clause::MAX_DEPTH;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub db_schema: String,
    pub default_locale: String,
    pub max_connections: u32,
    /// Nesting limit for where filters and relation includes.
    pub max_depth: usize,
    /// Directory of collection config files.
    pub config_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            db_schema: DEFAULT_DB_SCHEMA.into(),
            default_locale: "en".into(),
            max_connections: 5,
            max_depth: MAX_DEPTH,
            config_path: None,
        }
    }
}

impl Settings {
    /// Reads DATABASE_URL, ARCHITECT_SCHEMA, ARCHITECT_DEFAULT_LOCALE, ARCHITECT_MAX_CONNECTIONS,
    /// ARCHITECT_MAX_DEPTH and ARCHITECT_CONFIG_PATH. Call `dotenvy::dotenv()` first to honor a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        Settings {
            database_url: get("DATABASE_URL"),
            db_schema: get("ARCHITECT_SCHEMA").unwrap_or(d.db_schema),
            default_locale: get("ARCHITECT_DEFAULT_LOCALE").unwrap_or(d.default_locale),
            max_connections: get("ARCHITECT_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_connections),
            max_depth: get("ARCHITECT_MAX_DEPTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_depth),
            config_path: get("ARCHITECT_CONFIG_PATH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn falls_back_to_defaults() {
        let s = Settings::from_lookup(|_| None);
        assert_eq!(s, Settings::default());
        assert_eq!(s.db_schema, "public");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage_numbers() {
        let env: HashMap<&str, &str> = [
            ("ARCHITECT_SCHEMA", "cms"),
            ("ARCHITECT_DEFAULT_LOCALE", "sk"),
            ("ARCHITECT_MAX_CONNECTIONS", "lots"),
            ("ARCHITECT_MAX_DEPTH", "4"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.db_schema, "cms");
        assert_eq!(s.default_locale, "sk");
        assert_eq!(s.max_connections, 5);
        assert_eq!(s.max_depth, 4);
    }
}

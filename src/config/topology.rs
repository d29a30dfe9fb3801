//! Physical tables backing one collection.

use crate::sql::{qualified_table, quoted};

pub const I18N_PARENT_COLUMN: &str = "parent_id";
pub const LOCALE_COLUMN: &str = "locale";
pub const VERSION_ID_COLUMN: &str = "version_id";
pub const VERSION_NUMBER_COLUMN: &str = "version_number";
pub const VERSION_OPERATION_COLUMN: &str = "version_operation";
pub const VERSION_USER_COLUMN: &str = "version_user_id";
pub const VERSION_CREATED_AT_COLUMN: &str = "version_created_at";

/// Main table always exists. The i18n table exists when the collection has localized
/// fields; the version tables exist when versioning is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableTopology {
    pub schema: String,
    pub main: String,
    pub i18n: Option<String>,
    pub versions: Option<String>,
    pub i18n_versions: Option<String>,
}

impl TableTopology {
    pub fn derive(schema: &str, table: &str, localized: bool, versioned: bool) -> Self {
        TableTopology {
            schema: schema.to_string(),
            main: table.to_string(),
            i18n: localized.then(|| format!("{}_i18n", table)),
            versions: versioned.then(|| format!("{}_versions", table)),
            i18n_versions: (localized && versioned).then(|| format!("{}_i18n_versions", table)),
        }
    }

    pub fn main_table(&self) -> String {
        qualified_table(&self.schema, &self.main)
    }

    pub fn i18n_table(&self) -> Option<String> {
        self.i18n.as_deref().map(|t| qualified_table(&self.schema, t))
    }

    pub fn versions_table(&self) -> Option<String> {
        self.versions.as_deref().map(|t| qualified_table(&self.schema, t))
    }

    pub fn i18n_versions_table(&self) -> Option<String> {
        self.i18n_versions.as_deref().map(|t| qualified_table(&self.schema, t))
    }

    pub fn qualify(&self, table: &str) -> String {
        qualified_table(&self.schema, table)
    }
}

/// `alias."column"`
pub fn col(alias: &str, column: &str) -> String {
    format!("{}.{}", alias, quoted(column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_tables_from_flags() {
        let t = TableTopology::derive("public", "posts", true, true);
        assert_eq!(t.main_table(), "\"public\".\"posts\"");
        assert_eq!(t.i18n.as_deref(), Some("posts_i18n"));
        assert_eq!(t.versions.as_deref(), Some("posts_versions"));
        assert_eq!(t.i18n_versions.as_deref(), Some("posts_i18n_versions"));

        let plain = TableTopology::derive("cms", "users", false, true);
        assert!(plain.i18n.is_none());
        assert!(plain.i18n_versions.is_none());
        assert_eq!(plain.versions_table().as_deref(), Some("\"cms\".\"users_versions\""));
    }
}

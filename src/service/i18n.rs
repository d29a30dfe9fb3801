//! Localization: choose locale joins for a read and fold the joined columns back into plain fields.

use crate::config::ResolvedCollection;
use crate::context::{CrudContext, Record};
use crate::sql::LocaleJoin;
use serde_json::Value;

pub const CURRENT_PREFIX: &str = "_i18n_";
pub const FALLBACK_PREFIX: &str = "_i18n_fallback_";

/// Locale joins for reading `coll`, or `None` when it has no localized fields.
pub fn locale_join(coll: &ResolvedCollection, ctx: &CrudContext) -> Option<LocaleJoin> {
    if !coll.is_localized() {
        return None;
    }
    Some(LocaleJoin {
        locale: ctx.locale().to_string(),
        fallback: ctx.fallback_active().then(|| ctx.default_locale.clone()),
    })
}

/// Replace `_i18n_<f>` / `_i18n_fallback_<f>` with `<f>`: the current-locale value when
/// non-null, else the fallback value, else null. Fields that were not projected stay absent.
pub fn merge_localized(row: &mut Record, coll: &ResolvedCollection) {
    for f in coll.localized_fields() {
        let current_key = format!("{}{}", CURRENT_PREFIX, f.name);
        let fallback_key = format!("{}{}", FALLBACK_PREFIX, f.name);
        let current = row.remove(&current_key);
        let fallback = row.remove(&fallback_key);
        if current.is_none() && fallback.is_none() {
            continue;
        }
        let value = match current {
            Some(v) if !v.is_null() => v,
            _ => fallback.unwrap_or(Value::Null),
        };
        row.insert(f.name.clone(), value);
    }
}

pub fn merge_rows(rows: &mut [Record], coll: &ResolvedCollection) {
    if !coll.is_localized() {
        return;
    }
    for row in rows {
        merge_localized(row, coll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CollectionConfig};
    use crate::store::mock::rec;
    use serde_json::json;

    fn posts() -> ResolvedCollection {
        let c: Vec<CollectionConfig> = serde_json::from_value(json!([{
            "name": "posts",
            "fields": { "title": { "type": "text" }, "body": { "type": "text" }, "slug": { "type": "text" } },
            "localized": ["title", "body"]
        }]))
        .unwrap();
        resolve(&c).unwrap().get("posts").unwrap().clone()
    }

    #[test]
    fn falls_back_per_field() {
        let coll = posts();
        let mut row = rec(json!({
            "id": "p1",
            "slug": "hello",
            "_i18n_title": "Ahoj",
            "_i18n_fallback_title": "Hello",
            "_i18n_body": null,
            "_i18n_fallback_body": "English body"
        }));
        merge_localized(&mut row, &coll);
        assert_eq!(
            row,
            rec(json!({ "id": "p1", "slug": "hello", "title": "Ahoj", "body": "English body" }))
        );
    }

    #[test]
    fn missing_translation_without_fallback_is_null() {
        let coll = posts();
        let mut row = rec(json!({ "id": "p1", "_i18n_title": null }));
        merge_localized(&mut row, &coll);
        assert_eq!(row, rec(json!({ "id": "p1", "title": null })));
    }

    #[test]
    fn join_only_falls_back_for_other_locales() {
        let coll = posts();
        let sk = CrudContext::system().with_locale("sk");
        assert_eq!(
            locale_join(&coll, &sk),
            Some(LocaleJoin {
                locale: "sk".into(),
                fallback: Some("en".into())
            })
        );
        let en = CrudContext::system();
        assert_eq!(locale_join(&coll, &en).unwrap().fallback, None);
        let no_fb = CrudContext::system().with_locale("sk").with_locale_fallback(false);
        assert_eq!(locale_join(&coll, &no_fb).unwrap().fallback, None);
    }
}

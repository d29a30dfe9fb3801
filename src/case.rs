//! Case conversion between field names (camelCase, as used by callers) and column names (snake_case, as stored).

/// Convert a single identifier from snake_case to camelCase.
/// e.g. "author_id" -> "authorId", "created_at" -> "createdAt"
pub fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = false;
    for c in s.chars() {
        if c == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert a single identifier from camelCase to snake_case.
/// e.g. "authorId" -> "author_id", "createdAt" -> "created_at"
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_and_camel() {
        assert_eq!(to_snake_case("authorId"), "author_id");
        assert_eq!(to_snake_case("title"), "title");
        assert_eq!(to_camel_case("version_created_at"), "versionCreatedAt");
        assert_eq!(to_camel_case(&to_snake_case("parentPostId")), "parentPostId");
    }
}

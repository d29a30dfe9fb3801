//! Request validation from field declarations and their rules.

use crate::config::{FieldType, ResolvedCollection, ResolvedField, ValidationRule};
use crate::context::Record;
use crate::error::AppError;
use regex::Regex;
use serde_json::Value;

pub struct RequestValidator;

impl RequestValidator {
    /// Validate a create payload. Required fields without a default must be present and non-null.
    pub fn validate(body: &Record, coll: &ResolvedCollection) -> Result<(), AppError> {
        for f in &coll.fields {
            let val = body.get(&f.name);
            if f.required && f.default.is_none() && (val.is_none() || val == Some(&Value::Null)) {
                return Err(AppError::Validation(format!("{} is required", f.name)));
            }
            if let Some(v) = val {
                validate_field(f, v)?;
            }
        }
        Ok(())
    }

    /// Validate only the fields present in body. Required fields may not be nulled.
    pub fn validate_partial(body: &Record, coll: &ResolvedCollection) -> Result<(), AppError> {
        for (name, v) in body {
            if let Some(f) = coll.field(name) {
                if f.required && v.is_null() {
                    return Err(AppError::Validation(format!("{} is required", name)));
                }
                validate_field(f, v)?;
            }
        }
        Ok(())
    }
}

fn validate_field(f: &ResolvedField, v: &Value) -> Result<(), AppError> {
    if v.is_null() {
        return Ok(());
    }
    validate_type(&f.name, f.type_, v)?;
    match &f.validation {
        Some(rule) => validate_rule(&f.name, v, rule),
        None => Ok(()),
    }
}

fn validate_type(col: &str, type_: FieldType, v: &Value) -> Result<(), AppError> {
    let ok = match type_ {
        FieldType::Text | FieldType::Timestamp | FieldType::Date => v.is_string(),
        FieldType::Uuid => v.as_str().map_or(false, |s| uuid::Uuid::parse_str(s).is_ok()),
        FieldType::Integer => v.is_i64() || v.is_u64(),
        FieldType::Number => v.is_number(),
        FieldType::Boolean => v.is_boolean(),
        FieldType::Json => true,
        FieldType::TextArray => v.as_array().map_or(false, |a| a.iter().all(Value::is_string)),
        FieldType::IntegerArray => v.as_array().map_or(false, |a| a.iter().all(Value::is_i64)),
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!("{} must be of type {:?}", col, type_)))
    }
}

fn validate_rule(col: &str, v: &Value, rule: &ValidationRule) -> Result<(), AppError> {
    if let Some(format) = &rule.format {
        validate_format(col, v, format)?;
    }
    if let Some(max) = rule.max_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() > max as usize {
                return Err(AppError::Validation(format!(
                    "{} must be at most {} characters",
                    col, max
                )));
            }
        }
    }
    if let Some(min) = rule.min_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() < min as usize {
                return Err(AppError::Validation(format!(
                    "{} must be at least {} characters",
                    col, min
                )));
            }
        }
    }
    if let Some(ref pattern) = rule.pattern {
        let re = Regex::new(pattern).map_err(|_| AppError::Validation(format!("invalid pattern for {}", col)))?;
        if let Some(s) = v.as_str() {
            if !re.is_match(s) {
                return Err(AppError::Validation(format!("{} does not match required pattern", col)));
            }
        }
    }
    if let Some(ref allowed) = rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(AppError::Validation(format!(
                "{} must be one of: {:?}",
                col,
                allowed.iter().take(5).collect::<Vec<_>>()
            )));
        }
    }
    if let Some(min) = rule.minimum {
        if let Some(n) = v.as_f64() {
            if n < min {
                return Err(AppError::Validation(format!("{} must be at least {}", col, min)));
            }
        }
    }
    if let Some(max) = rule.maximum {
        if let Some(n) = v.as_f64() {
            if n > max {
                return Err(AppError::Validation(format!("{} must be at most {}", col, max)));
            }
        }
    }
    Ok(())
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::String(t)) => s == t,
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn validate_format(col: &str, v: &Value, format: &str) -> Result<(), AppError> {
    match format.to_lowercase().as_str() {
        "email" => {
            if let Some(s) = v.as_str() {
                if !s.contains('@') || s.len() < 3 {
                    return Err(AppError::Validation(format!("{} must be a valid email", col)));
                }
            }
        }
        "uuid" => {
            if let Some(s) = v.as_str() {
                if uuid::Uuid::parse_str(s).is_err() {
                    return Err(AppError::Validation(format!("{} must be a valid UUID", col)));
                }
            }
        }
        "slug" => {
            if let Some(s) = v.as_str() {
                if s.is_empty() || !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
                    return Err(AppError::Validation(format!("{} must be a slug", col)));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

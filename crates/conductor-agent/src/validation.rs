use regex::Regex;
use serde_json::Value;

use conductor_core::error::{ConductorError, Result};
use conductor_core::workflow::{OutputSchema, ValidationRule};

use crate::graph::handoff::lookup_path;

/// Check a step's input against its validation rules.
///
/// All violations are collected into one `Validation` error.
pub fn validate_input(rules: &[ValidationRule], input: &Value) -> Result<()> {
    let mut violations = Vec::new();
    for rule in rules {
        if let Err(msg) = check_rule(rule, input) {
            violations.push(msg);
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConductorError::Validation(violations.join("; ")))
    }
}

fn check_rule(rule: &ValidationRule, input: &Value) -> std::result::Result<(), String> {
    match rule {
        ValidationRule::Required { field } => {
            let value = lookup_path(input, field);
            let missing = match &value {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                _ => false,
            };
            if missing {
                return Err(format!("'{}' is required", field));
            }
        }
        ValidationRule::Pattern { field, pattern } => {
            let re = Regex::new(pattern)
                .map_err(|e| format!("invalid pattern for '{}': {}", field, e))?;
            if let Some(text) = text_of(&lookup_path(input, field)) {
                if !re.is_match(&text) {
                    return Err(format!("'{}' does not match /{}/", field, pattern));
                }
            }
        }
        ValidationRule::MinLength { field, min } => {
            if let Some(len) = length_of(&lookup_path(input, field)) {
                if len < *min {
                    return Err(format!("'{}' shorter than {}", field, min));
                }
            }
        }
        ValidationRule::MaxLength { field, max } => {
            if let Some(len) = length_of(&lookup_path(input, field)) {
                if len > *max {
                    return Err(format!("'{}' longer than {}", field, max));
                }
            }
        }
        ValidationRule::Range { field, min, max } => {
            let value = lookup_path(input, field);
            if value.is_null() {
                return Ok(());
            }
            let Some(n) = value.as_f64() else {
                return Err(format!("'{}' is not a number", field));
            };
            if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                return Err(format!("'{}' = {} out of range", field, n));
            }
        }
        ValidationRule::OneOf { field, values } => {
            let value = lookup_path(input, field);
            if !value.is_null() && !values.contains(&value) {
                return Err(format!("'{}' must be one of {:?}", field, values));
            }
        }
    }
    Ok(())
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

/// Ensure an output carries every key the schema requires.
pub fn validate_output(schema: &OutputSchema, output: &Value) -> Result<()> {
    if schema.required_keys.is_empty() {
        return Ok(());
    }
    let missing: Vec<&str> = schema
        .required_keys
        .iter()
        .filter(|key| lookup_path(output, key).is_null())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConductorError::Validation(format!(
            "output missing required keys: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required() {
        let rules = vec![ValidationRule::Required { field: "topic".into() }];
        assert!(validate_input(&rules, &json!({"topic": "AI"})).is_ok());
        assert!(validate_input(&rules, &json!({"topic": "  "})).is_err());
        assert!(validate_input(&rules, &json!({})).is_err());
    }

    #[test]
    fn test_pattern_and_lengths() {
        let rules = vec![
            ValidationRule::Pattern {
                field: "code".into(),
                pattern: r"^[A-Z]{3}-\d+$".into(),
            },
            ValidationRule::MinLength { field: "code".into(), min: 5 },
            ValidationRule::MaxLength { field: "code".into(), max: 8 },
        ];
        assert!(validate_input(&rules, &json!({"code": "FDA-42"})).is_ok());

        let err = validate_input(&rules, &json!({"code": "fda-123456"})).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("does not match"));
        assert!(msg.contains("longer than 8"));
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let rules = vec![ValidationRule::Pattern {
            field: "x".into(),
            pattern: "(".into(),
        }];
        assert!(validate_input(&rules, &json!({"x": "y"})).is_err());
    }

    #[test]
    fn test_range_and_one_of() {
        let rules = vec![
            ValidationRule::Range { field: "budget".into(), min: Some(0.0), max: Some(100.0) },
            ValidationRule::OneOf {
                field: "region".into(),
                values: vec![json!("us"), json!("eu")],
            },
        ];
        assert!(validate_input(&rules, &json!({"budget": 50, "region": "eu"})).is_ok());
        assert!(validate_input(&rules, &json!({"budget": 150})).is_err());
        assert!(validate_input(&rules, &json!({"region": "apac"})).is_err());
        assert!(validate_input(&rules, &json!({"budget": "lots"})).is_err());
    }

    #[test]
    fn test_output_schema() {
        let schema = OutputSchema {
            required_keys: vec!["summary".into(), "risk.level".into()],
        };
        assert!(validate_output(&schema, &json!({"summary": "s", "risk": {"level": "low"}})).is_ok());
        let err = validate_output(&schema, &json!({"summary": "s"})).unwrap_err();
        assert!(err.to_string().contains("risk.level"));
        assert!(validate_output(&schema, &json!("plain text")).is_err());
        assert!(validate_output(&OutputSchema::default(), &json!("anything")).is_ok());
    }
}

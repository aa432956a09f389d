//! # Validation Module
//!
//! Input validation for caller-supplied function references and arguments.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller API (livequery-sync)                                  │
//! │  ├── watch_query / mutation / action receive raw strings               │
//! │  └── THIS MODULE: reject malformed references synchronously            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Wire protocol                                                │
//! │  └── Only canonical FunctionPath values are ever encoded               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Server                                                       │
//! │  └── Unknown functions surface as query/mutation errors (values)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use livequery_core::validation::parse_function_path;
//!
//! let path = parse_function_path("messages.js:list").unwrap();
//! assert_eq!(path.to_string(), "messages:list");
//! assert!(parse_function_path("").is_err());
//! ```

use crate::error::ValidationError;
use crate::types::{Args, FunctionPath, Value};
use crate::MAX_FUNCTION_PATH_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Function name used when a reference names only a module.
pub const DEFAULT_EXPORT: &str = "default";

// =============================================================================
// Function References
// =============================================================================

/// Parses and canonicalizes a function reference.
///
/// ## Rules
/// - Must not be empty or contain whitespace
/// - `"module"` alone refers to the module's `default` export
/// - A trailing `.js` on the module is stripped
/// - Module: `[A-Za-z0-9_-./]`, no empty segments
/// - Function: `[A-Za-z0-9_]`, non-empty
pub fn parse_function_path(raw: &str) -> ValidationResult<FunctionPath> {
    if raw.is_empty() {
        return Err(ValidationError::Required {
            field: "function path".to_string(),
        });
    }

    if raw.len() > MAX_FUNCTION_PATH_LEN {
        return Err(ValidationError::TooLong {
            field: "function path".to_string(),
            max: MAX_FUNCTION_PATH_LEN,
        });
    }

    if raw.chars().any(char::is_whitespace) {
        return Err(invalid("function path", "must not contain whitespace"));
    }

    let (module, function) = match raw.split_once(':') {
        Some((module, function)) => (module, function),
        None => (raw, DEFAULT_EXPORT),
    };

    let module = module.strip_suffix(".js").unwrap_or(module);
    validate_module(module)?;
    validate_function_name(function)?;

    Ok(FunctionPath::from_parts(
        module.to_string(),
        function.to_string(),
    ))
}

fn validate_module(module: &str) -> ValidationResult<()> {
    if module.is_empty() {
        return Err(ValidationError::Required {
            field: "module".to_string(),
        });
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/');
    if !module.chars().all(allowed) {
        return Err(invalid(
            "module",
            "may contain only letters, digits, '_', '-', '.', and '/'",
        ));
    }

    if module.split('/').any(str::is_empty) {
        return Err(invalid("module", "must not contain empty path segments"));
    }

    Ok(())
}

fn validate_function_name(function: &str) -> ValidationResult<()> {
    if function.is_empty() {
        return Err(ValidationError::Required {
            field: "function name".to_string(),
        });
    }

    if !function.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(
            "function name",
            "may contain only letters, digits, and '_'",
        ));
    }

    Ok(())
}

// =============================================================================
// Arguments
// =============================================================================

/// Converts a JSON value into function arguments.
///
/// `null` is accepted as "no arguments"; anything other than an object is
/// rejected.
pub fn args_from_value(value: Value) -> ValidationResult<Args> {
    match value {
        Value::Null => Ok(Args::new()),
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(invalid(
            "args",
            &format!("must be an object, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_function_path() {
        assert_eq!(
            parse_function_path("messages:list").unwrap().to_string(),
            "messages:list"
        );
        assert_eq!(
            parse_function_path("messages").unwrap().to_string(),
            "messages:default"
        );
        assert_eq!(
            parse_function_path("chat/rooms.js:get").unwrap().to_string(),
            "chat/rooms:get"
        );
    }

    #[test]
    fn test_parse_function_path_rejects_malformed() {
        assert!(matches!(
            parse_function_path(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(parse_function_path("messages:").is_err());
        assert!(parse_function_path(":list").is_err());
        assert!(parse_function_path("mess ages:list").is_err());
        assert!(parse_function_path("messages:li-st").is_err());
        assert!(parse_function_path("chat//rooms:get").is_err());
        assert!(parse_function_path("a:b:c").is_err());
        assert!(matches!(
            parse_function_path(&"a".repeat(MAX_FUNCTION_PATH_LEN + 1)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_args_from_value() {
        assert!(args_from_value(Value::Null).unwrap().is_empty());
        let args = args_from_value(json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(args_from_value(json!([1, 2])).is_err());
        assert!(args_from_value(json!("x")).is_err());
    }
}

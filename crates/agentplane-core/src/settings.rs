//! Recognized agent settings.
//!
//! The set of keys is fixed at compile time; unknown keys are rejected at the
//! API boundary. Each setting declares its type, its environment variable on
//! the agent container, an optional default, and whether changing it requires
//! a pod restart.

use crate::error::{Error, Result};
use serde_json::Value;

/// Declared type of a setting value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    String,
    Int,
    Float,
    Bool,
    /// Closed set of accepted string values
    Enum(&'static [&'static str]),
}

/// Compile-time definition of a recognized setting
#[derive(Debug, Clone, Copy)]
pub struct SettingDef {
    pub key: &'static str,
    pub env_var: &'static str,
    pub ty: SettingType,
    pub default: Option<&'static str>,
    pub requires_restart: bool,
}

/// The full registry of recognized settings
pub const SETTINGS: &[SettingDef] = &[
    SettingDef {
        key: "model",
        env_var: "AGENT_MODEL",
        ty: SettingType::String,
        default: None,
        requires_restart: true,
    },
    SettingDef {
        key: "provider",
        env_var: "AGENT_PROVIDER",
        ty: SettingType::Enum(&["openai", "anthropic", "ollama"]),
        default: Some("openai"),
        requires_restart: true,
    },
    SettingDef {
        key: "temperature",
        env_var: "AGENT_TEMPERATURE",
        ty: SettingType::Float,
        default: Some("0.7"),
        requires_restart: false,
    },
    SettingDef {
        key: "max_tokens",
        env_var: "AGENT_MAX_TOKENS",
        ty: SettingType::Int,
        default: Some("1024"),
        requires_restart: false,
    },
    SettingDef {
        key: "tool_timeout_secs",
        env_var: "AGENT_TOOL_TIMEOUT_SECS",
        ty: SettingType::Int,
        default: Some("60"),
        requires_restart: false,
    },
    SettingDef {
        key: "auto_approve_tools",
        env_var: "AGENT_AUTO_APPROVE_TOOLS",
        ty: SettingType::Bool,
        default: Some("false"),
        requires_restart: false,
    },
    SettingDef {
        key: "log_level",
        env_var: "AGENT_LOG_LEVEL",
        ty: SettingType::Enum(&["error", "warn", "info", "debug"]),
        default: Some("info"),
        requires_restart: true,
    },
];

/// Look up a setting definition by key
pub fn lookup(key: &str) -> Result<&'static SettingDef> {
    SETTINGS
        .iter()
        .find(|d| d.key == key)
        .ok_or_else(|| Error::UnknownSetting(key.to_string()))
}

/// Coerce a JSON value to the declared type of `def`.
///
/// Accepts the natural JSON representation as well as string forms ("42",
/// "true") so callers can round-trip values through environment variables.
pub fn coerce(def: &SettingDef, value: &Value) -> Result<Value> {
    let invalid = || {
        Error::InvalidArgument(format!(
            "setting '{}' expects a {} value",
            def.key,
            type_name(def.ty)
        ))
    };

    match def.ty {
        SettingType::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            _ => Err(invalid()),
        },
        SettingType::Int => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        SettingType::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        },
        SettingType::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        SettingType::Enum(allowed) => match value {
            Value::String(s) if allowed.contains(&s.as_str()) => Ok(Value::String(s.clone())),
            _ => Err(Error::InvalidArgument(format!(
                "setting '{}' must be one of: {}",
                def.key,
                allowed.join(", ")
            ))),
        },
    }
}

/// Render a coerced value as the string the agent sees in its environment
pub fn to_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(ty: SettingType) -> &'static str {
    match ty {
        SettingType::String => "string",
        SettingType::Int => "int",
        SettingType::Float => "float",
        SettingType::Bool => "bool",
        SettingType::Enum(_) => "enum",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_known_and_unknown() {
        assert_eq!(lookup("model").unwrap().env_var, "AGENT_MODEL");
        assert!(matches!(lookup("nope"), Err(Error::UnknownSetting(_))));
    }

    #[test]
    fn test_coerce_int_from_number_and_string() {
        let def = lookup("max_tokens").unwrap();
        assert_eq!(coerce(def, &json!(2048)).unwrap(), json!(2048));
        assert_eq!(coerce(def, &json!("2048")).unwrap(), json!(2048));
        assert!(coerce(def, &json!("lots")).is_err());
        assert!(coerce(def, &json!(1.5)).is_err());
    }

    #[test]
    fn test_coerce_float_accepts_ints() {
        let def = lookup("temperature").unwrap();
        assert_eq!(coerce(def, &json!(1)).unwrap(), json!(1.0));
        assert_eq!(coerce(def, &json!("0.2")).unwrap(), json!(0.2));
    }

    #[test]
    fn test_coerce_bool() {
        let def = lookup("auto_approve_tools").unwrap();
        assert_eq!(coerce(def, &json!(true)).unwrap(), json!(true));
        assert_eq!(coerce(def, &json!("false")).unwrap(), json!(false));
        assert!(coerce(def, &json!(1)).is_err());
    }

    #[test]
    fn test_coerce_enum_rejects_unknown_variant() {
        let def = lookup("provider").unwrap();
        assert_eq!(coerce(def, &json!("ollama")).unwrap(), json!("ollama"));
        assert!(coerce(def, &json!("bedrock")).is_err());
    }

    #[test]
    fn test_env_string_rendering() {
        assert_eq!(to_env_string(&json!("gpt")), "gpt");
        assert_eq!(to_env_string(&json!(42)), "42");
        assert_eq!(to_env_string(&json!(true)), "true");
    }

    #[test]
    fn test_registry_defaults_parse_under_their_own_type() {
        for def in SETTINGS {
            if let Some(default) = def.default {
                let coerced = coerce(def, &Value::String(default.to_string()));
                assert!(coerced.is_ok(), "default for {} must coerce", def.key);
            }
        }
    }
}

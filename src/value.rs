use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// A scalar cell or field value. Absence is modelled as `Option<Value>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// A flat field-name to value record, as handed to the persistence store.
pub type Record = BTreeMap<String, Option<Value>>;

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Converts a YAML scalar from a mapping or schema document.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Option<Self>> {
        Ok(match value {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(b) => Some(Value::Boolean(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Some(Value::Float(f))
                } else {
                    bail!("Unsupported numeric literal {n:?}")
                }
            }
            serde_yaml::Value::String(s) => Some(Value::String(s.clone())),
            other => bail!("Expected a scalar value, found {other:?}"),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Coercion target declared on a field rule with `$col_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    String,
    Boolean,
    /// Unrecognised tags are kept so the value passes through unchanged.
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Other(tag) => tag.as_str(),
        }
    }

    pub fn coerce(&self, value: Value) -> Result<Value> {
        match self {
            FieldType::Integer => coerce_integer(value),
            FieldType::Float => coerce_float(value),
            FieldType::String => Ok(Value::String(value.as_display())),
            FieldType::Boolean => coerce_boolean(value),
            FieldType::Other(_) => Ok(value),
        }
    }
}

impl FromStr for FieldType {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "integer" | "int" => FieldType::Integer,
            "float" | "number" | "double" => FieldType::Float,
            "string" | "str" => FieldType::String,
            "boolean" | "bool" => FieldType::Boolean,
            _ => FieldType::Other(value.trim().to_string()),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn coerce_integer(value: Value) -> Result<Value> {
    match value {
        Value::Integer(_) => Ok(value),
        Value::Float(f) if f.is_finite() => Ok(Value::Integer(f.trunc() as i64)),
        Value::Float(f) => Err(anyhow!("Cannot convert {f} to integer")),
        Value::Boolean(b) => Ok(Value::Integer(i64::from(b))),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(parsed) = trimmed.parse::<i64>() {
                return Ok(Value::Integer(parsed));
            }
            let parsed: f64 = trimmed
                .parse()
                .with_context(|| format!("Failed to parse '{s}' as integer"))?;
            if parsed.fract() == 0.0 && parsed.is_finite() {
                Ok(Value::Integer(parsed as i64))
            } else {
                Err(anyhow!("Failed to parse '{s}' as integer"))
            }
        }
    }
}

fn coerce_float(value: Value) -> Result<Value> {
    match value {
        Value::Float(_) => Ok(value),
        Value::Integer(i) => Ok(Value::Float(i as f64)),
        Value::Boolean(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
        Value::String(s) => {
            let parsed: f64 = s
                .trim()
                .parse()
                .with_context(|| format!("Failed to parse '{s}' as float"))?;
            Ok(Value::Float(parsed))
        }
    }
}

fn coerce_boolean(value: Value) -> Result<Value> {
    match value {
        Value::Boolean(_) => Ok(value),
        Value::Integer(i) => Ok(Value::Boolean(i != 0)),
        Value::Float(f) => Ok(Value::Boolean(f != 0.0)),
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            let parsed = match lowered.as_str() {
                "true" | "t" | "yes" | "y" | "1" => true,
                "false" | "f" | "no" | "n" | "0" => false,
                _ => bail!("Failed to parse '{s}' as boolean"),
            };
            Ok(Value::Boolean(parsed))
        }
    }
}

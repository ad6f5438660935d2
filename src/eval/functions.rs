// Built-in Function Table
//
// Pure functions callable from rule and action expressions. Dispatch is by
// uppercase name; the frozen per-firing timestamp backs NOW so repeated
// calls within one firing agree.

use crate::common::Value;
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};

const BUILTIN_NAMES: &[&str] = &[
    "NOW", "DATE", "DAYS", "HOURS", "CONCAT", "UPPER", "LOWER", "LENGTH", "ABS", "ROUND", "MIN",
    "MAX",
];

/// Whether a function name resolves in the built-in table.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

fn expect_arity(name: &str, args: &[Value], arity: usize) -> Result<()> {
    if args.len() != arity {
        return Err(EngineError::InvalidInput(format!(
            "{} expects {} argument{}, got {}",
            name,
            arity,
            if arity == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn numeric(name: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        EngineError::InvalidInput(format!("{} expects a number, got {}", name, value.type_name()))
    })
}

/// Durations scale to seconds so they compare against timestamp differences
/// the host stores as epoch seconds.
fn duration(name: &str, args: &[Value], seconds_per_unit: i64) -> Result<Value> {
    expect_arity(name, args, 1)?;
    match &args[0] {
        Value::Integer(n) => Ok(Value::Integer(n * seconds_per_unit)),
        Value::Float(n) => Ok(Value::Float(n * seconds_per_unit as f64)),
        other => Err(EngineError::InvalidInput(format!(
            "{} expects a number, got {}",
            name,
            other.type_name()
        ))),
    }
}

/// Dispatch a built-in call. Unknown names surface as `UnknownFunction` and
/// fail the enclosing firing.
pub fn call(name: &str, args: &[Value], now: DateTime<Utc>) -> Result<Value> {
    match name {
        "NOW" => {
            expect_arity(name, args, 0)?;
            Ok(Value::Timestamp(now))
        }
        "DATE" => {
            expect_arity(name, args, 1)?;
            let text = args[0].as_str().ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "DATE expects a string, got {}",
                    args[0].type_name()
                ))
            })?;
            if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
                return Ok(Value::Timestamp(timestamp.with_timezone(&Utc)));
            }
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| {
                EngineError::InvalidInput(format!("DATE cannot parse '{}' as ISO-8601", text))
            })?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| EngineError::InvalidInput(format!("DATE out of range: {}", text)))?;
            Ok(Value::Timestamp(DateTime::from_naive_utc_and_offset(
                midnight, Utc,
            )))
        }
        "DAYS" => duration(name, args, 86_400),
        "HOURS" => duration(name, args, 3_600),
        "CONCAT" => {
            let mut text = String::new();
            for arg in args {
                if !arg.is_null() {
                    text.push_str(&arg.to_string());
                }
            }
            Ok(Value::String(text))
        }
        "UPPER" | "LOWER" => {
            expect_arity(name, args, 1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(if name == "UPPER" {
                    s.to_uppercase()
                } else {
                    s.to_lowercase()
                })),
                other => Err(EngineError::InvalidInput(format!(
                    "{} expects a string, got {}",
                    name,
                    other.type_name()
                ))),
            }
        }
        "LENGTH" => {
            expect_arity(name, args, 1)?;
            match &args[0] {
                Value::Null => Ok(Value::Integer(0)),
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                other => Err(EngineError::InvalidInput(format!(
                    "LENGTH expects a string, got {}",
                    other.type_name()
                ))),
            }
        }
        "ABS" => {
            expect_arity(name, args, 1)?;
            match &args[0] {
                Value::Integer(n) => Ok(Value::Integer(n.abs())),
                Value::Float(n) => Ok(Value::Float(n.abs())),
                other => Err(EngineError::InvalidInput(format!(
                    "ABS expects a number, got {}",
                    other.type_name()
                ))),
            }
        }
        "ROUND" => {
            expect_arity(name, args, 1)?;
            match &args[0] {
                Value::Integer(n) => Ok(Value::Integer(*n)),
                Value::Float(n) => Ok(Value::Integer(n.round() as i64)),
                other => Err(EngineError::InvalidInput(format!(
                    "ROUND expects a number, got {}",
                    other.type_name()
                ))),
            }
        }
        "MIN" | "MAX" => {
            expect_arity(name, args, 2)?;
            let a = numeric(name, &args[0])?;
            let b = numeric(name, &args[1])?;
            let pick_first = if name == "MIN" { a <= b } else { a >= b };
            let picked = if pick_first { &args[0] } else { &args[1] };
            Ok(picked.clone())
        }
        other => Err(EngineError::UnknownFunction(other.to_string())),
    }
}

//! Transition conditions.
//!
//! Conditions are only evaluated when the engine runs with condition
//! evaluation switched on; otherwise the first CONDITIONAL transition wins.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::ExecutionContext;
use crate::{Error, Result};

lazy_static! {
    static ref CONDITION: Regex =
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").unwrap();
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, context: &ExecutionContext) -> Result<bool>;
}

/// Evaluates `path op literal` against the execution context.
/// See `ExecutionContext::resolve` for how paths are looked up.
#[derive(Debug, Default, Clone)]
pub struct PathConditionEvaluator;

impl PathConditionEvaluator {
    pub fn new() -> Self {
        Self
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ConditionEvaluator for PathConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &ExecutionContext) -> Result<bool> {
        let caps = CONDITION
            .captures(condition)
            .ok_or_else(|| Error::StepDispatch(format!("Invalid condition format: {}", condition)))?;

        let path = &caps[1];
        let operator = &caps[2];
        let expected = caps[3].trim_matches('"').trim_matches('\'');

        let Some(actual) = context.resolve(path) else {
            // Missing values only satisfy inequality
            return Ok(operator == "!=");
        };

        let numeric = actual.as_f64().zip(expected.parse::<f64>().ok());

        match operator {
            "==" => Ok(match numeric {
                Some((a, b)) => a == b,
                None => as_text(&actual) == expected,
            }),
            "!=" => Ok(match numeric {
                Some((a, b)) => a != b,
                None => as_text(&actual) != expected,
            }),
            ">" | ">=" | "<" | "<=" => {
                let (a, b) = numeric.ok_or_else(|| {
                    Error::StepDispatch(format!(
                        "Operator {} needs numeric operands: {}",
                        operator, condition
                    ))
                })?;
                Ok(match operator {
                    ">" => a > b,
                    ">=" => a >= b,
                    "<" => a < b,
                    _ => a <= b,
                })
            }
            _ => Err(Error::StepDispatch(format!("Unknown operator: {}", operator))),
        }
    }
}

//! Condition evaluation over CEL expressions.
//!
//! Conditions are named CEL expressions attached to tuples. A tuple with a
//! condition only grants access when the expression evaluates to `true`
//! against the merged evaluation context. Expressions are parsed once and
//! cached process-wide, keyed by their source.
//!
//! Context merging: the tuple's stored condition context takes precedence
//! over the request context. Constraints written at tuple-write time cannot
//! be weakened by the caller of a check.

use std::collections::HashMap;
use std::panic;
use std::sync::{Arc, OnceLock};

use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Program, Value};
use dashmap::DashMap;

use crate::error::{DomainError, DomainResult};
use crate::model::Condition;

/// A parsed CEL expression.
pub struct CompiledExpression {
    source: String,
    program: Program,
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("source", &self.source)
            .finish()
    }
}

impl CompiledExpression {
    /// Parses a CEL expression.
    ///
    /// The underlying parser may panic on some malformed input; panics are
    /// caught and reported as parse errors.
    pub fn parse(expression: &str) -> DomainResult<Self> {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| Program::compile(expression)));

        let program = match result {
            Ok(Ok(program)) => program,
            Ok(Err(e)) => {
                return Err(DomainError::ConditionParseError {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_panic) => {
                return Err(DomainError::ConditionParseError {
                    expression: expression.to_string(),
                    reason: "parser encountered an internal error".to_string(),
                });
            }
        };

        Ok(Self {
            source: expression.to_string(),
            program,
        })
    }

    /// The original source expression.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression to a boolean with the given variables bound
    /// at the top level.
    pub fn evaluate_bool(&self, variables: &HashMap<String, Value>) -> Result<bool, String> {
        let mut ctx = Context::default();
        for (name, value) in variables {
            // HashMap keys are unique, so add_variable cannot collide.
            ctx.add_variable(name.as_str(), value.clone())
                .map_err(|e| e.to_string())?;
        }

        match self.program.execute(&ctx) {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(other) => Err(format!(
                "expression did not evaluate to a boolean: {:?}",
                other
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Process-wide cache of parsed expressions keyed by source.
struct ExpressionCache {
    expressions: DashMap<String, Arc<CompiledExpression>>,
}

impl ExpressionCache {
    fn get_or_parse(&self, expression: &str) -> DomainResult<Arc<CompiledExpression>> {
        if let Some(cached) = self.expressions.get(expression) {
            return Ok(Arc::clone(cached.value()));
        }
        let parsed = Arc::new(CompiledExpression::parse(expression)?);
        self.expressions
            .insert(expression.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }
}

fn expression_cache() -> &'static ExpressionCache {
    static CACHE: OnceLock<ExpressionCache> = OnceLock::new();
    CACHE.get_or_init(|| ExpressionCache {
        expressions: DashMap::new(),
    })
}

/// Evaluates a condition against the merged tuple and request contexts.
///
/// Returns `Ok(true)`/`Ok(false)` for a clean evaluation; an evaluation
/// failure (missing parameter, non-boolean result) is a typed error, not a
/// `false` result.
pub fn evaluate_condition(
    condition: &Condition,
    tuple_context: Option<&HashMap<String, serde_json::Value>>,
    request_context: &HashMap<String, serde_json::Value>,
) -> DomainResult<bool> {
    let expression = expression_cache().get_or_parse(&condition.expression)?;

    // Request context first, tuple context second so stored parameters win.
    let mut variables: HashMap<String, Value> = HashMap::new();
    for (key, value) in request_context {
        variables.insert(key.clone(), json_to_cel(value));
    }
    if let Some(tuple_context) = tuple_context {
        for (key, value) in tuple_context {
            variables.insert(key.clone(), json_to_cel(value));
        }
    }

    expression
        .evaluate_bool(&variables)
        .map_err(|reason| DomainError::ConditionEvaluationFailed {
            condition_name: condition.name.clone(),
            reason,
        })
}

/// Converts a JSON value into a CEL value.
///
/// Numbers convert in priority order i64 → u64 → f64 so large positive
/// integers keep their precision.
fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                Value::Null
            }
        }
        serde_json::Value::String(s) => {
            // Timestamps arrive as RFC3339 strings; CEL comparisons need
            // the timestamp type, so try that first.
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                Value::Timestamp(dt)
            } else {
                Value::String(s.clone().into())
            }
        }
        serde_json::Value::Array(values) => {
            Value::List(values.iter().map(json_to_cel).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(map) => {
            let converted: HashMap<Key, Value> = map
                .iter()
                .map(|(k, v)| (Key::String(k.clone().into()), json_to_cel(v)))
                .collect();
            Value::Map(converted.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(expression: &str) -> Condition {
        Condition {
            name: "test_condition".to_string(),
            expression: expression.to_string(),
            parameters: Default::default(),
        }
    }

    fn context(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_condition_true_and_false() {
        let cond = condition("amount < limit");
        let ctx = context(&[("amount", json!(5)), ("limit", json!(10))]);
        assert!(evaluate_condition(&cond, None, &ctx).unwrap());

        let ctx = context(&[("amount", json!(50)), ("limit", json!(10))]);
        assert!(!evaluate_condition(&cond, None, &ctx).unwrap());
    }

    #[test]
    fn test_missing_parameter_is_error_not_false() {
        let cond = condition("amount < limit");
        let ctx = context(&[("amount", json!(5))]);
        assert!(matches!(
            evaluate_condition(&cond, None, &ctx).unwrap_err(),
            DomainError::ConditionEvaluationFailed { .. }
        ));
    }

    #[test]
    fn test_tuple_context_overrides_request_context() {
        let cond = condition("limit == 10");
        let tuple_ctx = context(&[("limit", json!(10))]);
        let request_ctx = context(&[("limit", json!(999))]);
        assert!(evaluate_condition(&cond, Some(&tuple_ctx), &request_ctx).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let cond = condition("1 + 1");
        assert!(matches!(
            evaluate_condition(&cond, None, &HashMap::new()).unwrap_err(),
            DomainError::ConditionEvaluationFailed { .. }
        ));
    }

    #[test]
    fn test_parse_error_surfaces() {
        let cond = condition("((");
        assert!(matches!(
            evaluate_condition(&cond, None, &HashMap::new()).unwrap_err(),
            DomainError::ConditionParseError { .. }
        ));
    }

    #[test]
    fn test_timestamp_comparison() {
        let cond = condition("current_time < expires_at");
        let ctx = context(&[
            ("current_time", json!("2024-01-01T00:00:00Z")),
            ("expires_at", json!("2025-01-01T00:00:00Z")),
        ]);
        assert!(evaluate_condition(&cond, None, &ctx).unwrap());
    }
}

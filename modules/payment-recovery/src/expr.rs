//! Expression evaluator shared by workflow trigger conditions and the
//! `conditional` step executor.
//!
//! `{conditions: [{field, operator, value}], logic: AND | OR}` evaluated
//! against a field-extraction view of a [`PaymentFailure`]. An unknown field
//! or an operator incompatible with the value's type makes that one
//! condition `false` rather than erroring the whole evaluation — a
//! conservative default matching the way the source treats missing
//! fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::PaymentFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    And,
    Or,
}

impl Default for Logic {
    fn default() -> Self {
        Logic::And
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

/// `{conditions, logic}`. A missing or empty `conditions` list matches
/// everything, per §4.6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expression {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
}

/// Extract a named field from a [`PaymentFailure`] as a JSON value, the
/// common representation the comparison functions operate on.
fn extract_field(failure: &PaymentFailure, field: &str) -> Option<Value> {
    match field {
        "amount" => Some(Value::from(failure.amount.to_string().parse::<f64>().ok()?)),
        "currency" => Some(Value::from(failure.currency.clone())),
        "failure_reason" => Some(Value::from(failure.failure_reason.clone())),
        "provider" => Some(Value::from(failure.provider_id.clone())),
        "customer_email" => failure.customer_email.clone().map(Value::from),
        "retry_count" => Some(Value::from(failure.retry_count)),
        "days_overdue" => failure.days_overdue().map(Value::from),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_i64().map(|v| v as f64)).or_else(|| value.as_u64().map(|v| v as f64))
}

/// `serde_json::Value`'s derived equality doesn't normalize `Number`
/// variants, so `json!(2500) != json!(2500.0)` even though they're the same
/// number. Compare as floats when both sides parse as numbers; fall back to
/// raw equality for strings, bools, and the rest.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn evaluate_condition(failure: &PaymentFailure, condition: &Condition) -> bool {
    let Some(actual) = extract_field(failure, &condition.field) else {
        return false;
    };

    match condition.operator {
        Operator::Eq => values_equal(&actual, &condition.value),
        Operator::Ne => !values_equal(&actual, &condition.value),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let (Some(a), Some(b)) = (as_f64(&actual), as_f64(&condition.value)) else {
                return false;
            };
            match condition.operator {
                Operator::Gt => a > b,
                Operator::Gte => a >= b,
                Operator::Lt => a < b,
                Operator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        Operator::Contains => match (actual.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        Operator::In => match condition.value.as_array() {
            Some(list) => list.contains(&actual),
            None => false,
        },
    }
}

/// Evaluate `expression` against `failure`. An empty conditions list always
/// matches.
pub fn evaluate(expression: &Expression, failure: &PaymentFailure) -> bool {
    if expression.conditions.is_empty() {
        return true;
    }
    match expression.logic {
        Logic::And => expression.conditions.iter().all(|c| evaluate_condition(failure, c)),
        Logic::Or => expression.conditions.iter().any(|c| evaluate_condition(failure, c)),
    }
}

//! Rule Engine (C4): ordered condition→action evaluation against a
//! `PaymentFailure`, producing tagged results the processor routes to
//! orchestration side effects. The rule list is guarded by a
//! reader/writer lock — reads dominate (every processed event evaluates
//! the full list) and must not block each other, per §5.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::expr::{evaluate, Expression};
use crate::model::PaymentFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    HighRiskAlert,
    RetryPayment,
    CustomerCommunication,
    EscalateToManager,
}

/// One ordered rule: a condition expression and the tag it produces when
/// matched. Rules never affect `risk_score` — the processor stays
/// authoritative for that (§9 open question); rules only add tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub condition: Expression,
    pub tag: ActionTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_name: String,
    pub tag: ActionTag,
}

/// Ordered, mutable rule list. Evaluation against a failure never mutates
/// the list; rules are added/removed through dedicated methods that take
/// the write lock briefly.
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules: RwLock::new(rules) }
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().unwrap().push(rule);
    }

    /// Evaluate every rule, in declaration order, against `failure`.
    /// Returns one [`RuleResult`] per matching rule.
    pub fn evaluate(&self, failure: &PaymentFailure) -> Vec<RuleResult> {
        let rules = self.rules.read().unwrap();
        rules
            .iter()
            .filter(|rule| evaluate(&rule.condition, failure))
            .map(|rule| RuleResult { rule_name: rule.name.clone(), tag: rule.tag })
            .collect()
    }
}

impl Default for RuleEngine {
    /// A starter rule set mirroring the bands in §4.5: high-risk failures
    /// get alerted, card declines get retried, everything else still gets
    /// a customer touch.
    fn default() -> Self {
        use crate::expr::{Condition, Logic, Operator};

        Self::new(vec![
            Rule {
                name: "high_risk_alert".into(),
                condition: Expression {
                    conditions: vec![Condition { field: "amount".into(), operator: Operator::Gte, value: serde_json::json!(10000) }],
                    logic: Logic::And,
                },
                tag: ActionTag::HighRiskAlert,
            },
            Rule {
                name: "retry_card_declines".into(),
                condition: Expression {
                    conditions: vec![Condition {
                        field: "failure_reason".into(),
                        operator: Operator::Eq,
                        value: serde_json::json!("card_declined"),
                    }],
                    logic: Logic::And,
                },
                tag: ActionTag::RetryPayment,
            },
            Rule {
                name: "notify_customer".into(),
                condition: Expression::default(),
                tag: ActionTag::CustomerCommunication,
            },
            Rule {
                name: "escalate_overdue".into(),
                condition: Expression {
                    conditions: vec![Condition { field: "days_overdue".into(), operator: Operator::Gt, value: serde_json::json!(60) }],
                    logic: Logic::And,
                },
                tag: ActionTag::EscalateToManager,
            },
        ])
    }
}

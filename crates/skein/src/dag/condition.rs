//! Edge-condition grammar, parsed once at generation time.
//!
//! The grammar is deliberately narrow: `<field> <op> <literal>` where the
//! field is `confidence` or `complexity` and the operator one of
//! `< <= > >=` (unicode `≤`/`≥` accepted). Anything else parses to `None`,
//! which the caller logs and treats as always-true.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Confidence,
    Complexity,
}

impl fmt::Display for ConditionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionField::Confidence => write!(f, "confidence"),
            ConditionField::Complexity => write!(f, "complexity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpOp::Lt => write!(f, "<"),
            CmpOp::Le => write!(f, "<="),
            CmpOp::Gt => write!(f, ">"),
            CmpOp::Ge => write!(f, ">="),
        }
    }
}

impl CmpOp {
    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
        }
    }
}

/// A parsed edge guard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeCondition {
    pub field: ConditionField,
    pub op: CmpOp,
    pub threshold: f64,
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.threshold)
    }
}

impl EdgeCondition {
    pub fn new(field: ConditionField, op: CmpOp, threshold: f64) -> Self {
        Self {
            field,
            op,
            threshold,
        }
    }

    /// Parse a condition string. Returns `None` for anything outside the
    /// grammar; empty input is the always-true guard and also `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let field = if let Some(rest) = trimmed.strip_prefix("confidence") {
            (ConditionField::Confidence, rest)
        } else if let Some(rest) = trimmed.strip_prefix("complexity") {
            (ConditionField::Complexity, rest)
        } else {
            return None;
        };
        let (field, rest) = field;
        let rest = rest.trim_start();

        let (op, rest) = if let Some(r) = rest.strip_prefix(">=").or_else(|| rest.strip_prefix('≥'))
        {
            (CmpOp::Ge, r)
        } else if let Some(r) = rest.strip_prefix("<=").or_else(|| rest.strip_prefix('≤')) {
            (CmpOp::Le, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (CmpOp::Gt, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (CmpOp::Lt, r)
        } else {
            return None;
        };

        let threshold: f64 = rest.trim().parse().ok()?;
        Some(Self {
            field,
            op,
            threshold,
        })
    }

    /// Extract this condition's field from a node result. Text-bearing
    /// results without an explicit `complexity` fall back to a length-based
    /// estimate, capped at 1.0.
    pub fn field_value(&self, result: &Value) -> Option<f64> {
        let key = self.field.to_string();
        if let Some(value) = result.get(&key).and_then(Value::as_f64) {
            return Some(value);
        }
        if self.field == ConditionField::Complexity {
            let text = result
                .as_str()
                .or_else(|| result.get("response").and_then(Value::as_str))?;
            return Some((text.len() as f64 / 1000.0).min(1.0));
        }
        None
    }

    /// Evaluate against an upstream node's result. A result that does not
    /// carry the field satisfies the guard (and the caller logs it).
    pub fn evaluate(&self, result: &Value) -> bool {
        match self.field_value(result) {
            Some(value) => self.op.compare(value, self.threshold),
            None => {
                tracing::warn!(
                    condition = %self,
                    "node result carries no matching field, treating edge as satisfied"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("confidence >= 0.7", ConditionField::Confidence, CmpOp::Ge, 0.7)]
    #[test_case("confidence > 0.5", ConditionField::Confidence, CmpOp::Gt, 0.5)]
    #[test_case("confidence < 0.7", ConditionField::Confidence, CmpOp::Lt, 0.7)]
    #[test_case("complexity > 0.8", ConditionField::Complexity, CmpOp::Gt, 0.8)]
    #[test_case("complexity <= 0.8", ConditionField::Complexity, CmpOp::Le, 0.8; "ascii le")]
    #[test_case("complexity ≤ 0.8", ConditionField::Complexity, CmpOp::Le, 0.8; "unicode le")]
    fn test_parse_valid(input: &str, field: ConditionField, op: CmpOp, threshold: f64) {
        let parsed = EdgeCondition::parse(input).unwrap();
        assert_eq!(parsed.field, field);
        assert_eq!(parsed.op, op);
        assert!((parsed.threshold - threshold).abs() < f64::EPSILON);
    }

    #[test_case(""; "empty is always true")]
    #[test_case("certainty > 0.5"; "unknown field")]
    #[test_case("confidence == 0.5"; "unsupported operator")]
    #[test_case("confidence > high"; "non numeric literal")]
    fn test_parse_rejects(input: &str) {
        assert!(EdgeCondition::parse(input).is_none());
    }

    #[test]
    fn test_evaluate_reads_matching_field() {
        let condition = EdgeCondition::parse("confidence >= 0.7").unwrap();
        assert!(condition.evaluate(&json!({"confidence": 0.85})));
        assert!(!condition.evaluate(&json!({"confidence": 0.6})));
    }

    #[test]
    fn test_complexity_defaults_from_text_length() {
        let condition = EdgeCondition::parse("complexity > 0.8").unwrap();
        let short = json!({"response": "brief"});
        assert!(!condition.evaluate(&short));

        let long = json!({"response": "x".repeat(900)});
        assert!(condition.evaluate(&long));

        // Cap at 1.0 even for very long text.
        let huge = json!("y".repeat(100_000));
        assert_eq!(condition.field_value(&huge), Some(1.0));
    }

    #[test]
    fn test_missing_field_satisfies_guard() {
        let condition = EdgeCondition::parse("confidence >= 0.7").unwrap();
        assert!(condition.evaluate(&json!({"unrelated": true})));
    }

    #[test]
    fn test_display_round_trips() {
        let condition = EdgeCondition::parse("complexity <= 0.8").unwrap();
        assert_eq!(
            EdgeCondition::parse(&condition.to_string()).unwrap(),
            condition
        );
    }
}

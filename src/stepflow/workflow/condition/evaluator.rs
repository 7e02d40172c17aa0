//! Predicate evaluator
//!
//! Evaluation is pure: it reads the payload and never mutates it.

use super::ast::{CompareOp, Expression, Literal};
use crate::stepflow::workflow::state::Payload;
use serde_json::Value;

/// Evaluate a predicate against the payload
pub fn evaluate(expr: &Expression, payload: &Payload) -> bool {
    match expr {
        Expression::True => true,
        Expression::False => false,
        Expression::Compare { path, op, right } => {
            evaluate_compare(payload.get_path(path), *op, right)
        }
        Expression::Truthy(path) => is_truthy(payload.get_path(path)),
        Expression::And(left, right) => evaluate(left, payload) && evaluate(right, payload),
        Expression::Or(left, right) => evaluate(left, payload) || evaluate(right, payload),
        Expression::Not(inner) => !evaluate(inner, payload),
    }
}

fn evaluate_compare(left: Option<&Value>, op: CompareOp, right: &Literal) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        CompareOp::Gt => compare_numbers(left, right, |a, b| a > b),
        CompareOp::Gte => compare_numbers(left, right, |a, b| a >= b),
        CompareOp::Lt => compare_numbers(left, right, |a, b| a < b),
        CompareOp::Lte => compare_numbers(left, right, |a, b| a <= b),
        CompareOp::Contains => check_contains(left, right),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn literal_matches(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::Null, Literal::Null) => true,
        (Value::String(s), Literal::String(rs)) => s == rs,
        (Value::Number(n), Literal::Number(rn)) => n
            .as_f64()
            .map(|f| (f - rn).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Bool(b), Literal::Boolean(rb)) => b == rb,
        _ => false,
    }
}

fn values_equal(left: Option<&Value>, right: &Literal) -> bool {
    match left {
        // Absent fields compare equal to null
        None => *right == Literal::Null,
        Some(value) => literal_matches(value, right),
    }
}

fn compare_numbers<F>(left: Option<&Value>, right: &Literal, cmp: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (left.and_then(Value::as_f64), right) {
        (Some(f), Literal::Number(rn)) => cmp(f, *rn),
        _ => false,
    }
}

fn check_contains(left: Option<&Value>, right: &Literal) -> bool {
    match (left, right) {
        (Some(Value::String(s)), Literal::String(substr)) => s.contains(substr.as_str()),
        (Some(Value::Array(arr)), lit) => arr.iter().any(|v| literal_matches(v, lit)),
        (Some(Value::Object(obj)), Literal::String(key)) => obj.contains_key(key),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepflow::workflow::condition::parser::parse;
    use serde_json::json;

    fn payload_with(pairs: Vec<(&str, Value)>) -> Payload {
        Payload::from_pairs(pairs)
    }

    fn eval(condition: &str, payload: &Payload) -> bool {
        evaluate(&parse(condition).unwrap(), payload)
    }

    #[test]
    fn test_string_equality() {
        let payload = payload_with(vec![("complexity", json!("low"))]);
        assert!(eval("complexity == 'low'", &payload));
        assert!(!eval("complexity == 'high'", &payload));
        assert!(eval("complexity != 'high'", &payload));
    }

    #[test]
    fn test_number_comparison() {
        let payload = payload_with(vec![("score", json!(7.5))]);

        assert!(eval("score > 5", &payload));
        assert!(!eval("score > 10", &payload));
        assert!(eval("score >= 7.5", &payload));
        assert!(eval("score < 10", &payload));
        assert!(eval("score <= 7.5", &payload));
        assert!(!eval("score <= 7", &payload));
    }

    #[test]
    fn test_number_comparison_against_string_is_false() {
        let payload = payload_with(vec![("score", json!("high"))]);
        assert!(!eval("score > 1", &payload));
        assert!(!eval("score < 1", &payload));
    }

    #[test]
    fn test_missing_field_is_null() {
        let payload = Payload::new();
        assert!(eval("missing == null", &payload));
        assert!(!eval("missing == 'value'", &payload));
        assert!(!eval("missing", &payload));
    }

    #[test]
    fn test_contains() {
        let payload = payload_with(vec![
            ("message", json!("hello world")),
            ("tags", json!(["bug", "urgent"])),
            ("counts", json!([1, 2, 3])),
            ("meta", json!({"owner": "ops"})),
        ]);

        assert!(eval("message contains 'world'", &payload));
        assert!(!eval("message contains 'foo'", &payload));
        assert!(eval("tags contains 'urgent'", &payload));
        assert!(!eval("tags contains 'frontend'", &payload));
        assert!(eval("counts contains 2", &payload));
        assert!(eval("meta contains 'owner'", &payload));
    }

    #[test]
    fn test_truthiness() {
        let payload = payload_with(vec![
            ("subtasks", json!(["a"])),
            ("empty", json!([])),
            ("flag", json!(false)),
        ]);
        assert!(eval("subtasks", &payload));
        assert!(!eval("empty", &payload));
        assert!(!eval("flag", &payload));
        assert!(eval("not flag", &payload));
    }

    #[test]
    fn test_logical_composition() {
        let payload = payload_with(vec![("type", json!("feature")), ("priority", json!(5))]);

        assert!(eval("type == 'bug' or priority > 3", &payload));
        assert!(!eval("type == 'bug' and priority > 3", &payload));
        assert!(eval("not (type == 'bug' or priority > 10)", &payload));
    }

    #[test]
    fn test_nested_path() {
        let payload = payload_with(vec![("analysis", json!({"level": {"name": "high"}}))]);
        assert!(eval("analysis.level.name == 'high'", &payload));
        assert!(!eval("analysis.level.name == 'low'", &payload));
    }
}

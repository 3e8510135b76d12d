//! Primitive whitelist
//!
//! Every compiled artifact is assembled from these operations and nothing
//! else. The pure functions below are shared by the real-time closures and
//! the in-memory batch executor so both paths agree on values at the
//! boundaries.

use crate::ast::{ArithOp, CompareOp, Tolerance};
use crate::types::Value;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Fault raised by a primitive on values it cannot handle
pub type OpResult<T> = std::result::Result<T, String>;

/// Whitelisted primitives a real-time validator may be composed of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    LoadField,
    Const,
    Today,
    Compare,
    Between,
    InList,
    Length,
    IsBlank,
    DateDiff,
    DateShift,
    Abs,
    Arith,
    Within,
    Required,
    And,
    Or,
    Not,
    Select,
}

impl Primitive {
    /// The complete whitelist
    pub const ALL: [Primitive; 18] = [
        Primitive::LoadField,
        Primitive::Const,
        Primitive::Today,
        Primitive::Compare,
        Primitive::Between,
        Primitive::InList,
        Primitive::Length,
        Primitive::IsBlank,
        Primitive::DateDiff,
        Primitive::DateShift,
        Primitive::Abs,
        Primitive::Arith,
        Primitive::Within,
        Primitive::Required,
        Primitive::And,
        Primitive::Or,
        Primitive::Not,
        Primitive::Select,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::LoadField => "load_field",
            Primitive::Const => "const",
            Primitive::Today => "today",
            Primitive::Compare => "compare",
            Primitive::Between => "between",
            Primitive::InList => "in_list",
            Primitive::Length => "length",
            Primitive::IsBlank => "is_blank",
            Primitive::DateDiff => "date_diff",
            Primitive::DateShift => "date_shift",
            Primitive::Abs => "abs",
            Primitive::Arith => "arith",
            Primitive::Within => "within",
            Primitive::Required => "required",
            Primitive::And => "and",
            Primitive::Or => "or",
            Primitive::Not => "not",
            Primitive::Select => "select",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Order two values of the same runtime type
pub fn ordering(left: &Value, right: &Value) -> OpResult<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| "cannot compare NaN".to_string()),
        (Value::Date(a), Value::Date(b)) => Ok(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (a, b) => Err(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

pub fn compare(left: &Value, op: CompareOp, right: &Value) -> OpResult<bool> {
    Ok(op.holds(ordering(left, right)?))
}

/// Inclusive range check
pub fn between(value: &Value, low: &Value, high: &Value) -> OpResult<bool> {
    Ok(ordering(value, low)? != Ordering::Less && ordering(value, high)? != Ordering::Greater)
}

/// List membership by value equality
pub fn in_list(value: &Value, items: &[Value]) -> bool {
    items
        .iter()
        .any(|item| matches!(ordering(value, item), Ok(Ordering::Equal)))
}

pub fn arith(left: f64, op: ArithOp, right: f64) -> OpResult<f64> {
    let result = match op {
        ArithOp::Add => left + right,
        ArithOp::Sub => left - right,
        ArithOp::Mul => left * right,
        ArithOp::Div => {
            if right == 0.0 {
                return Err("division by zero".to_string());
            }
            left / right
        }
    };
    if result.is_finite() {
        Ok(result)
    } else {
        Err("arithmetic overflow".to_string())
    }
}

/// Whole days from `b` to `a`
pub fn date_diff(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days()
}

pub fn date_shift(base: NaiveDate, days: i64) -> OpResult<NaiveDate> {
    Duration::try_days(days)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| format!("date out of range: {} {:+} days", base, days))
}

/// Character count
pub fn length(text: &str) -> f64 {
    text.chars().count() as f64
}

/// Tolerance check. Bounds are inclusive and nothing is rounded.
pub fn within(value: &Value, reference: &Value, tolerance: Tolerance) -> OpResult<bool> {
    match (tolerance, value, reference) {
        (Tolerance::Percent(pct), Value::Number(v), Value::Number(r)) => {
            Ok((v - r).abs() <= pct * r.abs() / 100.0)
        }
        (Tolerance::Absolute(n), Value::Number(v), Value::Number(r)) => Ok((v - r).abs() <= n),
        (Tolerance::Days(n), Value::Date(v), Value::Date(r)) => Ok(date_diff(*v, *r).abs() <= n),
        (tolerance, v, r) => Err(format!(
            "within {} cannot apply to {} and {}",
            tolerance,
            v.type_name(),
            r.type_name()
        )),
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation (n - 1); undefined below two values
pub fn sample_sd(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_between_inclusive() {
        let lo = Value::Number(40.0);
        let hi = Value::Number(200.0);
        assert!(between(&Value::Number(40.0), &lo, &hi).unwrap());
        assert!(between(&Value::Number(200.0), &lo, &hi).unwrap());
        assert!(!between(&Value::Number(39.9), &lo, &hi).unwrap());
        assert!(between(&Value::from("x"), &lo, &hi).is_err());
    }

    #[test]
    fn test_within_percent_boundary() {
        let r = Value::Number(70.0);
        assert!(within(&Value::Number(77.0), &r, Tolerance::Percent(10.0)).unwrap());
        assert!(!within(&Value::Number(85.0), &r, Tolerance::Percent(10.0)).unwrap());
        assert!(within(&Value::Number(63.0), &r, Tolerance::Percent(10.0)).unwrap());
    }

    #[test]
    fn test_within_days_boundary() {
        let r = Value::Date(d(2024, 1, 1));
        assert!(within(&Value::Date(d(2024, 1, 8)), &r, Tolerance::Days(7)).unwrap());
        assert!(!within(&Value::Date(d(2024, 1, 9)), &r, Tolerance::Days(7)).unwrap());
        assert!(within(&Value::Date(d(2023, 12, 25)), &r, Tolerance::Days(7)).unwrap());
    }

    #[test]
    fn test_arith_division_by_zero() {
        assert!(arith(1.0, ArithOp::Div, 0.0).is_err());
        assert_eq!(arith(6.0, ArithOp::Div, 3.0).unwrap(), 2.0);
    }

    #[test]
    fn test_date_helpers() {
        assert_eq!(date_diff(d(2024, 3, 1), d(2024, 2, 1)), 29);
        assert_eq!(date_shift(d(2024, 1, 31), 14).unwrap(), d(2024, 2, 14));
    }

    #[test]
    fn test_date_shift_out_of_range_is_a_fault() {
        assert!(date_shift(d(2024, 1, 1), 200_000_000_000_000).is_err());
        assert!(date_shift(d(2024, 1, 1), i64::MAX).is_err());
        assert!(date_shift(d(2024, 1, 1), i64::MIN).is_err());
        assert!(date_shift(NaiveDate::MAX, 1).is_err());
    }

    #[test]
    fn test_mean_and_sample_sd() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        let sd = sample_sd(&values).unwrap();
        assert!((sd - 2.138089935).abs() < 1e-6);
        assert_eq!(sample_sd(&[1.0]), None);
    }

    #[test]
    fn test_in_list_matches_by_value() {
        let items = vec![Value::from("M"), Value::from("F")];
        assert!(in_list(&Value::from("F"), &items));
        assert!(!in_list(&Value::from("X"), &items));
        assert!(!in_list(&Value::Number(1.0), &items));
    }
}

//! Operators for TrialCheck expressions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal (= or ==)
    Eq,
    /// Not equal (!= or <>)
    Ne,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
}

impl CompareOp {
    /// Returns true for operators that need an ordering, not just equality
    pub fn is_ordering(&self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    /// Apply the operator to an ordering result
    pub fn holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
        }
    }
}

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    /// Addition (+)
    Add,
    /// Subtraction (-)
    Sub,
    /// Multiplication (*)
    Mul,
    /// Division (/)
    Div,
}

impl ArithOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

/// Boolean combinators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn keyword(&self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
        }
    }
}

/// Population aggregates available to cross-patient rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    /// Arithmetic mean
    Mean,
    /// Sample standard deviation
    Sd,
}

impl AggregateFn {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mean" => Some(AggregateFn::Mean),
            "sd" => Some(AggregateFn::Sd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Mean => "mean",
            AggregateFn::Sd => "sd",
        }
    }
}

/// Units accepted by date arithmetic and day windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateUnit {
    Days,
    Weeks,
}

/// Largest day count a shift or window may span (about 10,000 years)
pub const MAX_DAY_SPAN: i64 = 3_650_000;

impl DateUnit {
    /// Day count for `amount` units, `None` past `MAX_DAY_SPAN`
    pub fn to_days(&self, amount: i64) -> Option<i64> {
        let days = match self {
            DateUnit::Days => Some(amount),
            DateUnit::Weeks => amount.checked_mul(7),
        }?;
        (days.checked_abs()? <= MAX_DAY_SPAN).then_some(days)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            DateUnit::Days => "days",
            DateUnit::Weeks => "weeks",
        }
    }
}

/// Tolerance of a `within` clause
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Tolerance {
    /// `within N% of R`: |v - R| <= N/100 * |R|
    Percent(f64),
    /// `within N of R`: |v - R| <= N
    Absolute(f64),
    /// `within N days of R`: |v - R| in whole days <= N
    Days(i64),
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tolerance::Percent(p) => write!(f, "{}%", crate::Value::Number(*p)),
            Tolerance::Absolute(n) => write!(f, "{}", crate::Value::Number(*n)),
            Tolerance::Days(d) => write!(f, "{} days", d),
        }
    }
}

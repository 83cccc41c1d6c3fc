//! Backend-agnostic query tree.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

impl QueryValue {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryValue::Bool(_) => "bool",
            QueryValue::Int(_) => "int",
            QueryValue::Float(_) => "float",
            QueryValue::Str(_) => "string",
            QueryValue::IntList(_) => "int list",
            QueryValue::StrList(_) => "string list",
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, QueryValue::IntList(_) | QueryValue::StrList(_))
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Str(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Str(value)
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Int(value)
    }
}

impl From<f64> for QueryValue {
    fn from(value: f64) -> Self {
        QueryValue::Float(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Match,
    NotMatch,
}

impl Operator {
    pub fn is_negated(self) -> bool {
        matches!(self, Operator::Neq | Operator::NotIn | Operator::NotMatch)
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
        )
    }

    pub fn is_membership(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }

    pub fn is_match(self) -> bool {
        matches!(self, Operator::Match | Operator::NotMatch)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Match => "MATCH",
            Operator::NotMatch => "NOT MATCH",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare {
        field: String,
        op: Operator,
        value: QueryValue,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Exists(String),
}

impl Condition {
    pub fn compare(field: &str, op: Operator, value: impl Into<QueryValue>) -> Self {
        Condition::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<QueryValue>) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Avg,
    Count,
    Max,
    Min,
    Sum,
    Uniq,
    P50,
    P75,
    P90,
    P95,
    P99,
    Quantiles(Vec<f64>),
    /// Any value of the group.
    Any,
    /// Every value of the group. Array fields are concatenated.
    GroupArray,
    /// Distinct values of the group. Array fields are flattened first.
    GroupUniqArray,
}

impl AggregateFunction {
    /// Quantile level for the fixed percentile functions.
    pub fn percentile(&self) -> Option<f64> {
        match self {
            AggregateFunction::P50 => Some(0.5),
            AggregateFunction::P75 => Some(0.75),
            AggregateFunction::P90 => Some(0.9),
            AggregateFunction::P95 => Some(0.95),
            AggregateFunction::P99 => Some(0.99),
            _ => None,
        }
    }
}

/// An aggregate over `field`. With a `condition` only matching rows are
/// aggregated (the `...If` form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub field: String,
    pub alias: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Aggregation {
    pub fn new(function: AggregateFunction, field: &str, alias: &str) -> Self {
        Self {
            function,
            field: field.to_string(),
            alias: alias.to_string(),
            condition: None,
        }
    }

    pub fn filtered(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// A selected field or an aggregation alias.
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Tenant and time window every query is scoped to.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub organization_id: i64,
    pub project_ids: Vec<i64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub referrer: String,
}

//! Field registry and per-field value checking.

use std::collections::HashMap;
use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::query::ast::{AggregateFunction, Aggregation, Operator, QueryValue};
use crate::query::error::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    StringArray,
}

impl AttributeType {
    pub fn is_numeric(self) -> bool {
        matches!(self, AttributeType::Int | AttributeType::Float)
    }

    pub fn is_array(self) -> bool {
        matches!(self, AttributeType::StringArray)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Int => "int",
            AttributeType::Float => "float",
            AttributeType::Bool => "bool",
            AttributeType::DateTime => "datetime",
            AttributeType::StringArray => "string array",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field backed by a derived expression. Only `operators` may be used on it.
#[derive(Debug, PartialEq, Eq)]
pub struct ComputedField {
    pub name: &'static str,
    pub ty: AttributeType,
    pub operators: &'static [Operator],
}

const SCALAR_COMPARISONS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Gt,
    Operator::Gte,
    Operator::Lt,
    Operator::Lte,
];

pub const COMPUTED_FIELDS: &[ComputedField] = &[
    ComputedField {
        name: "duration",
        ty: AttributeType::Int,
        operators: SCALAR_COMPARISONS,
    },
    ComputedField {
        name: "activity",
        ty: AttributeType::Int,
        operators: SCALAR_COMPARISONS,
    },
];

const TAG_OPERATORS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::In,
    Operator::NotIn,
    Operator::Match,
    Operator::NotMatch,
];

/// A query field name resolved against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Column { name: String, ty: AttributeType },
    Computed(&'static ComputedField),
    /// `tags[key]`: the values stored under `key` in the parallel tag arrays.
    Tag(String),
}

impl Field {
    pub fn ty(&self) -> AttributeType {
        match self {
            Field::Column { ty, .. } => *ty,
            Field::Computed(computed) => computed.ty,
            Field::Tag(_) => AttributeType::StringArray,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Field::Column { name, .. } => name.clone(),
            Field::Computed(computed) => computed.name.to_string(),
            Field::Tag(key) => format!("tags[{key}]"),
        }
    }
}

/// Parse `tags[key]` into `key`.
pub fn tag_key(name: &str) -> Option<&str> {
    name.strip_prefix("tags[")
        .and_then(|rest| rest.strip_suffix(']'))
        .filter(|key| !key.is_empty())
}

/// Caller-supplied mapping of stored column name to its type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeTypes {
    types: HashMap<String, AttributeType>,
}

impl AttributeTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, ty: AttributeType) -> Self {
        self.insert(name, ty);
        self
    }

    pub fn insert(&mut self, name: &str, ty: AttributeType) {
        self.types.insert(name.to_string(), ty);
    }

    pub fn get(&self, name: &str) -> Option<AttributeType> {
        self.types.get(name).copied()
    }

    /// Columns of the replays dataset, one row per segment.
    pub fn replay_defaults() -> Self {
        let strings = [
            "replay_id",
            "environment",
            "release",
            "dist",
            "platform",
            "replay_type",
            "user_id",
            "user_email",
            "user_name",
            "ip_address_v4",
            "os_name",
            "os_version",
            "browser_name",
            "browser_version",
            "device_name",
            "device_brand",
            "device_family",
            "device_model",
            "sdk_name",
            "sdk_version",
        ];
        let ints = [
            "project_id",
            "segment_id",
            "count_errors",
            "count_warnings",
            "count_infos",
            "count_dead_clicks",
            "count_rage_clicks",
            "count_urls",
            "is_archived",
            "viewed_by_id",
        ];
        let datetimes = ["timestamp", "replay_start_timestamp"];
        let arrays = ["urls", "error_ids", "trace_ids", "tags.key", "tags.value"];

        let mut types = Self::new();
        for name in strings {
            types.insert(name, AttributeType::String);
        }
        for name in ints {
            types.insert(name, AttributeType::Int);
        }
        for name in datetimes {
            types.insert(name, AttributeType::DateTime);
        }
        for name in arrays {
            types.insert(name, AttributeType::StringArray);
        }
        types
    }

    pub fn resolve(&self, name: &str) -> Result<Field, QueryError> {
        if let Some(key) = tag_key(name) {
            return Ok(Field::Tag(key.to_string()));
        }
        if let Some(computed) = COMPUTED_FIELDS.iter().find(|c| c.name == name) {
            return Ok(Field::Computed(computed));
        }
        match self.get(name) {
            Some(ty) => Ok(Field::Column {
                name: name.to_string(),
                ty,
            }),
            None => Err(QueryError::NotSupported(name.to_string())),
        }
    }
}

fn mismatch(field: &Field, expected: AttributeType, value: &QueryValue) -> QueryError {
    QueryError::TypeMismatch {
        field: field.name(),
        expected,
        got: value.kind(),
    }
}

fn unsupported(field: &Field, op: Operator) -> QueryError {
    QueryError::UnsupportedOperator {
        field: field.name(),
        op,
    }
}

/// Whether `value` is a valid right-hand side of `field op value`.
pub fn check_comparison(
    field: &Field,
    op: Operator,
    value: &QueryValue,
) -> Result<(), QueryError> {
    let allowed = match field {
        Field::Computed(computed) => computed.operators.contains(&op),
        Field::Tag(_) => TAG_OPERATORS.contains(&op),
        Field::Column { ty, .. } => match ty {
            AttributeType::Int | AttributeType::Float | AttributeType::DateTime => !op.is_match(),
            AttributeType::String | AttributeType::StringArray => !op.is_ordering(),
            AttributeType::Bool => matches!(op, Operator::Eq | Operator::Neq),
        },
    };
    if !allowed {
        return Err(unsupported(field, op));
    }

    let ty = field.ty();
    let ok = if op.is_membership() {
        match ty {
            AttributeType::String | AttributeType::StringArray => {
                matches!(value, QueryValue::StrList(_))
            }
            AttributeType::Int | AttributeType::Float => matches!(value, QueryValue::IntList(_)),
            AttributeType::DateTime | AttributeType::Bool => false,
        }
    } else {
        match (ty, value) {
            (AttributeType::String | AttributeType::StringArray, QueryValue::Str(_)) => true,
            (AttributeType::Int, QueryValue::Int(_)) => true,
            (AttributeType::Float, QueryValue::Int(_) | QueryValue::Float(_)) => true,
            (AttributeType::Bool, QueryValue::Bool(_)) => true,
            (AttributeType::DateTime, QueryValue::Int(_)) => true,
            (AttributeType::DateTime, QueryValue::Str(s)) => {
                DateTime::parse_from_rfc3339(s).is_ok()
            }
            _ => false,
        }
    };
    if ok {
        Ok(())
    } else {
        Err(mismatch(field, ty, value))
    }
}

/// `count()` over whole rows rather than a field.
pub fn is_count_star(aggregation: &Aggregation) -> bool {
    matches!(aggregation.function, AggregateFunction::Count)
        && (aggregation.field.is_empty() || aggregation.field == "*")
}

pub fn check_aggregation(
    field: &Field,
    function: &AggregateFunction,
) -> Result<(), QueryError> {
    let ty = field.ty();
    let numeric_only = matches!(
        function,
        AggregateFunction::Avg | AggregateFunction::Sum | AggregateFunction::Quantiles(_)
    ) || function.percentile().is_some();
    let scalar_only = matches!(function, AggregateFunction::Max | AggregateFunction::Min);

    if numeric_only && !ty.is_numeric() {
        return Err(QueryError::TypeMismatch {
            field: field.name(),
            expected: AttributeType::Float,
            got: ty.as_str(),
        });
    }
    if scalar_only && ty.is_array() {
        return Err(QueryError::TypeMismatch {
            field: field.name(),
            expected: AttributeType::String,
            got: ty.as_str(),
        });
    }
    Ok(())
}

/// Type of an aggregate's result column. `field` is `None` for `count()`.
pub fn aggregate_type(function: &AggregateFunction, field: Option<AttributeType>) -> AttributeType {
    match function {
        AggregateFunction::Count | AggregateFunction::Uniq => AttributeType::Int,
        AggregateFunction::Avg => AttributeType::Float,
        AggregateFunction::GroupArray | AggregateFunction::GroupUniqArray => {
            AttributeType::StringArray
        }
        AggregateFunction::Max
        | AggregateFunction::Min
        | AggregateFunction::Sum
        | AggregateFunction::Any => field.unwrap_or(AttributeType::Float),
        // percentiles and quantile lists
        _ => AttributeType::Float,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_fields() {
        let types = AttributeTypes::replay_defaults();

        assert_eq!(
            types.resolve("replay_id").unwrap(),
            Field::Column {
                name: "replay_id".to_string(),
                ty: AttributeType::String
            }
        );
        assert_eq!(
            types.resolve("tags[browser]").unwrap(),
            Field::Tag("browser".to_string())
        );
        assert!(matches!(
            types.resolve("duration").unwrap(),
            Field::Computed(ComputedField { name: "duration", .. })
        ));

        let err = types.resolve("favourite_color").unwrap_err();
        assert!(matches!(err, QueryError::NotSupported(ref f) if f == "favourite_color"));
        assert!(err.to_string().contains("favourite_color"));

        // An empty key is not a tag reference
        assert!(types.resolve("tags[]").is_err());
    }

    #[test]
    fn test_computed_fields_restrict_operators() {
        let types = AttributeTypes::replay_defaults();
        let duration = types.resolve("duration").unwrap();

        assert!(check_comparison(&duration, Operator::Gt, &QueryValue::Int(30)).is_ok());

        let err = check_comparison(&duration, Operator::In, &QueryValue::IntList(vec![1, 2]))
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::UnsupportedOperator { ref field, op: Operator::In } if field == "duration"
        ));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let types = AttributeTypes::replay_defaults();
        let errors = types.resolve("count_errors").unwrap();

        let err = check_comparison(&errors, Operator::Eq, &"five".into()).unwrap_err();
        assert!(matches!(
            err,
            QueryError::TypeMismatch { expected: AttributeType::Int, got: "string", .. }
        ));

        // Membership needs a list
        let replay_id = types.resolve("replay_id").unwrap();
        assert!(check_comparison(&replay_id, Operator::In, &"abc".into()).is_err());
        assert!(check_comparison(
            &replay_id,
            Operator::In,
            &QueryValue::StrList(vec!["abc".to_string()])
        )
        .is_ok());

        let timestamp = types.resolve("timestamp").unwrap();
        let day: QueryValue = "2024-01-01T00:00:00Z".into();
        assert!(check_comparison(&timestamp, Operator::Gte, &day).is_ok());
        assert!(check_comparison(&timestamp, Operator::Gte, &"yesterday".into()).is_err());
    }

    #[test]
    fn test_tags_reject_ordering() {
        let tag = Field::Tag("release".to_string());
        assert!(check_comparison(&tag, Operator::Match, &"1.*".into()).is_ok());
        assert!(matches!(
            check_comparison(&tag, Operator::Gt, &"1".into()),
            Err(QueryError::UnsupportedOperator { .. })
        ));
    }
}

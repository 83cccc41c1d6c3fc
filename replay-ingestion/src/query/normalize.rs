//! EAP returns datetimes as epoch-second doubles and every number as a double.
//! Rows are rewritten to the shape Snuba returns for the same query.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};

use crate::query::ast::Query;
use crate::query::error::QueryError;
use crate::query::fields::{aggregate_type, is_count_star, AttributeType, AttributeTypes};

/// Type of every column label a query produces.
pub fn label_types(
    query: &Query,
    types: &AttributeTypes,
) -> Result<HashMap<String, AttributeType>, QueryError> {
    let mut labels = HashMap::with_capacity(query.select.len() + query.aggregations.len());
    for name in &query.select {
        labels.insert(name.clone(), types.resolve(name)?.ty());
    }
    for aggregation in &query.aggregations {
        let field_ty = if is_count_star(aggregation) {
            None
        } else {
            Some(types.resolve(&aggregation.field)?.ty())
        };
        labels.insert(
            aggregation.alias.clone(),
            aggregate_type(&aggregation.function, field_ty),
        );
    }
    Ok(labels)
}

fn to_datetime(label: &str, seconds: f64) -> Result<Value, QueryError> {
    let invalid =
        || QueryError::InvalidResponse(format!("invalid timestamp {seconds} for {label}"));
    if !seconds.is_finite() {
        return Err(invalid());
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    let at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
    Ok(Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
}

/// Cast an integer-valued double, refusing anything with a fractional part.
fn to_integer(label: &str, value: f64) -> Result<Value, QueryError> {
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    if !value.is_finite() || value.fract() != 0.0 || !in_range {
        return Err(QueryError::InvalidResponse(format!(
            "non-integral value {value} for integer column {label}"
        )));
    }
    Ok(Value::from(value as i64))
}

fn normalize_value(label: &str, ty: AttributeType, value: Value) -> Result<Value, QueryError> {
    let Value::Number(number) = &value else {
        return Ok(value);
    };
    if number.is_i64() || number.is_u64() {
        return match ty {
            AttributeType::DateTime => to_datetime(label, number.as_f64().unwrap_or_default()),
            _ => Ok(value),
        };
    }
    let Some(x) = number.as_f64() else {
        return Ok(value);
    };
    match ty {
        AttributeType::DateTime => to_datetime(label, x),
        AttributeType::Int => to_integer(label, x),
        _ => Ok(value),
    }
}

pub fn normalize_rows(
    rows: Vec<Map<String, Value>>,
    labels: &HashMap<String, AttributeType>,
) -> Result<Vec<Map<String, Value>>, QueryError> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(label, value)| {
                    let value = match labels.get(&label) {
                        Some(ty) => normalize_value(&label, *ty, value)?,
                        None => value,
                    };
                    Ok::<_, QueryError>((label, value))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query::ast::{AggregateFunction, Aggregation};

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn query() -> Query {
        Query {
            select: vec!["replay_id".to_string(), "project_id".to_string()],
            aggregations: vec![
                Aggregation::new(AggregateFunction::Max, "timestamp", "finished_at"),
                Aggregation::new(AggregateFunction::Count, "", "count_segments"),
                Aggregation::new(AggregateFunction::Avg, "count_errors", "avg_errors"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_label_types() {
        let labels = label_types(&query(), &AttributeTypes::replay_defaults()).unwrap();
        assert_eq!(labels["replay_id"], AttributeType::String);
        assert_eq!(labels["project_id"], AttributeType::Int);
        assert_eq!(labels["finished_at"], AttributeType::DateTime);
        assert_eq!(labels["count_segments"], AttributeType::Int);
        assert_eq!(labels["avg_errors"], AttributeType::Float);
    }

    #[test]
    fn test_normalize_rows() {
        let labels = label_types(&query(), &AttributeTypes::replay_defaults()).unwrap();
        let rows = vec![row(json!({
            "replay_id": "abc",
            "project_id": 42.0,
            "finished_at": 1704067200.5,
            "count_segments": 3.0,
            "avg_errors": 1.5,
            "unlisted": 2.0,
        }))];

        let normalized = normalize_rows(rows, &labels).unwrap();
        assert_eq!(
            Value::Object(normalized[0].clone()),
            json!({
                "replay_id": "abc",
                "project_id": 42,
                "finished_at": "2024-01-01T00:00:00.500Z",
                "count_segments": 3,
                "avg_errors": 1.5,
                "unlisted": 2.0,
            })
        );
    }

    #[test]
    fn test_integer_timestamps_are_converted() {
        let labels = HashMap::from([("finished_at".to_string(), AttributeType::DateTime)]);
        let normalized =
            normalize_rows(vec![row(json!({"finished_at": 1704067200}))], &labels).unwrap();
        assert_eq!(normalized[0]["finished_at"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_fractional_integer_fails() {
        let labels = HashMap::from([("project_id".to_string(), AttributeType::Int)]);
        let err = normalize_rows(vec![row(json!({"project_id": 42.5}))], &labels).unwrap_err();
        assert!(matches!(err, QueryError::InvalidResponse(ref m) if m.contains("project_id")));
    }

    #[test]
    fn test_nulls_pass_through() {
        let labels = HashMap::from([("project_id".to_string(), AttributeType::Int)]);
        let normalized = normalize_rows(vec![row(json!({"project_id": null}))], &labels).unwrap();
        assert_eq!(normalized[0]["project_id"], Value::Null);
    }
}

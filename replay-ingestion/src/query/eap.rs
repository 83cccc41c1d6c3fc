//! Translation of the query tree into an EAP trace-item table request, and
//! decoding of its column-oriented response.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::query::ast::{
    AggregateFunction, Aggregation, Condition, Direction, Operator, Query, QueryValue, RequestMeta,
};
use crate::query::error::QueryError;
use crate::query::fields::{
    check_aggregation, check_comparison, is_count_star, AttributeType, AttributeTypes, Field,
};
use crate::query::snuba::Page;

pub const TRACE_ITEM_TYPE: &str = "TRACE_ITEM_TYPE_REPLAY";
pub const COGS_CATEGORY: &str = "replays";
const EXTRAPOLATION_MODE: &str = "EXTRAPOLATION_MODE_NONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeKeyType {
    TypeString,
    TypeInt,
    TypeDouble,
    TypeBoolean,
    /// Only valid on selected columns; arrays cannot be filtered or aggregated.
    TypeArray,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeKey {
    #[serde(rename = "type")]
    pub kind: AttributeKeyType,
    pub name: String,
}

impl AttributeKey {
    pub fn new(kind: AttributeKeyType, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    ValStr(String),
    ValInt(i64),
    ValDouble(f64),
    ValBool(bool),
    ValStrArray { values: Vec<String> },
    ValIntArray { values: Vec<i64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonOp {
    OpEquals,
    OpNotEquals,
    OpIn,
    OpNotIn,
    OpGreaterThan,
    OpGreaterThanOrEquals,
    OpLessThan,
    OpLessThanOrEquals,
    OpLike,
    OpNotLike,
}

impl From<Operator> for ComparisonOp {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Eq => ComparisonOp::OpEquals,
            Operator::Neq => ComparisonOp::OpNotEquals,
            Operator::In => ComparisonOp::OpIn,
            Operator::NotIn => ComparisonOp::OpNotIn,
            Operator::Gt => ComparisonOp::OpGreaterThan,
            Operator::Gte => ComparisonOp::OpGreaterThanOrEquals,
            Operator::Lt => ComparisonOp::OpLessThan,
            Operator::Lte => ComparisonOp::OpLessThanOrEquals,
            Operator::Match => ComparisonOp::OpLike,
            Operator::NotMatch => ComparisonOp::OpNotLike,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceItemFilter {
    AndFilter {
        filters: Vec<TraceItemFilter>,
    },
    OrFilter {
        filters: Vec<TraceItemFilter>,
    },
    NotFilter {
        filters: Vec<TraceItemFilter>,
    },
    ComparisonFilter {
        key: AttributeKey,
        op: ComparisonOp,
        value: AttributeValue,
        ignore_case: bool,
    },
    ExistsFilter {
        key: AttributeKey,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Function {
    FunctionAvg,
    FunctionCount,
    FunctionMax,
    FunctionMin,
    FunctionSum,
    FunctionUniq,
    FunctionP50,
    FunctionP75,
    FunctionP90,
    FunctionP95,
    FunctionP99,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeAggregation {
    pub aggregate: Function,
    pub key: AttributeKey,
    pub label: String,
    pub extrapolation_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<TraceItemFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<AttributeKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AttributeAggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditional_aggregation: Option<AttributeAggregation>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceItemOrderBy {
    pub column: Column,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EapRequestMeta {
    pub organization_id: i64,
    pub project_ids: Vec<i64>,
    pub cogs_category: &'static str,
    pub referrer: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub trace_item_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageToken {
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceItemTableRequest {
    pub meta: EapRequestMeta,
    pub columns: Vec<Column>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<TraceItemFilter>,
    pub order_by: Vec<TraceItemOrderBy>,
    pub group_by: Vec<AttributeKey>,
    pub limit: u64,
    pub page_token: PageToken,
}

fn attribute_key(field: &Field) -> Result<AttributeKey, QueryError> {
    match field {
        Field::Column { name, ty } => {
            let kind = match ty {
                AttributeType::String => AttributeKeyType::TypeString,
                AttributeType::Int => AttributeKeyType::TypeInt,
                AttributeType::Float | AttributeType::DateTime => AttributeKeyType::TypeDouble,
                AttributeType::Bool => AttributeKeyType::TypeBoolean,
                AttributeType::StringArray => return Err(QueryError::NotSupported(name.clone())),
            };
            Ok(AttributeKey::new(kind, name))
        }
        Field::Computed(computed) => Err(QueryError::NotSupported(computed.name.to_string())),
        Field::Tag(key) => Ok(AttributeKey::new(AttributeKeyType::TypeString, key)),
    }
}

/// SQL LIKE pattern for a user wildcard pattern, matching anywhere in the value.
pub fn like_pattern(pattern: &str) -> String {
    let trimmed = pattern.strip_prefix('^').unwrap_or(pattern);
    let trimmed = trimmed.strip_suffix('$').unwrap_or(trimmed);
    let mut like = String::with_capacity(trimmed.len() + 2);
    like.push('%');
    for c in trimmed.chars() {
        match c {
            '*' => like.push('%'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            _ => like.push(c),
        }
    }
    like.push('%');
    like
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn attribute_value(ty: AttributeType, value: &QueryValue) -> Result<AttributeValue, QueryError> {
    let converted = match (ty, value) {
        (AttributeType::DateTime, QueryValue::Str(s)) => {
            let at = DateTime::parse_from_rfc3339(s)
                .map_err(|e| QueryError::Invalid(format!("bad datetime {s}: {e}")))?;
            AttributeValue::ValDouble(epoch_seconds(at.with_timezone(&Utc)))
        }
        (AttributeType::DateTime | AttributeType::Float, QueryValue::Int(i)) => {
            AttributeValue::ValDouble(*i as f64)
        }
        (_, QueryValue::Str(s)) => AttributeValue::ValStr(s.clone()),
        (_, QueryValue::Int(i)) => AttributeValue::ValInt(*i),
        (_, QueryValue::Float(x)) => AttributeValue::ValDouble(*x),
        (_, QueryValue::Bool(b)) => AttributeValue::ValBool(*b),
        (_, QueryValue::StrList(values)) => AttributeValue::ValStrArray {
            values: values.clone(),
        },
        (_, QueryValue::IntList(values)) => AttributeValue::ValIntArray {
            values: values.clone(),
        },
    };
    Ok(converted)
}

fn compare(field: &Field, op: Operator, value: &QueryValue) -> Result<TraceItemFilter, QueryError> {
    let key = attribute_key(field)?;
    let value = match (op.is_match(), value) {
        (true, QueryValue::Str(pattern)) => AttributeValue::ValStr(like_pattern(pattern)),
        (true, other) => {
            return Err(QueryError::Invalid(format!(
                "{op} needs a string pattern, got {}",
                other.kind()
            )))
        }
        (false, value) => attribute_value(field.ty(), value)?,
    };
    Ok(TraceItemFilter::ComparisonFilter {
        key,
        op: op.into(),
        value,
        ignore_case: op.is_match(),
    })
}

fn combine(
    children: &[Condition],
    types: &AttributeTypes,
    wrap: fn(Vec<TraceItemFilter>) -> TraceItemFilter,
) -> Result<TraceItemFilter, QueryError> {
    let mut filters = children
        .iter()
        .map(|child| translate_condition(child, types))
        .collect::<Result<Vec<_>, _>>()?;
    match filters.len() {
        0 => Err(QueryError::Invalid(
            "a boolean filter needs at least one condition".to_string(),
        )),
        1 => Ok(filters.swap_remove(0)),
        _ => Ok(wrap(filters)),
    }
}

pub fn translate_condition(
    condition: &Condition,
    types: &AttributeTypes,
) -> Result<TraceItemFilter, QueryError> {
    match condition {
        Condition::Compare { field, op, value } => {
            let field = types.resolve(field)?;
            check_comparison(&field, *op, value)?;
            compare(&field, *op, value)
        }
        Condition::And(children) => combine(children, types, |filters| {
            TraceItemFilter::AndFilter { filters }
        }),
        Condition::Or(children) => combine(children, types, |filters| {
            TraceItemFilter::OrFilter { filters }
        }),
        Condition::Not(inner) => Ok(TraceItemFilter::NotFilter {
            filters: vec![translate_condition(inner, types)?],
        }),
        Condition::Exists(name) => Ok(TraceItemFilter::ExistsFilter {
            key: attribute_key(&types.resolve(name)?)?,
        }),
    }
}

fn function(aggregation: &Aggregation) -> Result<Function, QueryError> {
    let function = match &aggregation.function {
        AggregateFunction::Avg => Function::FunctionAvg,
        AggregateFunction::Count => Function::FunctionCount,
        AggregateFunction::Max => Function::FunctionMax,
        AggregateFunction::Min => Function::FunctionMin,
        AggregateFunction::Sum => Function::FunctionSum,
        AggregateFunction::Uniq => Function::FunctionUniq,
        AggregateFunction::P50 => Function::FunctionP50,
        AggregateFunction::P75 => Function::FunctionP75,
        AggregateFunction::P90 => Function::FunctionP90,
        AggregateFunction::P95 => Function::FunctionP95,
        AggregateFunction::P99 => Function::FunctionP99,
        other => {
            return Err(QueryError::NotSupported(format!(
                "aggregate {other:?} ({})",
                aggregation.alias
            )))
        }
    };
    Ok(function)
}

pub fn translate_aggregation(
    aggregation: &Aggregation,
    types: &AttributeTypes,
) -> Result<Column, QueryError> {
    let aggregate = function(aggregation)?;
    let key = if is_count_star(aggregation) {
        AttributeKey::new(AttributeKeyType::TypeString, "replay_id")
    } else {
        let field = types.resolve(&aggregation.field)?;
        check_aggregation(&field, &aggregation.function)?;
        attribute_key(&field)?
    };
    let filter = aggregation
        .condition
        .as_ref()
        .map(|c| translate_condition(c, types))
        .transpose()?;

    let conditional = filter.is_some();
    let descriptor = AttributeAggregation {
        aggregate,
        key,
        label: aggregation.alias.clone(),
        extrapolation_mode: EXTRAPOLATION_MODE,
        filter,
    };
    let (aggregation_column, conditional_aggregation) = if conditional {
        (None, Some(descriptor))
    } else {
        (Some(descriptor), None)
    };
    Ok(Column {
        key: None,
        aggregation: aggregation_column,
        conditional_aggregation,
        label: aggregation.alias.clone(),
    })
}

/// Key of a selected column. Unlike filters, a select may read an array.
fn select_key(field: &Field) -> Result<AttributeKey, QueryError> {
    match field {
        Field::Column {
            name,
            ty: AttributeType::StringArray,
        } => Ok(AttributeKey::new(AttributeKeyType::TypeArray, name)),
        _ => attribute_key(field),
    }
}

fn key_column(field: &Field) -> Result<Column, QueryError> {
    Ok(Column {
        key: Some(select_key(field)?),
        aggregation: None,
        conditional_aggregation: None,
        label: field.name(),
    })
}

fn request_meta(meta: &RequestMeta) -> Result<EapRequestMeta, QueryError> {
    if meta.project_ids.is_empty() {
        return Err(QueryError::Invalid("at least one project id is required".to_string()));
    }
    Ok(EapRequestMeta {
        organization_id: meta.organization_id,
        project_ids: meta.project_ids.clone(),
        cogs_category: COGS_CATEGORY,
        referrer: meta.referrer.clone(),
        start_timestamp: meta.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        end_timestamp: meta.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        trace_item_type: TRACE_ITEM_TYPE,
    })
}

pub fn build_request(
    query: &Query,
    types: &AttributeTypes,
    meta: &RequestMeta,
    page: Page,
) -> Result<TraceItemTableRequest, QueryError> {
    if query.select.is_empty() && query.aggregations.is_empty() {
        return Err(QueryError::Invalid("nothing selected".to_string()));
    }

    let mut columns = Vec::with_capacity(query.select.len() + query.aggregations.len());
    for name in &query.select {
        columns.push(key_column(&types.resolve(name)?)?);
    }
    for aggregation in &query.aggregations {
        columns.push(translate_aggregation(aggregation, types)?);
    }

    let mut order_by = Vec::with_capacity(query.order_by.len());
    for order in &query.order_by {
        let column = match columns.iter().find(|c| c.label == order.field) {
            Some(column) => column.clone(),
            None => key_column(&types.resolve(&order.field)?)?,
        };
        order_by.push(TraceItemOrderBy {
            column,
            descending: order.direction == Direction::Desc,
        });
    }

    let group_by = query
        .group_by
        .iter()
        .map(|name| types.resolve(name).and_then(|f| attribute_key(&f)))
        .collect::<Result<Vec<_>, _>>()?;

    let filter = query
        .condition
        .as_ref()
        .map(|c| translate_condition(c, types))
        .transpose()?;

    Ok(TraceItemTableRequest {
        meta: request_meta(meta)?,
        columns,
        filter,
        order_by,
        group_by,
        limit: page.limit as u64,
        page_token: PageToken {
            offset: page.offset as u64,
        },
    })
}

/// One cell of a response column. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultValue {
    pub val_str: Option<String>,
    /// int64 arrives as a JSON string or number depending on the encoder.
    pub val_int: Option<Value>,
    pub val_double: Option<f64>,
    pub val_float: Option<f64>,
    pub val_bool: Option<bool>,
    pub val_array: Option<ArrayValue>,
    pub val_null: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArrayValue {
    #[serde(default)]
    pub values: Vec<ResultValue>,
}

impl ResultValue {
    pub fn into_json(self) -> Value {
        if let Some(s) = self.val_str {
            return Value::String(s);
        }
        if let Some(int) = self.val_int {
            return match int {
                Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(Value::String(s)),
                other => other,
            };
        }
        if let Some(x) = self.val_double.or(self.val_float) {
            return Number::from_f64(x).map_or(Value::Null, Value::Number);
        }
        if let Some(b) = self.val_bool {
            return Value::Bool(b);
        }
        if let Some(array) = self.val_array {
            return Value::Array(array.values.into_iter().map(Self::into_json).collect());
        }
        Value::Null
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraceItemColumnValues {
    pub attribute_name: String,
    #[serde(default)]
    pub results: Vec<ResultValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraceItemTableResponse {
    #[serde(default)]
    pub column_values: Vec<TraceItemColumnValues>,
}

impl TraceItemTableResponse {
    /// Pivot the column-oriented response into rows keyed by column label.
    pub fn into_rows(self) -> Vec<Map<String, Value>> {
        let row_count = self
            .column_values
            .iter()
            .map(|c| c.results.len())
            .max()
            .unwrap_or(0);
        let mut rows = vec![Map::new(); row_count];
        for column in self.column_values {
            let mut results = column.results.into_iter();
            for row in rows.iter_mut() {
                let value = results.next().map_or(Value::Null, ResultValue::into_json);
                row.insert(column.attribute_name.clone(), value);
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::query::ast::OrderBy;

    fn types() -> AttributeTypes {
        AttributeTypes::replay_defaults()
    }

    fn filter_json(condition: &Condition) -> Value {
        serde_json::to_value(translate_condition(condition, &types()).unwrap()).unwrap()
    }

    #[test]
    fn test_comparison_filters() {
        assert_eq!(
            filter_json(&Condition::eq("replay_id", "abc")),
            json!({"comparison_filter": {
                "key": {"type": "TYPE_STRING", "name": "replay_id"},
                "op": "OP_EQUALS",
                "value": {"val_str": "abc"},
                "ignore_case": false,
            }})
        );
        assert_eq!(
            filter_json(&Condition::compare(
                "project_id",
                Operator::In,
                QueryValue::IntList(vec![1, 2])
            )),
            json!({"comparison_filter": {
                "key": {"type": "TYPE_INT", "name": "project_id"},
                "op": "OP_IN",
                "value": {"val_int_array": {"values": [1, 2]}},
                "ignore_case": false,
            }})
        );
        assert_eq!(
            filter_json(&Condition::compare(
                "timestamp",
                Operator::Gte,
                "2024-01-01T00:00:00Z"
            )),
            json!({"comparison_filter": {
                "key": {"type": "TYPE_DOUBLE", "name": "timestamp"},
                "op": "OP_GREATER_THAN_OR_EQUALS",
                "value": {"val_double": 1704067200.0},
                "ignore_case": false,
            }})
        );
    }

    #[test]
    fn test_match_becomes_like() {
        assert_eq!(like_pattern("^foo*bar$"), "%foo%bar%");
        assert_eq!(like_pattern("100%_done"), "%100\\%\\_done%");

        assert_eq!(
            filter_json(&Condition::compare("tags[browser]", Operator::NotMatch, "fire*")),
            json!({"comparison_filter": {
                "key": {"type": "TYPE_STRING", "name": "browser"},
                "op": "OP_NOT_LIKE",
                "value": {"val_str": "%fire%%"},
                "ignore_case": true,
            }})
        );
    }

    #[test]
    fn test_boolean_filters() {
        let condition = Condition::Or(vec![
            Condition::eq("environment", "prod"),
            Condition::Exists("release".to_string()).negate(),
        ]);
        assert_eq!(
            filter_json(&condition),
            json!({"or_filter": {"filters": [
                {"comparison_filter": {
                    "key": {"type": "TYPE_STRING", "name": "environment"},
                    "op": "OP_EQUALS",
                    "value": {"val_str": "prod"},
                    "ignore_case": false,
                }},
                {"not_filter": {"filters": [
                    {"exists_filter": {"key": {"type": "TYPE_STRING", "name": "release"}}}
                ]}},
            ]}})
        );
    }

    #[test]
    fn test_unsupported_fields() {
        let err = translate_condition(
            &Condition::compare("duration", Operator::Gt, 10_i64),
            &types(),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::NotSupported(ref f) if f == "duration"));

        let err = translate_condition(&Condition::eq("urls", "https://a"), &types()).unwrap_err();
        assert!(matches!(err, QueryError::NotSupported(ref f) if f == "urls"));

        let err = translate_condition(&Condition::eq("nope", "x"), &types()).unwrap_err();
        assert!(matches!(err, QueryError::NotSupported(ref f) if f == "nope"));
    }

    #[test]
    fn test_aggregations() {
        let column = translate_aggregation(
            &Aggregation::new(AggregateFunction::P90, "count_errors", "p90_errors"),
            &types(),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&column).unwrap(),
            json!({
                "aggregation": {
                    "aggregate": "FUNCTION_P90",
                    "key": {"type": "TYPE_INT", "name": "count_errors"},
                    "label": "p90_errors",
                    "extrapolation_mode": "EXTRAPOLATION_MODE_NONE",
                },
                "label": "p90_errors",
            })
        );

        let conditional = translate_aggregation(
            &Aggregation::new(AggregateFunction::Count, "", "viewed")
                .filtered(Condition::eq("viewed_by_id", 7_i64)),
            &types(),
        )
        .unwrap();
        assert!(conditional.aggregation.is_none());
        let descriptor = conditional.conditional_aggregation.unwrap();
        assert_eq!(descriptor.aggregate, Function::FunctionCount);
        assert!(descriptor.filter.is_some());

        assert!(matches!(
            translate_aggregation(
                &Aggregation::new(AggregateFunction::Quantiles(vec![0.5]), "count_errors", "q"),
                &types()
            ),
            Err(QueryError::NotSupported(_))
        ));
    }

    #[test]
    fn test_build_request() {
        let meta = RequestMeta {
            organization_id: 1,
            project_ids: vec![42],
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            referrer: "replays.query.test".to_string(),
        };
        let query = Query {
            select: vec!["replay_id".to_string()],
            aggregations: vec![Aggregation::new(
                AggregateFunction::Max,
                "timestamp",
                "finished_at",
            )],
            group_by: vec!["replay_id".to_string()],
            order_by: vec![OrderBy::desc("finished_at")],
            ..Default::default()
        };
        let page = Page {
            limit: 10,
            offset: 20,
        };
        let request = build_request(&query, &types(), &meta, page).unwrap();
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(
            body["meta"],
            json!({
                "organization_id": 1,
                "project_ids": [42],
                "cogs_category": "replays",
                "referrer": "replays.query.test",
                "start_timestamp": "2024-01-01T00:00:00Z",
                "end_timestamp": "2024-01-02T00:00:00Z",
                "trace_item_type": "TRACE_ITEM_TYPE_REPLAY",
            })
        );
        assert_eq!(body["limit"], json!(10));
        assert_eq!(body["page_token"], json!({"offset": 20}));
        assert_eq!(body["group_by"], json!([{"type": "TYPE_STRING", "name": "replay_id"}]));
        assert_eq!(body["order_by"][0]["descending"], json!(true));
        assert_eq!(body["order_by"][0]["column"]["label"], json!("finished_at"));
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn test_response_into_rows() {
        let response: TraceItemTableResponse = serde_json::from_value(json!({
            "column_values": [
                {"attribute_name": "replay_id", "results": [{"val_str": "a"}, {"val_str": "b"}]},
                {"attribute_name": "project_id", "results": [{"val_int": "42"}, {"val_null": true}]},
                {"attribute_name": "finished_at", "results": [{"val_double": 1704067200.0}]},
            ]
        }))
        .unwrap();

        let rows = response.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"replay_id": "a", "project_id": 42, "finished_at": 1704067200.0})
        );
        assert_eq!(
            Value::Object(rows[1].clone()),
            json!({"replay_id": "b", "project_id": null, "finished_at": null})
        );
    }

    #[test]
    fn test_arrays_are_selectable_but_not_filterable() {
        let meta = RequestMeta {
            organization_id: 1,
            project_ids: vec![42],
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            referrer: "replays.query.test".to_string(),
        };
        let query = Query {
            select: vec!["replay_id".to_string(), "urls".to_string()],
            ..Default::default()
        };
        let page = Page {
            limit: 10,
            offset: 0,
        };
        let request = build_request(&query, &types(), &meta, page).unwrap();
        assert_eq!(
            serde_json::to_value(&request.columns[1]).unwrap(),
            json!({"key": {"type": "TYPE_ARRAY", "name": "urls"}, "label": "urls"})
        );

        let filtered = Query {
            condition: Some(Condition::eq("urls", "https://a")),
            ..query
        };
        assert!(matches!(
            build_request(&filtered, &types(), &meta, page),
            Err(QueryError::NotSupported(ref f)) if f == "urls"
        ));

        let response: TraceItemTableResponse = serde_json::from_value(json!({
            "column_values": [
                {"attribute_name": "urls", "results": [
                    {"val_array": {"values": [{"val_str": "https://a"}, {"val_str": "https://b"}]}},
                    {"val_array": {}},
                ]},
            ]
        }))
        .unwrap();
        let rows = response.into_rows();
        assert_eq!(rows[0]["urls"], json!(["https://a", "https://b"]));
        assert_eq!(rows[1]["urls"], json!([]));
    }
}

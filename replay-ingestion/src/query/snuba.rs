//! Translation of the query tree into SnQL.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::query::ast::{
    AggregateFunction, Aggregation, Condition, Direction, Operator, Query, QueryValue, RequestMeta,
};
use crate::query::error::QueryError;
use crate::query::fields::{
    check_aggregation, check_comparison, is_count_star, AttributeType, AttributeTypes, Field,
};
use crate::query::sampling::sample_condition;
use crate::query::tags::{array_condition, tag_values, wildcard_pattern};

pub const DATASET: &str = "replays";
pub const APP_ID: &str = "replay-backend-web";

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// A ClickHouse expression in function-call form.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Literal),
    /// `name(params)(args)` when `params` is non-empty, else `name(args)`.
    Function {
        name: String,
        params: Vec<Expr>,
        args: Vec<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Array(Vec<Expr>),
}

impl Expr {
    pub fn column(name: &str) -> Self {
        Expr::Column(name.to_string())
    }

    pub fn string(value: &str) -> Self {
        Expr::Literal(Literal::Str(value.to_string()))
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn uint(value: u64) -> Self {
        Expr::Literal(Literal::UInt(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value))
    }

    pub fn function(name: &str, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_string(),
            params: Vec::new(),
            args,
        }
    }

    pub fn parametric(name: &str, params: Vec<Expr>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_string(),
            params,
            args,
        }
    }

    pub fn lambda(params: &[&str], body: Expr) -> Self {
        Expr::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
                write!(f, "'{escaped}'")
            }
            Literal::Int(i) => write!(f, "{i}"),
            Literal::UInt(u) => write!(f, "{u}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => f.write_str(name),
            Expr::Literal(literal) => write!(f, "{literal}"),
            Expr::Function { name, params, args } => {
                f.write_str(name)?;
                if !params.is_empty() {
                    f.write_str("(")?;
                    write_list(f, params)?;
                    f.write_str(")")?;
                }
                f.write_str("(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::Lambda { params, body } => {
                if params.len() == 1 {
                    write!(f, "{} -> {body}", params[0])
                } else {
                    write!(f, "({}) -> {body}", params.join(", "))
                }
            }
            Expr::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
        }
    }
}

/// Plain identifiers pass through, anything else is backtick-quoted.
fn identifier(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "\\`"))
    }
}

fn computed_expr(name: &str) -> Expr {
    match name {
        "duration" => Expr::function(
            "dateDiff",
            vec![
                Expr::string("second"),
                Expr::column("replay_start_timestamp"),
                Expr::column("timestamp"),
            ],
        ),
        // activity = clamp((errors * 25 + urls * 5) / 10, 1, 10)
        _ => {
            let weighted = Expr::function(
                "plus",
                vec![
                    Expr::function("multiply", vec![Expr::column("count_errors"), Expr::int(25)]),
                    Expr::function("multiply", vec![Expr::column("count_urls"), Expr::int(5)]),
                ],
            );
            let score = Expr::function("intDiv", vec![weighted, Expr::int(10)]);
            Expr::function(
                "least",
                vec![
                    Expr::function("greatest", vec![score, Expr::int(1)]),
                    Expr::int(10),
                ],
            )
        }
    }
}

pub fn field_expr(field: &Field) -> Expr {
    match field {
        Field::Column { name, .. } => Expr::Column(name.clone()),
        Field::Computed(computed) => computed_expr(computed.name),
        Field::Tag(key) => tag_values(key),
    }
}

fn datetime_literal(at: DateTime<Utc>) -> Expr {
    Expr::function(
        "toDateTime",
        vec![Expr::string(&at.format("%Y-%m-%dT%H:%M:%S").to_string())],
    )
}

fn literal(ty: AttributeType, value: &QueryValue) -> Result<Expr, QueryError> {
    let expr = match (ty, value) {
        (AttributeType::DateTime, QueryValue::Str(s)) => {
            let at = DateTime::parse_from_rfc3339(s)
                .map_err(|e| QueryError::Invalid(format!("bad datetime {s}: {e}")))?;
            datetime_literal(at.with_timezone(&Utc))
        }
        (AttributeType::DateTime, QueryValue::Int(secs)) => {
            Expr::function("toDateTime", vec![Expr::int(*secs)])
        }
        (_, QueryValue::Str(s)) => Expr::string(s),
        (_, QueryValue::Int(i)) => Expr::int(*i),
        (_, QueryValue::Float(x)) => Expr::float(*x),
        (_, QueryValue::Bool(b)) => Expr::Literal(Literal::Bool(*b)),
        (_, QueryValue::IntList(items)) => {
            Expr::function("tuple", items.iter().map(|i| Expr::int(*i)).collect())
        }
        (_, QueryValue::StrList(items)) => {
            Expr::function("tuple", items.iter().map(|s| Expr::string(s)).collect())
        }
    };
    Ok(expr)
}

fn compare(field: &Field, op: Operator, value: &QueryValue) -> Result<Expr, QueryError> {
    let lhs = field_expr(field);
    if field.ty().is_array() {
        return array_condition(lhs, op, value);
    }

    let name = match op {
        Operator::Eq => "equals",
        Operator::Neq => "notEquals",
        Operator::In => "in",
        Operator::NotIn => "notIn",
        Operator::Gt => "greater",
        Operator::Gte => "greaterOrEquals",
        Operator::Lt => "less",
        Operator::Lte => "lessOrEquals",
        Operator::Match | Operator::NotMatch => {
            let QueryValue::Str(pattern) = value else {
                return Err(QueryError::Invalid(format!("{op} needs a string pattern")));
            };
            let matched =
                Expr::function("match", vec![lhs, Expr::string(&wildcard_pattern(pattern))]);
            return Ok(if op.is_negated() {
                Expr::function("not", vec![matched])
            } else {
                matched
            });
        }
    };
    Ok(Expr::function(name, vec![lhs, literal(field.ty(), value)?]))
}

fn exists(field: &Field) -> Expr {
    match field {
        Field::Tag(key) => Expr::function("has", vec![Expr::column("tags.key"), Expr::string(key)]),
        Field::Column {
            ty: AttributeType::String | AttributeType::StringArray,
            ..
        } => Expr::function("notEmpty", vec![field_expr(field)]),
        _ => Expr::function("isNotNull", vec![field_expr(field)]),
    }
}

fn combine(
    name: &str,
    children: &[Condition],
    types: &AttributeTypes,
) -> Result<Expr, QueryError> {
    let mut exprs = children
        .iter()
        .map(|child| translate_condition(child, types))
        .collect::<Result<Vec<_>, _>>()?;
    match exprs.len() {
        0 => Err(QueryError::Invalid(format!("{name} needs at least one condition"))),
        1 => Ok(exprs.swap_remove(0)),
        _ => Ok(Expr::function(name, exprs)),
    }
}

pub fn translate_condition(
    condition: &Condition,
    types: &AttributeTypes,
) -> Result<Expr, QueryError> {
    match condition {
        Condition::Compare { field, op, value } => {
            let field = types.resolve(field)?;
            check_comparison(&field, *op, value)?;
            compare(&field, *op, value)
        }
        Condition::And(children) => combine("and", children, types),
        Condition::Or(children) => combine("or", children, types),
        Condition::Not(inner) => Ok(Expr::function(
            "not",
            vec![translate_condition(inner, types)?],
        )),
        Condition::Exists(name) => Ok(exists(&types.resolve(name)?)),
    }
}

pub fn translate_aggregation(
    aggregation: &Aggregation,
    types: &AttributeTypes,
) -> Result<Expr, QueryError> {
    let condition = aggregation
        .condition
        .as_ref()
        .map(|c| translate_condition(c, types))
        .transpose()?;
    let suffix = if condition.is_some() { "If" } else { "" };

    if is_count_star(aggregation) {
        return Ok(Expr::function(
            &format!("count{suffix}"),
            condition.into_iter().collect(),
        ));
    }

    let field = types.resolve(&aggregation.field)?;
    check_aggregation(&field, &aggregation.function)?;

    let mut args = vec![field_expr(&field)];
    args.extend(condition);

    let simple = |name: &str, args: Vec<Expr>| Expr::function(&format!("{name}{suffix}"), args);
    let expr = match &aggregation.function {
        AggregateFunction::Avg => simple("avg", args),
        AggregateFunction::Count => simple("count", args),
        AggregateFunction::Max => simple("max", args),
        AggregateFunction::Min => simple("min", args),
        AggregateFunction::Sum => simple("sum", args),
        AggregateFunction::Uniq => simple("uniq", args),
        AggregateFunction::Any => simple("any", args),
        AggregateFunction::GroupArray if field.ty().is_array() => simple("groupArrayArray", args),
        AggregateFunction::GroupArray => simple("groupArray", args),
        AggregateFunction::GroupUniqArray if field.ty().is_array() => {
            simple("groupUniqArrayArray", args)
        }
        AggregateFunction::GroupUniqArray => simple("groupUniqArray", args),
        AggregateFunction::Quantiles(levels) => {
            if levels.is_empty() {
                return Err(QueryError::Invalid(format!(
                    "quantiles for {} needs at least one level",
                    aggregation.alias
                )));
            }
            Expr::parametric(
                &format!("quantiles{suffix}"),
                levels.iter().map(|q| Expr::float(*q)).collect(),
                args,
            )
        }
        percentile => {
            let level = percentile.percentile().ok_or_else(|| {
                QueryError::Invalid(format!("unhandled aggregate {percentile:?}"))
            })?;
            Expr::parametric(&format!("quantile{suffix}"), vec![Expr::float(level)], args)
        }
    };
    Ok(expr)
}

/// Limit and offset after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

fn scope_conditions(meta: &RequestMeta) -> Result<Vec<String>, QueryError> {
    if meta.project_ids.is_empty() {
        return Err(QueryError::Invalid("at least one project id is required".to_string()));
    }
    let projects = Expr::function(
        "tuple",
        meta.project_ids.iter().map(|id| Expr::int(*id)).collect(),
    );
    Ok(vec![
        format!("project_id IN {projects}"),
        format!("timestamp >= {}", datetime_literal(meta.start)),
        format!("timestamp < {}", datetime_literal(meta.end)),
    ])
}

fn where_clause(
    query: &Query,
    types: &AttributeTypes,
    meta: &RequestMeta,
    sample_rate: u64,
) -> Result<String, QueryError> {
    let mut conditions = scope_conditions(meta)?;
    if let Some(condition) = &query.condition {
        conditions.push(translate_condition(condition, types)?.to_string());
    }
    if let Some(sampler) = sample_condition(sample_rate) {
        conditions.push(sampler.to_string());
    }
    Ok(format!("WHERE {}", conditions.join(" AND ")))
}

/// Names that ORDER BY may reference as an alias rather than an expression.
fn select_aliases(query: &Query) -> Vec<&str> {
    query
        .select
        .iter()
        .map(String::as_str)
        .chain(query.aggregations.iter().map(|a| a.alias.as_str()))
        .collect()
}

/// Render a complete SnQL query. `sample_rate` of 1 disables sampling.
pub fn render_query(
    query: &Query,
    types: &AttributeTypes,
    meta: &RequestMeta,
    page: Page,
    sample_rate: u64,
) -> Result<String, QueryError> {
    if query.select.is_empty() && query.aggregations.is_empty() {
        return Err(QueryError::Invalid("nothing selected".to_string()));
    }

    let mut selected = Vec::with_capacity(query.select.len() + query.aggregations.len());
    for name in &query.select {
        let field = types.resolve(name)?;
        selected.push(match field {
            Field::Column { name, .. } => name,
            other => format!("{} AS {}", field_expr(&other), identifier(&other.name())),
        });
    }
    for aggregation in &query.aggregations {
        selected.push(format!(
            "{} AS {}",
            translate_aggregation(aggregation, types)?,
            identifier(&aggregation.alias)
        ));
    }

    let mut text = format!("MATCH ({DATASET}) SELECT {}", selected.join(", "));

    if !query.group_by.is_empty() {
        let groups = query
            .group_by
            .iter()
            .map(|name| types.resolve(name).map(|f| field_expr(&f).to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        text.push_str(&format!(" BY {}", groups.join(", ")));
    }

    text.push(' ');
    text.push_str(&where_clause(query, types, meta, sample_rate)?);

    if !query.order_by.is_empty() {
        let aliases = select_aliases(query);
        let mut orderings = Vec::with_capacity(query.order_by.len());
        for order in &query.order_by {
            let target = if aliases.contains(&order.field.as_str()) {
                identifier(&order.field)
            } else {
                field_expr(&types.resolve(&order.field)?).to_string()
            };
            let direction = match order.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            orderings.push(format!("{target} {direction}"));
        }
        text.push_str(&format!(" ORDER BY {}", orderings.join(", ")));
    }

    text.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
    Ok(text)
}

/// Pre-flight row count for the same filter, used to size the sampler.
pub fn render_count_query(
    query: &Query,
    types: &AttributeTypes,
    meta: &RequestMeta,
) -> Result<String, QueryError> {
    Ok(format!(
        "MATCH ({DATASET}) SELECT count() AS count {}",
        where_clause(query, types, meta, 1)?
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantIds {
    pub organization_id: i64,
    pub referrer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnubaRequest {
    pub query: String,
    pub dataset: &'static str,
    pub app_id: &'static str,
    pub tenant_ids: TenantIds,
    pub parent_api: String,
}

impl SnubaRequest {
    pub fn new(query: String, meta: &RequestMeta) -> Self {
        Self {
            query,
            dataset: DATASET,
            app_id: APP_ID,
            tenant_ids: TenantIds {
                organization_id: meta.organization_id,
                referrer: meta.referrer.clone(),
            },
            parent_api: meta.referrer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::query::ast::OrderBy;

    fn meta() -> RequestMeta {
        RequestMeta {
            organization_id: 1,
            project_ids: vec![42],
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            referrer: "replays.query.test".to_string(),
        }
    }

    fn translate(condition: &Condition) -> Result<String, QueryError> {
        translate_condition(condition, &AttributeTypes::replay_defaults()).map(|e| e.to_string())
    }

    #[test]
    fn test_scalar_operators() {
        assert_eq!(
            translate(&Condition::eq("replay_id", "abc")).unwrap(),
            "equals(replay_id, 'abc')"
        );
        assert_eq!(
            translate(&Condition::compare("count_errors", Operator::Gte, 3_i64)).unwrap(),
            "greaterOrEquals(count_errors, 3)"
        );
        assert_eq!(
            translate(&Condition::compare(
                "environment",
                Operator::NotIn,
                QueryValue::StrList(vec!["dev".to_string(), "test".to_string()])
            ))
            .unwrap(),
            "notIn(environment, tuple('dev', 'test'))"
        );
        assert_eq!(
            translate(&Condition::compare("user_email", Operator::NotMatch, "*@example.com"))
                .unwrap(),
            "not(match(user_email, '(?i).*@example\\\\.com'))"
        );
        assert_eq!(
            translate(&Condition::compare(
                "timestamp",
                Operator::Lt,
                "2024-01-01T12:00:00Z"
            ))
            .unwrap(),
            "less(timestamp, toDateTime('2024-01-01T12:00:00'))"
        );
    }

    #[test]
    fn test_string_literals_are_escaped() {
        assert_eq!(
            translate(&Condition::eq("user_name", "o'brien")).unwrap(),
            "equals(user_name, 'o\\'brien')"
        );
    }

    #[test]
    fn test_boolean_combinators() {
        let condition = Condition::And(vec![
            Condition::eq("environment", "prod"),
            Condition::Or(vec![
                Condition::compare("count_errors", Operator::Gt, 0_i64),
                Condition::Exists("tags[release]".to_string()),
            ]),
            Condition::eq("platform", "javascript").negate(),
        ]);
        assert_eq!(
            translate(&condition).unwrap(),
            "and(equals(environment, 'prod'), or(greater(count_errors, 0), \
             has(tags.key, 'release')), not(equals(platform, 'javascript')))"
        );

        assert!(matches!(
            translate(&Condition::And(vec![])),
            Err(QueryError::Invalid(_))
        ));
    }

    #[test]
    fn test_array_columns() {
        assert_eq!(
            translate(&Condition::eq("urls", "https://example.com/")).unwrap(),
            "has(urls, 'https://example.com/')"
        );
        assert_eq!(
            translate(&Condition::Exists("error_ids".to_string())).unwrap(),
            "notEmpty(error_ids)"
        );
    }

    #[test]
    fn test_computed_fields() {
        assert_eq!(
            translate(&Condition::compare("duration", Operator::Gt, 60_i64)).unwrap(),
            "greater(dateDiff('second', replay_start_timestamp, timestamp), 60)"
        );
        assert_eq!(
            translate(&Condition::compare("activity", Operator::Eq, 10_i64)).unwrap(),
            "equals(least(greatest(intDiv(plus(multiply(count_errors, 25), \
             multiply(count_urls, 5)), 10), 1), 10), 10)"
        );

        let err = translate(&Condition::compare("duration", Operator::Match, "1*")).unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_unknown_field() {
        let err = translate(&Condition::eq("nope", "x")).unwrap_err();
        assert!(matches!(err, QueryError::NotSupported(ref f) if f == "nope"));
    }

    #[test]
    fn test_aggregations() {
        let types = AttributeTypes::replay_defaults();
        let render = |aggregation: Aggregation| {
            translate_aggregation(&aggregation, &types).map(|e| e.to_string())
        };

        assert_eq!(
            render(Aggregation::new(AggregateFunction::Avg, "count_errors", "a")).unwrap(),
            "avg(count_errors)"
        );
        assert_eq!(
            render(Aggregation::new(AggregateFunction::P95, "duration", "p")).unwrap(),
            "quantile(0.95)(dateDiff('second', replay_start_timestamp, timestamp))"
        );
        assert_eq!(
            render(Aggregation::new(
                AggregateFunction::Quantiles(vec![0.5, 0.9]),
                "count_urls",
                "q"
            ))
            .unwrap(),
            "quantiles(0.5, 0.9)(count_urls)"
        );
        assert_eq!(
            render(
                Aggregation::new(AggregateFunction::Count, "", "viewed")
                    .filtered(Condition::eq("viewed_by_id", 7_i64))
            )
            .unwrap(),
            "countIf(equals(viewed_by_id, 7))"
        );
        assert_eq!(
            render(
                Aggregation::new(AggregateFunction::P50, "count_errors", "p")
                    .filtered(Condition::eq("environment", "prod"))
            )
            .unwrap(),
            "quantileIf(0.5)(count_errors, equals(environment, 'prod'))"
        );
        assert_eq!(
            render(Aggregation::new(AggregateFunction::GroupArray, "urls", "u")).unwrap(),
            "groupArrayArray(urls)"
        );

        assert!(matches!(
            render(Aggregation::new(AggregateFunction::Sum, "environment", "s")),
            Err(QueryError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_render_query() {
        let query = Query {
            select: vec!["replay_id".to_string()],
            aggregations: vec![Aggregation::new(
                AggregateFunction::Max,
                "timestamp",
                "finished_at",
            )],
            condition: Some(Condition::eq("tags[browser]", "Firefox")),
            group_by: vec!["replay_id".to_string()],
            order_by: vec![OrderBy::desc("finished_at"), OrderBy::asc("replay_id")],
            limit: None,
            offset: None,
        };
        let text = render_query(
            &query,
            &AttributeTypes::replay_defaults(),
            &meta(),
            Page { limit: 50, offset: 0 },
            1,
        )
        .unwrap();

        assert_eq!(
            text,
            "MATCH (replays) SELECT replay_id, max(timestamp) AS finished_at BY replay_id \
             WHERE project_id IN tuple(42) AND timestamp >= toDateTime('2024-01-01T00:00:00') \
             AND timestamp < toDateTime('2024-01-02T00:00:00') AND \
             has(arrayFilter((v, mask) -> mask, tags.value, arrayMap(k -> equals(k, 'browser'), \
             tags.key)), 'Firefox') ORDER BY finished_at DESC, replay_id ASC LIMIT 50 OFFSET 0"
        );
    }

    #[test]
    fn test_render_query_quotes_tag_alias() {
        let query = Query {
            select: vec!["tags[release]".to_string()],
            ..Default::default()
        };
        let text = render_query(
            &query,
            &AttributeTypes::replay_defaults(),
            &meta(),
            Page { limit: 1, offset: 0 },
            1,
        )
        .unwrap();
        assert!(text.contains("AS `tags[release]`"));
    }

    #[test]
    fn test_render_requires_scope_and_selection() {
        let types = AttributeTypes::replay_defaults();
        let page = Page { limit: 1, offset: 0 };

        assert!(render_query(&Query::default(), &types, &meta(), page, 1).is_err());

        let mut unscoped = meta();
        unscoped.project_ids.clear();
        let query = Query {
            select: vec!["replay_id".to_string()],
            ..Default::default()
        };
        assert!(render_query(&query, &types, &unscoped, page, 1).is_err());
    }

    #[test]
    fn test_request_body() {
        let request = SnubaRequest::new("MATCH (replays) SELECT replay_id".to_string(), &meta());
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "query": "MATCH (replays) SELECT replay_id",
                "dataset": "replays",
                "app_id": "replay-backend-web",
                "tenant_ids": {"organization_id": 1, "referrer": "replays.query.test"},
                "parent_api": "replays.query.test",
            })
        );
    }
}

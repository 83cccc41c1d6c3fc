//! Array-membership conditions, including the `tags[key]` dialect where tags
//! are stored as parallel `tags.key` / `tags.value` arrays.

use crate::query::ast::{Operator, QueryValue};
use crate::query::error::QueryError;
use crate::query::snuba::Expr;

/// Values of `tags.value` whose position in `tags.key` equals `key`.
pub fn tag_values(key: &str) -> Expr {
    let mask = Expr::function(
        "arrayMap",
        vec![
            Expr::lambda(
                &["k"],
                Expr::function("equals", vec![Expr::column("k"), Expr::string(key)]),
            ),
            Expr::column("tags.key"),
        ],
    );
    Expr::function(
        "arrayFilter",
        vec![
            Expr::lambda(&["v", "mask"], Expr::column("mask")),
            Expr::column("tags.value"),
            mask,
        ],
    )
}

/// Case-insensitive regex for a user wildcard pattern. Anchors are dropped
/// since `match` already searches for a substring.
pub fn wildcard_pattern(pattern: &str) -> String {
    let trimmed = pattern.strip_prefix('^').unwrap_or(pattern);
    let trimmed = trimmed.strip_suffix('$').unwrap_or(trimmed);
    let escaped: Vec<String> = trimmed.split('*').map(regex::escape).collect();
    format!("(?i){}", escaped.join(".*"))
}

fn string_array(values: &[String]) -> Expr {
    Expr::Array(values.iter().map(|v| Expr::string(v)).collect())
}

/// `array op value` for a string array expression. `=` means the array
/// contains the value, `in` means it contains any of them.
pub fn array_condition(array: Expr, op: Operator, value: &QueryValue) -> Result<Expr, QueryError> {
    let positive = match (op, value) {
        (Operator::Eq | Operator::Neq, QueryValue::Str(s)) => {
            Expr::function("has", vec![array, Expr::string(s)])
        }
        (Operator::In | Operator::NotIn, QueryValue::StrList(values)) => {
            Expr::function("hasAny", vec![array, string_array(values)])
        }
        (Operator::Match | Operator::NotMatch, QueryValue::Str(pattern)) => Expr::function(
            "arrayExists",
            vec![
                Expr::lambda(
                    &["v"],
                    Expr::function(
                        "match",
                        vec![Expr::column("v"), Expr::string(&wildcard_pattern(pattern))],
                    ),
                ),
                array,
            ],
        ),
        _ => {
            return Err(QueryError::Invalid(format!(
                "operator {op} cannot compare an array with a {}",
                value.kind()
            )))
        }
    };

    Ok(if op.is_negated() {
        Expr::function("not", vec![positive])
    } else {
        positive
    })
}

pub fn tag_condition(key: &str, op: Operator, value: &QueryValue) -> Result<Expr, QueryError> {
    array_condition(tag_values(key), op, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_pattern() {
        assert_eq!(wildcard_pattern("^foo*bar$"), "(?i)foo.*bar");
        assert_eq!(wildcard_pattern("a.b"), "(?i)a\\.b");
        assert_eq!(wildcard_pattern("*"), "(?i).*");
    }

    #[test]
    fn test_tag_equality() {
        let expr = tag_condition("browser", Operator::Eq, &"Chrome".into()).unwrap();
        assert_eq!(
            expr.to_string(),
            "has(arrayFilter((v, mask) -> mask, tags.value, \
             arrayMap(k -> equals(k, 'browser'), tags.key)), 'Chrome')"
        );
    }

    #[test]
    fn test_tag_membership_and_negation() {
        let values = QueryValue::StrList(vec!["1.0".to_string(), "2.0".to_string()]);
        let expr = tag_condition("release", Operator::NotIn, &values).unwrap();
        assert_eq!(
            expr.to_string(),
            "not(hasAny(arrayFilter((v, mask) -> mask, tags.value, \
             arrayMap(k -> equals(k, 'release'), tags.key)), ['1.0', '2.0']))"
        );
    }

    #[test]
    fn test_tag_wildcard() {
        let expr = tag_condition("url", Operator::Match, &"^*checkout$".into()).unwrap();
        assert_eq!(
            expr.to_string(),
            "arrayExists(v -> match(v, '(?i).*checkout'), arrayFilter((v, mask) -> mask, \
             tags.value, arrayMap(k -> equals(k, 'url'), tags.key)))"
        );
    }
}

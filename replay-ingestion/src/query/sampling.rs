use serde_json::{Map, Value};

use crate::query::error::QueryError;
use crate::query::snuba::Expr;

/// Keep one row in `rate` so that a result of `count` rows stays under `cap`.
pub fn sample_rate(count: u64, cap: u64) -> u64 {
    if cap == 0 || count <= cap {
        1
    } else {
        count / cap + 1
    }
}

/// Hash-modulo sampler on `replay_id`. Every segment of a replay lands on the
/// same side, and the same data always yields the same sample.
pub fn sample_condition(rate: u64) -> Option<Expr> {
    if rate <= 1 {
        return None;
    }
    let hashed = Expr::function(
        "cityHash64",
        vec![Expr::function("toString", vec![Expr::column("replay_id")])],
    );
    Some(Expr::function(
        "equals",
        vec![
            Expr::function("modulo", vec![hashed, Expr::uint(rate)]),
            Expr::int(0),
        ],
    ))
}

/// Read the `count` column of a pre-flight count response.
pub fn read_count(rows: &[Map<String, Value>]) -> Result<u64, QueryError> {
    let value = rows
        .first()
        .and_then(|row| row.get("count"))
        .ok_or_else(|| QueryError::InvalidResponse("count query returned no rows".to_string()))?;
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| QueryError::InvalidResponse(format!("invalid row count {value}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sample_rate() {
        assert_eq!(sample_rate(0, 1_000_000), 1);
        assert_eq!(sample_rate(1_000_000, 1_000_000), 1);
        assert_eq!(sample_rate(1_000_001, 1_000_000), 2);
        assert_eq!(sample_rate(2_500_000, 1_000_000), 3);
        assert_eq!(sample_rate(2_500_000, 0), 1);
    }

    #[test]
    fn test_sample_condition() {
        assert!(sample_condition(1).is_none());
        assert_eq!(
            sample_condition(3).unwrap().to_string(),
            "equals(modulo(cityHash64(toString(replay_id)), 3), 0)"
        );
    }

    #[test]
    fn test_read_count() {
        let rows = vec![json!({"count": 2_500_000}).as_object().unwrap().clone()];
        assert_eq!(read_count(&rows).unwrap(), 2_500_000);

        let quoted = vec![json!({"count": "17"}).as_object().unwrap().clone()];
        assert_eq!(read_count(&quoted).unwrap(), 17);

        assert!(read_count(&[]).is_err());
    }
}

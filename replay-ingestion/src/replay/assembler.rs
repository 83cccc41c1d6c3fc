//! Turns backend rows into [`Replay`]s.
//!
//! Snuba rows are already aggregated per replay. EAP rows are one per segment
//! and go through [`merge_segment_rows`] first so both paths share
//! [`as_replay`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::replay::model::{activity_score, Device, NameVersion, Replay, ReplayUser};

/// Columns summed across segments.
const SUMMED_COLUMNS: &[&str] = &[
    "count_errors",
    "count_warnings",
    "count_infos",
    "count_dead_clicks",
    "count_rage_clicks",
    "count_urls",
    "viewed_by_me",
];

/// Array columns whose merged values keep their first occurrence only.
const UNIQUE_ARRAY_COLUMNS: &[&str] = &["error_ids", "trace_ids", "releases"];

fn string_field(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|x| x as i64)),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn int_field(row: &Map<String, Value>, key: &str) -> i64 {
    row.get(key).and_then(int_value).unwrap_or_default()
}

fn bool_field(row: &Map<String, Value>, key: &str) -> bool {
    match row.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(other) => int_value(other).is_some_and(|i| i != 0),
        None => false,
    }
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn datetime_field(row: &Map<String, Value>, key: &str) -> DateTime<Utc> {
    row.get(key).and_then(parse_datetime).unwrap_or_default()
}

/// Positive ids only, sorted and deduplicated. Rows without a viewer carry 0.
fn id_array(row: &Map<String, Value>, key: &str) -> Vec<i64> {
    let Some(Value::Array(items)) = row.get(key) else {
        return Vec::new();
    };
    let mut ids: Vec<i64> = items.iter().filter_map(int_value).filter(|id| *id > 0).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn string_array(row: &Map<String, Value>, key: &str) -> Vec<String> {
    match row.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Pair up the parallel key and value arrays, collapsing repeats.
fn collect_tags(keys: &[Value], values: &[Value]) -> BTreeMap<String, BTreeSet<String>> {
    let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (key, value) in keys.iter().zip(values) {
        let (Value::String(key), Value::String(value)) = (key, value) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        tags.entry(key.clone()).or_default().insert(value.clone());
    }
    tags
}

fn tags_field(row: &Map<String, Value>) -> BTreeMap<String, BTreeSet<String>> {
    match (row.get("tag_keys"), row.get("tag_values")) {
        (Some(Value::Array(keys)), Some(Value::Array(values))) => collect_tags(keys, values),
        _ => BTreeMap::new(),
    }
}

fn first_non_empty(candidates: &[&str]) -> String {
    candidates
        .iter()
        .find(|c| !c.is_empty())
        .map(|c| c.to_string())
        .unwrap_or_default()
}

/// Build a [`Replay`] from an aggregate row.
///
/// An archived replay keeps only its id: values aggregated from segments
/// ingested before the archive must not leak out.
pub fn as_replay(row: &Map<String, Value>) -> Replay {
    let id = string_field(row, "replay_id");
    if bool_field(row, "is_archived") {
        return Replay::archived(id);
    }

    let user = {
        let id = string_field(row, "user_id");
        let username = string_field(row, "user_name");
        let email = string_field(row, "user_email");
        let ip = string_field(row, "ip_address_v4");
        let display_name =
            first_non_empty(&[username.as_str(), email.as_str(), id.as_str(), ip.as_str()]);
        ReplayUser {
            id,
            username,
            email,
            ip,
            display_name,
        }
    };

    let started_at = datetime_field(row, "started_at");
    let finished_at = datetime_field(row, "finished_at");
    let urls = string_array(row, "urls");
    let count_errors = int_field(row, "count_errors");
    let count_urls = match int_field(row, "count_urls") {
        0 => i64::try_from(urls.len()).unwrap_or(i64::MAX),
        n => n,
    };

    Replay {
        id,
        project_id: int_field(row, "project_id"),
        trace_ids: string_array(row, "trace_ids"),
        error_ids: string_array(row, "error_ids"),
        environment: string_field(row, "environment"),
        tags: tags_field(row),
        user,
        sdk: NameVersion {
            name: string_field(row, "sdk_name"),
            version: string_field(row, "sdk_version"),
        },
        os: NameVersion {
            name: string_field(row, "os_name"),
            version: string_field(row, "os_version"),
        },
        browser: NameVersion {
            name: string_field(row, "browser_name"),
            version: string_field(row, "browser_version"),
        },
        device: Device {
            name: string_field(row, "device_name"),
            brand: string_field(row, "device_brand"),
            family: string_field(row, "device_family"),
            model: string_field(row, "device_model"),
        },
        urls,
        started_at,
        finished_at,
        duration: (finished_at - started_at).num_seconds().max(0),
        count_errors,
        count_warnings: int_field(row, "count_warnings"),
        count_infos: int_field(row, "count_infos"),
        count_dead_clicks: int_field(row, "count_dead_clicks"),
        count_rage_clicks: int_field(row, "count_rage_clicks"),
        count_urls,
        count_segments: int_field(row, "count_segments"),
        activity: activity_score(count_errors, count_urls),
        is_archived: false,
        releases: string_array(row, "releases"),
        platform: string_field(row, "platform"),
        dist: string_field(row, "dist"),
        replay_type: string_field(row, "replay_type"),
        viewed_by_ids: id_array(row, "viewed_by_ids"),
        has_viewed: int_field(row, "viewed_by_me") > 0,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn extend_array(
    target: &mut Map<String, Value>,
    key: &str,
    value: Option<&Value>,
    unique: bool,
) {
    let Some(Value::Array(items)) = value else {
        return;
    };
    let entry = target
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(existing) = entry {
        for item in items {
            if !unique || !existing.contains(item) {
                existing.push(item.clone());
            }
        }
    }
}

fn merge_group(segments: &[&Map<String, Value>]) -> Map<String, Value> {
    let mut merged = Map::new();
    let mut started_at: Option<DateTime<Utc>> = None;
    let mut finished_at: Option<DateTime<Utc>> = None;
    let mut sums: HashMap<&str, i64> = HashMap::new();
    let mut archived = false;

    for segment in segments {
        if let Some(at) = segment.get("timestamp").and_then(parse_datetime) {
            started_at = Some(started_at.map_or(at, |s| s.min(at)));
            finished_at = Some(finished_at.map_or(at, |f| f.max(at)));
        }
        archived |= bool_field(segment, "is_archived");

        for (key, value) in segment.iter() {
            let key = key.as_str();
            if let Some(column) = SUMMED_COLUMNS.iter().find(|c| **c == key) {
                *sums.entry(*column).or_default() += int_value(value).unwrap_or_default();
                continue;
            }
            match key {
                "timestamp" | "segment_id" | "is_archived" => {}
                "urls" => extend_array(&mut merged, "urls", Some(value), false),
                "tags.key" => extend_array(&mut merged, "tag_keys", Some(value), false),
                "tags.value" => extend_array(&mut merged, "tag_values", Some(value), false),
                "viewed_by_id" => {
                    if int_value(value).is_some_and(|id| id > 0) {
                        let viewer = Value::Array(vec![value.clone()]);
                        extend_array(&mut merged, "viewed_by_ids", Some(&viewer), true);
                    }
                }
                "release" => {
                    if !is_empty(value) {
                        let release = Value::Array(vec![value.clone()]);
                        extend_array(&mut merged, "releases", Some(&release), true);
                    }
                }
                _ if UNIQUE_ARRAY_COLUMNS.contains(&key) => {
                    extend_array(&mut merged, key, Some(value), true)
                }
                _ => {
                    let current = merged.get(key);
                    if current.map_or(true, is_empty) && !is_empty(value) {
                        merged.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
    }

    for (column, total) in sums {
        merged.insert(column.to_string(), Value::from(total));
    }
    if let Some(at) = started_at {
        merged.insert(
            "started_at".to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }
    if let Some(at) = finished_at {
        merged.insert(
            "finished_at".to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }
    merged.insert("is_archived".to_string(), Value::Bool(archived));
    merged.insert("count_segments".to_string(), Value::from(segments.len()));
    merged
}

fn segment_order(a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
    int_field(a, "segment_id").cmp(&int_field(b, "segment_id"))
}

/// Fold per-segment rows into one aggregate row per replay, in the order
/// each replay first appears.
pub fn merge_segment_rows(rows: &[Map<String, Value>]) -> Vec<Map<String, Value>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Map<String, Value>>> = HashMap::new();
    for row in rows {
        let id = string_field(row, "replay_id");
        if id.is_empty() {
            continue;
        }
        let group = groups.entry(id.clone()).or_default();
        if group.is_empty() {
            order.push(id);
        }
        group.push(row);
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .map(|mut segments| {
            segments.sort_by(|a, b| segment_order(a, b));
            merge_group(&segments)
        })
        .collect()
}

/// [`merge_segment_rows`] followed by [`as_replay`].
pub fn assemble_segments(rows: &[Map<String, Value>]) -> Vec<Replay> {
    merge_segment_rows(rows).iter().map(as_replay).collect()
}

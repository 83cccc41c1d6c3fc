use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::query::snuba::Page;
use crate::query::{
    AggregateFunction, Aggregation, Backend, Condition, Operator, OrderBy, Query, QueryError,
    QueryRunner, QuerySettings, QueryValue, RequestMeta,
};
use crate::replay::assembler::{as_replay, merge_segment_rows};
use crate::replay::model::Replay;

const DEFAULT_SEGMENT_PAGE_SIZE: usize = 1000;

const ANY_COLUMNS: &[&str] = &[
    "environment",
    "platform",
    "dist",
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

const COUNT_COLUMNS: &[&str] = &[
    "count_errors",
    "count_warnings",
    "count_infos",
    "count_dead_clicks",
    "count_rage_clicks",
    "count_urls",
];

/// Per-segment arrays that EAP returns unaggregated.
const SEGMENT_ARRAY_COLUMNS: &[&str] =
    &["urls", "error_ids", "trace_ids", "tags.key", "tags.value"];

/// A request for a page of replays.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayQuery {
    pub filter: Option<Condition>,
    /// User whose views set `has_viewed`.
    pub viewer_id: i64,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ReplayQuery {
    pub fn new(viewer_id: i64) -> Self {
        Self {
            filter: None,
            viewer_id,
            order_by: vec![OrderBy::desc("started_at")],
            limit: None,
            offset: None,
        }
    }

    pub fn with_filter(mut self, filter: Condition) -> Self {
        self.filter = Some(filter);
        self
    }

    /// One row per replay, aggregated over its segments.
    pub fn aggregate_query(&self) -> Query {
        let mut aggregations = vec![
            Aggregation::new(AggregateFunction::Any, "project_id", "project_id"),
            Aggregation::new(AggregateFunction::Min, "timestamp", "started_at"),
            Aggregation::new(AggregateFunction::Max, "timestamp", "finished_at"),
            Aggregation::new(AggregateFunction::GroupArray, "urls", "urls"),
            Aggregation::new(AggregateFunction::GroupUniqArray, "error_ids", "error_ids"),
            Aggregation::new(AggregateFunction::GroupUniqArray, "trace_ids", "trace_ids"),
            Aggregation::new(AggregateFunction::GroupUniqArray, "release", "releases"),
            Aggregation::new(AggregateFunction::GroupArray, "tags.key", "tag_keys"),
            Aggregation::new(AggregateFunction::GroupArray, "tags.value", "tag_values"),
            Aggregation::new(AggregateFunction::Count, "", "count_segments"),
            Aggregation::new(AggregateFunction::Max, "is_archived", "is_archived"),
            Aggregation::new(AggregateFunction::GroupUniqArray, "viewed_by_id", "viewed_by_ids"),
            Aggregation::new(AggregateFunction::Count, "", "viewed_by_me")
                .filtered(Condition::eq("viewed_by_id", self.viewer_id)),
        ];
        aggregations.extend(
            ANY_COLUMNS
                .iter()
                .map(|c| Aggregation::new(AggregateFunction::Any, c, c)),
        );
        aggregations.extend(
            COUNT_COLUMNS
                .iter()
                .map(|c| Aggregation::new(AggregateFunction::Sum, c, c)),
        );

        Query {
            select: vec!["replay_id".to_string()],
            aggregations,
            condition: self.filter.clone(),
            group_by: vec!["replay_id".to_string()],
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }

    /// Phase one on EAP: the requested page of replay ids, grouped and sorted
    /// the same way as [`Self::aggregate_query`].
    pub fn replay_ids_query(&self) -> Query {
        let mut aggregations = vec![
            Aggregation::new(AggregateFunction::Max, "project_id", "project_id"),
            Aggregation::new(AggregateFunction::Min, "timestamp", "started_at"),
            Aggregation::new(AggregateFunction::Max, "timestamp", "finished_at"),
            Aggregation::new(AggregateFunction::Count, "", "count_segments"),
        ];
        aggregations.extend(
            COUNT_COLUMNS
                .iter()
                .map(|c| Aggregation::new(AggregateFunction::Sum, c, c)),
        );

        Query {
            select: vec!["replay_id".to_string()],
            aggregations,
            condition: self.filter.clone(),
            group_by: vec!["replay_id".to_string()],
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }

    /// Phase two on EAP: one row per segment of the given replays, for
    /// backends that cannot aggregate arrays. The filter still applies so the
    /// merged segments match what [`Self::aggregate_query`] aggregates.
    pub fn segment_query(&self, replay_ids: &[String], page: Page) -> Query {
        let select: Vec<String> = ["replay_id", "project_id", "segment_id", "timestamp"]
            .iter()
            .chain(ANY_COLUMNS)
            .chain(COUNT_COLUMNS)
            .chain(SEGMENT_ARRAY_COLUMNS)
            .chain(&["release", "is_archived", "viewed_by_id"])
            .map(|c| c.to_string())
            .collect();

        let by_id = Condition::compare(
            "replay_id",
            Operator::In,
            QueryValue::StrList(replay_ids.to_vec()),
        );
        let condition = match &self.filter {
            Some(filter) => Condition::And(vec![by_id, filter.clone()]),
            None => by_id,
        };

        Query {
            select,
            aggregations: Vec::new(),
            condition: Some(condition),
            group_by: Vec::new(),
            order_by: vec![OrderBy::asc("replay_id"), OrderBy::asc("segment_id")],
            limit: Some(page.limit),
            offset: Some(page.offset),
        }
    }
}

/// Fetches replays through whichever backend the settings select.
pub struct ReplayQueryBuilder {
    runner: Arc<QueryRunner>,
    segment_page_size: usize,
}

impl ReplayQueryBuilder {
    pub fn new(runner: Arc<QueryRunner>) -> Self {
        Self {
            runner,
            segment_page_size: DEFAULT_SEGMENT_PAGE_SIZE,
        }
    }

    /// Builder over HTTP clients for the configured backends.
    pub fn from_config(config: &Config) -> Result<Self, QueryError> {
        let runner = QueryRunner::from_config(config)?;
        Ok(Self::new(Arc::new(runner)).with_segment_page_size(config.query_segment_page_size))
    }

    /// Rows per request when reading segments from EAP.
    pub fn with_segment_page_size(mut self, segment_page_size: usize) -> Self {
        self.segment_page_size = segment_page_size.max(1);
        self
    }

    pub async fn fetch(
        &self,
        request: &ReplayQuery,
        settings: &QuerySettings,
        meta: &RequestMeta,
    ) -> Result<Vec<Replay>, QueryError> {
        let replays = match settings.backend {
            Backend::Snuba => {
                let result = self
                    .runner
                    .query(&request.aggregate_query(), settings, meta)
                    .await?;
                result.data.iter().map(as_replay).collect::<Vec<_>>()
            }
            Backend::Eap => self.fetch_from_segments(request, settings, meta).await?,
        };
        debug!(count = replays.len(), "Assembled replays");
        Ok(replays)
    }

    async fn fetch_from_segments(
        &self,
        request: &ReplayQuery,
        settings: &QuerySettings,
        meta: &RequestMeta,
    ) -> Result<Vec<Replay>, QueryError> {
        let page = self
            .runner
            .query(&request.replay_ids_query(), settings, meta)
            .await?;
        let replay_ids: Vec<String> = page
            .data
            .iter()
            .filter_map(|row| row.get("replay_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if replay_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        let mut offset = 0;
        loop {
            let query = request.segment_query(
                &replay_ids,
                Page {
                    limit: self.segment_page_size,
                    offset,
                },
            );
            let rows = self.runner.query(&query, settings, meta).await?.data;
            let fetched = rows.len();
            segments.extend(rows);
            if fetched < self.segment_page_size {
                break;
            }
            offset += fetched;
        }
        debug!(
            replays = replay_ids.len(),
            segments = segments.len(),
            "Fetched replay segments"
        );

        let mut merged: HashMap<String, Map<String, Value>> = merge_segment_rows(&segments)
            .into_iter()
            .filter_map(|row| {
                let id = row.get("replay_id").and_then(Value::as_str)?.to_string();
                Some((id, row))
            })
            .collect();

        let replays = replay_ids
            .iter()
            .filter_map(|id| merged.remove(id))
            .map(|row| {
                let mut replay = as_replay(&row);
                if !replay.is_archived {
                    replay.has_viewed = replay.viewed_by_ids.contains(&request.viewer_id);
                }
                replay
            })
            .collect();
        Ok(replays)
    }
}

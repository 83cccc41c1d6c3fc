//! Portable replay queries, translated per request into SnQL or an EAP
//! trace-item table request.
//!
//! Translation fails before any request is sent when a field is unknown, an
//! operator is outside what a field supports, or a value has the wrong type.

pub mod ast;
pub mod backend;
pub mod eap;
pub mod error;
pub mod fields;
pub mod normalize;
pub mod sampling;
pub mod snuba;
pub mod tags;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics_consts::{QUERY_DURATION_MS, QUERY_REQUESTS, QUERY_SAMPLE_RATE};
use crate::query::backend::{EapClient, HttpEapClient, HttpSnubaClient, SnubaClient};
use crate::query::snuba::{Page, SnubaRequest};

pub use ast::{
    AggregateFunction, Aggregation, Condition, Direction, Operator, OrderBy, Query, QueryValue,
    RequestMeta,
};
pub use error::QueryError;
pub use fields::{AttributeType, AttributeTypes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Snuba,
    Eap,
}

impl Backend {
    fn as_str(self) -> &'static str {
        match self {
            Backend::Snuba => "snuba",
            Backend::Eap => "eap",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub backend: Backend,
    pub default_limit: usize,
    pub default_offset: usize,
    /// Largest row count a query may scan before it is sampled.
    pub sample_row_cap: u64,
    /// Run a pre-flight count and sample when it exceeds `sample_row_cap`.
    /// Snuba only.
    pub sample: bool,
    pub attribute_types: AttributeTypes,
}

impl QuerySettings {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            default_limit: 50,
            default_offset: 0,
            sample_row_cap: 1_000_000,
            sample: false,
            attribute_types: AttributeTypes::replay_defaults(),
        }
    }

    pub fn from_config(config: &Config, backend: Backend) -> Self {
        Self {
            default_limit: config.query_default_limit,
            sample_row_cap: config.query_sample_row_cap,
            sample: config.query_sample && backend == Backend::Snuba,
            ..Self::new(backend)
        }
    }

    pub fn page(&self, query: &Query) -> Page {
        Page {
            limit: query.limit.unwrap_or(self.default_limit),
            offset: query.offset.unwrap_or(self.default_offset),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<Map<String, Value>>,
}

pub struct QueryRunner {
    snuba: Arc<dyn SnubaClient>,
    eap: Arc<dyn EapClient>,
}

impl QueryRunner {
    pub fn new(snuba: Arc<dyn SnubaClient>, eap: Arc<dyn EapClient>) -> Self {
        Self { snuba, eap }
    }

    pub fn from_config(config: &Config) -> Result<Self, QueryError> {
        Ok(Self::new(
            Arc::new(HttpSnubaClient::new(&config.snuba_url, config.query_timeout())?),
            Arc::new(HttpEapClient::new(&config.eap_url, config.query_timeout())?),
        ))
    }

    pub async fn query(
        &self,
        query: &Query,
        settings: &QuerySettings,
        meta: &RequestMeta,
    ) -> Result<QueryResult, QueryError> {
        let backend = settings.backend.as_str();
        let start = Instant::now();
        let outcome = match settings.backend {
            Backend::Snuba => self.query_snuba(query, settings, meta).await,
            Backend::Eap => self.query_eap(query, settings, meta).await,
        };

        let status = match &outcome {
            Ok(_) => "ok",
            Err(e) if e.is_client_error() => "invalid",
            Err(_) => "error",
        };
        metrics::counter!(QUERY_REQUESTS, "backend" => backend, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_MS, "backend" => backend)
            .record(start.elapsed().as_millis() as f64);
        outcome
    }

    async fn query_snuba(
        &self,
        query: &Query,
        settings: &QuerySettings,
        meta: &RequestMeta,
    ) -> Result<QueryResult, QueryError> {
        let types = &settings.attribute_types;
        let page = settings.page(query);
        let unsampled = snuba::render_query(query, types, meta, page, 1)?;

        let rate = if settings.sample {
            let count_query = snuba::render_count_query(query, types, meta)?;
            let rows = self
                .snuba
                .execute(&SnubaRequest::new(count_query, meta))
                .await?;
            let count = sampling::read_count(&rows)?;
            let rate = sampling::sample_rate(count, settings.sample_row_cap);
            metrics::histogram!(QUERY_SAMPLE_RATE).record(rate as f64);
            if rate > 1 {
                info!(
                    count,
                    rate,
                    referrer = %meta.referrer,
                    "Sampling replay query"
                );
            }
            rate
        } else {
            1
        };

        let text = if rate > 1 {
            snuba::render_query(query, types, meta, page, rate)?
        } else {
            unsampled
        };
        debug!(query = %text, "Running snuba query");

        let data = self.snuba.execute(&SnubaRequest::new(text, meta)).await?;
        Ok(QueryResult { data })
    }

    async fn query_eap(
        &self,
        query: &Query,
        settings: &QuerySettings,
        meta: &RequestMeta,
    ) -> Result<QueryResult, QueryError> {
        let types = &settings.attribute_types;
        let request = eap::build_request(query, types, meta, settings.page(query))?;
        let labels = normalize::label_types(query, types)?;

        let response = self.eap.table(&request).await?;
        let data = normalize::normalize_rows(response.into_rows(), &labels)?;
        Ok(QueryResult { data })
    }
}

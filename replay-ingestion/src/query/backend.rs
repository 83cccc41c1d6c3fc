use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::query::eap::{TraceItemTableRequest, TraceItemTableResponse};
use crate::query::error::QueryError;
use crate::query::snuba::SnubaRequest;

const USER_AGENT: &str = "PostHog Replay Query";
const SNUBA_PATH: &str = "replays/snql";
const EAP_TABLE_PATH: &str = "rpc/EndpointTraceItemTable/v1";

#[async_trait]
pub trait SnubaClient: Send + Sync {
    async fn execute(&self, request: &SnubaRequest) -> Result<Vec<Map<String, Value>>, QueryError>;
}

#[async_trait]
pub trait EapClient: Send + Sync {
    async fn table(
        &self,
        request: &TraceItemTableRequest,
    ) -> Result<TraceItemTableResponse, QueryError>;
}

#[derive(Deserialize)]
struct SnubaResponse {
    #[serde(default)]
    data: Vec<Map<String, Value>>,
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, QueryError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

async fn read_body(response: reqwest::Response) -> Result<String, QueryError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(QueryError::BackendStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

pub struct HttpSnubaClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSnubaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: endpoint(base_url, SNUBA_PATH),
        })
    }
}

#[async_trait]
impl SnubaClient for HttpSnubaClient {
    async fn execute(&self, request: &SnubaRequest) -> Result<Vec<Map<String, Value>>, QueryError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let body = read_body(response).await?;
        let parsed: SnubaResponse = serde_json::from_str(&body)
            .map_err(|e| QueryError::InvalidResponse(format!("snuba: {e}")))?;
        Ok(parsed.data)
    }
}

pub struct HttpEapClient {
    client: reqwest::Client,
    url: String,
}

impl HttpEapClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: endpoint(base_url, EAP_TABLE_PATH),
        })
    }
}

#[async_trait]
impl EapClient for HttpEapClient {
    async fn table(
        &self,
        request: &TraceItemTableRequest,
    ) -> Result<TraceItemTableResponse, QueryError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let body = read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| QueryError::InvalidResponse(format!("eap: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("http://snuba:1218/", SNUBA_PATH),
            "http://snuba:1218/replays/snql"
        );
        assert_eq!(
            endpoint("http://snuba:1218", EAP_TABLE_PATH),
            "http://snuba:1218/rpc/EndpointTraceItemTable/v1"
        );
    }
}

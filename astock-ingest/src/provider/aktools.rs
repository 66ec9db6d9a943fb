//! AKTools HTTP adapter.
//!
//! AKTools exposes every akshare function as
//! `GET {base}/api/public/{function}?{params}` returning a JSON array of
//! records (a serialized DataFrame).
//!
//! # Failure mapping
//! - 2xx with `[]` → empty result
//! - 408, 429, 5xx, connect/timeout errors, undecodable bodies → transient
//! - any other 4xx, malformed request URLs → permanent

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use astock_common::ProviderConfig;

use crate::pipeline::{
    DataSource, FetchError, IdentifierSource, RawRecord, RawResult, SourceError, WorkUnit,
};

/// Function listing every A-share code and name.
pub const CODE_LIST_ENDPOINT: &str = "stock_info_a_code_name";

// ============================================================================
// Client
// ============================================================================

/// Thin client for an AKTools server.
#[derive(Debug, Clone)]
pub struct AkToolsClient {
    client: reqwest::Client,
    base_url: String,
}

impl AkToolsClient {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client for AKTools")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call one akshare function and return its records.
    pub async fn call(&self, endpoint: &str, query: &[(String, String)]) -> Result<RawResult, FetchError> {
        let url = format!("{}/api/public/{}", self.base_url, endpoint);
        debug!(endpoint, ?query, "Calling AKTools");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if let Some(err) = status_error(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(match err {
                FetchError::Transient(msg) => FetchError::Transient(format!("{}: {}", msg, truncate(&body))),
                FetchError::Permanent(msg) => FetchError::Permanent(format!("{}: {}", msg, truncate(&body))),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("undecodable response from {}: {}", endpoint, e)))?;
        parse_records(body).map(RawResult::from_records)
    }
}

fn request_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Permanent(format!("invalid request: {}", err))
    } else {
        FetchError::Transient(format!("request failed: {}", err))
    }
}

/// Classify a non-success status. `None` means success.
pub fn status_error(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Some(FetchError::Transient(format!("HTTP {}", status)))
    } else {
        Some(FetchError::Permanent(format!("HTTP {}", status)))
    }
}

fn parse_records(body: Value) -> Result<Vec<RawRecord>, FetchError> {
    let Value::Array(items) = body else {
        return Err(FetchError::Transient("response is not a JSON array".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            other => Err(FetchError::Transient(format!("record is not an object: {}", other))),
        })
        .collect()
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ============================================================================
// Request Templates
// ============================================================================

/// How one query parameter is filled from a work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// The unit id as-is (`sh600000`, `20230630`, `SH`)
    UnitId,
    /// The unit id without its exchange prefix (`600000`)
    UnitCode,
    /// Start of the unit's range as `YYYYMMDD`; omitted without a range
    RangeStart,
    /// End of the unit's range as `YYYYMMDD`; omitted without a range
    RangeEnd,
    /// Map the unit id through a lookup table, e.g. `SH` → `上证`
    Lookup(Vec<(&'static str, &'static str)>),
    Fixed(&'static str),
}

/// Endpoint and parameter template of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub endpoint: &'static str,
    pub params: Vec<(&'static str, ParamValue)>,
}

impl RequestSpec {
    pub fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &'static str, value: ParamValue) -> Self {
        self.params.push((name, value));
        self
    }

    /// Query string pairs for `unit`.
    pub fn query(&self, unit: &WorkUnit) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    ParamValue::UnitId => unit.id.clone(),
                    ParamValue::UnitCode => strip_exchange(&unit.id).to_string(),
                    ParamValue::RangeStart => unit.range?.start().format("%Y%m%d").to_string(),
                    ParamValue::RangeEnd => unit.range?.end().format("%Y%m%d").to_string(),
                    ParamValue::Lookup(table) => table
                        .iter()
                        .find(|(key, _)| *key == unit.id)
                        .map(|(_, v)| v.to_string())
                        .unwrap_or_else(|| unit.id.clone()),
                    ParamValue::Fixed(v) => v.to_string(),
                };
                Some((name.to_string(), value))
            })
            .collect()
    }
}

fn strip_exchange(id: &str) -> &str {
    id.strip_prefix("sh")
        .or_else(|| id.strip_prefix("sz"))
        .unwrap_or(id)
}

// ============================================================================
// Pipeline Adapters
// ============================================================================

/// [`DataSource`] bound to one dataset's request template.
pub struct AkToolsSource {
    client: Arc<AkToolsClient>,
    request: RequestSpec,
}

impl AkToolsSource {
    pub fn new(client: Arc<AkToolsClient>, request: RequestSpec) -> Self {
        Self { client, request }
    }
}

#[async_trait]
impl DataSource for AkToolsSource {
    async fn fetch(&self, unit: &WorkUnit) -> Result<RawResult, FetchError> {
        self.client
            .call(self.request.endpoint, &self.request.query(unit))
            .await
    }
}

/// A-share code list from `stock_info_a_code_name`.
pub struct AkToolsIdentifiers {
    client: Arc<AkToolsClient>,
}

impl AkToolsIdentifiers {
    pub fn new(client: Arc<AkToolsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentifierSource for AkToolsIdentifiers {
    async fn list_identifiers(&self) -> Result<Vec<String>, SourceError> {
        let records = match self.client.call(CODE_LIST_ENDPOINT, &[]).await {
            Ok(RawResult::Records(records)) => records,
            Ok(RawResult::Empty) => Vec::new(),
            Err(e) => return Err(SourceError(e.to_string())),
        };

        Ok(records
            .iter()
            .filter_map(|record| match record.get("code")? {
                Value::String(code) => Some(code.clone()),
                Value::Number(n) => n.as_u64().map(|n| format!("{:06}", n)),
                _ => None,
            })
            .collect())
    }
}

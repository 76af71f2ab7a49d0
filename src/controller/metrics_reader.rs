//! Metrics backend integration for iteration results
//!
//! The metrics pipeline buckets raw exposure/conversion events per iteration
//! elsewhere; this module only reads those counts back.
//!
//! - `MetricsReader` trait for abstraction
//! - `HttpMetricsReader` queries the metrics service over HTTP
//! - `NoOpMetricsReader` when no backend is configured (every iteration has no data)
//! - `MockMetricsReader` for tests

use crate::model::VariantCounts;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics backend unreachable: {0}")]
    Unreachable(String),

    #[error("Metrics request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Metrics backend returned invalid response: {0}")]
    InvalidResponse(String),
}

/// Source of already-bucketed per-variant counts
///
/// An empty vector means the backend knows nothing about the iteration.
#[async_trait]
pub trait MetricsReader: Send + Sync {
    async fn fetch_counts(&self, iteration_id: Uuid) -> Result<Vec<VariantCounts>, MetricsError>;
}

/// Reader used when no metrics backend address is configured
pub struct NoOpMetricsReader;

#[async_trait]
impl MetricsReader for NoOpMetricsReader {
    async fn fetch_counts(&self, _iteration_id: Uuid) -> Result<Vec<VariantCounts>, MetricsError> {
        Ok(vec![])
    }
}

/// Response envelope of `GET /api/v1/iterations/{id}/counts`
#[derive(Debug, Deserialize)]
struct CountsResponse {
    status: String,
    #[serde(default)]
    data: Option<CountsData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountsData {
    #[serde(default)]
    variants: Vec<VariantCounts>,
}

/// Parse a counts response body
fn parse_counts_response(body: &str) -> Result<Vec<VariantCounts>, MetricsError> {
    let response: CountsResponse = serde_json::from_str(body)
        .map_err(|e| MetricsError::InvalidResponse(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(MetricsError::InvalidResponse(format!(
            "query failed with status {}: {}",
            response.status,
            response.error.unwrap_or_default()
        )));
    }

    Ok(response.data.map(|d| d.variants).unwrap_or_default())
}

pub struct HttpMetricsReader {
    client: reqwest::Client,
    address: String,
    timeout: Duration,
}

impl HttpMetricsReader {
    pub fn new(address: String, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build metrics HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn counts_url(&self, iteration_id: Uuid) -> String {
        format!("{}/api/v1/iterations/{}/counts", self.address, iteration_id)
    }
}

#[async_trait]
impl MetricsReader for HttpMetricsReader {
    async fn fetch_counts(&self, iteration_id: Uuid) -> Result<Vec<VariantCounts>, MetricsError> {
        let response = self
            .client
            .get(self.counts_url(iteration_id))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MetricsError::Timeout(self.timeout)
                } else {
                    MetricsError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Backend has never seen this iteration
            return Ok(vec![]);
        }
        if status.is_server_error() {
            return Err(MetricsError::Unreachable(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MetricsError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(MetricsError::InvalidResponse(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        parse_counts_response(&body)
    }
}

/// Reader with canned counts, failures and latency
#[cfg(test)]
pub struct MockMetricsReader {
    counts: std::sync::Mutex<std::collections::HashMap<Uuid, Vec<VariantCounts>>>,
    failing: std::sync::Mutex<std::collections::HashSet<Uuid>>,
    delay: Option<Duration>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockMetricsReader {
    pub fn new() -> Self {
        Self {
            counts: Default::default(),
            failing: Default::default(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_counts(&self, iteration_id: Uuid, counts: Vec<VariantCounts>) {
        self.counts.lock().unwrap().insert(iteration_id, counts);
    }

    pub fn fail_for(&self, iteration_id: Uuid) {
        self.failing.lock().unwrap().insert(iteration_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl MetricsReader for MockMetricsReader {
    async fn fetch_counts(&self, iteration_id: Uuid) -> Result<Vec<VariantCounts>, MetricsError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&iteration_id) {
            return Err(MetricsError::Unreachable("connection refused".to_string()));
        }
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(&iteration_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts_response_with_data() {
        let body = r#"{
            "status": "success",
            "data": {
                "variants": [
                    {"variant": "blue", "exposures": 1000, "conversions": 52},
                    {"variant": "green", "exposures": 980, "conversions": 61}
                ]
            }
        }"#;

        let counts = parse_counts_response(body).expect("valid response");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].variant, "blue");
        assert_eq!(counts[1].conversions, 61);
    }

    #[test]
    fn test_parse_counts_response_without_data() {
        let counts = parse_counts_response(r#"{"status": "success"}"#).unwrap();
        assert!(counts.is_empty());
    }

    #[test]
    fn test_parse_counts_response_error_status() {
        let result = parse_counts_response(r#"{"status": "error", "error": "bad iteration"}"#);
        match result {
            Err(MetricsError::InvalidResponse(msg)) => assert!(msg.contains("bad iteration")),
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_counts_response_invalid_json() {
        let result = parse_counts_response("not valid json");
        assert!(matches!(result, Err(MetricsError::InvalidResponse(_))));
    }

    #[test]
    fn test_counts_url_trims_trailing_slash() {
        let reader = HttpMetricsReader::new(
            "http://metrics.local:9000/".to_string(),
            Duration::from_secs(1),
        );
        let id = Uuid::nil();
        assert_eq!(
            reader.counts_url(id),
            format!("http://metrics.local:9000/api/v1/iterations/{}/counts", id)
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_unreachable() {
        // Port 9 (discard) is not served locally
        let reader =
            HttpMetricsReader::new("http://127.0.0.1:9".to_string(), Duration::from_secs(2));
        let result = reader.fetch_counts(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(MetricsError::Unreachable(_)) | Err(MetricsError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_reader_has_no_data() {
        let counts = NoOpMetricsReader.fetch_counts(Uuid::new_v4()).await.unwrap();
        assert!(counts.is_empty());
    }
}

//! HTTP client for the counter service

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::config::CollectorConfig;
use crate::error::{Error, Result};

use super::{
    AddOutcome, AddRequest, ConflictResponse, CounterTransport, CountersResponse, LastSeqResponse,
};

/// HTTP+JSON implementation of [`CounterTransport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::Config("collector.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            headers.insert(
                "X-API-KEY",
                HeaderValue::from_str(api_key)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        // Bounded so a hung handshake or flush cannot wedge the service
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client_url(&self, endpoint: &str, client_id: &str) -> String {
        format!(
            "{}/{}?client_id={}",
            self.base_url,
            endpoint,
            urlencoding::encode(client_id)
        )
    }
}

async fn api_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Error::Transport(format!("API error ({}): {}", status, error_text))
}

fn request_failed(e: reqwest::Error) -> Error {
    Error::Transport(format!("HTTP request failed: {}", e))
}

fn parse_failed(e: reqwest::Error) -> Error {
    Error::Transport(format!("failed to parse response: {}", e))
}

#[async_trait]
impl CounterTransport for HttpTransport {
    async fn last_applied(&self, client_id: &str) -> Result<u64> {
        let response = self
            .http_client
            .get(self.client_url("status", client_id))
            .send()
            .await
            .map_err(request_failed)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: LastSeqResponse = response.json().await.map_err(parse_failed)?;
        Ok(body.last_seq)
    }

    async fn add(&self, request: &AddRequest) -> Result<AddOutcome> {
        let url = format!("{}/add", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();

        if status.is_success() {
            let body: LastSeqResponse = response.json().await.map_err(parse_failed)?;
            Ok(AddOutcome::Applied {
                last_seq: body.last_seq,
            })
        } else if status == StatusCode::CONFLICT {
            let body: ConflictResponse = response.json().await.map_err(parse_failed)?;
            if body.expected_next == 0 {
                return Err(Error::Transport(
                    "conflict response with expected_next = 0".to_string(),
                ));
            }
            Ok(AddOutcome::Conflict {
                expected_next: body.expected_next,
            })
        } else {
            Err(api_error(response).await)
        }
    }

    async fn counters(&self, client_id: &str) -> Result<BTreeMap<String, u64>> {
        let response = self
            .http_client
            .get(self.client_url("counters", client_id))
            .send()
            .await
            .map_err(request_failed)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: CountersResponse = response.json().await.map_err(parse_failed)?;
        Ok(body.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_requires_server_url() {
        let config = CollectorConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(HttpTransport::new(&config).is_err());
    }

    #[test]
    fn test_transport_with_valid_config() {
        let config = CollectorConfig {
            enabled: true,
            server_url: Some("http://127.0.0.1:9000/".to_string()),
            api_key: Some("secret".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url(), "http://127.0.0.1:9000");
        assert_eq!(
            transport.client_url("status", "a b"),
            "http://127.0.0.1:9000/status?client_id=a%20b"
        );
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        let config = CollectorConfig {
            enabled: true,
            server_url: Some("http://127.0.0.1:9000".to_string()),
            api_key: Some("bad\nkey".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(Error::Config(_))
        ));
    }
}

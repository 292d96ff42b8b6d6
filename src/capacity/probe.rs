//! Provider probes.
//!
//! Local hosts speak the Ollama process API (`GET /api/ps`), which lists the
//! resident models and their VRAM use. A host that also reports
//! `total_vram` overrides the provider's declared capacity. Rate-limited APIs are asked for their
//! model list (`GET /models`) purely to read the rate-limit headers.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::{LoadedModel, Provider, ProviderKind};

const BYTES_PER_MB: u64 = 1024 * 1024;

pub const REMAINING_REQUESTS_HEADER: &str = "x-ratelimit-remaining-requests";
pub const REMAINING_TOKENS_HEADER: &str = "x-ratelimit-remaining-tokens";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("provider '{0}' declares no capacity and the host reported none")]
    UnknownCapacity(String),
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReading {
    Capacity {
        /// Host-reported total; falls back to the provider's declared capacity
        total_mb: u64,
        used_mb: u64,
        loaded: Vec<LoadedModel>,
    },
    Quota {
        remaining_requests: Option<i64>,
        remaining_tokens: Option<i64>,
    },
}

#[async_trait]
pub trait CapacityProbe: Send + Sync {
    async fn probe(&self, provider: &Provider) -> Result<ProbeReading, ProbeError>;
}

/// Read the remaining-quota headers. Missing or unparsable values are `None`.
pub fn quota_from_headers(headers: &HeaderMap) -> (Option<i64>, Option<i64>) {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    (read(REMAINING_REQUESTS_HEADER), read(REMAINING_TOKENS_HEADER))
}

#[derive(Debug, Deserialize)]
struct ProcessList {
    #[serde(default)]
    models: Vec<ProcessEntry>,
    /// Bytes; absent on stock Ollama
    #[serde(default)]
    total_vram: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProcessEntry {
    name: String,
    #[serde(default)]
    size_vram: u64,
}

/// Probe over HTTP.
#[derive(Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn probe_local(&self, provider: &Provider) -> Result<ProbeReading, ProbeError> {
        let resp = self.http.get(provider.url("/api/ps")).send().await?;
        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status()));
        }
        let list: ProcessList = resp.json().await?;
        capacity_reading(provider, list)
    }

    async fn probe_quota(&self, provider: &Provider) -> Result<ProbeReading, ProbeError> {
        let mut req = self.http.get(provider.url("/models"));
        if let Some(token) = provider.resolve_credential() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        // A 429 still carries the headers we want.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProbeError::Status(resp.status()));
        }
        let (remaining_requests, remaining_tokens) = quota_from_headers(resp.headers());
        Ok(ProbeReading::Quota {
            remaining_requests,
            remaining_tokens,
        })
    }
}

fn capacity_reading(provider: &Provider, list: ProcessList) -> Result<ProbeReading, ProbeError> {
    let total_mb = list
        .total_vram
        .filter(|bytes| *bytes > 0)
        .map(|bytes| bytes / BYTES_PER_MB)
        .or(provider.capacity_mb)
        .ok_or_else(|| ProbeError::UnknownCapacity(provider.id.clone()))?;
    let loaded: Vec<LoadedModel> = list
        .models
        .into_iter()
        .map(|m| LoadedModel {
            model_id: m.name,
            used_mb: m.size_vram.div_ceil(BYTES_PER_MB),
        })
        .collect();
    let used_mb = loaded.iter().map(|m| m.used_mb).sum();
    Ok(ProbeReading::Capacity {
        total_mb,
        used_mb,
        loaded,
    })
}

#[async_trait]
impl CapacityProbe for HttpProbe {
    async fn probe(&self, provider: &Provider) -> Result<ProbeReading, ProbeError> {
        match provider.kind {
            ProviderKind::LocalCapacity => self.probe_local(provider).await,
            ProviderKind::RateLimited => self.probe_quota(provider).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_REQUESTS_HEADER, HeaderValue::from_static("0"));
        headers.insert(REMAINING_TOKENS_HEADER, HeaderValue::from_static("not-a-number"));
        assert_eq!(quota_from_headers(&headers), (Some(0), None));
        assert_eq!(quota_from_headers(&HeaderMap::new()), (None, None));
    }

    #[test]
    fn test_process_list_to_capacity() {
        let provider = Provider {
            id: "gpu".into(),
            name: "GPU".into(),
            kind: ProviderKind::LocalCapacity,
            base_url: "http://gpu:11434/".into(),
            credential_ref: None,
            capacity_mb: Some(24_000),
        };
        let list: ProcessList = serde_json::from_str(
            r#"{"models":[
                {"name":"llama3:8b","size":6000000000,"size_vram":5368709120},
                {"name":"phi3:mini","size_vram":1048576}
            ]}"#,
        )
        .unwrap();

        match capacity_reading(&provider, list).unwrap() {
            ProbeReading::Capacity { total_mb, used_mb, loaded } => {
                assert_eq!(total_mb, 24_000);
                assert_eq!(used_mb, 5121);
                assert_eq!(loaded[0].model_id, "llama3:8b");
            }
            other => panic!("unexpected reading {other:?}"),
        }
        assert_eq!(provider.url("/api/ps"), "http://gpu:11434/api/ps");
    }

    #[test]
    fn test_host_total_overrides_declared_capacity() {
        let mut provider = Provider {
            id: "gpu".into(),
            name: "GPU".into(),
            kind: ProviderKind::LocalCapacity,
            base_url: "http://gpu:11434".into(),
            credential_ref: None,
            capacity_mb: Some(24_000),
        };
        let reported = r#"{"models":[],"total_vram":17179869184}"#;

        let list: ProcessList = serde_json::from_str(reported).unwrap();
        match capacity_reading(&provider, list).unwrap() {
            ProbeReading::Capacity { total_mb, used_mb, .. } => {
                assert_eq!(total_mb, 16_384);
                assert_eq!(used_mb, 0);
            }
            other => panic!("unexpected reading {other:?}"),
        }

        provider.capacity_mb = None;
        let list: ProcessList = serde_json::from_str(r#"{"models":[]}"#).unwrap();
        assert!(matches!(
            capacity_reading(&provider, list),
            Err(ProbeError::UnknownCapacity(_))
        ));
    }
}

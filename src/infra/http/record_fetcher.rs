// HTTP implementation of the record fetcher: one GET against the data
// endpoint, decoded as a JSON list of objects.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::retry::send_with_retry;
use crate::core::agent::{PortError, Record, RecordFetcher};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("response from {url} is not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("response from {url} is neither a JSON object nor a list")]
    Shape { url: String },
}

pub struct HttpRecordFetcher {
    client: Client,
    max_retries: u32,
}

impl HttpRecordFetcher {
    pub fn new(max_retries: u32) -> Self {
        Self {
            client: Client::new(),
            max_retries,
        }
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<Record>, FetchError> {
        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .timeout(timeout);

        let response = send_with_retry(request, self.max_retries)
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })?;

        let records = parse_records(body).ok_or_else(|| FetchError::Shape {
            url: url.to_string(),
        })?;
        tracing::info!("Fetched {} records from {}", records.len(), url);
        Ok(records)
    }
}

/// A list keeps its object entries in order; a lone object becomes a
/// one-record list. Anything else is not record-shaped.
pub fn parse_records(body: Value) -> Option<Vec<Record>> {
    match body {
        Value::Array(items) => {
            let total = items.len();
            let records: Vec<Record> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect();
            if records.len() < total {
                tracing::warn!(
                    "Skipped {} non-object entries in API response",
                    total - records.len()
                );
            }
            Some(records)
        }
        Value::Object(map) => Some(vec![map]),
        _ => None,
    }
}

#[async_trait]
impl RecordFetcher for HttpRecordFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<Record>, PortError> {
        Ok(self.fetch(url, timeout).await?)
    }
}

//! HTTP fallback sync client.
//!
//! In HTTP mode the node pulls catch-up data from other nodes' `POST /sync`
//! endpoint: the body is a JSON `SyncRequest`, the reply a JSON
//! `SyncResponse`. Same protocol as the P2P path, different pipe.

use std::time::Duration;

use async_trait::async_trait;

use pop_protocol::config::REQUEST_TIMEOUT;
use pop_protocol::sync::{SyncClient, SyncError, SyncRequest, SyncResponse};

pub struct HttpSyncClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSyncClient {
    /// `base_url` is the remote API root, e.g. `http://10.0.0.2:9741`.
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/sync", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    fn source(&self) -> String {
        self.endpoint.clone()
    }

    async fn fetch(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http(format!("{} returned {status}", self.endpoint)));
        }
        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| SyncError::Http(format!("bad sync response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalizes_trailing_slash() {
        let client = HttpSyncClient::new("http://127.0.0.1:9741/").unwrap();
        assert_eq!(client.source(), "http://127.0.0.1:9741/sync");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_fault() {
        use pop_protocol::Classify;
        use pop_protocol::FaultClass;

        // Port 9 (discard) is closed on test machines.
        let client = HttpSyncClient::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.fetch(SyncRequest::Status).await.unwrap_err();
        assert_eq!(err.fault_class(), FaultClass::Network);
    }
}

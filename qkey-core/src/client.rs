//! HTTP client for fetching keys from a key gateway
//!
//! Mirrors the gateway's two key operations: take the next key, or fetch a
//! previously issued key again by its id.

use crate::{protocol::KeyResponse, retry::RetryPolicy, Error, Result};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Configuration for the key client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway root, e.g. `http://localhost:8000/`
    pub base_url: Url,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ClientConfig {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            base_url,
            timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Plain-HTTP gateway at `hostname:port`
    pub fn for_host(hostname: &str, port: u16) -> Result<Self> {
        let url = Url::parse(&format!("http://{}:{}/", hostname, port))
            .map_err(|e| Error::Config(format!("Invalid gateway host '{}': {}", hostname, e)))?;
        Ok(Self::new(url))
    }
}

/// Client for the key gateway's REST API
pub struct KeyClient {
    client: Client,
    config: ClientConfig,
    keys_received: AtomicU64,
}

impl KeyClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .use_rustls_tls()
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            config,
            keys_received: AtomicU64::new(0),
        })
    }

    /// Take the next key from the gateway
    #[instrument(skip(self), fields(gateway = %self.config.base_url))]
    pub async fn get_key(&self) -> Result<KeyResponse> {
        let url = self.endpoint("api/keys")?;
        let key = self.config.retry_policy.execute(|| self.fetch_once(url.clone())).await?;
        self.keys_received.fetch_add(1, Ordering::Relaxed);
        Ok(key)
    }

    /// Fetch a key that was issued earlier, by id
    #[instrument(skip(self), fields(gateway = %self.config.base_url))]
    pub async fn get_key_by_id(&self, id: u64) -> Result<KeyResponse> {
        let url = self.endpoint(&format!("api/keys/{}", id))?;
        self.config.retry_policy.execute(|| self.fetch_once(url.clone())).await
    }

    /// Number of keys successfully taken with [`KeyClient::get_key`]
    pub fn keys_received(&self) -> u64 {
        self.keys_received.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", path, e)))
    }

    async fn fetch_once(&self, url: Url) -> Result<KeyResponse> {
        debug!("Requesting {}", url);

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!("Failed to reach {}: {}", url, e);
            Error::Network(e)
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("no key at {}", url)));
        }

        let response = response.error_for_status().map_err(|e| {
            warn!("Gateway returned an error for {}: {}", url, e);
            Error::Network(e)
        })?;

        let body = response.bytes().await.map_err(Error::Network)?;
        let key: KeyResponse = serde_json::from_slice(&body)?;

        if !key.is_valid() {
            return Err(Error::Validation(format!(
                "gateway returned invalid key id {}",
                key.id
            )));
        }

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard, retry_policy: RetryPolicy) -> KeyClient {
        let mut config = ClientConfig::new(Url::parse(&server.url()).unwrap());
        config.retry_policy = retry_policy;
        KeyClient::new(config).unwrap()
    }

    fn quick_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_url_building() {
        let config = ClientConfig::new(Url::parse("http://gateway.local:8000/qkey").unwrap());
        assert_eq!(config.base_url.as_str(), "http://gateway.local:8000/qkey/");

        let client = KeyClient::new(config).unwrap();
        assert_eq!(
            client.endpoint("api/keys/12").unwrap().as_str(),
            "http://gateway.local:8000/qkey/api/keys/12"
        );
    }

    #[test]
    fn test_host_config() {
        assert_eq!(
            ClientConfig::for_host("localhost", 8000).unwrap().base_url.as_str(),
            "http://localhost:8000/"
        );
        assert_eq!(
            ClientConfig::for_host("keys.example", 1540).unwrap().base_url.as_str(),
            "http://keys.example:1540/"
        );
    }

    #[tokio::test]
    async fn test_get_key_counts_keys() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/keys")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":0,"key":"0110"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server, RetryPolicy::none());
        assert_eq!(client.keys_received(), 0);

        let key = client.get_key().await.unwrap();
        assert_eq!(key, KeyResponse { id: 0, key: "0110".to_string() });
        client.get_key().await.unwrap();
        assert_eq!(client.keys_received(), 2);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_request_does_not_count() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/keys")
            .with_status(500)
            .with_body("Failure")
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server, quick_retries(3));
        let result = client.get_key().await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(client.keys_received(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_key_by_id() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/api/keys/3")
            .with_status(200)
            .with_body(r#"{"id":3,"key":"1100"}"#)
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/api/keys/99")
            .with_status(404)
            .with_body(r#"{"id":-1,"key":""}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, quick_retries(3));
        assert_eq!(client.get_key_by_id(3).await.unwrap().key, "1100");
        assert!(matches!(
            client.get_key_by_id(99).await,
            Err(Error::NotFound(_))
        ));
        // Retrievals never advance the key counter
        assert_eq!(client.keys_received(), 0);

        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/keys")
            .with_status(200)
            .with_body(r#"{"id":-1,"key":""}"#)
            .create_async()
            .await;

        let client = client_for(&server, RetryPolicy::none());
        assert!(matches!(client.get_key().await, Err(Error::Validation(_))));
        assert_eq!(client.keys_received(), 0);
    }
}

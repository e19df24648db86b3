// Sender module - delivers metrics to the collector service
//
// Every request body goes through the outbound security pipeline
// (sign -> gzip -> encrypt) before it leaves the process. Deliveries that
// fail because the server is overloaded or broken (500/503) are retried
// with linear backoff; any other failure is reported immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::debug;

use crate::model::Metric;
use crate::retry::{RetryPolicy, Retryer, Transient};
use crate::security::{self, SecurityError, HASH_HEADER};

/// Initial attempt plus three retries, spaced 1s, 3s and 5s.
pub const DEFAULT_SEND_POLICY: RetryPolicy =
    RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(2));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(StatusCode),

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl Transient for SendError {
    /// Only an overloaded or failing server is worth waiting for.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            SendError::Status(StatusCode::INTERNAL_SERVER_ERROR)
                | SendError::Status(StatusCode::SERVICE_UNAVAILABLE)
        )
    }
}

/// Delivery seam between the scheduler and the network.
#[async_trait]
pub trait MetricSender: Send + Sync {
    /// Delivers a whole snapshot in one request.
    async fn send_batch(&self, metrics: &[Metric]) -> Result<(), SendError>;

    /// Delivers a single metric.
    async fn send_one(&self, metric: &Metric) -> Result<(), SendError>;
}

/// HTTP sender targeting `POST /updates` and `POST /update`.
pub struct HttpSender {
    client: Client,

    /// Server root, always with a scheme and without a trailing slash
    base_url: String,

    /// HMAC secret; empty disables signing
    hash_key: Vec<u8>,

    /// Server public key; `None` sends plain gzip
    public_key: Option<RsaPublicKey>,

    retryer: Retryer<SendError>,
}

impl HttpSender {
    /// Creates a sender for the server at `address`.
    ///
    /// # Arguments
    /// * `address` - `host:port` or a full `http(s)://` URL
    /// * `hash_key` - Shared HMAC secret, empty to disable signing
    /// * `public_key` - Server RSA key, `None` to disable encryption
    pub fn new(
        address: &str,
        hash_key: impl Into<Vec<u8>>,
        public_key: Option<RsaPublicKey>,
    ) -> Result<Self, SendError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(HttpSender {
            client,
            base_url: normalize_address(address),
            hash_key: hash_key.into(),
            public_key,
            retryer: Retryer::transient(DEFAULT_SEND_POLICY),
        })
    }

    /// Replaces the delivery retry schedule.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retryer = Retryer::transient(policy);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Seals `plain` once and posts it, retrying transient failures.
    async fn deliver(&self, path: &str, plain: &[u8]) -> Result<(), SendError> {
        let hash_key = Some(self.hash_key.as_slice()).filter(|k| !k.is_empty());
        let payload = security::seal(plain, hash_key, self.public_key.as_ref())?;
        let url = format!("{}{}", self.base_url, path);

        let payload = &payload;
        let url = url.as_str();
        self.retryer.retry(move || self.post(url, payload)).await
    }

    async fn post(&self, url: &str, payload: &security::SealedPayload) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, payload.content_type)
            .header(CONTENT_ENCODING, payload.content_encoding)
            .body(payload.body.clone());
        if let Some(signature) = &payload.signature {
            request = request.header(HASH_HEADER, signature);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Status(status));
        }

        debug!("POST {} -> {} ({} bytes sent)", url, status, payload.body.len());
        Ok(())
    }
}

#[async_trait]
impl MetricSender for HttpSender {
    async fn send_batch(&self, metrics: &[Metric]) -> Result<(), SendError> {
        if metrics.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(metrics)?;
        self.deliver("/updates", &body).await
    }

    async fn send_one(&self, metric: &Metric) -> Result<(), SendError> {
        let body = serde_json::to_vec(metric)?;
        self.deliver("/update", &body).await
    }
}

fn normalize_address(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

//! Third-party offer providers.
//!
//! Each upstream source gets an [`OfferProvider`] that knows its endpoints
//! and raw JSON shape, normalizing listings through a per-provider
//! [`normalize::NormalizationTable`]. Callers never talk to a provider
//! directly: they go through a [`ProviderAdapter`], which bounds the call
//! with its own timeout and swaps any failure or empty result for
//! synthetic offers from [`mock::MockOfferGenerator`].
//!
//! # Data Sources
//!
//! - [`kumapon`]: Kumapon area deals
//! - [`hotpepper`]: HotPepper gourmet shop coupons
//! - [`yahoo`]: Yahoo! local search shops with coupons
//! - [`mock`]: deterministic filler, used only as fallback

pub mod hotpepper;
pub mod kumapon;
pub mod mock;
pub mod normalize;
pub mod yahoo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::geo::{self, Coordinates};
use crate::model::{OfferRecord, OfferSource};

pub use hotpepper::HotPepperProvider;
pub use kumapon::KumaponProvider;
pub use mock::MockOfferGenerator;
pub use yahoo::YahooLocalProvider;

/// A location query handed to every provider.
#[derive(Debug, Clone, Copy)]
pub struct AreaQuery {
    pub center: Coordinates,
    pub radius_m: f64,
    pub now: DateTime<Utc>,
}

/// Failures internal to a provider. Never surfaced to API callers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("malformed upstream payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provider credentials not configured")]
    MissingCredentials,

    #[error("provider timed out")]
    Timeout,

    #[error("invalid normalization rule: {0}")]
    Rule(#[from] regex::Error),
}

impl ProviderError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Status(code) => *code >= 500,
            ProviderError::Timeout => true,
            _ => false,
        }
    }
}

/// Timeout and retry policy for one provider's HTTP client.
#[derive(Debug, Clone, Copy)]
pub struct HttpPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

impl HttpPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            timeout: config.timeout,
            retries: config.retries,
            ..Self::default()
        }
    }
}

/// HTTP client owned by a single provider, carrying that provider's policy.
#[derive(Clone)]
pub struct ProviderHttp {
    client: reqwest::Client,
    policy: HttpPolicy,
}

impl ProviderHttp {
    pub fn new(policy: HttpPolicy) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(policy.timeout).build()?;
        Ok(Self { client, policy })
    }

    /// GET a JSON document, retrying transient failures with linear backoff.
    pub async fn get_json(&self, url: &str) -> Result<Value, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Retrying provider request");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json_once(&self, url: &str) -> Result<Value, ProviderError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// A live upstream offer source.
#[async_trait]
pub trait OfferProvider: Send + Sync {
    /// Source tag stamped on this provider's records.
    fn source(&self) -> OfferSource;

    /// Short name used in logs and synthetic ids.
    fn name(&self) -> &'static str {
        self.source().id_prefix()
    }

    /// Fetch and normalize live offers within the query radius.
    async fn fetch_live(&self, query: &AreaQuery) -> Result<Vec<OfferRecord>, ProviderError>;
}

/// Non-failing wrapper around an [`OfferProvider`].
#[derive(Clone)]
pub struct ProviderAdapter {
    provider: Arc<dyn OfferProvider>,
    timeout: Duration,
    fallback: MockOfferGenerator,
}

impl ProviderAdapter {
    pub fn new(provider: impl OfferProvider + 'static, timeout: Duration) -> Self {
        Self {
            provider: Arc::new(provider),
            timeout,
            fallback: MockOfferGenerator::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: MockOfferGenerator) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn name(&self) -> &'static str {
        self.provider.name()
    }

    /// Fetch offers within the query radius. Never fails: errors, timeouts
    /// and empty results all yield the synthetic fallback instead.
    pub async fn fetch_offers(&self, query: &AreaQuery) -> Vec<OfferRecord> {
        let provider = self.provider.name();

        let outcome = tokio::time::timeout(self.timeout, self.provider.fetch_live(query))
            .await
            .unwrap_or(Err(ProviderError::Timeout));

        match outcome {
            Ok(mut records) => {
                // Providers drop out-of-radius records themselves; re-check
                // so a buggy provider cannot leak far-away offers.
                records.retain(|r| geo::distance(query.center, r.location) <= query.radius_m);
                if !records.is_empty() {
                    debug!(provider, count = records.len(), "Live offers fetched");
                    return records;
                }
                info!(provider, "Provider returned no usable offers, using fallback");
            }
            Err(ProviderError::Timeout) => {
                warn!(
                    provider,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Provider timed out, using fallback"
                );
            }
            Err(e) => {
                warn!(provider, error = %e, "Provider unavailable, using fallback");
            }
        }

        self.fallback.generate(provider, query)
    }
}

/// Build the standard adapter set, each with its own HTTP client.
pub fn default_adapters(config: &ProviderConfig) -> Result<Vec<ProviderAdapter>, ProviderError> {
    let policy = HttpPolicy::from_config(config);
    // The outer timeout covers every retry of every request in one fetch.
    let budget = config.timeout * (config.retries + 1) + Duration::from_secs(1);

    Ok(vec![
        ProviderAdapter::new(
            KumaponProvider::with_base_url(ProviderHttp::new(policy)?, &config.kumapon_url)?,
            budget,
        ),
        ProviderAdapter::new(
            HotPepperProvider::new(ProviderHttp::new(policy)?, config.hotpepper_key.clone())?,
            budget,
        ),
        ProviderAdapter::new(
            YahooLocalProvider::new(ProviderHttp::new(policy)?, config.yahoo_app_id.clone())?,
            budget,
        ),
    ])
}

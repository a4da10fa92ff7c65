/**
 * Trip report service
 *
 * Fetches `/api/reports/trips` for one device and time range, routed through a
 * `RequestCache` so repeated and concurrent requests for the same range share
 * one HTTP call.
 */
use crate::USER_AGENT;
use crate::cache::{CacheConfig, CacheKey, RequestCache};
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default HTTP request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub device_id: i64,
    #[serde(default)]
    pub device_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Meters
    #[serde(default)]
    pub distance: f64,
    /// Knots
    #[serde(default)]
    pub average_speed: f64,
    #[serde(default)]
    pub max_speed: f64,
    /// Milliseconds
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub start_position_id: Option<i64>,
    #[serde(default)]
    pub end_position_id: Option<i64>,
    #[serde(default)]
    pub start_lat: Option<f64>,
    #[serde(default)]
    pub start_lon: Option<f64>,
    #[serde(default)]
    pub end_lat: Option<f64>,
    #[serde(default)]
    pub end_lon: Option<f64>,
    #[serde(default)]
    pub start_address: Option<String>,
    #[serde(default)]
    pub end_address: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TripServiceConfig {
    /// Server root, e.g. `https://demo.traccar.org`
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub ttl: Duration,
    pub request_timeout: Duration,
}

impl TripServiceConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            ttl: CacheConfig::default().default_ttl,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TripService {
    http: reqwest::Client,
    config: TripServiceConfig,
    cache: RequestCache<Vec<Trip>>,
}

impl TripService {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(config: TripServiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self::with_client(http, config))
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client, config: TripServiceConfig) -> Self {
        Self {
            http,
            config,
            cache: RequestCache::new(),
        }
    }

    /// Trips for `device_id` between `from` and `to`, served from cache while fresh
    ///
    /// # Errors
    ///
    /// Returns `Error::FetchFailed` if the request fails and nothing was cached
    /// for this range before
    pub async fn trips(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trip>> {
        let key = CacheKey::new(device_id, from, to);
        let url = format!(
            "{}/api/reports/trips",
            self.config.base_url.trim_end_matches('/')
        );
        let query = [
            ("deviceId", device_id.to_string()),
            (
                "from",
                key.range_start().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "to",
                key.range_end().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ];
        let http = self.http.clone();
        let token = self.config.bearer_token.clone();

        self.cache
            .fetch(
                key,
                move || async move {
                    debug!("🌐 GET {} deviceId={}", url, device_id);
                    let mut request = http
                        .get(&url)
                        .query(&query)
                        .header(ACCEPT, "application/json");
                    if let Some(token) = token {
                        request = request.bearer_auth(token);
                    }

                    let trips = request
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<Vec<Trip>>()
                        .await?;
                    Ok(trips)
                },
                self.config.ttl,
            )
            .await
    }

    /// Forces the next `trips` call for this range to hit the server
    pub async fn invalidate(&self, device_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) {
        self.cache
            .invalidate(&CacheKey::new(device_id, from, to))
            .await;
    }

    #[must_use]
    pub const fn cache(&self) -> &RequestCache<Vec<Trip>> {
        &self.cache
    }
}

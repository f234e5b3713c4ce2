//! HTTP backend for the remote read API and the position sink.
//!
//! - Connection pooling through one shared `reqwest::Client`
//! - Dispatch rate limiting (spaces out request starts)
//! - Retry with exponential backoff on 429
//! - 404 maps to [`SyncError::NotFound`] so deleted entities get pruned
//!
//! Reads also retry transport errors. Position submissions do not: a request
//! that timed out may still have been stored, and the caller's durable queue
//! retries it on the next trigger anyway.

use async_trait::async_trait;
use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::{EventFilter, EventsPage, FeedApi, MemberPosition, PositionSink, UserProfile};
use crate::error::{Result, SyncError};
use crate::{Bounds, LocationSample};

const DISPATCH_INTERVAL_MS: u64 = 50;
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_IDLE_PER_HOST: usize = 8;

/// Dispatch rate limiter - spaces out when requests START, so a burst of
/// tracked-history reads never hits the server all at once.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    /// Wait for our dispatch slot. Each caller gets a unique slot
    /// `interval` apart.
    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;
            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at - now, num)
        };

        // Wait outside the lock
        if !wait.is_zero() {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait);
            tokio::time::sleep(wait).await;
        }
        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // Exponential backoff: 1s, 2s, 4s max
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!("[DispatchRateLimiter] Got 429! Consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }
}

/// Client for the live map REST API.
pub struct ApiClient {
    client: Client,
    base_url: Url,
    auth_header: String,
    rate_limiter: DispatchRateLimiter,
}

impl ApiClient {
    /// Create a client for `base_url` authenticating as `user` with `token`.
    pub fn new(base_url: &str, user: &str, token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::InvalidConfig(format!("invalid base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!("'{}' cannot be a base URL", base_url)));
        }
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, token));

        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url,
            auth_header: format!("Basic {}", auth),
            rate_limiter: DispatchRateLimiter::new(Duration::from_millis(DISPATCH_INTERVAL_MS)),
        })
    }

    /// Base URL extended with path segments (each segment is percent-encoded).
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn events_url(&self, bounds: &Bounds, filter: &EventFilter) -> Url {
        let mut url = self.endpoint(&["events"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("minLat", &bounds.min_lat.to_string())
                .append_pair("maxLat", &bounds.max_lat.to_string())
                .append_pair("minLng", &bounds.min_lng.to_string())
                .append_pair("maxLng", &bounds.max_lng.to_string());
            if !filter.categories.is_empty() {
                let categories: Vec<&str> = filter.categories.iter().map(String::as_str).collect();
                query.append_pair("categories", &categories.join(","));
            }
            if filter.urgent_only {
                query.append_pair("urgentOnly", "true");
            }
        }
        url
    }

    /// GET and decode. Retries 429 and transport errors.
    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
        let mut retries = 0;
        loop {
            self.rate_limiter.wait_for_dispatch_slot().await;
            let response = self
                .client
                .get(url.clone())
                .header("Authorization", &self.auth_header)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(status_error(resp.status(), what));
                    }
                    tokio::time::sleep(self.rate_limiter.record_429()).await;
                }
                Ok(resp) => {
                    self.rate_limiter.record_success();
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(status_error(status, what));
                    }
                    let bytes = resp.bytes().await?;
                    debug!("[ApiClient] GET {} -> {} bytes", what, bytes.len());
                    return Ok(serde_json::from_slice(&bytes)?);
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(e.into());
                    }
                    let wait = transport_backoff(retries);
                    warn!("[ApiClient] GET {} error: {}, retry {} after {:?}", what, e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// POST a JSON body. Retries 429 only.
    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B, what: &str) -> Result<()> {
        let mut retries = 0;
        loop {
            self.rate_limiter.wait_for_dispatch_slot().await;
            let resp = self
                .client
                .post(url.clone())
                .header("Authorization", &self.auth_header)
                .json(body)
                .send()
                .await?;

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(status_error(status, what));
                }
                tokio::time::sleep(self.rate_limiter.record_429()).await;
                continue;
            }
            self.rate_limiter.record_success();
            if !status.is_success() {
                return Err(status_error(status, what));
            }
            debug!("[ApiClient] POST {} -> {}", what, status);
            return Ok(());
        }
    }
}

fn transport_backoff(attempt: u32) -> Duration {
    Duration::from_millis(200 * (1 << attempt.min(4)))
}

fn status_error(status: StatusCode, what: &str) -> SyncError {
    if status == StatusCode::NOT_FOUND {
        SyncError::NotFound(what.to_string())
    } else {
        SyncError::Network(format!("HTTP {} for {}", status, what))
    }
}

#[derive(Serialize)]
struct BatchBody<'a> {
    samples: &'a [LocationSample],
}

#[async_trait]
impl FeedApi for ApiClient {
    async fn events_in_region(&self, bounds: &Bounds, filter: &EventFilter) -> Result<EventsPage> {
        self.get_json(self.events_url(bounds, filter), "events").await
    }

    async fn event_positions(&self, event_id: &str) -> Result<Vec<LocationSample>> {
        let url = self.endpoint(&["events", event_id, "positions"]);
        self.get_json(url, &format!("event {}", event_id)).await
    }

    async fn group_positions(&self, group_id: &str) -> Result<Vec<MemberPosition>> {
        let url = self.endpoint(&["groups", group_id, "positions"]);
        self.get_json(url, &format!("group {}", group_id)).await
    }

    async fn group_events(&self, group_id: &str) -> Result<EventsPage> {
        let url = self.endpoint(&["groups", group_id, "events"]);
        self.get_json(url, &format!("group {}", group_id)).await
    }

    async fn user_profile(&self) -> Result<UserProfile> {
        self.get_json(self.endpoint(&["me"]), "profile").await
    }
}

#[async_trait]
impl PositionSink for ApiClient {
    async fn submit_sample(&self, sample: &LocationSample) -> Result<()> {
        self.post_json(self.endpoint(&["positions"]), sample, "position").await
    }

    async fn submit_batch(&self, samples: &[LocationSample]) -> Result<()> {
        let body = BatchBody { samples };
        self.post_json(self.endpoint(&["positions", "batch"]), &body, "position batch").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, "user", "secret").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_rate_limiter() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));

        // First request should not wait
        let start = Instant::now();
        assert_eq!(limiter.wait_for_dispatch_slot().await, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Second request waits for the next slot
        assert_eq!(limiter.wait_for_dispatch_slot().await, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn test_429_backoff_grows_and_resets() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));
        assert_eq!(limiter.record_429(), Duration::from_secs(1));
        assert_eq!(limiter.record_429(), Duration::from_secs(2));
        assert_eq!(limiter.record_429(), Duration::from_secs(4));
        assert_eq!(limiter.record_429(), Duration::from_secs(4));
        limiter.record_success();
        assert_eq!(limiter.record_429(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_endpoint_paths() {
        let api = client("https://api.example.com/v1/");
        assert_eq!(
            api.endpoint(&["events", "42", "positions"]).as_str(),
            "https://api.example.com/v1/events/42/positions"
        );
        // Ids are encoded as single segments
        assert_eq!(
            api.endpoint(&["groups", "a/b", "events"]).as_str(),
            "https://api.example.com/v1/groups/a%2Fb/events"
        );
        assert_eq!(api.auth_header, "Basic dXNlcjpzZWNyZXQ=");
    }

    #[tokio::test]
    async fn test_events_query() {
        let api = client("https://api.example.com");
        let bounds = Bounds { min_lat: 51.4, max_lat: 51.6, min_lng: -0.2, max_lng: 0.1 };
        let mut filter = EventFilter::default();
        assert_eq!(
            api.events_url(&bounds, &filter).as_str(),
            "https://api.example.com/events?minLat=51.4&maxLat=51.6&minLng=-0.2&maxLng=0.1"
        );

        filter.categories.insert("flood".to_string());
        filter.categories.insert("fire".to_string());
        filter.urgent_only = true;
        let url = api.events_url(&bounds, &filter);
        assert!(url.as_str().ends_with("&categories=fire%2Cflood&urgentOnly=true"), "{}", url);
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::NOT_FOUND, "event 1").is_not_found());
        let err = status_error(StatusCode::BAD_GATEWAY, "events");
        assert!(err.is_transient());
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_rejects_bad_base_url() {
        assert!(matches!(
            ApiClient::new("not a url", "u", "t"),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            ApiClient::new("mailto:someone@example.com", "u", "t"),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}

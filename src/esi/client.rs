//! Authenticated client for the game API.
//!
//! All outbound traffic funnels through here: the global token bucket is
//! taken before every request, upstream failures feed the error budget, and
//! GET responses are cached against their validity headers so revalidation
//! can answer from memory with a conditional request.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::esi::limits::{ErrorBudget, TokenBucket};
use crate::esi::models::*;
use crate::esi::UpstreamApi;
use crate::models::Deadline;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct CachedResponse {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    fresh_until: Instant,
    pages: Option<u32>,
}

pub struct EsiClient {
    http: reqwest::Client,
    base_url: String,
    bucket: Arc<TokenBucket>,
    budget: Arc<ErrorBudget>,
    response_cache: Mutex<HashMap<String, CachedResponse>>,
}

struct RequestSpec<'a> {
    method: Method,
    url: String,
    token: Option<&'a str>,
    json_body: Option<serde_json::Value>,
    /// GETs revalidate through the response cache; mutations never do.
    cacheable: bool,
}

impl EsiClient {
    pub fn new(config: &Config, bucket: Arc<TokenBucket>, budget: Arc<ErrorBudget>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(config.upstream_user_agent.clone())
            .build()
            .map_err(|e| Error::internal("building upstream http client", e))?;

        Ok(Self {
            http,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            bucket,
            budget,
            response_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        token: Option<&str>,
        deadline: Deadline,
    ) -> Result<T> {
        let (body, _) = self
            .execute(RequestSpec {
                method: Method::GET,
                url,
                token,
                json_body: None,
                cacheable: true,
            }, deadline)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::internal("decoding upstream response", e))
    }

    async fn execute(
        &self,
        spec: RequestSpec<'_>,
        deadline: Deadline,
    ) -> Result<(Arc<Vec<u8>>, Option<u32>)> {
        // Fresh cache entries short-circuit before touching the bucket.
        let cached_etag = if spec.cacheable {
            let cache = self.response_cache.lock();
            if let Some(entry) = cache.get(&spec.url) {
                if entry.fresh_until > Instant::now() {
                    return Ok((entry.body.clone(), entry.pages));
                }
            }
            cache.get(&spec.url).and_then(|e| e.etag.clone())
        } else {
            None
        };

        if self.budget.exhausted() {
            return Err(Error::UpstreamUnavailable(
                "error budget exhausted".to_string(),
            ));
        }

        self.bucket.acquire(deadline).await?;

        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_err = Error::UpstreamTransport("no attempt made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            let mut request = self.http.request(spec.method.clone(), &spec.url);
            if let Some(token) = spec.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &spec.json_body {
                request = request.json(body);
            }
            if let Some(etag) = &cached_etag {
                request = request.header(header::IF_NONE_MATCH, etag.clone());
            }

            let sent = tokio::time::timeout_at(deadline.instant(), request.send()).await;
            match sent {
                Err(_) => return Err(Error::DeadlineExceeded),
                Ok(Ok(response)) => {
                    let status = response.status();

                    if status == StatusCode::NOT_MODIFIED {
                        let validity = cache_validity(response.headers());
                        let mut cache = self.response_cache.lock();
                        if let Some(entry) = cache.get_mut(&spec.url) {
                            entry.fresh_until = Instant::now() + validity;
                            debug!(url = %spec.url, "Revalidated upstream response");
                            return Ok((entry.body.clone(), entry.pages));
                        }
                        // An entry evicted mid-flight leaves nothing to
                        // serve; treat as a transient miss and retry plain.
                        last_err =
                            Error::UpstreamTransport("revalidation without cache entry".into());
                    } else if status.is_success() {
                        let etag = header_string(response.headers(), header::ETAG);
                        let pages = header_string(response.headers(), "x-pages")
                            .and_then(|v| v.parse().ok());
                        let validity = cache_validity(response.headers());
                        let body = response
                            .bytes()
                            .await
                            .map_err(|e| Error::UpstreamTransport(e.to_string()))?;
                        let body = Arc::new(body.to_vec());

                        if spec.cacheable {
                            let mut cache = self.response_cache.lock();
                            cache.insert(
                                spec.url.clone(),
                                CachedResponse {
                                    body: body.clone(),
                                    etag,
                                    fresh_until: Instant::now() + validity,
                                    pages,
                                },
                            );
                        }
                        return Ok((body, pages));
                    } else {
                        match status.as_u16() {
                            401 | 403 => return Err(Error::Unauthorized),
                            404 => return Err(Error::NotFound(spec.url.clone())),
                            420 | 429 => {
                                self.budget.record_error();
                                let retry_after = header_string(response.headers(), header::RETRY_AFTER)
                                    .and_then(|v| v.parse().ok())
                                    .unwrap_or_else(|| {
                                        self.bucket.retry_after_hint().as_secs().max(1)
                                    });
                                return Err(Error::RateLimited {
                                    retry_after_secs: retry_after,
                                });
                            }
                            s if (400..500).contains(&s) => {
                                let body = response.text().await.unwrap_or_default();
                                return Err(Error::UpstreamClient(format!("{status}: {body}")));
                            }
                            _ => {
                                self.budget.record_error();
                                warn!(url = %spec.url, %status, attempt, "Upstream server error");
                                last_err =
                                    Error::UpstreamUnavailable(format!("status {status}"));
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(url = %spec.url, attempt, error = %e, "Upstream transport failure");
                    last_err = Error::UpstreamTransport(e.to_string());
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                let wait = Duration::from_millis(backoff + jitter);
                if wait > deadline.remaining() {
                    return Err(Error::DeadlineExceeded);
                }
                tokio::time::sleep(wait).await;
                backoff *= 2;
            }
        }

        Err(last_err)
    }
}

fn header_string(
    headers: &header::HeaderMap,
    name: impl header::AsHeaderName,
) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// How long a response may be served without revalidation, from
/// `Cache-Control: max-age` or the `Expires`/`Date` pair. Responses without
/// validity headers are not reusable.
fn cache_validity(headers: &header::HeaderMap) -> Duration {
    if let Some(cache_control) = header_string(headers, header::CACHE_CONTROL) {
        for directive in cache_control.split(',') {
            let directive = directive.trim();
            if let Some(value) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = value.parse::<u64>() {
                    return Duration::from_secs(secs);
                }
            }
        }
    }

    if let Some(expires) = header_string(headers, header::EXPIRES) {
        if let Ok(expires) = chrono::DateTime::parse_from_rfc2822(&expires) {
            let now = header_string(headers, header::DATE)
                .and_then(|d| chrono::DateTime::parse_from_rfc2822(&d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let delta = expires.with_timezone(&Utc) - now;
            if let Ok(validity) = delta.to_std() {
                return validity;
            }
        }
    }

    Duration::ZERO
}

#[async_trait]
impl UpstreamApi for EsiClient {
    async fn market_orders(
        &self,
        region_id: i32,
        deadline: Deadline,
    ) -> Result<Vec<EsiMarketOrder>> {
        let first_url = self.url(&format!("markets/{region_id}/orders/?page=1"));
        let (body, pages) = self
            .execute(RequestSpec {
                method: Method::GET,
                url: first_url,
                token: None,
                json_body: None,
                cacheable: true,
            }, deadline)
            .await?;
        let mut orders: Vec<EsiMarketOrder> = serde_json::from_slice(&body)
            .map_err(|e| Error::internal("decoding market orders", e))?;

        let pages = pages.unwrap_or(1);
        for page in 2..=pages {
            let url = self.url(&format!("markets/{region_id}/orders/?page={page}"));
            let page_orders: Vec<EsiMarketOrder> =
                self.get_json(url, None, deadline).await?;
            orders.extend(page_orders);
        }

        debug!(region_id, pages, orders = orders.len(), "Fetched region order book");
        Ok(orders)
    }

    async fn market_history(
        &self,
        region_id: i32,
        type_id: i32,
        deadline: Deadline,
    ) -> Result<Vec<EsiMarketHistoryDay>> {
        let url = self.url(&format!("markets/{region_id}/history/?type_id={type_id}"));
        self.get_json(url, None, deadline).await
    }

    async fn character_location(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiCharacterLocation> {
        let url = self.url(&format!("characters/{character_id}/location/"));
        self.get_json(url, Some(token), deadline).await
    }

    async fn character_skills(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiSkills> {
        let url = self.url(&format!("characters/{character_id}/skills/"));
        self.get_json(url, Some(token), deadline).await
    }

    async fn character_ship(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<EsiShip> {
        let url = self.url(&format!("characters/{character_id}/ship/"));
        self.get_json(url, Some(token), deadline).await
    }

    async fn character_assets(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<EsiAsset>> {
        let url = self.url(&format!("characters/{character_id}/assets/"));
        self.get_json(url, Some(token), deadline).await
    }

    async fn character_fittings(
        &self,
        character_id: i64,
        token: &str,
        deadline: Deadline,
    ) -> Result<Vec<EsiFitting>> {
        let url = self.url(&format!("characters/{character_id}/fittings/"));
        self.get_json(url, Some(token), deadline).await
    }

    async fn resolve_names(&self, ids: &[i64], deadline: Deadline) -> Result<Vec<EsiName>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url("universe/names/");
        let (body, _) = self
            .execute(RequestSpec {
                method: Method::POST,
                url,
                token: None,
                json_body: Some(serde_json::json!(ids)),
                cacheable: false,
            }, deadline)
            .await?;
        serde_json::from_slice(&body).map_err(|e| Error::internal("decoding name lookup", e))
    }

    async fn set_waypoint(
        &self,
        destination_id: i64,
        token: &str,
        clear_other_waypoints: bool,
        add_to_beginning: bool,
        deadline: Deadline,
    ) -> Result<()> {
        let url = self.url(&format!(
            "ui/autopilot/waypoint/?destination_id={destination_id}\
             &clear_other_waypoints={clear_other_waypoints}\
             &add_to_beginning={add_to_beginning}"
        ));
        self.execute(RequestSpec {
            method: Method::POST,
            url,
            token: Some(token),
            json_body: None,
            cacheable: false,
        }, deadline)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> header::HeaderMap {
        let mut map = header::HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                header::HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn validity_prefers_max_age() {
        let map = headers(&[("cache-control", "public, max-age=300")]);
        assert_eq!(cache_validity(&map), Duration::from_secs(300));
    }

    #[test]
    fn validity_from_expires_pair() {
        let map = headers(&[
            ("date", "Wed, 01 Jan 2025 00:00:00 GMT"),
            ("expires", "Wed, 01 Jan 2025 00:05:00 GMT"),
        ]);
        assert_eq!(cache_validity(&map), Duration::from_secs(300));
    }

    #[test]
    fn validity_defaults_to_zero() {
        assert_eq!(cache_validity(&header::HeaderMap::new()), Duration::ZERO);
    }

    #[test]
    fn expired_expires_is_not_negative() {
        let map = headers(&[
            ("date", "Wed, 01 Jan 2025 00:10:00 GMT"),
            ("expires", "Wed, 01 Jan 2025 00:05:00 GMT"),
        ]);
        assert_eq!(cache_validity(&map), Duration::ZERO);
    }
}

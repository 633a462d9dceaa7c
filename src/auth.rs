//! Anonymous-credential acquisition for the z.ai web frontend.
//!
//! The upstream accepts unauthenticated visitors through a short-lived
//! anonymous JWT issued by its auth endpoint. The token is shared by every
//! in-flight chat stream, so acquisition is coalesced: one fetch at a time,
//! with concurrent callers parking until the refresher finishes.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::HttpClients;

/// Anonymous auth endpoint on the z.ai web frontend.
pub const ANONYMOUS_AUTH_URL: &str = "https://chat.z.ai/api/v1/auths/";

/// A token within this many seconds of expiry is treated as expired, so a
/// request never starts on a credential about to lapse mid-stream.
const TOKEN_VALIDITY_SKEW_SECS: i64 = 30;

/// Lifetime assumed when the JWT carries no usable `exp` claim, and the
/// ceiling applied even when it does.
const FALLBACK_TOKEN_TTL_MINS: i64 = 8;

#[derive(Debug, Deserialize)]
struct AnonymousAuthResponse {
    #[serde(default)]
    token: String,
}

/// Extract the `exp` claim (Unix seconds) from a JWT without verifying it.
/// Returns `None` on any structural problem; callers fall back to a fixed
/// TTL in that case.
pub fn decode_jwt_exp(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?.trim_end_matches('=');
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp").and_then(serde_json::Value::as_i64)
}

fn compute_expire_at(now: DateTime<Utc>, exp: Option<i64>) -> DateTime<Utc> {
    let ceiling = now + Duration::minutes(FALLBACK_TOKEN_TTL_MINS);
    match exp.filter(|value| *value > 0) {
        Some(seconds) => match Utc.timestamp_opt(seconds, 0).single() {
            Some(claimed) => claimed.min(ceiling),
            None => ceiling,
        },
        None => ceiling,
    }
}

#[derive(Debug, Default)]
struct TokenState {
    token: String,
    expire_at: Option<DateTime<Utc>>,
    refreshing: bool,
}

impl TokenState {
    fn valid_token(&self, now: DateTime<Utc>) -> Option<String> {
        if self.token.is_empty() {
            return None;
        }
        let expire_at = self.expire_at?;
        if now < expire_at - Duration::seconds(TOKEN_VALIDITY_SKEW_SECS) {
            Some(self.token.clone())
        } else {
            None
        }
    }
}

struct CacheInner {
    state: tokio::sync::Mutex<TokenState>,
    refreshed: tokio::sync::Notify,
}

/// Process-wide cache for the anonymous token, owned by the gateway state
/// and passed explicitly to whoever needs a credential. Clones share one
/// underlying cache.
///
/// Guarantees: at most one fetch in flight; waiters woken after every
/// completed fetch observe the same `(token, expire_at)`; a failed fetch
/// leaves the cache unchanged and lets the next caller retry.
#[derive(Clone)]
pub struct AnonymousTokenCache {
    inner: Arc<CacheInner>,
}

impl Default for AnonymousTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnonymousTokenCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: tokio::sync::Mutex::new(TokenState::default()),
                refreshed: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Return a usable anonymous token, fetching one if necessary.
    pub async fn get_token(&self, clients: &Arc<HttpClients>) -> Result<String> {
        let clients = Arc::clone(clients);
        self.get_token_via(move || async move { fetch_anonymous_token(&clients).await })
            .await
    }

    /// Single-flight core, generic over the fetch so tests can count and
    /// stall acquisitions without a network.
    async fn get_token_via<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, DateTime<Utc>)>> + Send + 'static,
    {
        loop {
            let mut state = self.inner.state.lock().await;
            if let Some(token) = state.valid_token(Utc::now()) {
                return Ok(token);
            }

            if !state.refreshing {
                state.refreshing = true;
                drop(state);
                break;
            }

            // Register interest before releasing the lock so a refresh
            // finishing in between cannot be missed.
            let notified = self.inner.refreshed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);
            notified.await;
        }

        // The refresh runs detached: a caller that gives up mid-await must
        // not cancel it, and the cache update has to happen even if nobody
        // is left listening.
        let inner = Arc::clone(&self.inner);
        let fut = fetch();
        let refresh = tokio::spawn(async move {
            let fetched = fut.await;

            let mut state = inner.state.lock().await;
            state.refreshing = false;
            inner.refreshed.notify_waiters();
            match fetched {
                Ok((token, expire_at)) => {
                    state.token = token.clone();
                    state.expire_at = Some(expire_at);
                    Ok(token)
                }
                Err(error) => Err(error),
            }
        });

        match refresh.await {
            Ok(result) => result,
            Err(error) => Err(anyhow!("token refresh task failed: {error}")),
        }
    }
}

async fn fetch_anonymous_token(clients: &HttpClients) -> Result<(String, DateTime<Utc>)> {
    let response = clients
        .random_client()
        .get(ANONYMOUS_AUTH_URL)
        .send()
        .await
        .context("anonymous token request failed")?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        bail!("anonymous auth endpoint returned status {status}");
    }

    let auth: AnonymousAuthResponse = response
        .json()
        .await
        .context("anonymous auth response was not valid JSON")?;
    if auth.token.is_empty() {
        bail!("anonymous auth endpoint returned an empty token");
    }

    let expire_at = compute_expire_at(Utc::now(), decode_jwt_exp(&auth.token));
    tracing::debug!(%expire_at, "fetched anonymous token");

    Ok((auth.token, expire_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn jwt_with_payload(payload: &str) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!("{}.{}.sig", engine.encode("{}"), engine.encode(payload))
    }

    #[test]
    fn decode_jwt_exp_reads_claim() {
        let token = jwt_with_payload("{\"exp\":1234567890,\"sub\":\"anon\"}");
        assert_eq!(decode_jwt_exp(&token), Some(1_234_567_890));
    }

    #[test]
    fn decode_jwt_exp_tolerates_garbage() {
        assert_eq!(decode_jwt_exp(""), None);
        assert_eq!(decode_jwt_exp("not-a-jwt"), None);
        assert_eq!(decode_jwt_exp("a.%%%.c"), None);
        let token = jwt_with_payload("not json");
        assert_eq!(decode_jwt_exp(&token), None);
    }

    #[test]
    fn expiry_is_capped_at_fallback_ttl() {
        let now = Utc::now();
        let far_future = (now + Duration::hours(2)).timestamp();
        let capped = compute_expire_at(now, Some(far_future));
        assert_eq!(capped, now + Duration::minutes(FALLBACK_TOKEN_TTL_MINS));

        let soon = (now + Duration::minutes(3)).timestamp();
        let claimed = compute_expire_at(now, Some(soon));
        assert!(claimed < now + Duration::minutes(4));

        assert_eq!(
            compute_expire_at(now, None),
            now + Duration::minutes(FALLBACK_TOKEN_TTL_MINS)
        );
        assert_eq!(
            compute_expire_at(now, Some(0)),
            now + Duration::minutes(FALLBACK_TOKEN_TTL_MINS)
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(AnonymousTokenCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .get_token_via(|| {
                        let fetches = Arc::clone(&fetches);
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            // Hold the refresh open long enough for every
                            // other caller to queue behind it.
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            Ok(("tok-1".to_string(), Utc::now() + Duration::minutes(5)))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let token = handle.await.expect("task panicked").expect("fetch failed");
            assert_eq!(token, "tok-1");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_skew_window() {
        let cache = Arc::new(AnonymousTokenCache::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = Arc::clone(&fetches);
            let token = cache
                .get_token_via(move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(("tok-2".to_string(), Utc::now() + Duration::minutes(5)))
                })
                .await
                .unwrap();
            assert_eq!(token, "tok-2");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_refresh() {
        let cache = Arc::new(AnonymousTokenCache::new());

        let first = cache
            .get_token_via(|| async {
                // Expires inside the 30s validity skew: unusable at once.
                Ok(("stale".to_string(), Utc::now() + Duration::seconds(10)))
            })
            .await
            .unwrap();
        assert_eq!(first, "stale");

        let second = cache
            .get_token_via(|| async { Ok(("fresh".to_string(), Utc::now() + Duration::minutes(5))) })
            .await
            .unwrap();
        assert_eq!(second, "fresh");
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_empty_and_unlocked() {
        let cache = Arc::new(AnonymousTokenCache::new());

        let err = cache
            .get_token_via(|| async { bail!("upstream unavailable") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upstream unavailable"));

        // The failed refresh must not wedge the cache; the next caller
        // performs its own fetch and succeeds.
        let token = cache
            .get_token_via(|| async {
                Ok(("recovered".to_string(), Utc::now() + Duration::minutes(5)))
            })
            .await
            .unwrap();
        assert_eq!(token, "recovered");
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_wedge_the_refresh() {
        let cache = Arc::new(AnonymousTokenCache::new());

        // First caller starts a slow refresh and is dropped mid-await.
        let initiator = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_token_via(|| async {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        Ok(("survivor".to_string(), Utc::now() + Duration::minutes(5)))
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        initiator.abort();

        // The detached refresh still completes and benefits later callers
        // without a second fetch.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let token = cache
            .get_token_via(|| async {
                panic!("cache should already hold the survivor token");
            })
            .await
            .unwrap();
        assert_eq!(token, "survivor");
    }
}

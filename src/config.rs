//! Environment-driven configuration and outbound HTTP client selection.
//!
//! The proxy reads its settings from the process environment (an optional
//! `.env` file is honored at startup). When `PROXY_URL` is set, outbound
//! traffic is split between a direct client and a proxied client so the
//! upstream sees a mix of source addresses; the split is either random
//! (anonymous-auth fetches) or sticky per credential (chat streams), so a
//! given token always travels the same path.

use rand::Rng;
use std::time::Duration;

/// Default listener port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 8000;

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Optional outbound HTTP(S) proxy for upstream traffic.
    pub proxy_url: Option<String>,
}

impl Config {
    /// Load configuration from the environment. A `.env` file in the
    /// working directory is merged in first, matching deployment habits
    /// of the upstream service this proxy fronts.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let host = std::env::var("HOST")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let proxy_url = std::env::var("PROXY_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            host,
            port,
            proxy_url,
        }
    }
}

/// The two outbound clients the proxy may use. Both are connection-pooled
/// and built once; `reqwest::Client` is cheap to clone internally so the
/// selectors hand out references.
pub struct HttpClients {
    direct: reqwest::Client,
    proxied: Option<reqwest::Client>,
}

impl HttpClients {
    /// Build the outbound clients. An invalid `proxy_url` is logged and
    /// ignored, leaving only the direct path.
    pub fn new(proxy_url: Option<&str>) -> Self {
        let direct = build_client(None);

        let proxied = proxy_url.and_then(|raw| match reqwest::Proxy::all(raw) {
            Ok(proxy) => Some(build_client(Some(proxy))),
            Err(error) => {
                tracing::error!("Invalid proxy URL {raw:?}: {error}");
                None
            }
        });

        Self { direct, proxied }
    }

    /// The direct (un-proxied) client.
    pub fn default_client(&self) -> &reqwest::Client {
        &self.direct
    }

    /// Randomly pick direct or proxied (50/50) per call. Used where no
    /// stable identity exists yet, e.g. the anonymous-token fetch.
    pub fn random_client(&self) -> &reqwest::Client {
        let Some(proxied) = self.proxied.as_ref() else {
            return &self.direct;
        };

        if rand::thread_rng().gen_bool(0.5) {
            tracing::debug!("outbound path: direct (random)");
            &self.direct
        } else {
            tracing::debug!("outbound path: proxy (random)");
            proxied
        }
    }

    /// Pick direct or proxied deterministically from `key` (e.g. the
    /// bearer token), so the same credential always leaves through the
    /// same path and the upstream never sees it hop between addresses.
    pub fn sticky_client(&self, key: &str) -> &reqwest::Client {
        let Some(proxied) = self.proxied.as_ref() else {
            return &self.direct;
        };
        if key.is_empty() {
            return self.random_client();
        }

        if fnv1a_32(key.as_bytes()) % 2 == 0 {
            tracing::debug!(
                key = %crate::util::truncate_with_ellipsis(key, 10),
                "outbound path: direct (sticky)"
            );
            &self.direct
        } else {
            tracing::debug!(
                key = %crate::util::truncate_with_ellipsis(key, 10),
                "outbound path: proxy (sticky)"
            );
            proxied
        }
    }
}

fn build_client(proxy: Option<reqwest::Proxy>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100);

    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder.build().unwrap_or_else(|error| {
        tracing::warn!("Failed to build outbound client: {error}");
        reqwest::Client::new()
    })
}

/// 32-bit FNV-1a. Small and stable; only used to bucket credentials
/// between the two outbound paths.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

use crate::config::Config;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// URLs per purge API call.
const PURGE_CHUNK: usize = 30;
/// Attempts per chunk before giving up.
const MAX_ATTEMPTS: u32 = 3;
/// Backoff after a rate-limit response.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
/// Backoff after any other failure.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Rate-limited cache purger for a Cloudflare-compatible CDN API.
///
/// Jobs are queued onto an unbounded channel and drained by a single worker,
/// so purge calls never run concurrently and never block deletion paths.
pub struct CdnPurger {
    tx: Option<mpsc::UnboundedSender<Vec<String>>>,
}

impl CdnPurger {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        if !config.cdn_purge || config.cdn_zone_id.is_none() {
            return Arc::new(Self { tx: None });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(config, rx));
        Arc::new(Self { tx: Some(tx) })
    }

    /// Queue a purge job. Never blocks and never fails the caller.
    pub fn purge(&self, urls: Vec<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        if urls.is_empty() {
            return;
        }
        if tx.send(urls).is_err() {
            warn!("CDN purge worker is gone; dropping purge job");
        }
    }

    /// Purge the service URLs for a set of file names (and their thumbnails
    /// where one can exist).
    pub fn purge_names(&self, config: &Config, names: &[String]) {
        if self.tx.is_none() || names.is_empty() {
            return;
        }
        let mut urls = Vec::with_capacity(names.len() * 2);
        for name in names {
            urls.push(config.file_url(name));
            let identifier = name.split('.').next().unwrap_or(name);
            if crate::services::thumbs::supports_extension(&crate::utils::validation::extname(name))
            {
                urls.push(config.file_url(&format!("thumbs/{identifier}.png")));
            }
        }
        self.purge(urls);
    }
}

fn auth_headers(config: &Config) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();
    // First configured credential wins: API token, then user service key,
    // then API key + email.
    if let Some(token) = &config.cdn_api_token {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).ok()?,
        );
    } else if let Some(key) = &config.cdn_user_service_key {
        headers.insert("X-Auth-User-Service-Key", HeaderValue::from_str(key).ok()?);
    } else if let (Some(key), Some(email)) = (&config.cdn_api_key, &config.cdn_email) {
        headers.insert("X-Auth-Key", HeaderValue::from_str(key).ok()?);
        headers.insert("X-Auth-Email", HeaderValue::from_str(email).ok()?);
    } else {
        return None;
    }
    Some(headers)
}

async fn worker_loop(config: Arc<Config>, mut rx: mpsc::UnboundedReceiver<Vec<String>>) {
    let Some(headers) = auth_headers(&config) else {
        error!("CDN purge enabled but no credentials configured; worker exiting");
        return;
    };
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .default_headers(headers)
        .build()
    else {
        error!("Failed to build CDN purge HTTP client; worker exiting");
        return;
    };

    let zone = config.cdn_zone_id.clone().unwrap_or_default();
    let endpoint = format!("https://api.cloudflare.com/client/v4/zones/{zone}/purge_cache");

    info!("CDN purge worker started for zone {}", zone);

    while let Some(urls) = rx.recv().await {
        for chunk in urls.chunks(PURGE_CHUNK) {
            purge_chunk(&client, &endpoint, chunk).await;
        }
    }
}

async fn purge_chunk(client: &reqwest::Client, endpoint: &str, chunk: &[String]) {
    for attempt in 1..=MAX_ATTEMPTS {
        match client.post(endpoint).json(&json!({ "files": chunk })).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!("Purged {} URL(s) from CDN cache", chunk.len());
                    return;
                }
                let rate_limited = status.as_u16() == 429;
                warn!(
                    "CDN purge attempt {}/{} failed with status {}",
                    attempt, MAX_ATTEMPTS, status
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(if rate_limited {
                        RATE_LIMIT_BACKOFF
                    } else {
                        ERROR_BACKOFF
                    })
                    .await;
                }
            }
            Err(e) => {
                warn!(
                    "CDN purge attempt {}/{} failed: {}",
                    attempt, MAX_ATTEMPTS, e
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
    error!(
        "Giving up on CDN purge for {} URL(s) after {} attempts",
        chunk.len(),
        MAX_ATTEMPTS
    );
}

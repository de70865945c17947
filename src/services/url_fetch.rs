use crate::api::error::AppError;
use crate::config::Config;
use crate::utils::validation::{extname, sanitize_original};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

/// A remote download staged on disk under a provisional `.tmp` name.
#[derive(Debug)]
pub struct FetchedUrl {
    pub size: u64,
    /// BLAKE3 hex digest, empty when hashing is disabled.
    pub hash: String,
    /// Extension derived from Content-Disposition or the URL path.
    pub extension: String,
    /// Derived original file name.
    pub original: String,
    pub mime: String,
}

/// Downloads remote URLs into the upload pipeline.
///
/// One deadline covers HEAD and GET together: the budget is kept short on
/// purpose so upstream proxies never see an idle socket long enough to evict
/// it, and the HEAD time is subtracted from what the GET may use.
pub struct UrlFetcher {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl UrlFetcher {
    pub fn new(config: Arc<Config>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stashbin/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Apply the configured URL-proxy template, if any.
    fn rewrite(&self, url: &str) -> String {
        match &self.config.url_proxy {
            Some(template) => {
                let noprot = url
                    .strip_prefix("https://")
                    .or_else(|| url.strip_prefix("http://"))
                    .unwrap_or(url);
                template
                    .replace("{url}", &encode_component(url))
                    .replace("{url-noprot}", &encode_component(noprot))
            }
            None => url.to_string(),
        }
    }

    /// Download `url` into `tmp_path`. On any failure the temp file is
    /// removed before the error propagates.
    pub async fn fetch(&self, url: &str, tmp_path: &Path) -> Result<FetchedUrl, AppError> {
        let result = self.fetch_inner(url, tmp_path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(tmp_path).await;
        }
        result
    }

    async fn fetch_inner(&self, url: &str, tmp_path: &Path) -> Result<FetchedUrl, AppError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| AppError::BadRequest(format!("Invalid URL: {url}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::BadRequest(
                "Only HTTP and HTTPS URLs are allowed.".to_string(),
            ));
        }

        let target = self.rewrite(url);
        let deadline = Instant::now() + Duration::from_secs(self.config.url_fetch_timeout_secs);

        // HEAD first: a declared Content-Length over the cap fails before any
        // bytes move. Servers that reject HEAD are tolerated.
        let head = tokio::time::timeout_at(deadline, self.client.head(&target).send())
            .await
            .map_err(|_| AppError::BadRequest("Fetch timed out.".to_string()))?;
        if let Ok(response) = head
            && let Some(length) = response.content_length()
            && length > self.config.url_max_size
        {
            return Err(AppError::PayloadTooLarge(format!(
                "File too large, size limit is {} bytes.",
                self.config.url_max_size
            )));
        }

        let response = tokio::time::timeout_at(deadline, self.client.get(&target).send())
            .await
            .map_err(|_| AppError::BadRequest("Fetch timed out.".to_string()))?
            .map_err(|e| AppError::BadRequest(format!("Failed to fetch URL: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::BadRequest(format!(
                "URL responded with status {}.",
                response.status()
            )));
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .unwrap_or("application/octet-stream")
            .trim()
            .to_string();

        let disposition_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);

        // The real name comes from Content-Disposition when present, the URL
        // path otherwise; the extension re-checks the filter after transfer.
        let original = disposition_name
            .or_else(|| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
            })
            .map(|s| sanitize_original(&s))
            .unwrap_or_else(|| "blob".to_string());
        let extension = extname(&original);

        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = self.config.hashing.then(blake3::Hasher::new);
        let mut size = 0u64;
        let mut body = response;

        loop {
            let chunk = tokio::time::timeout_at(deadline, body.chunk())
                .await
                .map_err(|_| AppError::BadRequest("Fetch timed out.".to_string()))?
                .map_err(|e| AppError::BadRequest(format!("Failed to read URL body: {e}")))?;
            let Some(chunk) = chunk else {
                break;
            };
            size += chunk.len() as u64;
            if size > self.config.url_max_size {
                return Err(AppError::PayloadTooLarge(format!(
                    "File too large, size limit is {} bytes.",
                    self.config.url_max_size
                )));
            }
            file.write_all(&chunk).await?;
            if let Some(h) = hasher.as_mut() {
                h.update(&chunk);
            }
        }
        file.flush().await?;

        // Content-Length lies happen; the written byte count is what binds.
        if size > self.config.url_max_size {
            return Err(AppError::PayloadTooLarge(format!(
                "File too large, size limit is {} bytes.",
                self.config.url_max_size
            )));
        }

        debug!("Fetched {} ({} bytes) from {}", original, size, url);

        Ok(FetchedUrl {
            size,
            hash: hasher
                .map(|h| h.finalize().to_hex().to_string())
                .unwrap_or_default(),
            extension,
            original,
            mime,
        })
    }
}

/// Extract `filename="..."` (or bare `filename=...`) from Content-Disposition.
fn parse_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Percent-encode a string for use inside a query component.
fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_filename_parsing() {
        assert_eq!(
            parse_disposition_filename(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            parse_disposition_filename("inline; filename=data.bin"),
            Some("data.bin".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn component_encoding() {
        assert_eq!(
            encode_component("https://a.b/c d"),
            "https%3A%2F%2Fa.b%2Fc%20d"
        );
        assert_eq!(encode_component("safe-._~"), "safe-._~");
    }

    #[test]
    fn proxy_rewrite() {
        let config = Arc::new(Config {
            url_proxy: Some("https://proxy.example/?u={url-noprot}".to_string()),
            ..Config::default()
        });
        let fetcher = UrlFetcher::new(config).unwrap();
        assert_eq!(
            fetcher.rewrite("https://cdn.example/file.png"),
            "https://proxy.example/?u=cdn.example%2Ffile.png"
        );
    }

    #[test]
    fn no_proxy_passthrough() {
        let fetcher = UrlFetcher::new(Arc::new(Config::default())).unwrap();
        assert_eq!(fetcher.rewrite("https://x/y"), "https://x/y");
    }
}

use crate::config::Config;
use anyhow::{Result, anyhow};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Outcome of scanning one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { threats: Vec<String> },
    /// The engine could not produce a verdict (limits, parse error, ...).
    Unscannable { reason: String },
}

#[async_trait::async_trait]
pub trait Scanner: Send + Sync {
    /// Scan a byte stream. Used as the in-line passthrough during ingestion.
    async fn scan_stream(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanVerdict>;

    /// Scan a file already on disk. Used for chunked uploads, where the
    /// bytes arrived across requests, and for URL downloads.
    async fn scan_path(&self, path: &Path) -> Result<ScanVerdict>;

    async fn health_check(&self) -> bool;
}

/// ClamAV daemon (clamd) over TCP using the INSTREAM command.
pub struct ClamAvScanner {
    host: String,
    port: u16,
}

/// Byte cap per INSTREAM frame.
const INSTREAM_CHUNK: usize = 1024 * 1024;
/// Hard ceiling on one scan, matched to clamd's own limits.
const SCAN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }

    async fn instream(&self, mut reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanVerdict> {
        let mut stream = self.connect().await?;
        stream.write_all(b"zINSTREAM\0").await?;

        let mut buffer = vec![0u8; INSTREAM_CHUNK];
        let mut total_sent = 0usize;
        let mut write_error = None;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                if write_error.is_none() {
                    if let Err(e) = stream.write_all(&0u32.to_be_bytes()).await {
                        write_error = Some(e);
                    }
                    let _ = stream.flush().await;
                }
                break;
            }

            // clamd may close the socket early once it has seen enough (for
            // example right after a signature hit). Keep draining the source
            // and read whatever verdict it left for us below.
            if write_error.is_none() {
                let frame = (n as u32).to_be_bytes();
                let res = async {
                    stream.write_all(&frame).await?;
                    stream.write_all(&buffer[..n]).await
                }
                .await;
                if let Err(e) = res {
                    debug!("ClamAV stopped reading after {} bytes: {}", total_sent, e);
                    write_error = Some(e);
                }
            }
            total_sent += n;
        }

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.ok();

        let response = String::from_utf8_lossy(&response);
        let response = response.trim_end_matches('\0').trim();
        debug!("ClamAV response: '{}'", response);

        if response.is_empty() {
            if let Some(e) = write_error {
                return Err(anyhow!(
                    "ClamAV closed the connection without a verdict ({} bytes sent): {}",
                    total_sent,
                    e
                ));
            }
            return Err(anyhow!("ClamAV returned no response"));
        }

        if response.ends_with("OK") {
            Ok(ScanVerdict::Clean)
        } else if response.contains("FOUND") {
            let threat = response
                .rsplit_once(':')
                .map(|(_, v)| v.trim().trim_end_matches(" FOUND").trim())
                .unwrap_or("Unknown threat")
                .to_string();
            Ok(ScanVerdict::Infected {
                threats: vec![threat],
            })
        } else {
            Ok(ScanVerdict::Unscannable {
                reason: response.to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl Scanner for ClamAvScanner {
    async fn scan_stream(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanVerdict> {
        match tokio::time::timeout(SCAN_TIMEOUT, self.instream(reader)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ClamAV scan timed out")),
        }
    }

    async fn scan_path(&self, path: &Path) -> Result<ScanVerdict> {
        let file = tokio::fs::File::open(path).await?;
        self.scan_stream(Box::pin(file)).await
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// Scanner used when scanning is disabled.
pub struct NoOpScanner;

#[async_trait::async_trait]
impl Scanner for NoOpScanner {
    async fn scan_stream(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanVerdict> {
        Ok(ScanVerdict::Clean)
    }

    async fn scan_path(&self, _path: &Path) -> Result<ScanVerdict> {
        Ok(ScanVerdict::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub fn create_scanner(config: &Config) -> std::sync::Arc<dyn Scanner> {
    if config.scan_enabled {
        std::sync::Arc::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        ))
    } else {
        std::sync::Arc::new(NoOpScanner)
    }
}

/// Whether this upload skips scanning entirely.
pub fn should_bypass(config: &Config, user_rank: Option<i32>, ext: &str, size: Option<u64>) -> bool {
    if !config.scan_enabled {
        return true;
    }
    if user_rank.is_some_and(|rank| rank >= config.scan_bypass_rank) {
        return true;
    }
    if config.scan_whitelist.iter().any(|e| e == ext) {
        return true;
    }
    if size.is_some_and(|s| s > config.scan_max_size) {
        return true;
    }
    false
}

/// Collapse per-file verdicts into a request-level rejection, if any.
/// Infections win over unscannable files; the message names the first threat
/// and notes when there are more.
pub fn aggregate_verdicts(verdicts: &[ScanVerdict]) -> Option<String> {
    let mut threats: Vec<&str> = Vec::new();
    let mut unscannable = false;

    for verdict in verdicts {
        match verdict {
            ScanVerdict::Clean => {}
            ScanVerdict::Infected { threats: t } => {
                threats.extend(t.iter().map(|s| s.as_str()));
            }
            ScanVerdict::Unscannable { reason } => {
                warn!("Unscannable file in batch: {}", reason);
                unscannable = true;
            }
        }
    }

    if let Some(first) = threats.first() {
        let suffix = if threats.len() > 1 { ", and more" } else { "" };
        return Some(format!("Threat found: {first}{suffix}."));
    }
    if unscannable {
        return Some("Unable to scan the files.".to_string());
    }
    None
}

/// Scanner doubles for the test suites.
pub mod testing {
    use super::*;

    /// Always reports the EICAR test signature.
    pub struct AlwaysInfectedScanner;

    #[async_trait::async_trait]
    impl Scanner for AlwaysInfectedScanner {
        async fn scan_stream(
            &self,
            _reader: Pin<Box<dyn AsyncRead + Send>>,
        ) -> Result<ScanVerdict> {
            Ok(ScanVerdict::Infected {
                threats: vec!["Eicar-Test-Signature".to_string()],
            })
        }

        async fn scan_path(&self, _path: &Path) -> Result<ScanVerdict> {
            Ok(ScanVerdict::Infected {
                threats: vec!["Eicar-Test-Signature".to_string()],
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_scanner_is_clean() {
        let scanner = NoOpScanner;
        let reader = Box::pin(std::io::Cursor::new(b"anything".to_vec()));
        assert_eq!(scanner.scan_stream(reader).await.unwrap(), ScanVerdict::Clean);
        assert!(scanner.health_check().await);
    }

    #[test]
    fn aggregate_prefers_infections() {
        let verdicts = vec![
            ScanVerdict::Clean,
            ScanVerdict::Unscannable {
                reason: "limit".to_string(),
            },
            ScanVerdict::Infected {
                threats: vec!["Worm.A".to_string()],
            },
        ];
        let msg = aggregate_verdicts(&verdicts).unwrap();
        assert!(msg.contains("Worm.A"));
        assert!(!msg.contains("and more"));
    }

    #[test]
    fn aggregate_notes_additional_threats() {
        let verdicts = vec![
            ScanVerdict::Infected {
                threats: vec!["Worm.A".to_string()],
            },
            ScanVerdict::Infected {
                threats: vec!["Worm.B".to_string()],
            },
        ];
        let msg = aggregate_verdicts(&verdicts).unwrap();
        assert!(msg.contains("Worm.A"));
        assert!(msg.contains("and more"));
    }

    #[test]
    fn aggregate_reports_unscannable() {
        let verdicts = vec![
            ScanVerdict::Clean,
            ScanVerdict::Unscannable {
                reason: "size limit exceeded".to_string(),
            },
        ];
        assert_eq!(
            aggregate_verdicts(&verdicts).unwrap(),
            "Unable to scan the files."
        );
    }

    #[test]
    fn aggregate_clean_batch() {
        assert_eq!(aggregate_verdicts(&[ScanVerdict::Clean]), None);
        assert_eq!(aggregate_verdicts(&[]), None);
    }

    #[test]
    fn bypass_policy() {
        let config = Config {
            scan_enabled: true,
            scan_whitelist: vec![".txt".to_string()],
            scan_max_size: 1000,
            ..Config::default()
        };
        assert!(should_bypass(&config, Some(100), ".bin", Some(10)));
        assert!(should_bypass(&config, None, ".txt", Some(10)));
        assert!(should_bypass(&config, None, ".bin", Some(2000)));
        assert!(!should_bypass(&config, Some(0), ".bin", Some(10)));

        let disabled = Config::default();
        assert!(should_bypass(&disabled, None, ".bin", None));
    }
}

//! Retrieval of the schedule page.
//!
//! The page is served in a legacy single-byte encoding without a reliable
//! charset header, so the body is always decoded with the configured
//! encoding instead of being sniffed.

use async_trait::async_trait;
use encoding_rs::Encoding;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::FetchError;

/// Source of schedule page markup.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the decoded page.
    async fn fetch(&self) -> Result<String, FetchError>;

    /// Where the page comes from, for log lines.
    fn describe(&self) -> String;
}

/// Fetches the page over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    encoding: &'static Encoding,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("schedule-watch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            encoding: config.encoding()?,
            timeout_secs: config.timeout_secs,
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: self.url.clone(),
                secs: self.timeout_secs,
            }
        } else {
            FetchError::Network {
                url: self.url.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<String, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok(decode(&body, self.encoding))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads a saved copy of the page from disk.
pub struct FileFetcher {
    path: PathBuf,
    encoding: &'static Encoding,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>, encoding: &'static Encoding) -> Self {
        Self {
            path: path.into(),
            encoding,
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self) -> Result<String, FetchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(decode(&bytes, self.encoding))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Decodes with a fixed encoding. Malformed sequences become U+FFFD.
pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _had_errors) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_windows_1251() {
        // "Свободно" in windows-1251
        let bytes = [0xD1, 0xE2, 0xEE, 0xE1, 0xEE, 0xE4, 0xED, 0xEE];
        assert_eq!(decode(&bytes, encoding_rs::WINDOWS_1251), "Свободно");
    }

    #[test]
    fn test_decode_ignores_utf8_bom() {
        let bytes = [0xEF, 0xBB, 0xBF, b'a'];
        let text = decode(&bytes, encoding_rs::WINDOWS_1251);
        assert_eq!(text.chars().count(), 4);
    }

    #[tokio::test]
    async fn test_file_fetcher() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("page.htm");
        std::fs::write(&path, [0xCF, 0xED]).unwrap();

        let fetcher = FileFetcher::new(&path, encoding_rs::WINDOWS_1251);
        assert_eq!(fetcher.fetch().await.unwrap(), "Пн");
        assert!(fetcher.describe().ends_with("page.htm"));
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_file() {
        let fetcher = FileFetcher::new("/nonexistent/page.htm", encoding_rs::UTF_8);
        assert!(matches!(fetcher.fetch().await, Err(FetchError::Io { .. })));
    }
}

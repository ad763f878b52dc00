use futures_util::StreamExt;
use log::debug;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{MediaError, MediaResult};

const MAX_REDIRECTS: usize = 5;

/// Raw bytes fetched from a remote source plus the content type the server
/// reported, if any.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Streaming HTTP fetcher with a hard byte cap. SSRF screening of the target
/// happens before this layer; the downloader only refuses non-HTTP schemes.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    max_bytes: usize,
}

impl Downloader {
    pub fn new(cfg: &HttpConfig) -> MediaResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Downloader {
            client,
            max_bytes: cfg.max_bytes,
        })
    }

    pub async fn download(&self, url: &Url) -> MediaResult<Download> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(MediaError::validation(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::DownloadFailed {
                status: status.as_u16(),
                reason: format!("GET {url} returned {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            // Abort the instant the cumulative size crosses the cap.
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(MediaError::DownloadTooLarge {
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(MediaError::DownloadFailed {
                status: status.as_u16(),
                reason: format!("GET {url} returned an empty body"),
            });
        }

        debug!("downloaded {} bytes from {url}", bytes.len());
        Ok(Download {
            bytes,
            content_type,
        })
    }
}

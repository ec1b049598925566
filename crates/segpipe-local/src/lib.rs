use segpipe_core::{Error, Result, TokenizationResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub mod extract;
pub mod lexer;
pub mod limiter;
pub mod oauth;
pub mod pipeline;

pub use limiter::RateLimiter;
pub use pipeline::{Segmenter, TracingProgress};

#[derive(Debug, Clone)]
struct CacheEntry {
    result: TokenizationResult,
    stored_at: Instant,
}

/// Process-lifetime cache of provider results keyed by a hash of the request text.
///
/// Entries expire `ttl` after they were stored. Expiry is lazy: an entry is only checked
/// (and evicted) when it is read.
#[derive(Debug)]
pub struct SegmentCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SegmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key_for_text(text: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"text:");
        h.update(text.as_bytes());
        hex::encode(h.finalize())
    }

    pub fn get(&self, text: &str) -> Option<TokenizationResult> {
        let key = Self::key_for_text(text);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = entries
            .get(&key)
            .map(|e| e.stored_at.elapsed() < self.ttl)?;
        if !fresh {
            entries.remove(&key);
            return None;
        }
        entries.get(&key).map(|e| e.result.clone())
    }

    /// Store unconditionally, replacing any previous entry for the same text.
    pub fn put(&self, text: &str, result: &TokenizationResult) {
        let key = Self::key_for_text(text);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared HTTP client with the timeouts every provider call relies on.
pub fn default_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("segpipe-local/0.1")
        .redirect(reqwest::redirect::Policy::limited(10))
        // Per-request timeouts are not enforced above this layer.
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Network(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
}

/// GET a page for extraction, reading at most `max_bytes` of the body.
pub async fn fetch_html(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<FetchedPage> {
    let url = url::Url::parse(url).map_err(|e| Error::InvalidInput(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidInput(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let final_url = resp.url().to_string();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    if !status.is_success() {
        return Err(Error::Network(format!("page fetch HTTP {status}")));
    }

    let mut truncated = false;
    let mut bytes = Vec::new();
    let mut stream = resp.bytes_stream();
    use futures_util::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
        if bytes.len().saturating_add(chunk.len()) > max_bytes {
            let can_take = max_bytes.saturating_sub(bytes.len());
            bytes.extend_from_slice(&chunk[..can_take]);
            truncated = true;
            break;
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(FetchedPage {
        final_url,
        status: status.as_u16(),
        content_type,
        body: String::from_utf8_lossy(&bytes).to_string(),
        truncated,
    })
}

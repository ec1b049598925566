use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod chunk;
pub mod layout;
pub mod paragraph;
pub mod reconcile;
pub mod text;

pub use chunk::{estimate_chunk_count, plan_chunks, Chunk};
pub use paragraph::{Paragraph, ParagraphIndex};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("extract failed: {0}")]
    Extract(String),
    #[error("no tokens produced: {0}")]
    NoTokens(String),
}

impl Error {
    /// The only classification the retry orchestrator looks at.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Keywords that mark an error message (or raw HTTP body) as a provider rate-limit signal.
const RATE_LIMIT_KEYWORDS: [&str; 4] = ["qps", "rate limit", "too many requests", "limit reached"];

/// Best-effort text heuristic shared by the lexer adapter (error payloads, HTTP bodies)
/// and transport-error classification.
pub fn mentions_rate_limit(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    RATE_LIMIT_KEYWORDS.iter().any(|k| s.contains(k))
}

/// One item as returned by the provider, before any position is known.
///
/// `item` is the token text; every other provider field (pos tags, ne, byte offsets, ...)
/// is kept verbatim in `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawItem {
    #[serde(default)]
    pub item: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawItem {
    pub fn new(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            fields: serde_json::Map::new(),
        }
    }
}

/// Normalized provider reply for one chunk: a single `items` list regardless of which
/// field name the provider used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenizationResult {
    pub items: Vec<RawItem>,
}

/// A provider token with its reconciled position in the full source text.
///
/// `start`/`end` are char offsets into the text passed to the segmenter; they stay `None`
/// when no match was found. `paragraph_index` indexes `SegmentOutput::paragraph_positions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub text: String,
    pub paragraph_index: Option<usize>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl Token {
    pub fn unpositioned(raw: RawItem) -> Self {
        Self {
            text: raw.item,
            paragraph_index: None,
            start: None,
            end: None,
            raw: raw.fields,
        }
    }

    pub fn is_positioned(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Outbound contract to the UI: merged tokens plus the paragraph position table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SegmentOutput {
    pub items: Vec<Token>,
    pub paragraph_positions: Vec<Paragraph>,
}

/// An image found next to the extracted text.
///
/// `position` is the index of the paragraph the image follows; `-1` marks a header image
/// that precedes all text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub src: String,
    #[serde(default)]
    pub alt: String,
    pub position: i64,
}

/// Inbound contract from content extraction: `\n`-joined blocks plus images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContentData {
    pub text: String,
    pub images: Vec<Image>,
}

#[async_trait::async_trait]
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn tokenize(&self, text: &str, access_token: &str) -> Result<TokenizationResult>;
}

#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A bearer that was acquired out of band.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(Error::TokenAcquisition("empty access token".to_string()));
        }
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Planned {
        text_chars: usize,
        chunks: usize,
        estimated_chunks: usize,
    },
    /// `index`/`total` count against the first plan, so a resumed pass continues the numbering.
    ChunkStarted {
        index: usize,
        total: usize,
        start: usize,
        end: usize,
    },
    ChunkDone {
        index: usize,
        total: usize,
        tokens: usize,
    },
    CacheHit {
        chars: usize,
    },
    Backoff {
        attempt: u32,
        wait: Duration,
        remainder_start: usize,
    },
    FrameStarted {
        start: usize,
        retry: u32,
    },
    Warning {
        chunk: Option<usize>,
        message: String,
        dismiss_after: Duration,
    },
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressEvent::Planned {
                text_chars,
                chunks,
                estimated_chunks,
            } => write!(
                f,
                "planned {chunks} chunk(s) for {text_chars} chars (estimate {estimated_chunks})"
            ),
            ProgressEvent::ChunkStarted { index, total, .. } => {
                write!(f, "chunk {}/{}", index + 1, total)
            }
            ProgressEvent::ChunkDone {
                index,
                total,
                tokens,
            } => write!(f, "chunk {}/{} done: {tokens} tokens", index + 1, total),
            ProgressEvent::CacheHit { chars } => write!(f, "cache hit ({chars} chars)"),
            ProgressEvent::Backoff {
                attempt,
                wait,
                remainder_start,
            } => write!(
                f,
                "rate limited; retry {attempt} in {}ms from offset {remainder_start}",
                wait.as_millis()
            ),
            ProgressEvent::FrameStarted { start, retry } => {
                write!(f, "resuming at offset {start} (retry {retry})")
            }
            ProgressEvent::Warning { message, .. } => f.write_str(message),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Upper bound on chunk length in chars (provider ceiling is in bytes; keep headroom).
    pub max_chunk_chars: usize,
    /// Minimum spacing between provider calls, measured from the previous completion.
    pub min_interval_ms: u64,
    /// Unconditional pause between consecutive chunks.
    pub chunk_delay_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_retries: u32,
    pub cache_ttl_s: u64,
    /// How long a UI should keep a warning visible.
    pub warning_display_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 15_000,
            min_interval_ms: 1_000,
            chunk_delay_ms: 500,
            retry_backoff_ms: 2_000,
            max_retries: 3,
            cache_ttl_s: 30 * 60,
            warning_display_ms: 5_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

impl SegmentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_chunk_chars: env_parse("SEGPIPE_MAX_CHUNK_CHARS").unwrap_or(d.max_chunk_chars),
            min_interval_ms: env_parse("SEGPIPE_MIN_INTERVAL_MS").unwrap_or(d.min_interval_ms),
            chunk_delay_ms: env_parse("SEGPIPE_CHUNK_DELAY_MS").unwrap_or(d.chunk_delay_ms),
            retry_backoff_ms: env_parse("SEGPIPE_RETRY_BACKOFF_MS").unwrap_or(d.retry_backoff_ms),
            max_retries: env_parse("SEGPIPE_MAX_RETRIES").unwrap_or(d.max_retries),
            cache_ttl_s: env_parse("SEGPIPE_CACHE_TTL_S").unwrap_or(d.cache_ttl_s),
            warning_display_ms: env_parse("SEGPIPE_WARNING_DISPLAY_MS")
                .unwrap_or(d.warning_display_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_chars == 0 {
            return Err(Error::InvalidInput(
                "max_chunk_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s)
    }

    pub fn warning_display(&self) -> Duration {
        Duration::from_millis(self.warning_display_ms)
    }
}

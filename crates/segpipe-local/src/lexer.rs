//! Client for a Baidu-style lexer endpoint.
//!
//! Wire contract:
//! - `POST <endpoint>?charset=UTF-8&access_token=<token>` with `{"text": "..."}`
//! - success: `{"items": [{"item": "..."}, ...]}` or `{"lexical_analysis": [...]}`
//! - failure: `{"error_code": 17, "error_msg": "..."}`

use segpipe_core::{mentions_rate_limit, Error, RawItem, Result, TokenizationResult, Tokenizer};
use serde::Deserialize;
use std::time::Instant;

/// Provider codes that mean "slow down" (17: request limit, 18: qps limit).
const RATE_LIMIT_CODES: [i64; 2] = [17, 18];

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct LexerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl LexerClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint from `SEGPIPE_LEXER_ENDPOINT`, defaulting to the public Baidu lexer.
    pub fn from_env(client: reqwest::Client) -> Self {
        let endpoint = env("SEGPIPE_LEXER_ENDPOINT")
            .unwrap_or_else(|| "https://aip.baidubce.com/rpc/2.0/nlp/v1/lexer".to_string());
        Self::new(client, endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Tokenizer for LexerClient {
    fn name(&self) -> &'static str {
        "lexer"
    }

    async fn tokenize(&self, text: &str, access_token: &str) -> Result<TokenizationResult> {
        let t0 = Instant::now();
        tracing::debug!(chars = text.chars().count(), bytes = text.len(), "lexer request");
        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("charset", "UTF-8"), ("access_token", access_token)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| classify_transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| classify_transport(e.to_string()))?;
        if !status.is_success() {
            if status.as_u16() == 429 || mentions_rate_limit(&body) {
                return Err(Error::RateLimited(format!("lexer HTTP {status}")));
            }
            return Err(Error::Provider(format!("lexer HTTP {status}")));
        }

        let reply = parse_reply(&body)?;
        let result = reply.into_result()?;
        if result.items.is_empty() {
            tracing::warn!("lexer returned an empty item list");
        }
        tracing::debug!(
            items = result.items.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "lexer response"
        );
        Ok(result)
    }
}

fn classify_transport(msg: String) -> Error {
    if mentions_rate_limit(&msg) {
        Error::RateLimited(msg)
    } else {
        Error::Network(msg)
    }
}

/// Everything the provider may put at the top level; which fields are set decides the shape.
#[derive(Debug, Deserialize)]
struct LexerPayload {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    items: Option<Vec<RawItem>>,
    #[serde(default)]
    lexical_analysis: Option<Vec<RawItem>>,
}

/// Provider reply after shape normalization.
#[derive(Debug, PartialEq)]
enum LexerReply {
    Items(Vec<RawItem>),
    Failure { code: i64, message: String },
}

impl LexerReply {
    fn into_result(self) -> Result<TokenizationResult> {
        match self {
            LexerReply::Items(items) => Ok(TokenizationResult { items }),
            LexerReply::Failure { code, message } => {
                if RATE_LIMIT_CODES.contains(&code) || mentions_rate_limit(&message) {
                    Err(Error::RateLimited(format!("lexer error {code}: {message}")))
                } else {
                    Err(Error::Provider(format!("lexer error {code}: {message}")))
                }
            }
        }
    }
}

fn parse_reply(body: &str) -> Result<LexerReply> {
    let p: LexerPayload = serde_json::from_str(body)
        .map_err(|e| Error::Provider(format!("malformed lexer payload: {e}")))?;
    // error_code 0 is not an error.
    if let Some(code) = p.error_code.filter(|c| *c != 0) {
        return Ok(LexerReply::Failure {
            code,
            message: p.error_msg.unwrap_or_default(),
        });
    }
    match p.items.or(p.lexical_analysis) {
        Some(items) => Ok(LexerReply::Items(items)),
        None => Err(Error::Provider(
            "lexer payload has neither items nor lexical_analysis".to_string(),
        )),
    }
}

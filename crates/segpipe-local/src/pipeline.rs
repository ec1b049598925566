//! Chunked segmentation with position-preserving reassembly and bounded rate-limit retry.
//!
//! A rate-limited chunk does not fail the extraction: after a fixed backoff the unprocessed
//! remainder (from that chunk's start) is planned and segmented again with `retry + 1`.
//! Instead of recursing, each resubmission is a [`Frame`] on an explicit stack; tokens
//! produced inside a frame are remainder-relative and get rebased onto the full text.

use crate::limiter::RateLimiter;
use crate::SegmentCache;
use segpipe_core::reconcile::{complete_positions, rebase, reconcile_chunk};
use segpipe_core::text::CharIndex;
use segpipe_core::{
    estimate_chunk_count, plan_chunks, Error, NoopProgress, ParagraphIndex, ProgressEvent,
    ProgressSink, Result, SegmentConfig, SegmentOutput, TokenSource, TokenizationResult,
    Tokenizer,
};
use std::sync::Arc;

/// One pass over (a suffix of) the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    /// Char offset of the remainder in the full text.
    start: usize,
    retry: u32,
    /// Chunks already accounted for before this frame; keeps "chunk i/N" monotonic.
    base: usize,
}

pub struct Segmenter {
    tokenizer: Arc<dyn Tokenizer>,
    limiter: Arc<RateLimiter>,
    cache: Arc<SegmentCache>,
    cfg: SegmentConfig,
    progress: Arc<dyn ProgressSink>,
}

impl Segmenter {
    /// A segmenter with its own limiter and cache.
    pub fn new(tokenizer: Arc<dyn Tokenizer>, cfg: SegmentConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(cfg.min_interval()));
        let cache = Arc::new(SegmentCache::new(cfg.cache_ttl()));
        Self::with_shared(tokenizer, limiter, cache, cfg)
    }

    /// A segmenter that shares limiter and cache with others, so concurrent extractions
    /// still respect one provider-wide call spacing.
    pub fn with_shared(
        tokenizer: Arc<dyn Tokenizer>,
        limiter: Arc<RateLimiter>,
        cache: Arc<SegmentCache>,
        cfg: SegmentConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            tokenizer,
            limiter,
            cache,
            cfg,
            progress: Arc::new(NoopProgress),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.cfg
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    /// Acquire a token, then segment. No provider call is made if acquisition fails.
    pub async fn segment_with(&self, source: &dyn TokenSource, text: &str) -> Result<SegmentOutput> {
        let token = source.access_token().await.map_err(|e| match e {
            Error::TokenAcquisition(_) => e,
            other => Error::TokenAcquisition(other.to_string()),
        })?;
        self.segment(text, &token).await
    }

    /// Segment `text`, returning every non-blank token with its position (when one was
    /// found) and the paragraph table the positions refer to.
    ///
    /// Per-chunk failures are reported through the progress sink and skipped. The call only
    /// fails when no tokens were produced at all.
    pub async fn segment(&self, text: &str, access_token: &str) -> Result<SegmentOutput> {
        let global = ParagraphIndex::build(text);
        let chars = CharIndex::new(text);
        let max = self.cfg.max_chunk_chars;

        let mut merged = Vec::new();
        let mut last_err: Option<Error> = None;
        let mut frames = vec![Frame {
            start: 0,
            retry: 0,
            base: 0,
        }];

        while let Some(frame) = frames.pop() {
            if frame.retry > 0 {
                tracing::info!(start = frame.start, retry = frame.retry, "resuming remainder");
                self.progress.emit(ProgressEvent::FrameStarted {
                    start: frame.start,
                    retry: frame.retry,
                });
            }
            let remainder = &text[chars.byte_of(frame.start)..];
            let local = ParagraphIndex::build(remainder);
            let chunks = plan_chunks(remainder, local.paragraphs(), max);
            let total = frame.base + chunks.len();
            let estimated = estimate_chunk_count(local.text_chars(), max);
            tracing::info!(
                text_chars = local.text_chars(),
                chunks = total,
                estimated_chunks = estimated,
                "planned chunks"
            );
            self.progress.emit(ProgressEvent::Planned {
                text_chars: local.text_chars(),
                chunks: total,
                estimated_chunks: estimated,
            });

            for (k, chunk) in chunks.iter().enumerate() {
                let i = frame.base + k;
                if k > 0 {
                    tokio::time::sleep(self.cfg.chunk_delay()).await;
                }
                let (abs_start, abs_end) = (frame.start + chunk.start, frame.start + chunk.end);
                tracing::info!(start = abs_start, end = abs_end, "chunk {}/{}", i + 1, total);
                self.progress.emit(ProgressEvent::ChunkStarted {
                    index: i,
                    total,
                    start: abs_start,
                    end: abs_end,
                });

                match self.request(&chunk.text, access_token).await {
                    Ok(res) => {
                        let mut toks = reconcile_chunk(chunk, res.items, local.paragraphs());
                        rebase(&mut toks, frame.start, global.paragraphs());
                        tracing::info!(tokens = toks.len(), "chunk {}/{} done", i + 1, total);
                        self.progress.emit(ProgressEvent::ChunkDone {
                            index: i,
                            total,
                            tokens: toks.len(),
                        });
                        merged.extend(toks);
                    }
                    Err(e) if e.is_rate_limited() && frame.retry < self.cfg.max_retries => {
                        let wait = self.cfg.retry_backoff();
                        let attempt = frame.retry + 1;
                        tracing::warn!(
                            attempt,
                            max_retries = self.cfg.max_retries,
                            wait_ms = wait.as_millis() as u64,
                            remainder_start = abs_start,
                            "rate limited: {e}"
                        );
                        self.progress.emit(ProgressEvent::Backoff {
                            attempt,
                            wait,
                            remainder_start: abs_start,
                        });
                        tokio::time::sleep(wait).await;
                        frames.push(Frame {
                            start: abs_start,
                            retry: attempt,
                            base: i,
                        });
                        // The new frame owns everything from this chunk on.
                        break;
                    }
                    Err(e) => {
                        let message = format!("chunk {}/{} failed: {e}", i + 1, total);
                        tracing::warn!(start = abs_start, end = abs_end, "{message}");
                        self.progress.emit(ProgressEvent::Warning {
                            chunk: Some(i),
                            message,
                            dismiss_after: self.cfg.warning_display(),
                        });
                        last_err = Some(e);
                    }
                }
            }
        }

        let dropped = complete_positions(&mut merged, text, global.paragraphs());
        let unpositioned = merged.iter().filter(|t| !t.is_positioned()).count();
        tracing::info!(
            tokens = merged.len(),
            dropped_blank = dropped,
            unpositioned,
            paragraphs = global.len(),
            "segmentation finished"
        );

        if merged.is_empty() {
            let err = last_err
                .unwrap_or_else(|| Error::NoTokens(format!("{} chars of input", chars.char_len())));
            self.progress.emit(ProgressEvent::Warning {
                chunk: None,
                message: format!("segmentation produced no tokens: {err}"),
                dismiss_after: self.cfg.warning_display(),
            });
            return Err(err);
        }

        Ok(SegmentOutput {
            items: merged,
            paragraph_positions: global.into_paragraphs(),
        })
    }

    /// One provider request: cache first, then through the shared limiter.
    async fn request(&self, text: &str, access_token: &str) -> Result<TokenizationResult> {
        if let Some(hit) = self.cache.get(text) {
            let chars = text.chars().count();
            tracing::info!(chars, provider = self.tokenizer.name(), "cache hit");
            self.progress.emit(ProgressEvent::CacheHit { chars });
            return Ok(hit);
        }
        let res = self
            .limiter
            .run(|| self.tokenizer.tokenize(text, access_token))
            .await?;
        self.cache.put(text, &res);
        Ok(res)
    }
}

/// Progress sink that writes the "chunk i/N" style lines to the tracing log.
///
/// Backoffs and warnings are already logged at `warn` by the segmenter itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Backoff { .. } | ProgressEvent::Warning { .. } => {
                tracing::debug!(target: "segpipe::progress", "{event}")
            }
            _ => tracing::info!(target: "segpipe::progress", "{event}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segpipe_core::text::slice_chars;
    use segpipe_core::{RawItem, StaticToken};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct Call {
        text: String,
        started: Instant,
        finished: Instant,
    }

    /// Whitespace tokenizer with scripted failures by call number (0-based).
    #[derive(Default)]
    struct ScriptedTokenizer {
        calls: Mutex<Vec<Call>>,
        fail_on: Mutex<HashMap<usize, Error>>,
        always: Option<Error>,
        latency: Duration,
    }

    impl ScriptedTokenizer {
        fn failing_on(pairs: Vec<(usize, Error)>) -> Self {
            Self {
                fail_on: Mutex::new(pairs.into_iter().collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Tokenizer for ScriptedTokenizer {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn tokenize(&self, text: &str, access_token: &str) -> Result<TokenizationResult> {
            assert_eq!(access_token, "tok");
            let started = Instant::now();
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call {
                    text: text.to_string(),
                    started,
                    finished: Instant::now(),
                });
                calls.len() - 1
            };
            if let Some(e) = self.always.clone() {
                return Err(e);
            }
            if let Some(e) = self.fail_on.lock().unwrap().remove(&n) {
                return Err(e);
            }
            Ok(TokenizationResult {
                items: text.split_whitespace().map(RawItem::new).collect(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<ProgressEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    fn segmenter(tok: Arc<ScriptedTokenizer>, rec: Arc<Recorder>) -> Segmenter {
        Segmenter::new(tok, SegmentConfig::default())
            .unwrap()
            .with_progress(rec)
    }

    /// 32,000 chars of unique 8-char words, 11 per line.
    fn long_text() -> String {
        let mut lines = Vec::new();
        let mut n = 0usize;
        let mut len = 0usize;
        while len < 32_000 {
            let words: Vec<String> = (0..11)
                .map(|_| {
                    n += 1;
                    format!("w{n:07}")
                })
                .collect();
            let line = words.join(" ");
            len += line.len() + 1;
            lines.push(line);
        }
        lines.join("\n").chars().take(32_000).collect()
    }

    fn assert_positions_sound(text: &str, out: &SegmentOutput) {
        for t in &out.items {
            let (Some(s), Some(e)) = (t.start, t.end) else {
                panic!("unpositioned token {:?}", t.text)
            };
            assert_eq!(slice_chars(text, s, e), t.text);
            let p = &out.paragraph_positions[t.paragraph_index.expect("paragraph")];
            assert!(p.start <= s && s < p.end);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_chunk_tokens_resolve_to_both_paragraphs() {
        let tok = Arc::new(ScriptedTokenizer::default());
        let rec = Arc::new(Recorder::default());
        let cfg = SegmentConfig {
            max_chunk_chars: 1000,
            ..Default::default()
        };
        let seg = Segmenter::new(tok.clone(), cfg).unwrap().with_progress(rec.clone());
        let text = "Hello world.\n\nThis is paragraph two.";

        let out = seg.segment(text, "tok").await.unwrap();
        assert_eq!(tok.calls().len(), 1);
        assert_eq!(out.paragraph_positions.len(), 2);
        assert_eq!(
            (out.paragraph_positions[1].start, out.paragraph_positions[1].end),
            (14, 36)
        );
        assert_eq!(out.items.len(), 6);
        assert!(out
            .items
            .iter()
            .all(|t| matches!(t.paragraph_index, Some(0) | Some(1))));
        assert_positions_sound(text, &out);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_middle_chunk_resumes_remainder_with_global_offsets() {
        let text = long_text();
        assert_eq!(text.chars().count(), 32_000);
        let idx = ParagraphIndex::build(&text);
        let plan = plan_chunks(&text, idx.paragraphs(), 15_000);
        assert_eq!(plan.len(), 3);

        let tok = Arc::new(ScriptedTokenizer::failing_on(vec![(
            1,
            Error::RateLimited("lexer error 17".to_string()),
        )]));
        let rec = Arc::new(Recorder::default());
        let seg = segmenter(tok.clone(), rec.clone());

        let out = seg.segment(&text, "tok").await.unwrap();

        let calls = tok.calls();
        let texts: Vec<&str> = calls.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                plan[0].text.as_str(),
                plan[1].text.as_str(),
                plan[1].text.as_str(),
                plan[2].text.as_str()
            ]
        );
        assert!(calls[2].started - calls[1].finished >= Duration::from_millis(2000));

        let events = rec.events();
        let backoffs: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Backoff { .. }))
            .collect();
        assert_eq!(
            backoffs,
            vec![&ProgressEvent::Backoff {
                attempt: 1,
                wait: Duration::from_millis(2000),
                remainder_start: plan[1].start,
            }]
        );
        assert!(events.contains(&ProgressEvent::FrameStarted {
            start: plan[1].start,
            retry: 1
        }));
        // The resumed pass keeps counting against the original plan.
        let progress: Vec<String> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::ChunkStarted { .. }))
            .map(|e| e.to_string())
            .collect();
        assert_eq!(progress, vec!["chunk 1/3", "chunk 2/3", "chunk 2/3", "chunk 3/3"]);

        assert_eq!(out.items.len(), text.split_whitespace().count());
        assert_positions_sound(&text, &out);
        assert!(out
            .items
            .iter()
            .any(|t| t.start.unwrap() >= plan[2].start));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_limit_stops_after_max_retries() {
        let tok = Arc::new(ScriptedTokenizer {
            always: Some(Error::RateLimited("qps".to_string())),
            ..Default::default()
        });
        let rec = Arc::new(Recorder::default());
        let seg = segmenter(tok.clone(), rec.clone());

        let err = seg.segment("just one chunk", "tok").await.unwrap_err();
        assert!(err.is_rate_limited());
        // First attempt plus three resubmissions.
        assert_eq!(tok.calls().len(), 4);
        let frames = rec
            .events()
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::FrameStarted { .. }))
            .count();
        assert_eq!(frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_the_chunk_and_continue_with_the_next() {
        let text = long_text();
        let idx = ParagraphIndex::build(&text);
        let plan = plan_chunks(&text, idx.paragraphs(), 15_000);
        assert_eq!(plan.len(), 3);

        let rl = || Error::RateLimited("lexer error 18: qps".to_string());
        let tok = Arc::new(ScriptedTokenizer::failing_on(vec![
            (1, rl()),
            (2, rl()),
            (3, rl()),
            (4, rl()),
        ]));
        let rec = Arc::new(Recorder::default());
        let seg = segmenter(tok.clone(), rec.clone());

        let out = seg.segment(&text, "tok").await.unwrap();

        let calls = tok.calls();
        // Chunk 1, chunk 2 four times (first try plus three retries), then chunk 3.
        assert_eq!(calls.len(), 6);
        assert!(calls[1..5].iter().all(|c| c.text == plan[1].text));
        assert_eq!(calls.last().map(|c| c.text.as_str()), Some(plan[2].text.as_str()));

        let warnings: Vec<_> = rec
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Warning { chunk, message, .. } => Some((chunk, message)),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, Some(1));
        assert!(warnings[0].1.starts_with("chunk 2/3 failed"));

        let expected = plan[0].text.split_whitespace().count() + plan[2].text.split_whitespace().count();
        assert_eq!(out.items.len(), expected);
        assert!(out
            .items
            .iter()
            .all(|t| t.start.unwrap() < plan[1].start || t.start.unwrap() >= plan[2].start));
        assert_positions_sound(&text, &out);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_error_skips_chunk_and_keeps_partial_results() {
        let text = long_text();
        let idx = ParagraphIndex::build(&text);
        let plan = plan_chunks(&text, idx.paragraphs(), 15_000);

        let tok = Arc::new(ScriptedTokenizer::failing_on(vec![(
            1,
            Error::Provider("lexer error 282004: invalid parameter".to_string()),
        )]));
        let rec = Arc::new(Recorder::default());
        let seg = segmenter(tok.clone(), rec.clone());

        let out = seg.segment(&text, "tok").await.unwrap();
        assert_eq!(tok.calls().len(), 3);
        let expected = plan[0].text.split_whitespace().count() + plan[2].text.split_whitespace().count();
        assert_eq!(out.items.len(), expected);
        assert!(out
            .items
            .iter()
            .all(|t| t.start.unwrap() < plan[1].start || t.start.unwrap() >= plan[2].start));

        let warnings: Vec<_> = rec
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Warning {
                    chunk,
                    message,
                    dismiss_after,
                } => Some((chunk, message, dismiss_after)),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, Some(1));
        assert!(warnings[0].1.starts_with("chunk 2/3 failed"));
        assert_eq!(warnings[0].2, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn all_chunks_failing_is_a_failure() {
        let tok = Arc::new(ScriptedTokenizer {
            always: Some(Error::Provider("boom".to_string())),
            ..Default::default()
        });
        let seg = segmenter(tok.clone(), Arc::new(Recorder::default()));
        let err = seg.segment("some text", "tok").await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(tok.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_text_yields_no_tokens_error() {
        let tok = Arc::new(ScriptedTokenizer::default());
        let seg = segmenter(tok.clone(), Arc::new(Recorder::default()));
        assert!(matches!(
            seg.segment("", "tok").await,
            Err(Error::NoTokens(_))
        ));
        assert!(matches!(
            seg.segment(" \n\n ", "tok").await,
            Err(Error::NoTokens(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_text_within_ttl_hits_cache() {
        let text = long_text();
        let tok = Arc::new(ScriptedTokenizer::default());
        let rec = Arc::new(Recorder::default());
        let seg = segmenter(tok.clone(), rec.clone());

        let a = seg.segment(&text, "tok").await.unwrap();
        let first = tok.calls().len();
        let b = seg.segment(&text, "tok").await.unwrap();
        assert_eq!(tok.calls().len(), first);
        assert_eq!(seg.cache().len(), first);
        assert_eq!(a, b);
        assert!(rec
            .events()
            .iter()
            .any(|e| matches!(e, ProgressEvent::CacheHit { .. })));

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        seg.segment(&text, "tok").await.unwrap();
        assert_eq!(tok.calls().len(), first * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_calls_are_spaced_and_chunks_are_delayed() {
        let text = long_text();
        let tok = Arc::new(ScriptedTokenizer {
            latency: Duration::from_millis(50),
            ..Default::default()
        });
        let seg = segmenter(tok.clone(), Arc::new(Recorder::default()));
        seg.segment(&text, "tok").await.unwrap();

        let calls = tok.calls();
        assert_eq!(calls.len(), 3);
        for w in calls.windows(2) {
            assert!(w[1].started - w[0].finished >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn segmenters_sharing_a_limiter_never_overlap() {
        let cfg = SegmentConfig::default();
        let limiter = Arc::new(RateLimiter::new(cfg.min_interval()));
        let tok = Arc::new(ScriptedTokenizer {
            latency: Duration::from_millis(200),
            ..Default::default()
        });
        let a = Segmenter::with_shared(
            tok.clone(),
            limiter.clone(),
            Arc::new(SegmentCache::new(cfg.cache_ttl())),
            cfg.clone(),
        )
        .unwrap();
        let b = Segmenter::with_shared(
            tok.clone(),
            limiter,
            Arc::new(SegmentCache::new(cfg.cache_ttl())),
            cfg,
        )
        .unwrap();

        assert!(Arc::ptr_eq(a.limiter(), b.limiter()));
        assert_eq!(a.limiter().min_interval(), Duration::from_millis(1000));
        assert_eq!(b.config().min_interval_ms, 1000);

        let (ra, rb) = tokio::join!(a.segment("first tab text", "tok"), b.segment("second tab", "tok"));
        ra.unwrap();
        rb.unwrap();

        let mut calls = tok.calls();
        calls.sort_by_key(|c| c.started);
        assert_eq!(calls.len(), 2);
        assert!(calls[1].started - calls[0].finished >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn token_acquisition_failure_stops_before_any_provider_call() {
        let tok = Arc::new(ScriptedTokenizer::default());
        let seg = segmenter(tok.clone(), Arc::new(Recorder::default()));
        let err = seg
            .segment_with(&StaticToken(String::new()), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenAcquisition(_)));
        assert!(tok.calls().is_empty());

        let out = seg
            .segment_with(&StaticToken("tok".to_string()), "hello")
            .await
            .unwrap();
        assert_eq!(out.items[0].text, "hello");
    }

    #[test]
    fn zero_chunk_budget_is_rejected_at_construction() {
        let cfg = SegmentConfig {
            max_chunk_chars: 0,
            ..Default::default()
        };
        assert!(matches!(
            Segmenter::new(Arc::new(ScriptedTokenizer::default()), cfg),
            Err(Error::InvalidInput(_))
        ));
    }
}

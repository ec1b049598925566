use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segpipe_core::{layout, ContentData, SegmentConfig};
use segpipe_local::{extract, lexer::LexerClient, oauth, Segmenter, TracingProgress};
use std::io::Read;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "segpipe")]
#[command(about = "Chunked text segmentation through a remote lexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Segment text (file, URL, or stdin) and print tokens with positions (json).
    Segment(SegmentCmd),
    /// Extract readable text and images from an HTML page (json).
    Extract(ExtractCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct InputArgs {
    /// Read input from this file (default: stdin).
    #[arg(long, conflicts_with = "url")]
    file: Option<std::path::PathBuf>,
    /// Fetch this page and extract its main content first.
    #[arg(long)]
    url: Option<String>,
    /// Maximum bytes read from a fetched page.
    #[arg(long, default_value_t = 2_000_000)]
    max_bytes: usize,
}

#[derive(clap::Args, Debug)]
struct SegmentCmd {
    #[command(flatten)]
    input: InputArgs,
    /// Treat file/stdin input as HTML and run content extraction before segmenting.
    #[arg(long)]
    html: bool,
    /// Emit the paragraph-grouped view instead of the flat token list.
    #[arg(long)]
    grouped: bool,
    /// Chunk budget in chars.
    #[arg(long)]
    max_chunk_chars: Option<usize>,
    /// Rate-limit retries per extraction.
    #[arg(long)]
    max_retries: Option<u32>,
    /// Lexer endpoint (overrides SEGPIPE_LEXER_ENDPOINT).
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ExtractCmd {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// KEY=VALUE lines from `SEGPIPE_ENV_FILE`; existing process env wins and values are never logged.
fn load_env_file() {
    let Ok(p) = std::env::var("SEGPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("SEGPIPE_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolve the input to `ContentData`. URL input is always HTML.
async fn load_content(
    client: &reqwest::Client,
    input: &InputArgs,
    html: bool,
) -> Result<ContentData> {
    if let Some(url) = &input.url {
        let page = segpipe_local::fetch_html(client, url, input.max_bytes).await?;
        if page.truncated {
            tracing::warn!(max_bytes = input.max_bytes, url = %page.final_url, "page body truncated");
        }
        return Ok(extract::extract_content(&page.body)?);
    }
    let raw = match &input.file {
        Some(p) => {
            std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?
        }
        None => {
            let mut s = String::new();
            std::io::stdin()
                .read_to_string(&mut s)
                .context("read stdin")?;
            s
        }
    };
    if html {
        Ok(extract::extract_content(&raw)?)
    } else {
        Ok(ContentData {
            text: raw,
            images: Vec::new(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Segment(args) => {
            let client = segpipe_local::default_client()?;
            let content = load_content(&client, &args.input, args.html).await?;

            let mut cfg = SegmentConfig::from_env();
            if let Some(n) = args.max_chunk_chars {
                cfg.max_chunk_chars = n;
            }
            if let Some(n) = args.max_retries {
                cfg.max_retries = n;
            }

            let tokens = oauth::token_source_from_env(client.clone())?;
            let lexer = match args.endpoint {
                Some(e) => LexerClient::new(client, e),
                None => LexerClient::from_env(client),
            };
            let segmenter =
                Segmenter::new(Arc::new(lexer), cfg)?.with_progress(Arc::new(TracingProgress));
            let out = segmenter.segment_with(tokens.as_ref(), &content.text).await?;

            let v = if args.grouped {
                let view = layout::group_by_paragraph(&out, &content.images);
                serde_json::json!({
                    "schema_version": 1,
                    "kind": "segment_grouped",
                    "ok": true,
                    "view": view,
                })
            } else {
                serde_json::json!({
                    "schema_version": 1,
                    "kind": "segment",
                    "ok": true,
                    "items": out.items,
                    "paragraph_positions": out.paragraph_positions,
                    "images": content.images,
                })
            };
            println!("{v}");
        }
        Commands::Extract(args) => {
            let client = segpipe_local::default_client()?;
            let content = load_content(&client, &args.input, true).await?;
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "extract",
                "ok": true,
                "text": content.text,
                "images": content.images,
            });
            println!("{v}");
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "segpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("segpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}

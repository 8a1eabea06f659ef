use crate::constants::{API_KEY_ENV, DEFAULT_ENDPOINT, MAX_STREAM_LINES};
use crate::types::*;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Chat endpoint that answers with a server-sent event stream
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
    /// Ask a single question and exit; otherwise questions are read from stdin
    #[arg(long)]
    pub query: Option<String>,
    /// Resume an existing conversation
    #[arg(long)]
    pub chat_id: Option<String>,
    /// Parse a captured SSE transcript instead of connecting
    #[arg(long)]
    pub replay: Option<PathBuf>,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = MAX_STREAM_LINES)]
    pub max_stream_lines: usize,
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,
    /// Print each final transcript as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub api_key: Option<String>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(args: Arc<Args>) -> Result<Self> {
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(k) if !k.is_empty() => Some(k),
            _ => None,
        };
        Ok(Self {
            client: build_client(&args)?,
            api_key,
            args,
        })
    }
}

/// Transport timeouts live here; the parser itself never times out.
pub fn build_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}

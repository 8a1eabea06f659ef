use shopassist::session::{ChatSession, TurnStatus};
use shopassist::streaming::{open_chat_stream, replay_lines, StreamHandler, TurnEvent};
use shopassist::*;

use clap::Parser;
use colored::*;
use futures_util::Stream;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());
    let guard = shopassist::logging::init_tracing(&args.log_dir);
    shopassist::logging::setup_panic_hook();

    let code = run(args).await;
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run(args: Arc<Args>) -> i32 {
    let mut session = match &args.chat_id {
        Some(id) => ChatSession::with_chat_id(ChatId(id.clone())),
        None => ChatSession::new(),
    };

    if let Some(path) = &args.replay {
        let lines = match replay_lines(path).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Failed to open replay file {}: {}", path.display(), e.inner);
                return 1;
            }
        };
        return exit_code(run_turn(lines, &mut session, &args).await);
    }

    let state = match AppState::new(args.clone()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e.inner);
            return 1;
        }
    };

    if let Some(query) = &args.query {
        return exit_code(ask(&state, &mut session, query).await);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".bold().blue());
        let _ = std::io::stdout().flush();
        let query = match stdin.next_line().await {
            Ok(Some(q)) => q,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                return 1;
            }
        };
        let query = query.trim();
        if query.is_empty() {
            continue;
        }
        ask(&state, &mut session, query).await;
    }
    0
}

async fn ask(state: &AppState, session: &mut ChatSession, query: &str) -> TurnStatus {
    let chat_id = session.chat_id().cloned();
    match open_chat_stream(state, query, chat_id.as_ref()).await {
        Ok(lines) => run_turn(lines, session, &state.args).await,
        Err(e) => {
            tracing::error!("Failed to open chat stream: {}", e);
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            TurnStatus::Failed
        }
    }
}

async fn run_turn<S>(lines: S, session: &mut ChatSession, args: &Args) -> TurnStatus
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
{
    let handle = match session.begin_turn() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            return TurnStatus::Failed;
        }
    };

    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let renderer = tokio::spawn(render(rx, args.json));
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let status = StreamHandler::handle_stream(
        lines,
        session,
        handle,
        tx,
        cancel,
        args.max_stream_lines,
    )
    .await;

    interrupt.abort();
    if let Err(e) = renderer.await {
        tracing::error!("Renderer task failed: {}", e);
    }
    status
}

async fn render(mut rx: mpsc::Receiver<TurnEvent>, json: bool) {
    let mut printed_prose = 0usize;
    if !json {
        println!("{}", "thinking…".dimmed());
    }

    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Delta(delta) => {
                if json {
                    continue;
                }
                if let Some(prose) = &delta.committed_prose {
                    println!("{}", prose);
                    printed_prose += 1;
                }
                for product in &delta.products {
                    print_product(product);
                }
            }
            TurnEvent::ChatId(id) => tracing::info!("Conversation id: {}", id),
            TurnEvent::RequestId(id) => tracing::debug!("Request id: {}", id),
            TurnEvent::Finalized(transcript) => {
                if json {
                    match serde_json::to_string_pretty(&transcript) {
                        Ok(s) => println!("{}", s),
                        Err(e) => tracing::error!("Failed to serialize transcript: {}", e),
                    }
                    continue;
                }
                let prose_entries = transcript
                    .entries
                    .iter()
                    .filter(|e| e.as_prose().is_some())
                    .count();
                if prose_entries > printed_prose {
                    if let Some(text) = transcript.entries.last().and_then(|e| e.as_prose()) {
                        println!("{}", text);
                    }
                }
            }
            TurnEvent::Failed(message) => eprintln!("{} {}", "error:".red().bold(), message),
            TurnEvent::Cancelled => eprintln!("{}", "(cancelled)".dimmed()),
        }
    }
}

fn print_product(product: &ProductRecord) {
    let mut line = format!("  • {}", product.title.bold());
    if let Some(price) = &product.price {
        line.push_str(&format!("  {}", price.to_string().green()));
    }
    if let Some(rating) = product.review_rating {
        line.push_str(&format!("  ★ {:.1}", rating));
        if let Some(count) = product.review_count {
            line.push_str(&format!(" ({})", count));
        }
    }
    println!("{}", line);
    if let Some(description) = &product.description {
        println!("    {}", description.dimmed());
    }
    if let Some(url) = &product.product_url {
        println!("    {}", url.cyan().underline());
    }
}

fn exit_code(status: TurnStatus) -> i32 {
    match status {
        TurnStatus::Closed => 0,
        TurnStatus::Cancelled => 130,
        TurnStatus::Streaming | TurnStatus::Failed => 1,
    }
}

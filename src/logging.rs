use crate::constants::{DEFAULT_LOG_FILTER, LOG_FILE_NAME};
use crate::ingress::InboundEvent;
use crate::reconciler::ChatTurnState;
use crate::types::TurnId;
use std::panic;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};

/// Installs the global subscriber: env filter, daily log file, span traces for errors.
///
/// Keep the returned guard alive for the life of the process or buffered lines are lost.
pub fn init_tracing(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Logs panics through tracing before the default hook prints them.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-turn counters, logged once when the turn closes.
pub struct TurnMetric {
    pub started: Instant,
    pub events: usize,
    pub text_chars: usize,
    pub products_received: usize,
    pub products_displayed: usize,
}

impl Default for TurnMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMetric {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: 0,
            text_chars: 0,
            products_received: 0,
            products_displayed: 0,
        }
    }

    pub fn record_event(&mut self, event: &InboundEvent) {
        self.events += 1;
        match event {
            InboundEvent::ChatToken(fragment) => self.text_chars += fragment.chars().count(),
            InboundEvent::Product(_) => self.products_received += 1,
            _ => {}
        }
    }

    pub fn record_displayed(&mut self, count: usize) {
        self.products_displayed += count;
    }

    pub fn log_summary(&self, turn_id: TurnId, state: &ChatTurnState) {
        info!(
            target: "turn_recorder",
            "[TURN END] TurnID: {} | Events: {} | Fragments: {} | Text: {} chars | Products: {}/{} shown | References: {} | {:?}",
            turn_id.short(),
            self.events,
            state.fragment_count(),
            self.text_chars,
            self.products_displayed,
            self.products_received,
            state.references().len(),
            self.started.elapsed()
        );
    }
}

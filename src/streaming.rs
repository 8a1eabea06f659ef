use crate::constants::MAX_SSE_LINE_BYTES;
use crate::ingress::{self, SseDecoder, SseFrame};
use crate::main_helper::AppState;
use crate::session::{ChatSession, FinalTranscript, SessionUpdate, TurnHandle, TurnStatus};
use crate::types::*;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Line stream over an HTTP response body.
pub type HttpLines = FramedRead<StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>, LinesCodec>;

/// Updates forwarded to the presentation layer, in order.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Delta(TranscriptDelta),
    ChatId(ChatId),
    RequestId(RequestId),
    Finalized(FinalTranscript),
    /// Transport failure, verbatim. No final transcript follows.
    Failed(String),
    Cancelled,
}

#[derive(Serialize, Debug)]
pub struct ChatRequest<'a> {
    pub query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<&'a str>,
}

pub struct StreamHandler;

enum Flow {
    Continue,
    Stop(TurnStatus),
}

impl StreamHandler {
    /// Drives one turn to completion.
    ///
    /// Events are applied to the session one at a time, in stream order. When `cancel` fires the
    /// turn is cancelled in the session and nothing read afterwards is applied.
    pub async fn handle_stream<S>(
        lines: S,
        session: &mut ChatSession,
        handle: TurnHandle,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
        max_lines: usize,
    ) -> TurnStatus
    where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let span = tracing::info_span!("turn", turn_id = %handle.turn_id.short());
        Self::run(lines, session, handle, tx, cancel, max_lines)
            .instrument(span)
            .await
    }

    async fn run<S>(
        mut lines: S,
        session: &mut ChatSession,
        handle: TurnHandle,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
        max_lines: usize,
    ) -> TurnStatus
    where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let mut decoder = SseDecoder::new();
        let mut line_count = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.cancel_turn(handle);
                    let _ = tx.send(TurnEvent::Cancelled).await;
                    return TurnStatus::Cancelled;
                }
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Self::fail(session, handle, &tx, line_error(e)).await,
                None => break,
            };

            line_count += 1;
            if line_count > max_lines {
                tracing::error!("[STREAM] Stream exceeded max line limit ({})", max_lines);
                let message = format!("Stream exceeded max line limit ({})", max_lines);
                return Self::fail(session, handle, &tx, message).await;
            }

            if let Some(frame) = decoder.push_line(&line) {
                if let Flow::Stop(status) = Self::dispatch(&frame, session, handle, &tx).await {
                    return status;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            if let Flow::Stop(status) = Self::dispatch(&frame, session, handle, &tx).await {
                return status;
            }
        }

        tracing::debug!("[STREAM] Stream closed");
        match session.close_turn(handle) {
            Some(final_transcript) => {
                if tx.send(TurnEvent::Finalized(final_transcript)).await.is_err() {
                    tracing::trace!("Receiver dropped before final transcript");
                }
                TurnStatus::Closed
            }
            None => match session.status() {
                Some(status) => status,
                None => TurnStatus::Cancelled,
            },
        }
    }

    async fn dispatch(
        frame: &SseFrame,
        session: &mut ChatSession,
        handle: TurnHandle,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Flow {
        let event = match ingress::parse_event(frame) {
            Ok(ev) => ev,
            // Reply text and products cannot be skipped without corrupting the turn.
            Err(e) if ingress::carries_content(&frame.event) => {
                let message = format!("Malformed {} frame: {}", frame.event, e.inner);
                return Flow::Stop(Self::fail(session, handle, tx, message).await);
            }
            Err(e) => {
                tracing::warn!("[STREAM] Skipping undecodable {} frame: {}", frame.event, e.inner);
                return Flow::Continue;
            }
        };

        let outbound = match session.apply(handle, event) {
            Some(SessionUpdate::Delta(delta)) => TurnEvent::Delta(delta),
            Some(SessionUpdate::ChatId(id)) => TurnEvent::ChatId(id),
            Some(SessionUpdate::RequestId(id)) => TurnEvent::RequestId(id),
            Some(SessionUpdate::Failed(message)) => {
                let _ = tx.send(TurnEvent::Failed(message)).await;
                return Flow::Stop(TurnStatus::Failed);
            }
            None => return Flow::Continue,
        };

        if tx.send(outbound).await.is_err() {
            tracing::trace!("Receiver dropped, cancelling turn");
            session.cancel_turn(handle);
            return Flow::Stop(TurnStatus::Cancelled);
        }
        Flow::Continue
    }

    async fn fail(
        session: &mut ChatSession,
        handle: TurnHandle,
        tx: &mpsc::Sender<TurnEvent>,
        message: String,
    ) -> TurnStatus {
        tracing::error!("[STREAM] {}", message);
        session.fail_turn(handle);
        let _ = tx.send(TurnEvent::Failed(message)).await;
        TurnStatus::Failed
    }
}

fn line_error(e: LinesCodecError) -> String {
    match e {
        LinesCodecError::Io(io) => format!("Stream read failed: {}", io),
        LinesCodecError::MaxLineLengthExceeded => "Max line length exceeded".to_string(),
    }
}

/// Posts the query and returns the response body as SSE lines.
pub async fn open_chat_stream(
    state: &AppState,
    query: &str,
    chat_id: Option<&ChatId>,
) -> Result<HttpLines> {
    let body = ChatRequest {
        query,
        chat_id: chat_id.map(|c| c.0.as_str()),
    };

    let mut request = state
        .client
        .post(&state.args.endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&body);
    if let Some(key) = &state.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = match response.text().await {
            Ok(t) => t,
            Err(_) => String::new(),
        };
        return Err(ShopAssistError::Transport(format!("HTTP {}: {}", status, text)).into());
    }

    let body: BoxStream<'static, std::io::Result<Bytes>> = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();
    Ok(FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES),
    ))
}

/// Opens a captured SSE transcript from disk.
pub async fn replay_lines(path: &Path) -> Result<FramedRead<tokio::fs::File, LinesCodec>> {
    let file = tokio::fs::File::open(path).await?;
    Ok(FramedRead::new(
        file,
        LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES),
    ))
}

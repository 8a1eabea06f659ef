//! Turn lifecycle around the reconciler.
//!
//! A session owns at most one turn at a time. Each turn gets a fresh [`StreamReconciler`] and a
//! [`TurnHandle`]; events carrying a stale handle, or arriving after the turn stopped streaming,
//! are dropped without touching any state.

use crate::finalizer;
use crate::ingress::InboundEvent;
use crate::logging::TurnMetric;
use crate::reconciler::{ChatTurnState, StreamReconciler};
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnHandle {
    pub turn_id: TurnId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Cancelled,
    Failed,
    Closed,
}

/// Entries shown for one turn plus the mutable streaming slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    entries: Vec<ChatTranscriptEntry>,
    streaming_prose: Option<String>,
    waiting_for_first_token: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            waiting_for_first_token: true,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, delta: &TranscriptDelta) {
        if let Some(prose) = &delta.committed_prose {
            self.entries.push(ChatTranscriptEntry::prose(prose.clone()));
        }
        if !delta.products.is_empty() {
            match self.entries.last_mut() {
                Some(ChatTranscriptEntry::Products { items }) => {
                    items.extend(delta.products.iter().cloned())
                }
                _ => self.entries.push(ChatTranscriptEntry::Products {
                    items: delta.products.clone(),
                }),
            }
        }
        if let Some(preview) = &delta.preview {
            self.streaming_prose = Some(preview.clone());
        }
    }

    /// Replaces the preview with the authoritative final prose.
    pub fn close(&mut self, final_prose: ChatTranscriptEntry) {
        self.streaming_prose = None;
        self.waiting_for_first_token = false;
        match final_prose.as_prose() {
            Some(text) if text.is_empty() => {}
            _ => self.entries.push(final_prose),
        }
    }

    pub fn entries(&self) -> &[ChatTranscriptEntry] {
        &self.entries
    }

    pub fn streaming_prose(&self) -> Option<&str> {
        self.streaming_prose.as_deref()
    }

    pub fn is_waiting_for_first_token(&self) -> bool {
        self.waiting_for_first_token
    }

    /// Committed entries followed by the streaming preview, as the UI would draw them.
    pub fn snapshot(&self) -> Vec<ChatTranscriptEntry> {
        let mut out = self.entries.clone();
        if let Some(text) = self.streaming_prose.as_ref().filter(|t| !t.is_empty()) {
            out.push(ChatTranscriptEntry::StreamingProse { text: text.clone() });
        }
        out
    }

    fn stop_waiting(&mut self) {
        self.waiting_for_first_token = false;
        self.streaming_prose = None;
    }
}

/// What applying one inbound event produced for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Delta(TranscriptDelta),
    ChatId(ChatId),
    RequestId(RequestId),
    /// Transport failure reported by the server, verbatim.
    Failed(String),
}

/// Result of closing a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalTranscript {
    pub turn_id: TurnId,
    pub chat_id: Option<ChatId>,
    pub request_id: Option<RequestId>,
    pub entries: Vec<ChatTranscriptEntry>,
    /// Products received but never referenced; they are not displayed.
    pub unreferenced: Vec<String>,
    pub closed_at: chrono::DateTime<chrono::Utc>,
}

struct ActiveTurn {
    handle: TurnHandle,
    status: TurnStatus,
    reconciler: StreamReconciler,
    transcript: Transcript,
    request_id: Option<RequestId>,
    metric: TurnMetric,
}

#[derive(Default)]
pub struct ChatSession {
    chat_id: Option<ChatId>,
    generation: u64,
    turn: Option<ActiveTurn>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes an existing conversation; the id is echoed back on the next request.
    pub fn with_chat_id(chat_id: ChatId) -> Self {
        Self {
            chat_id: Some(chat_id),
            ..Self::default()
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(&self.turn, Some(t) if t.status == TurnStatus::Streaming)
    }

    /// Starts a turn with fresh state. The previous turn must have been closed or cancelled.
    pub fn begin_turn(&mut self) -> Result<TurnHandle> {
        if let Some(turn) = &self.turn {
            if turn.status == TurnStatus::Streaming {
                return Err(ShopAssistError::TurnInProgress(turn.handle.turn_id).into());
            }
        }
        self.generation += 1;
        let handle = TurnHandle {
            turn_id: TurnId::new(),
            generation: self.generation,
        };
        tracing::debug!("[SESSION] Turn {} started", handle.turn_id.short());
        self.turn = Some(ActiveTurn {
            handle,
            status: TurnStatus::Streaming,
            reconciler: StreamReconciler::new(handle.turn_id),
            transcript: Transcript::new(),
            request_id: None,
            metric: TurnMetric::new(),
        });
        Ok(handle)
    }

    /// Stops applying events for the turn. Its state stays readable until the next turn begins.
    pub fn cancel_turn(&mut self, handle: TurnHandle) -> bool {
        match self.streaming_turn(handle) {
            Some(turn) => {
                turn.status = TurnStatus::Cancelled;
                turn.transcript.stop_waiting();
                tracing::info!("[SESSION] Turn {} cancelled", handle.turn_id.short());
                true
            }
            None => false,
        }
    }

    /// Applies one event. Returns `None` when the event was dropped or changed nothing visible.
    pub fn apply(&mut self, handle: TurnHandle, event: InboundEvent) -> Option<SessionUpdate> {
        let chat_id = &mut self.chat_id;
        let turn = match self.turn.as_mut() {
            Some(t) if t.handle == handle && t.status == TurnStatus::Streaming => t,
            _ => {
                tracing::trace!(
                    "[SESSION] Dropping event for inactive turn {}",
                    handle.turn_id.short()
                );
                return None;
            }
        };
        turn.metric.record_event(&event);

        match event {
            InboundEvent::ChatId(id) => {
                *chat_id = Some(id.clone());
                Some(SessionUpdate::ChatId(id))
            }
            InboundEvent::RequestId(id) => {
                turn.request_id = Some(id.clone());
                Some(SessionUpdate::RequestId(id))
            }
            InboundEvent::ChatToken(fragment) => {
                if !fragment.is_empty() {
                    turn.transcript.waiting_for_first_token = false;
                }
                let delta = turn.reconciler.on_fragment(&fragment);
                turn.metric.record_displayed(delta.products.len());
                turn.transcript.apply(&delta);
                Some(SessionUpdate::Delta(delta))
            }
            InboundEvent::Product(record) => {
                let delta = turn.reconciler.on_product(record);
                if delta.is_empty() {
                    return None;
                }
                turn.metric.record_displayed(delta.products.len());
                turn.transcript.apply(&delta);
                Some(SessionUpdate::Delta(delta))
            }
            InboundEvent::Error(message) => {
                tracing::warn!(
                    "[SESSION] Turn {} failed: {}",
                    handle.turn_id.short(),
                    message
                );
                turn.status = TurnStatus::Failed;
                turn.transcript.stop_waiting();
                Some(SessionUpdate::Failed(message))
            }
            InboundEvent::Unknown(name) => {
                tracing::debug!("[SESSION] Ignoring unknown event {}", name);
                None
            }
        }
    }

    /// Marks the turn failed after a transport error. Nothing is repaired or finalized.
    pub fn fail_turn(&mut self, handle: TurnHandle) -> bool {
        match self.streaming_turn(handle) {
            Some(turn) => {
                turn.status = TurnStatus::Failed;
                turn.transcript.stop_waiting();
                true
            }
            None => false,
        }
    }

    /// Runs the finalizer once on stream close.
    pub fn close_turn(&mut self, handle: TurnHandle) -> Option<FinalTranscript> {
        let chat_id = self.chat_id.clone();
        let turn = self.streaming_turn(handle)?;

        let flushed = turn.reconciler.flush();
        turn.metric.record_displayed(flushed.products.len());
        turn.transcript.apply(&flushed);

        let state = turn.reconciler.turn();
        let displayed = state.displayed_products();
        let final_prose = finalizer::finalize(state.text(), &displayed);
        let unreferenced: Vec<String> =
            finalizer::unreferenced_products(state.text(), state.products().as_slice())
                .into_iter()
                .map(|p| p.product_id.clone())
                .collect();
        if !unreferenced.is_empty() {
            tracing::debug!(
                "[SESSION] Turn {} closed with unreferenced products: {}",
                handle.turn_id.short(),
                unreferenced.join(", ")
            );
        }

        turn.transcript.close(final_prose);
        turn.status = TurnStatus::Closed;
        turn.metric.log_summary(handle.turn_id, state);

        Some(FinalTranscript {
            turn_id: handle.turn_id,
            chat_id,
            request_id: turn.request_id.clone(),
            entries: turn.transcript.entries().to_vec(),
            unreferenced,
            closed_at: chrono::Utc::now(),
        })
    }

    pub fn status(&self) -> Option<TurnStatus> {
        self.turn.as_ref().map(|t| t.status)
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.turn.as_ref().map(|t| &t.transcript)
    }

    pub fn turn_state(&self) -> Option<&ChatTurnState> {
        self.turn.as_ref().map(|t| t.reconciler.turn())
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.turn.as_ref().and_then(|t| t.request_id.as_ref())
    }

    fn streaming_turn(&mut self, handle: TurnHandle) -> Option<&mut ActiveTurn> {
        match self.turn.as_mut() {
            Some(t) if t.handle == handle && t.status == TurnStatus::Streaming => Some(t),
            _ => None,
        }
    }
}

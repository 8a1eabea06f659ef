use crate::constants::{
    EVENT_CHAT_ID, EVENT_CHAT_TOKEN, EVENT_DEFAULT, EVENT_ERROR, EVENT_PRODUCT, EVENT_REQUEST_ID,
    MAX_SSE_LINE_BYTES,
};
use crate::types::*;
use serde::{Deserialize, Serialize};

/// One decoded event from the assistant stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ChatId(ChatId),
    RequestId(RequestId),
    ChatToken(String),
    Product(ProductRecord),
    /// Error frame sent by the server; carried verbatim.
    Error(String),
    Unknown(String),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ValuePayload {
    pub value: String,
}

/// Flat product JSON as sent in `product` events.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProductPayload {
    pub product_id: String,
    #[serde(default)]
    pub main_image_url: Option<String>,
    #[serde(default)]
    pub data: ProductData,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProductData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<ProductPrice>,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub review_rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u64>,
}

impl From<ProductPayload> for ProductRecord {
    fn from(payload: ProductPayload) -> Self {
        Self {
            product_id: payload.product_id,
            title: payload.data.title,
            description: payload.data.description,
            image_url: payload.main_image_url,
            product_url: payload.data.product_url,
            price: payload.data.price,
            review_rating: payload.data.review_rating,
            review_count: payload.data.review_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Reassembles `event:` / `data:` lines into frames; a blank line dispatches.
#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            other => tracing::trace!("[SSE] Ignoring field {}", other),
        }
        None
    }

    /// Dispatches a frame left open when the stream ended without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: match event {
                Some(e) if !e.is_empty() => e,
                _ => EVENT_DEFAULT.to_string(),
            },
            data,
        })
    }
}

pub fn parse_event(frame: &SseFrame) -> Result<InboundEvent> {
    if frame.data.len() > MAX_SSE_LINE_BYTES {
        return Err(ShopAssistError::Protocol(format!(
            "{} frame too large: {} bytes",
            frame.event,
            frame.data.len()
        ))
        .into());
    }

    let event = match frame.event.as_str() {
        EVENT_CHAT_ID => InboundEvent::ChatId(ChatId(parse_value(&frame.data)?)),
        EVENT_REQUEST_ID => InboundEvent::RequestId(RequestId(parse_value(&frame.data)?)),
        EVENT_CHAT_TOKEN => InboundEvent::ChatToken(parse_value(&frame.data)?),
        EVENT_PRODUCT => {
            let payload: ProductPayload = serde_json::from_str(&frame.data)?;
            InboundEvent::Product(payload.into())
        }
        // Error bodies are passed through even when they are not JSON.
        EVENT_ERROR => match serde_json::from_str::<ValuePayload>(&frame.data) {
            Ok(v) => InboundEvent::Error(v.value),
            Err(_) => InboundEvent::Error(frame.data.clone()),
        },
        other => InboundEvent::Unknown(other.to_string()),
    };
    Ok(event)
}

/// Events whose loss would change the reply text or its products.
pub fn carries_content(event: &str) -> bool {
    matches!(event, EVENT_CHAT_TOKEN | EVENT_PRODUCT)
}

fn parse_value(data: &str) -> Result<String> {
    let payload: ValuePayload = serde_json::from_str(data)?;
    Ok(payload.value)
}

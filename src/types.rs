use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TurnId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum ShopAssistError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Turn {0} is still streaming; cancel it before starting a new one")]
    TurnInProgress(TurnId),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ShopAssistError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ShopAssistError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- PRODUCTS ---

/// Prices arrive either as JSON numbers or as preformatted strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PriceValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for PriceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{:.2}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductPrice {
    #[serde(default)]
    pub currency: String,
    pub value: PriceValue,
}

impl fmt::Display for ProductPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.currency.is_empty() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.currency)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecord {
    pub product_id: String,
    pub title: String,
    /// Back-filled from the trailing text of the product's reference line.
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub price: Option<ProductPrice>,
    pub review_rating: Option<f64>,
    pub review_count: Option<u64>,
}

impl ProductRecord {
    pub fn new(product_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            title: title.into(),
            description: None,
            image_url: None,
            product_url: None,
            price: None,
            review_rating: None,
            review_count: None,
        }
    }
}

/// --- TRANSCRIPT ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChatTranscriptEntry {
    Prose { text: String },
    Products { items: Vec<ProductRecord> },
    /// Transient preview, replaced on every fragment and dropped when the turn closes.
    StreamingProse { text: String },
}

impl ChatTranscriptEntry {
    pub fn prose(text: impl Into<String>) -> Self {
        Self::Prose { text: text.into() }
    }

    pub fn as_prose(&self) -> Option<&str> {
        match self {
            Self::Prose { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_products(&self) -> Option<&[ProductRecord]> {
        match self {
            Self::Products { items } => Some(items.as_slice()),
            _ => None,
        }
    }
}

/// What one reconciler step changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranscriptDelta {
    /// Replacement for the streaming-prose slot.
    pub preview: Option<String>,
    /// Prose committed irrevocably by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_prose: Option<String>,
    /// Products that became displayable during this step, in display order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<ProductRecord>,
}

impl TranscriptDelta {
    pub fn is_empty(&self) -> bool {
        self.preview.is_none() && self.committed_prose.is_none() && self.products.is_empty()
    }
}

/// --- PARSER STATE ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcilerState {
    ScanningProse,
    InsideProductBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseCursor {
    pub current_line: usize,
    pub last_line_with_product_ref: Option<usize>,
    pub pending_product_id: Option<String>,
    pub state: ReconcilerState,
}

impl Default for ParseCursor {
    fn default() -> Self {
        Self {
            current_line: 0,
            last_line_with_product_ref: None,
            pending_product_id: None,
            state: ReconcilerState::ScanningProse,
        }
    }
}

impl ParseCursor {
    pub fn is_inside_product_block(&self) -> bool {
        self.state == ReconcilerState::InsideProductBlock
    }

    /// A reference on `line` has not been announced yet.
    pub fn is_new_reference_line(&self, line: usize) -> bool {
        match self.last_line_with_product_ref {
            Some(last) => last < line,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_entry_serializes_with_kind_tag() {
        let entry = ChatTranscriptEntry::StreamingProse {
            text: "hi".to_string(),
        };
        let json = match serde_json::to_value(&entry) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {}", e),
        };
        assert_eq!(json["kind"], "streaming-prose");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_price_accepts_number_or_string() {
        let numeric: ProductPrice =
            match serde_json::from_str(r#"{"currency":"USD","value":49.5}"#) {
                Ok(p) => p,
                Err(e) => panic!("parse failed: {}", e),
            };
        assert_eq!(numeric.to_string(), "49.50 USD");

        let text: ProductPrice = match serde_json::from_str(r#"{"value":"$12"}"#) {
            Ok(p) => p,
            Err(e) => panic!("parse failed: {}", e),
        };
        assert_eq!(text.to_string(), "$12");
    }

    #[test]
    fn test_cursor_new_reference_line() {
        let mut cursor = ParseCursor::default();
        assert!(cursor.is_new_reference_line(0));
        cursor.last_line_with_product_ref = Some(3);
        assert!(!cursor.is_new_reference_line(3));
        assert!(cursor.is_new_reference_line(4));
        assert!(!cursor.is_inside_product_block());
        cursor.state = ReconcilerState::InsideProductBlock;
        assert!(cursor.is_inside_product_block());
    }
}

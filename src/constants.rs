/// SSE event names emitted by the shopping-assistant endpoint
pub const EVENT_CHAT_ID: &str = "chat_id";
pub const EVENT_REQUEST_ID: &str = "reqid";
pub const EVENT_CHAT_TOKEN: &str = "chat_token";
pub const EVENT_PRODUCT: &str = "product";
pub const EVENT_ERROR: &str = "error";
/// Name assumed for frames without an `event:` line
pub const EVENT_DEFAULT: &str = "message";

/// Marker literals
pub const REFERENCE_OPEN: &str = "[[";
pub const REFERENCE_CLOSE: &str = "]]";

/// Stream guards
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Config defaults
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/stream";
pub const DEFAULT_LOG_FILTER: &str = "shopassist=info";
pub const LOG_FILE_NAME: &str = "shopassist.log";
pub const API_KEY_ENV: &str = "SHOPASSIST_API_KEY";

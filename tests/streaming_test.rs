use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use shopassist::session::{ChatSession, TurnHandle, TurnStatus};
use shopassist::streaming::{replay_lines, StreamHandler, TurnEvent};
use shopassist::types::*;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

fn frame(event: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

fn chat_token(value: &str) -> String {
    frame(
        "chat_token",
        &serde_json::json!({ "value": value }).to_string(),
    )
}

fn product_frame(id: &str, title: &str) -> String {
    frame(
        "product",
        &serde_json::json!({
            "product_id": id,
            "main_image_url": format!("https://img.example/{}.jpg", id),
            "data": {
                "title": title,
                "price": { "currency": "USD", "value": 59.99 },
                "product_url": format!("https://shop.example/{}", id),
                "review_rating": 4.4,
                "review_count": 87
            }
        })
        .to_string(),
    )
}

fn scenario_body() -> String {
    [
        frame("chat_id", r#"{"value":"chat-1"}"#),
        frame("reqid", r#"{"value":"req-9"}"#),
        chat_token("Here are "),
        chat_token("some options:\n"),
        chat_token("1. [[p1]] **Shoe A** - comfy\n"),
        chat_token("more text"),
        product_frame("p1", "Shoe A"),
    ]
    .concat()
}

/// Splits the body into fixed-size byte chunks so lines straddle reads.
fn chunked(body: &str, size: usize) -> Vec<std::io::Result<Bytes>> {
    body.as_bytes()
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

fn lines_of(
    body: &str,
    size: usize,
) -> FramedRead<StreamReader<stream::Iter<std::vec::IntoIter<std::io::Result<Bytes>>>, Bytes>, LinesCodec>
{
    FramedRead::new(
        StreamReader::new(stream::iter(chunked(body, size))),
        LinesCodec::new(),
    )
}

fn begin(session: &mut ChatSession) -> TurnHandle {
    match session.begin_turn() {
        Ok(h) => h,
        Err(e) => panic!("begin_turn failed: {}", e),
    }
}

async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn full_stream_produces_final_transcript() {
    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(256);

    let status = StreamHandler::handle_stream(
        lines_of(&scenario_body(), 7),
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;
    assert_eq!(status, TurnStatus::Closed);

    let events = drain(rx).await;
    assert!(matches!(&events[0], TurnEvent::ChatId(id) if id.0 == "chat-1"));
    assert!(matches!(&events[1], TurnEvent::RequestId(id) if id.0 == "req-9"));

    let final_transcript = match events.last() {
        Some(TurnEvent::Finalized(f)) => f.clone(),
        other => panic!("Expected Finalized, got {:?}", other),
    };
    assert_eq!(final_transcript.chat_id, Some(ChatId("chat-1".into())));
    assert_eq!(final_transcript.request_id, Some(RequestId("req-9".into())));
    assert_eq!(final_transcript.entries.len(), 3);
    assert_eq!(
        final_transcript.entries[0].as_prose(),
        Some("Here are some options:")
    );
    let items = final_transcript.entries[1].as_products().unwrap_or_default();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].description.as_deref(), Some("comfy"));
    assert_eq!(items[0].review_count, Some(87));
    assert_eq!(final_transcript.entries[2].as_prose(), Some("more text"));
    assert_eq!(session.chat_id(), Some(&ChatId("chat-1".into())));
}

#[tokio::test]
async fn error_event_fails_turn_and_stops_applying() {
    let body = [
        chat_token("Partial answer"),
        frame("error", r#"{"value":"upstream timeout"}"#),
        chat_token(" should not land"),
    ]
    .concat();

    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let status = StreamHandler::handle_stream(
        lines_of(&body, 64),
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;

    assert_eq!(status, TurnStatus::Failed);
    let events = drain(rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Failed(m) if m == "upstream timeout")));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Finalized(_))));
    assert_eq!(
        session.turn_state().map(|s| s.text()),
        Some("Partial answer")
    );
}

#[tokio::test]
async fn malformed_token_frame_fails_turn() {
    let body = [
        chat_token("Hello "),
        frame("chat_token", r#"{"value": broken}"#),
        chat_token("world"),
    ]
    .concat();

    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let status = StreamHandler::handle_stream(
        lines_of(&body, 16),
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;

    assert_eq!(status, TurnStatus::Failed);
    let events = drain(rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Failed(m) if m.contains("Malformed chat_token frame"))));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Finalized(_))));
    assert_eq!(session.turn_state().map(|s| s.text()), Some("Hello "));
}

#[tokio::test]
async fn undecodable_id_frame_is_skipped() {
    let body = [
        frame("reqid", "not json"),
        chat_token("Plain answer"),
    ]
    .concat();

    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let status = StreamHandler::handle_stream(
        lines_of(&body, 16),
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;

    assert_eq!(status, TurnStatus::Closed);
    let events = drain(rx).await;
    match events.last() {
        Some(TurnEvent::Finalized(f)) => {
            assert_eq!(f.request_id, None);
            assert_eq!(f.entries, vec![ChatTranscriptEntry::prose("Plain answer")]);
        }
        other => panic!("Expected Finalized, got {:?}", other),
    }
}

#[tokio::test]
async fn read_error_is_surfaced() {
    let chunks: Vec<std::io::Result<Bytes>> = vec![
        Ok(Bytes::from(chat_token("hello"))),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        )),
    ];
    let lines = FramedRead::new(StreamReader::new(stream::iter(chunks)), LinesCodec::new());

    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let status = StreamHandler::handle_stream(
        lines,
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;

    assert_eq!(status, TurnStatus::Failed);
    let events = drain(rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Failed(m) if m.contains("reset by peer"))));
    assert_eq!(session.status(), Some(TurnStatus::Failed));
}

#[tokio::test]
async fn cancellation_freezes_turn_state() {
    let body = [chat_token("Looking"), chat_token(" around\n")].concat();
    let open_ended = stream::iter(chunked(&body, 5)).chain(stream::pending());
    let lines = FramedRead::new(StreamReader::new(open_ended), LinesCodec::new());

    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let status =
        StreamHandler::handle_stream(lines, &mut session, handle, tx, cancel, 10_000).await;
    assert_eq!(status, TurnStatus::Cancelled);

    let events = drain(rx).await;
    assert!(matches!(events.last(), Some(TurnEvent::Cancelled)));
    assert_eq!(session.status(), Some(TurnStatus::Cancelled));

    let cursor_before = session.turn_state().map(|s| s.cursor().clone());
    let late = shopassist::ingress::InboundEvent::ChatToken("late".into());
    assert!(session.apply(handle, late).is_none());
    assert_eq!(
        session.turn_state().map(|s| s.text()),
        Some("Looking around\n")
    );
    assert_eq!(session.turn_state().map(|s| s.cursor().clone()), cursor_before);
}

#[tokio::test]
async fn line_limit_stops_runaway_stream() {
    let body = (0..20).map(|i| chat_token(&format!("t{} ", i))).collect::<String>();
    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(64);
    let status = StreamHandler::handle_stream(
        lines_of(&body, 32),
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        9,
    )
    .await;

    assert_eq!(status, TurnStatus::Failed);
    let events = drain(rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Failed(m) if m.contains("max line limit"))));
}

#[tokio::test]
async fn replay_file_drives_a_turn() {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => panic!("tempfile failed: {}", e),
    };
    if let Err(e) = file.write_all(scenario_body().as_bytes()) {
        panic!("write failed: {}", e);
    }

    let lines = match replay_lines(file.path()).await {
        Ok(l) => l,
        Err(e) => panic!("replay_lines failed: {}", e),
    };
    let mut session = ChatSession::new();
    let handle = begin(&mut session);
    let (tx, rx) = mpsc::channel(256);
    let status = StreamHandler::handle_stream(
        lines,
        &mut session,
        handle,
        tx,
        CancellationToken::new(),
        10_000,
    )
    .await;

    assert_eq!(status, TurnStatus::Closed);
    let events = drain(rx).await;
    match events.last() {
        Some(TurnEvent::Finalized(f)) => {
            assert_eq!(f.entries.len(), 3);
            assert_eq!(f.entries[2].as_prose(), Some("more text"));
        }
        other => panic!("Expected Finalized, got {:?}", other),
    }
}

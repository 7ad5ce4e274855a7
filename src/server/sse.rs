//! Server-sent-events hub.
//!
//! Mutation handlers and the team watcher publish on one broadcast channel;
//! every connected client gets its own receiver. A client sees events in
//! arrival order; there is no ordering guarantee across clients.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use super::api::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseEvent {
    Connected,
    BoardChanged,
    TeamChanged,
}

impl SseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::BoardChanged => "board-changed",
            Self::TeamChanged => "team-changed",
        }
    }
}

pub type SseSender = broadcast::Sender<SseEvent>;

pub fn channel() -> SseSender {
    broadcast::channel(256).0
}

/// Fan an event out to every connected client. Having no clients is fine.
pub fn broadcast_event(tx: &SseSender, event: SseEvent) {
    let _ = tx.send(event);
}

/// `GET /api/events`: upgrade to an event stream. The first frame is
/// always `{"type":"connected"}`.
pub async fn sse_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse_tx.subscribe();
    let hello = tokio_stream::once(Ok(frame(SseEvent::Connected)));
    let updates = BroadcastStream::new(rx).filter_map(|event| event.ok().map(|e| Ok(frame(e))));
    Sse::new(hello.chain(updates)).keep_alive(KeepAlive::default())
}

fn frame(event: SseEvent) -> Event {
    Event::default().data(json!({ "type": event.as_str() }).to_string())
}

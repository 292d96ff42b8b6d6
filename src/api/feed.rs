//! `GET /api/v1/feed` - WebSocket push of incremental stats.
//!
//! Each connection holds its own cursors. "latest" and "capacity" deltas
//! are polled on independent cadences; either stream can be switched off
//! per connection. A slow client only delays its own socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::handlers::ApiState;
use crate::stats::{FeedCursors, FeedMessage, FeedStream};

/// Maximum inbound WebSocket message size; clients only send control frames.
const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// WebSocket ping interval in seconds.
const WS_PING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    /// Resume after this ledger sequence. Absent: only rows from now on.
    pub latest_cursor: Option<u64>,
    /// Resume after this snapshot sequence. Absent: only rows from now on.
    pub capacity_cursor: Option<u64>,
    #[serde(default)]
    pub disable_latest: bool,
    #[serde(default)]
    pub disable_capacity: bool,
}

impl FeedQuery {
    fn starting_cursors(&self, heads: FeedCursors) -> FeedCursors {
        FeedCursors {
            latest: self.latest_cursor.unwrap_or(heads.latest),
            capacity: self.capacity_cursor.unwrap_or(heads.capacity),
        }
    }
}

pub async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(query): Query<FeedQuery>,
) -> Response {
    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| feed_stream(socket, state, query))
}

/// Compute one stream's delta. Errors are logged and treated as "nothing new".
fn poll(state: &ApiState, stream: FeedStream, cursors: &FeedCursors) -> Option<FeedMessage> {
    let limit = state.config.feed.batch_limit;
    let result = match stream {
        FeedStream::Latest => state.stats.latest_since(cursors.latest, limit),
        FeedStream::Capacity => state.stats.capacity_since(cursors.capacity, limit),
    };
    match result {
        Ok(msg) if !msg.is_empty() => Some(msg),
        Ok(_) => None,
        Err(e) => {
            warn!(?stream, error = %e, "Feed poll failed");
            None
        }
    }
}

async fn push(socket: &mut WebSocket, msg: &FeedMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode feed message");
            true
        }
    }
}

async fn feed_stream(mut socket: WebSocket, state: ApiState, query: FeedQuery) {
    let mut cursors = query.starting_cursors(state.stats.heads());
    info!(
        latest_cursor = cursors.latest,
        capacity_cursor = cursors.capacity,
        disable_latest = query.disable_latest,
        disable_capacity = query.disable_capacity,
        "Feed client connected"
    );

    let feed = &state.config.feed;
    let mut latest_tick = tokio::time::interval(Duration::from_millis(feed.latest_interval_ms.max(1)));
    let mut capacity_tick = tokio::time::interval(Duration::from_millis(feed.capacity_interval_ms.max(1)));
    let mut ping = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));

    loop {
        let msg = tokio::select! {
            _ = latest_tick.tick(), if !query.disable_latest => poll(&state, FeedStream::Latest, &cursors),
            _ = capacity_tick.tick(), if !query.disable_capacity => poll(&state, FeedStream::Capacity, &cursors),
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                None
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                    None
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!(error = %e, "Feed receive error");
                    break;
                }
            },
        };

        if let Some(msg) = msg {
            if !push(&mut socket, &msg).await {
                break;
            }
            cursors.advance(msg.stream(), msg.cursor());
        }
    }
    info!(
        latest_cursor = cursors.latest,
        capacity_cursor = cursors.capacity,
        "Feed client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cursor_starts_at_head() {
        let query = FeedQuery {
            latest_cursor: Some(3),
            ..Default::default()
        };
        let cursors = query.starting_cursors(FeedCursors { latest: 40, capacity: 12 });
        assert_eq!(cursors, FeedCursors { latest: 3, capacity: 12 });
    }

    #[test]
    fn test_disable_flags_parse_from_query() {
        let query = parse_query("latest_cursor=5&disable_capacity=true");
        assert_eq!(query.latest_cursor, Some(5));
        assert!(query.disable_capacity);
        assert!(!query.disable_latest);
    }

    fn parse_query(raw: &str) -> FeedQuery {
        let uri: axum::http::Uri = format!("/feed?{raw}").parse().unwrap();
        Query::<FeedQuery>::try_from_uri(&uri).unwrap().0
    }
}

//! Incremental feed: deltas since a client-held cursor.
//!
//! Two streams with independent cursors. `latest` walks the ledger journal
//! sequence, `capacity` walks the snapshot table sequence. Both sequences
//! are assigned at write time, so a late-arriving snapshot still lands past
//! every cursor already handed out and is delivered exactly once.

use serde::{Deserialize, Serialize};

use crate::types::{ProviderSnapshot, RequestEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStream {
    Latest,
    Capacity,
}

/// Per-connection cursor state. A cursor only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCursors {
    pub latest: u64,
    pub capacity: u64,
}

impl FeedCursors {
    pub fn advance(&mut self, stream: FeedStream, to: u64) {
        let cursor = match stream {
            FeedStream::Latest => &mut self.latest,
            FeedStream::Capacity => &mut self.capacity,
        };
        *cursor = (*cursor).max(to);
    }
}

/// One push to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum FeedMessage {
    Latest {
        cursor: u64,
        events: Vec<RequestEvent>,
    },
    Capacity {
        cursor: u64,
        snapshots: Vec<ProviderSnapshot>,
    },
}

impl FeedMessage {
    pub fn stream(&self) -> FeedStream {
        match self {
            Self::Latest { .. } => FeedStream::Latest,
            Self::Capacity { .. } => FeedStream::Capacity,
        }
    }

    pub fn cursor(&self) -> u64 {
        match self {
            Self::Latest { cursor, .. } | Self::Capacity { cursor, .. } => *cursor,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Latest { events, .. } => events.is_empty(),
            Self::Capacity { snapshots, .. } => snapshots.is_empty(),
        }
    }
}

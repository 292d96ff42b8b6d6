//! Sled backend for the request ledger.
//!
//! Three trees:
//! - `ledger_journal`: seq (u64 BE) -> `LedgerEntry`, append-only
//! - `ledger_requests`: request id -> latest `LedgerEntry`
//! - `ledger_by_enqueue`: enqueue nanos (u64 BE) ++ request id -> empty,
//!   for time-range scans
//!
//! Appends are serialized by a mutex so sequence order equals journal order,
//! which the incremental feed relies on.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

use super::{decode_seq, time_key, StorageError};
use crate::ledger::{LedgerEntry, LedgerError, LedgerStore};
use crate::types::RequestEvent;

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

pub struct SledLedgerStore {
    journal: sled::Tree,
    requests: sled::Tree,
    by_enqueue: sled::Tree,
    /// Next sequence number; the lock also serializes appends
    next_seq: Mutex<u64>,
}

impl SledLedgerStore {
    pub(super) fn open(db: &sled::Db) -> Result<Self, StorageError> {
        let journal = db.open_tree("ledger_journal")?;
        let next_seq = match journal.last()? {
            Some((key, _)) => decode_seq(&key, "ledger_journal")? + 1,
            None => 1,
        };
        Ok(Self {
            journal,
            requests: db.open_tree("ledger_requests")?,
            by_enqueue: db.open_tree("ledger_by_enqueue")?,
            next_seq: Mutex::new(next_seq),
        })
    }

    fn enqueue_key(event: &RequestEvent) -> Vec<u8> {
        let mut key = time_key(event.enqueued_at).to_vec();
        key.extend_from_slice(event.request_id.as_bytes());
        key
    }

    fn current(&self, request_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.requests.get(request_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

impl LedgerStore for SledLedgerStore {
    fn append(&self, event: &RequestEvent) -> Result<LedgerEntry, LedgerError> {
        let mut next_seq = self
            .next_seq
            .lock()
            .unwrap_or_else(|e| {
                tracing::warn!("Ledger sequence lock poisoned, recovering");
                e.into_inner()
            });

        let previous = self.current(&event.request_id)?;
        if let Some(prev) = &previous {
            if !event.state.may_follow(prev.event.state) {
                return Err(LedgerError::Rewrite {
                    request_id: event.request_id.clone(),
                    recorded: prev.event.state,
                    attempted: event.state,
                });
            }
        }

        let entry = LedgerEntry {
            seq: *next_seq,
            recorded_at: Utc::now(),
            event: event.clone(),
        };
        let value = serde_json::to_vec(&entry)?;

        self.journal.insert(entry.seq.to_be_bytes(), value.clone())?;
        self.requests.insert(event.request_id.as_bytes(), value)?;
        if previous.is_none() {
            self.by_enqueue.insert(Self::enqueue_key(event), Vec::<u8>::new())?;
        }
        *next_seq += 1;

        Ok(entry)
    }

    fn entries_after(&self, seq: u64, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let start = seq.saturating_add(1).to_be_bytes();
        let mut entries = Vec::new();
        for item in self.journal.range(start..) {
            if entries.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    fn latest(&self, limit: usize) -> Result<Vec<RequestEvent>, LedgerError> {
        let mut seen = std::collections::HashSet::new();
        let mut events = Vec::with_capacity(limit);

        // Journal newest-first; the first row seen per request is its latest.
        for item in self.journal.iter().rev() {
            if events.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            match serde_json::from_slice::<LedgerEntry>(&value) {
                Ok(entry) => {
                    if seen.insert(entry.event.request_id.clone()) {
                        events.push(entry.event);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable ledger row");
                }
            }
        }
        Ok(events)
    }

    fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, LedgerError> {
        let start_key = time_key(start);
        let end_key = time_key(end);
        let mut events = Vec::new();

        for item in self.by_enqueue.range(start_key..end_key) {
            let (key, _) = item?;
            let Some(id_bytes) = key.get(8..) else {
                continue;
            };
            let request_id = String::from_utf8_lossy(id_bytes);
            if let Some(entry) = self.current(&request_id)? {
                events.push(entry.event);
            }
        }
        Ok(events)
    }

    fn get(&self, request_id: &str) -> Result<Option<RequestEvent>, LedgerError> {
        Ok(self.current(request_id)?.map(|entry| entry.event))
    }

    fn head_seq(&self) -> u64 {
        self.next_seq
            .lock()
            .map_or_else(|e| *e.into_inner(), |guard| *guard)
            .saturating_sub(1)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

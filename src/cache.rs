//! Raw stage output cache.
//!
//! Keeps the unprocessed provider text of recent runs, keyed by request id,
//! so a front end can offer it for download after the run. Writes are best
//! effort and the pipeline never reads from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawOutput {
    pub stage_id: u32,
    pub output: String,
    pub model: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    created: Instant,
    outputs: Vec<RawOutput>,
}

/// TTL and size bounded map of request id to per-stage raw outputs.
#[derive(Debug)]
pub struct RawOutputCache {
    entries: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for RawOutputCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl RawOutputCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Append one stage's raw output to the entry for `request_id`.
    ///
    /// A new request evicts the oldest entry when the cache is full.
    pub fn append(&self, request_id: Uuid, stage_id: u32, output: &str, model: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            warn!(%request_id, "raw output cache lock poisoned; skipping write");
            return;
        };
        let now = Instant::now();
        Self::purge(&mut entries, self.ttl, now);

        if !entries.contains_key(&request_id) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                entries.remove(&id);
                debug!(evicted = %id, "raw output cache full; evicted oldest entry");
            }
        }

        entries
            .entry(request_id)
            .or_insert_with(|| Entry {
                created: now,
                outputs: Vec::new(),
            })
            .outputs
            .push(RawOutput {
                stage_id,
                output: output.to_string(),
                model: model.to_string(),
                recorded_at: Utc::now(),
            });
    }

    /// Outputs recorded for `request_id`, in stage order. Expired entries are
    /// purged first.
    pub fn get(&self, request_id: Uuid) -> Option<Vec<RawOutput>> {
        let mut entries = self.entries.lock().ok()?;
        Self::purge(&mut entries, self.ttl, Instant::now());
        entries.get(&request_id).map(|e| e.outputs.clone())
    }

    pub fn remove(&self, request_id: Uuid) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(&request_id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(entries: &mut HashMap<Uuid, Entry>, ttl: Duration, now: Instant) {
        entries.retain(|_, e| now.duration_since(e.created) < ttl);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use freja_storage::{MessageContent, MessageStatus, Position, Storage, StoredMessage};

/// How an incoming chunk combines with the buffered content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Append the chunk (token deltas).
    Accumulate,
    /// Overwrite with the chunk (full-snapshot streams).
    Replace,
}

#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Flush every N chunks.
    pub batch: u64,
    /// Flush when the stream goes quiet for this long.
    pub interval: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            batch: 20,
            interval: Duration::from_millis(300),
        }
    }
}

struct Entry {
    row_id: String,
    conversation_id: String,
    content: String,
    count: u64,
    /// Unflushed content since the last successful flush.
    dirty: bool,
    /// Last append or flush; drives both the quiet-stream check and the
    /// debounce deadline.
    last_touch: Instant,
    /// Debounce deadline; pushed forward by every append.
    deadline: Instant,
    /// True while a timer task is waiting on `deadline`.
    timer_armed: bool,
}

/// Per-`msg_id` coalescing buffer in front of [`Storage`].
///
/// Entries survive ordinary flushes so a stream can keep appending after a
/// mid-stream write; [`StreamBuffer::finish`] performs the terminal flush
/// and drops the entry.
pub struct StreamBuffer {
    storage: Arc<Storage>,
    opts: BufferOptions,
    entries: Mutex<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl StreamBuffer {
    pub fn new(storage: Arc<Storage>, opts: BufferOptions) -> Arc<Self> {
        Arc::new(Self {
            storage,
            opts,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Feed one chunk. Flushes inline on the count trigger or when the
    /// stream had gone quiet past the interval; otherwise (re)arms the
    /// debounce timer so a stalled stream still hits storage.
    ///
    /// Chunk order is the caller's contract; the buffer never reorders and
    /// never interleaves two `msg_id`s into one entry.
    pub async fn append(
        self: &Arc<Self>,
        row_id: &str,
        msg_id: &str,
        conversation_id: &str,
        chunk: &str,
        mode: AppendMode,
    ) {
        let entry = {
            let mut map = self.entries.lock().await;
            map.entry(msg_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Entry {
                        row_id: row_id.to_string(),
                        conversation_id: conversation_id.to_string(),
                        content: String::new(),
                        count: 0,
                        dirty: false,
                        last_touch: Instant::now(),
                        deadline: Instant::now(),
                        timer_armed: false,
                    }))
                })
                .clone()
        };

        let mut e = entry.lock().await;
        let now = Instant::now();
        let quiet = now.duration_since(e.last_touch) > self.opts.interval;

        match mode {
            AppendMode::Accumulate => e.content.push_str(chunk),
            AppendMode::Replace => {
                e.content.clear();
                e.content.push_str(chunk);
            }
        }
        e.count += 1;
        e.dirty = true;
        e.last_touch = now;

        if e.count % self.opts.batch == 0 || quiet {
            self.flush_entry(msg_id, &mut e).await;
            return;
        }

        e.deadline = now + self.opts.interval;
        if !e.timer_armed {
            e.timer_armed = true;
            let buffer = Arc::clone(self);
            let entry = Arc::clone(&entry);
            let msg_id = msg_id.to_string();
            tokio::spawn(async move {
                buffer.run_timer(msg_id, entry).await;
            });
        }
    }

    /// Single debounce timer per entry: sleeps toward a deadline that
    /// appends keep pushing forward, flushing once the stream stalls.
    async fn run_timer(self: Arc<Self>, msg_id: String, entry: Arc<Mutex<Entry>>) {
        loop {
            let deadline = {
                let e = entry.lock().await;
                e.deadline
            };
            tokio::time::sleep_until(deadline).await;
            let mut e = entry.lock().await;
            if e.deadline > Instant::now() {
                // An append moved the goalposts while we slept.
                continue;
            }
            e.timer_armed = false;
            if e.dirty {
                self.flush_entry(&msg_id, &mut e).await;
            }
            return;
        }
    }

    /// Force the pending content out, if any.
    pub async fn flush_now(&self, msg_id: &str) {
        let entry = {
            let map = self.entries.lock().await;
            map.get(msg_id).cloned()
        };
        if let Some(entry) = entry {
            let mut e = entry.lock().await;
            if e.dirty {
                self.flush_entry(msg_id, &mut e).await;
            }
        }
    }

    /// Terminal flush: write pending content and drop the entry.
    pub async fn finish(&self, msg_id: &str) {
        let entry = {
            let mut map = self.entries.lock().await;
            map.remove(msg_id)
        };
        if let Some(entry) = entry {
            let mut e = entry.lock().await;
            if e.dirty {
                self.flush_entry(msg_id, &mut e).await;
            }
        }
    }

    /// Upsert the entry into storage. Errors are logged and the entry
    /// stays dirty; the next append retries through the same path.
    async fn flush_entry(&self, msg_id: &str, e: &mut Entry) {
        let result = match self
            .storage
            .get_message_by_msg_id(&e.conversation_id, msg_id)
        {
            Ok(Some(mut existing)) => {
                existing.content = MessageContent::Text {
                    content: e.content.clone(),
                };
                self.storage.update_message(&existing.id.clone(), &existing)
            }
            Ok(None) => {
                let mut m = StoredMessage::new(
                    e.conversation_id.clone(),
                    Some(msg_id.to_string()),
                    MessageContent::Text {
                        content: e.content.clone(),
                    },
                    Position::Left,
                    MessageStatus::Work,
                );
                m.id = e.row_id.clone();
                self.storage.insert_message(&m)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                e.dirty = false;
                e.last_touch = Instant::now();
                debug!(%msg_id, chars = e.content.len(), "stream chunk flushed");
            }
            Err(err) => {
                warn!(%msg_id, error = %err, "stream flush failed, will retry on next append");
            }
        }
    }

    /// Number of live entries (tests and diagnostics).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

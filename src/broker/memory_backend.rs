//! In-memory broker backend using DashMap.
//!
//! Mirrors the Redis Streams semantics the pipeline relies on: per-partition
//! ordering, consumer groups with a pending list, explicit commits and
//! producer-side dedup. Records are lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::backend::{
    AppendOutcome, BrokerBackend, BrokerError, BrokerRecord, ReadCursor, RecordPosition,
};
use super::envelope::EventEnvelope;
use super::topics::Topic;

struct MemoryEntry {
    body: String,
    appended_at: DateTime<Utc>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    /// seq -> consumer that owns the delivery
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct MemoryStream {
    next_seq: u64,
    entries: BTreeMap<u64, MemoryEntry>,
    groups: HashMap<String, GroupState>,
}

impl MemoryStream {
    fn push(&mut self, body: String) -> u64 {
        self.next_seq += 1;
        self.entries.insert(
            self.next_seq,
            MemoryEntry {
                body,
                appended_at: Utc::now(),
            },
        );
        self.next_seq
    }
}

#[derive(Default)]
pub struct MemoryBrokerBackend {
    streams: DashMap<(Topic, u32), MemoryStream>,
    dedup: DashMap<Uuid, Instant>,
    fail_appends: AtomicU32,
}

fn record_id(seq: u64) -> String {
    format!("0-{}", seq)
}

fn parse_seq(record_id: &str) -> Result<u64, BrokerError> {
    record_id
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BrokerError::Command(format!("invalid record id {}", record_id)))
}

impl MemoryBrokerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with a connection error.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Append a body without validation or dedup, e.g. a malformed record.
    pub fn append_raw(&self, topic: Topic, partition: u32, body: impl Into<String>) -> String {
        let seq = self
            .streams
            .entry((topic, partition))
            .or_default()
            .push(body.into());
        record_id(seq)
    }

    pub fn stream_len(&self, topic: Topic, partition: u32) -> usize {
        self.streams
            .get(&(topic, partition))
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn total_records(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }

    pub fn pending_len(&self, topic: Topic, partition: u32, group: &str) -> usize {
        self.streams
            .get(&(topic, partition))
            .and_then(|s| s.groups.get(group).map(|g| g.pending.len()))
            .unwrap_or(0)
    }

    fn take_failure(&self) -> bool {
        self.fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read_entries(
        &self,
        topic: Topic,
        partition: u32,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        let mut stream = self
            .streams
            .get_mut(&(topic, partition))
            .ok_or_else(|| BrokerError::Command(format!("NOGROUP {} {}", topic, partition)))?;
        let stream = &mut *stream;
        let state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::Command(format!("NOGROUP {}", group)))?;

        let position = |seq: u64| RecordPosition {
            topic,
            partition,
            record_id: record_id(seq),
        };

        let mut records = Vec::new();
        match cursor {
            ReadCursor::Pending => {
                // Trimmed entries can no longer be delivered
                state.pending.retain(|seq, _| stream.entries.contains_key(seq));
                for (seq, owner) in state.pending.iter() {
                    if records.len() >= count {
                        break;
                    }
                    if owner == consumer {
                        records.push(BrokerRecord {
                            position: position(*seq),
                            body: stream.entries.get(seq).map(|e| e.body.clone()),
                        });
                    }
                }
            }
            ReadCursor::New => {
                let from = state.last_delivered + 1;
                for (seq, entry) in stream.entries.range(from..).take(count) {
                    state.last_delivered = *seq;
                    state.pending.insert(*seq, consumer.to_string());
                    records.push(BrokerRecord {
                        position: position(*seq),
                        body: Some(entry.body.clone()),
                    });
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl BrokerBackend for MemoryBrokerBackend {
    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        envelope: &EventEnvelope,
        dedup_window: Duration,
    ) -> Result<AppendOutcome, BrokerError> {
        if self.take_failure() {
            return Err(BrokerError::Connection("injected failure".into()));
        }

        let body = serde_json::to_string(envelope)
            .map_err(|e| BrokerError::Command(format!("encode envelope: {}", e)))?;

        // Dedup check and append happen under the dedup entry lock
        let now = Instant::now();
        let slot = match self.dedup.entry(envelope.id) {
            Entry::Occupied(entry) if now.duration_since(*entry.get()) < dedup_window => {
                return Ok(AppendOutcome::Duplicate);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(now);
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(now),
        };

        let seq = self
            .streams
            .entry((topic, partition))
            .or_default()
            .push(body);
        drop(slot);

        Ok(AppendOutcome::Appended {
            record_id: record_id(seq),
        })
    }

    async fn ensure_group(
        &self,
        topic: Topic,
        partition: u32,
        group: &str,
    ) -> Result<(), BrokerError> {
        self.streams
            .entry((topic, partition))
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        topic: Topic,
        partition: u32,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        self.read_entries(topic, partition, group, consumer, cursor, count)
    }

    async fn commit(&self, group: &str, position: &RecordPosition) -> Result<(), BrokerError> {
        let seq = parse_seq(&position.record_id)?;
        if let Some(mut stream) = self.streams.get_mut(&(position.topic, position.partition)) {
            if let Some(state) = stream.groups.get_mut(group) {
                state.pending.remove(&seq);
            }
        }
        Ok(())
    }

    async fn trim_before(
        &self,
        topic: Topic,
        partition: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        let Some(mut stream) = self.streams.get_mut(&(topic, partition)) else {
            return Ok(0);
        };
        let before = stream.entries.len();
        stream.entries.retain(|_, e| e.appended_at >= cutoff);
        Ok((before - stream.entries.len()) as u64)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

//! Redis Streams broker backend.
//!
//! One stream per `(topic, partition)` at `{prefix}:{topic}.events:{partition}`.
//! Appends go through a Lua script that claims `{prefix}:dedup:{id}` with
//! `SET NX EX` before `XADD`, so a retried publish never lands twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};

use crate::redis::{PoolError, RedisPool};

use super::backend::{
    AppendOutcome, BrokerBackend, BrokerError, BrokerRecord, ReadCursor, RecordPosition,
};
use super::envelope::{EventEnvelope, FIELD_ENVELOPE};
use super::topics::Topic;

const DEDUP_APPEND_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[1]) then
    return redis.call('XADD', KEYS[2], '*', unpack(ARGV, 2))
end
return false
"#;

pub struct RedisBrokerBackend {
    pool: Arc<RedisPool>,
    prefix: String,
    min_replicas: u32,
    replication_timeout: Duration,
    script: Script,
}

impl RedisBrokerBackend {
    pub fn new(
        pool: Arc<RedisPool>,
        prefix: impl Into<String>,
        min_replicas: u32,
        replication_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            min_replicas,
            replication_timeout,
            script: Script::new(DEDUP_APPEND_SCRIPT),
        }
    }

    fn stream_key(&self, topic: Topic, partition: u32) -> String {
        topic.stream_key(&self.prefix, partition)
    }

    fn dedup_key(&self, envelope: &EventEnvelope) -> String {
        format!("{}:dedup:{}", self.prefix, envelope.id)
    }

    fn map_error(err: PoolError) -> BrokerError {
        if err.is_transient() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Command(err.to_string())
        }
    }

    async fn wait_for_replicas(&self) -> Result<(), BrokerError> {
        if self.min_replicas == 0 {
            return Ok(());
        }

        let required = self.min_replicas;
        let timeout_ms = self.replication_timeout.as_millis() as u64;
        let acked: i64 = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("WAIT")
                    .arg(required)
                    .arg(timeout_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await
            .map_err(Self::map_error)?;

        if acked < required as i64 {
            return Err(BrokerError::UnderReplicated {
                acked: acked.max(0) as u32,
                required,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerBackend for RedisBrokerBackend {
    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        envelope: &EventEnvelope,
        dedup_window: Duration,
    ) -> Result<AppendOutcome, BrokerError> {
        let fields = envelope.to_record_fields()?;
        let dedup_key = self.dedup_key(envelope);
        let stream_key = self.stream_key(topic, partition);
        let window = dedup_window.as_secs().max(1);

        let mut invocation = self.script.key(dedup_key);
        invocation.key(&stream_key).arg(window);
        for (name, value) in &fields {
            invocation.arg(name).arg(value);
        }

        let record_id: Option<String> = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await
            .map_err(Self::map_error)?;

        let Some(record_id) = record_id else {
            tracing::debug!(
                event_id = %envelope.id,
                stream = %stream_key,
                "Envelope already published within dedup window"
            );
            return Ok(AppendOutcome::Duplicate);
        };

        self.wait_for_replicas().await?;

        Ok(AppendOutcome::Appended { record_id })
    }

    async fn ensure_group(
        &self,
        topic: Topic,
        partition: u32,
        group: &str,
    ) -> Result<(), BrokerError> {
        let key = self.stream_key(topic, partition);
        let group = group.to_string();

        let result = self
            .pool
            .execute(|mut conn| async move {
                conn.xgroup_create_mkstream::<_, _, _, ()>(&key, &group, "0")
                    .await
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(PoolError::Redis(e)) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::map_error(e)),
        }
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
        let key = self.stream_key(topic, partition);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let id = match cursor {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        };

        let reply: Option<StreamReadReply> = self
            .pool
            .execute(|mut conn| async move { conn.xread_options(&[&key], &[id], &options).await })
            .await
            .map_err(Self::map_error)?;

        let records = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|stream| stream.ids)
                    .map(|entry| BrokerRecord {
                        body: entry.get::<String>(FIELD_ENVELOPE),
                        position: RecordPosition {
                            topic,
                            partition,
                            record_id: entry.id,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(records)
    }

    async fn commit(&self, group: &str, position: &RecordPosition) -> Result<(), BrokerError> {
        let key = self.stream_key(position.topic, position.partition);
        let group = group.to_string();
        let id = position.record_id.clone();

        let _: i64 = self
            .pool
            .execute(|mut conn| async move { conn.xack(&key, &group, &[&id]).await })
            .await
            .map_err(Self::map_error)?;
        Ok(())
    }

    async fn trim_before(
        &self,
        topic: Topic,
        partition: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        let key = self.stream_key(topic, partition);
        let min_id = format!("{}-0", cutoff.timestamp_millis().max(0));

        let removed: i64 = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("XTRIM")
                    .arg(&key)
                    .arg("MINID")
                    .arg(&min_id)
                    .query_async(&mut conn)
                    .await
            })
            .await
            .map_err(Self::map_error)?;

        Ok(removed.max(0) as u64)
    }

    async fn health_check(&self) -> bool {
        self.pool.ping().await.is_ok()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

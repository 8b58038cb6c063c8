use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker topics. Each maps to `partitions` Redis streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Social,
    Repost,
    Guardian,
    Safety,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Social, Topic::Repost, Topic::Guardian, Topic::Safety];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Social => "social",
            Topic::Repost => "repost",
            Topic::Guardian => "guardian",
            Topic::Safety => "safety",
        }
    }

    /// Logical stream name, e.g. `social.events`
    pub fn stream_name(&self) -> &'static str {
        match self {
            Topic::Social => "social.events",
            Topic::Repost => "repost.events",
            Topic::Guardian => "guardian.events",
            Topic::Safety => "safety.events",
        }
    }

    pub fn retention(&self) -> Duration {
        const DAY: u64 = 86_400;
        match self {
            Topic::Social | Topic::Repost => Duration::from_secs(7 * DAY),
            Topic::Guardian => Duration::from_secs(30 * DAY),
            Topic::Safety => Duration::from_secs(90 * DAY),
        }
    }

    /// Accepts both `social` and `social.events`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.stream_name() == s)
    }

    /// Default topic for an event type, used when an envelope is re-emitted.
    pub fn for_event_type(event_type: &str) -> Self {
        match event_type.split('.').next().unwrap_or_default() {
            "repost" => Topic::Repost,
            "safety" => Topic::Safety,
            "guardian" | "independence" => Topic::Guardian,
            _ => Topic::Social,
        }
    }

    /// Redis key for one partition: `{prefix}:{stream}:{partition}`
    pub fn stream_key(&self, prefix: &str, partition: u32) -> String {
        format!("{}:{}:{}", prefix, self.stream_name(), partition)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_name())
    }
}

/// 32-bit FNV-1a over the partition key.
pub fn fnv1a(key: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    key.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    fnv1a(key) % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_both_forms() {
        assert_eq!(Topic::parse("social"), Some(Topic::Social));
        assert_eq!(Topic::parse("safety.events"), Some(Topic::Safety));
        assert_eq!(Topic::parse("billing"), None);
    }

    #[test]
    fn test_retention() {
        assert_eq!(Topic::Social.retention().as_secs(), 7 * 86_400);
        assert_eq!(Topic::Guardian.retention().as_secs(), 30 * 86_400);
        assert_eq!(Topic::Safety.retention().as_secs(), 90 * 86_400);
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a(""), 0x811c_9dc5);
        assert_eq!(fnv1a("a"), 0xe40c_292c);
    }

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let p = partition_for("user-42", 8);
        assert_eq!(p, partition_for("user-42", 8));
        assert!(p < 8);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_topic_for_event_type() {
        assert_eq!(Topic::for_event_type("repost.created"), Topic::Repost);
        assert_eq!(Topic::for_event_type("safety.alert"), Topic::Safety);
        assert_eq!(Topic::for_event_type("follow.requested"), Topic::Social);
    }

    #[test]
    fn test_stream_key() {
        assert_eq!(Topic::Repost.stream_key("haven", 3), "haven:repost.events:3");
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic notification ids.
const NOTIFICATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a9e_4b7d_4c38_9e21_7d5a_0b3f_c816);

/// Priority levels for notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Numeric weight for ordering (higher = more urgent)
    pub fn as_weight(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Channels used when neither the builder nor the producer asked for any.
    pub fn default_channels(&self) -> ChannelSet {
        match self {
            Priority::Low => ChannelSet::from_slice(&[Channel::InApp]),
            Priority::Medium => ChannelSet::from_slice(&[Channel::InApp, Channel::Push]),
            Priority::High => {
                ChannelSet::from_slice(&[Channel::InApp, Channel::Push, Channel::Email])
            }
            Priority::Urgent => ChannelSet::all(),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_weight().cmp(&other.as_weight())
    }
}

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Push,
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::InApp, Channel::Push, Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in_app",
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Channel::InApp => 0b0001,
            Channel::Push => 0b0010,
            Channel::Email => 0b0100,
            Channel::Sms => 0b1000,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of channels, serialized as a list of channel names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<Channel>", from = "Vec<Channel>")]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::from_slice(&Channel::ALL)
    }

    pub fn in_app_only() -> Self {
        Self::from_slice(&[Channel::InApp])
    }

    pub fn from_slice(channels: &[Channel]) -> Self {
        Self(channels.iter().fold(0, |acc, c| acc | c.bit()))
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0 |= channel.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Channels in stable order (in_app first)
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|c| c.as_str().to_string()).collect()
    }
}

impl From<Vec<Channel>> for ChannelSet {
    fn from(channels: Vec<Channel>) -> Self {
        Self::from_slice(&channels)
    }
}

impl From<ChannelSet> for Vec<Channel> {
    fn from(set: ChannelSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Closed set of notification types known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    CommentOnOwnPost,
    PostLiked,
    NewFollower,
    FollowRequest,
    FollowApproved,
    DirectMessage,
    MessageRequest,
    GroupInvitation,
    ContentShareRequest,
    Repost,
    GuardianMessage,
    GuardianApprovalRequest,
    EducationalContent,
    SafetyReminder,
    SafetyAlert,
    AchievementEarned,
    IndependenceDayReminder,
    IndependenceTransition,
    SystemAlert,
}

/// Types a minor account may ever receive.
pub const KID_ALLOWED_TYPES: &[NotificationType] = &[
    NotificationType::CommentOnOwnPost,
    NotificationType::DirectMessage,
    NotificationType::FollowApproved,
    NotificationType::GuardianMessage,
    NotificationType::EducationalContent,
    NotificationType::SafetyReminder,
    NotificationType::AchievementEarned,
    NotificationType::IndependenceDayReminder,
    NotificationType::SafetyAlert,
];

impl NotificationType {
    pub const ALL: [NotificationType; 19] = [
        NotificationType::CommentOnOwnPost,
        NotificationType::PostLiked,
        NotificationType::NewFollower,
        NotificationType::FollowRequest,
        NotificationType::FollowApproved,
        NotificationType::DirectMessage,
        NotificationType::MessageRequest,
        NotificationType::GroupInvitation,
        NotificationType::ContentShareRequest,
        NotificationType::Repost,
        NotificationType::GuardianMessage,
        NotificationType::GuardianApprovalRequest,
        NotificationType::EducationalContent,
        NotificationType::SafetyReminder,
        NotificationType::SafetyAlert,
        NotificationType::AchievementEarned,
        NotificationType::IndependenceDayReminder,
        NotificationType::IndependenceTransition,
        NotificationType::SystemAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::CommentOnOwnPost => "comment_on_own_post",
            NotificationType::PostLiked => "post_liked",
            NotificationType::NewFollower => "new_follower",
            NotificationType::FollowRequest => "follow_request",
            NotificationType::FollowApproved => "follow_approved",
            NotificationType::DirectMessage => "direct_message",
            NotificationType::MessageRequest => "message_request",
            NotificationType::GroupInvitation => "group_invitation",
            NotificationType::ContentShareRequest => "content_share_request",
            NotificationType::Repost => "repost",
            NotificationType::GuardianMessage => "guardian_message",
            NotificationType::GuardianApprovalRequest => "guardian_approval_request",
            NotificationType::EducationalContent => "educational_content",
            NotificationType::SafetyReminder => "safety_reminder",
            NotificationType::SafetyAlert => "safety_alert",
            NotificationType::AchievementEarned => "achievement_earned",
            NotificationType::IndependenceDayReminder => "independence_day_reminder",
            NotificationType::IndependenceTransition => "independence_transition",
            NotificationType::SystemAlert => "system_alert",
        }
    }

    pub fn is_kid_allowed(&self) -> bool {
        KID_ALLOWED_TYPES.contains(self)
    }

    /// Requests that need a guardian decision when the recipient is a minor.
    pub fn guardian_request_type(&self) -> Option<GuardianRequestType> {
        match self {
            NotificationType::FollowRequest => Some(GuardianRequestType::FollowRequest),
            NotificationType::MessageRequest => Some(GuardianRequestType::MessageRequest),
            NotificationType::GroupInvitation => Some(GuardianRequestType::GroupInvitation),
            NotificationType::ContentShareRequest => {
                Some(GuardianRequestType::ContentShareRequest)
            }
            _ => None,
        }
    }

    /// What a minor sees once a guardian has approved the request.
    pub fn approved_form(&self) -> NotificationType {
        match self {
            NotificationType::FollowRequest => NotificationType::FollowApproved,
            NotificationType::MessageRequest => NotificationType::DirectMessage,
            NotificationType::GroupInvitation | NotificationType::ContentShareRequest => {
                NotificationType::GuardianMessage
            }
            other => *other,
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            NotificationType::SafetyAlert => Priority::Urgent,
            NotificationType::GuardianApprovalRequest
            | NotificationType::GuardianMessage
            | NotificationType::IndependenceTransition
            | NotificationType::IndependenceDayReminder
            | NotificationType::SystemAlert => Priority::High,
            NotificationType::PostLiked | NotificationType::AchievementEarned => Priority::Low,
            _ => Priority::Medium,
        }
    }

    /// Per-type channel defaults that override the priority-based ones.
    pub fn default_channels(&self) -> Option<ChannelSet> {
        match self {
            NotificationType::Repost => {
                Some(ChannelSet::from_slice(&[Channel::InApp, Channel::Push]))
            }
            NotificationType::GuardianApprovalRequest | NotificationType::GuardianMessage => Some(
                ChannelSet::from_slice(&[Channel::InApp, Channel::Email, Channel::Push]),
            ),
            NotificationType::SafetyAlert => Some(ChannelSet::all()),
            NotificationType::EducationalContent => {
                Some(ChannelSet::from_slice(&[Channel::InApp, Channel::Email]))
            }
            NotificationType::IndependenceTransition
            | NotificationType::IndependenceDayReminder => {
                Some(ChannelSet::from_slice(&[Channel::InApp, Channel::Email]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown notification type: {s}"))
    }
}

/// Kinds of request a guardian can be asked to decide on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianRequestType {
    FollowRequest,
    MessageRequest,
    GroupInvitation,
    ContentShareRequest,
    /// Informational mirror of a minor's activity
    ActivityReview,
}

impl GuardianRequestType {
    pub const ALL: [GuardianRequestType; 5] = [
        GuardianRequestType::FollowRequest,
        GuardianRequestType::MessageRequest,
        GuardianRequestType::GroupInvitation,
        GuardianRequestType::ContentShareRequest,
        GuardianRequestType::ActivityReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardianRequestType::FollowRequest => "follow_request",
            GuardianRequestType::MessageRequest => "message_request",
            GuardianRequestType::GroupInvitation => "group_invitation",
            GuardianRequestType::ContentShareRequest => "content_share_request",
            GuardianRequestType::ActivityReview => "activity_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            GuardianRequestType::FollowRequest => "follow request",
            GuardianRequestType::MessageRequest => "message request",
            GuardianRequestType::GroupInvitation => "group invitation",
            GuardianRequestType::ContentShareRequest => "content share request",
            GuardianRequestType::ActivityReview => "activity review",
        }
    }
}

/// Guardian approval status. `Pending` is only ever the initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        *self == ApprovalStatus::Pending && next != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetySeverity {
    Info,
    Warning,
    Critical,
}

/// Phases of the independence transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndependencePhase {
    Monitoring,
    Warning,
    Preparation,
    Transition,
    Complete,
}

impl IndependencePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndependencePhase::Monitoring => "monitoring",
            IndependencePhase::Warning => "warning",
            IndependencePhase::Preparation => "preparation",
            IndependencePhase::Transition => "transition",
            IndependencePhase::Complete => "complete",
        }
    }
}

/// Variant-specific notification data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Social,
    Repost {
        original_post_id: String,
        repost_id: String,
        repost_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quote_text: Option<String>,
    },
    Kid {
        guardian_visible: bool,
        safety_score: f64,
        requires_guardian_action: bool,
    },
    Guardian {
        approval_id: Uuid,
        request_type: GuardianRequestType,
        kid_account_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        status: ApprovalStatus,
        expires_at: DateTime<Utc>,
        requires_action: bool,
    },
    SafetyAlert {
        severity: SafetySeverity,
        auto_resolved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kid_account_id: Option<String>,
    },
    Educational {
        education_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    IndependenceTransition {
        phase: IndependencePhase,
        maturity_score: f64,
        requirements: BTreeMap<String, bool>,
    },
}

impl NotificationKind {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationKind::Social => "social",
            NotificationKind::Repost { .. } => "repost",
            NotificationKind::Kid { .. } => "kid",
            NotificationKind::Guardian { .. } => "guardian",
            NotificationKind::SafetyAlert { .. } => "safety_alert",
            NotificationKind::Educational { .. } => "educational",
            NotificationKind::IndependenceTransition { .. } => "independence_transition",
        }
    }
}

/// A persisted, typed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub delivered: bool,
    pub priority: Priority,
    pub channels: ChannelSet,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Envelope (or approval) this notification was derived from
    pub source_event_id: Uuid,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    /// Deterministic id for `(event, recipient, type)`, so a redelivered
    /// envelope maps onto the row it already produced.
    pub fn derive_id(event_id: Uuid, recipient_id: &str, notification_type: NotificationType) -> Uuid {
        let name = format!("{}:{}:{}", event_id, recipient_id, notification_type.as_str());
        Uuid::new_v5(&NOTIFICATION_NAMESPACE, name.as_bytes())
    }

    pub fn is_guardian_pending(&self) -> bool {
        matches!(
            self.kind,
            NotificationKind::Guardian {
                status: ApprovalStatus::Pending,
                ..
            }
        )
    }

    pub fn approval_id(&self) -> Option<Uuid> {
        match self.kind {
            NotificationKind::Guardian { approval_id, .. } => Some(approval_id),
            _ => None,
        }
    }
}

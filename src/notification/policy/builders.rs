//! Built-in builders, one per registered event type.
//!
//! Payload keys are camelCase: `actorId`, `actorName`, `postId`, `excerpt`.
//! The envelope subject is the user the event concerns, which for social
//! events is the recipient.

use smallvec::smallvec;

use crate::broker::{EnvelopeError, EventEnvelope};
use crate::notification::{NotificationKind, NotificationType, Priority, SafetySeverity};

use super::registry::{BuildContext, BuilderRegistry, Drafts, NotificationDraft};

const EXCERPT_LEN: usize = 100;

pub(super) fn register_defaults(registry: &mut BuilderRegistry) {
    registry
        .register("comment.created", comment_created)
        .register("post.liked", post_liked)
        .register("user.followed", user_followed)
        .register("follow.requested", follow_requested)
        .register("follow.approved", follow_approved)
        .register("message.sent", message_sent)
        .register("message.requested", message_requested)
        .register("group.invited", group_invited)
        .register("content.share_requested", content_share_requested)
        .register("repost.created", repost_created)
        .register("safety.alert", safety_alert)
        .register("system.alert", system_alert)
        .register("educational.content", educational_content)
        .register("achievement.earned", achievement_earned)
        .register("guardian.message", guardian_message)
        .register("safety.reminder", safety_reminder);
}

fn require<'e>(envelope: &'e EventEnvelope, key: &'static str) -> Result<&'e str, EnvelopeError> {
    envelope
        .payload_str(key)
        .filter(|v| !v.is_empty())
        .ok_or(EnvelopeError::MissingField(key))
}

fn actor_id(envelope: &EventEnvelope) -> Option<String> {
    envelope.payload_str("actorId").map(str::to_string)
}

fn actor_name(envelope: &EventEnvelope) -> &str {
    envelope.payload_str("actorName").unwrap_or("Someone")
}

fn excerpt(envelope: &EventEnvelope) -> Option<String> {
    let text = envelope
        .payload_str("excerpt")
        .or_else(|| envelope.payload_str("content"))?;
    if text.chars().count() <= EXCERPT_LEN {
        return Some(text.to_string());
    }
    let cut: String = text.chars().take(EXCERPT_LEN).collect();
    Some(format!("{}...", cut))
}

/// Nobody is notified about their own actions.
fn is_self_action(envelope: &EventEnvelope) -> bool {
    envelope.payload_str("actorId") == Some(envelope.subject_user_id.as_str())
}

fn single(draft: NotificationDraft) -> Result<Drafts, EnvelopeError> {
    Ok(smallvec![draft])
}

fn social(
    envelope: &EventEnvelope,
    notification_type: NotificationType,
    title: &str,
    message: String,
) -> NotificationDraft {
    NotificationDraft::new(&envelope.subject_user_id, notification_type, title, message)
        .from_sender(actor_id(envelope))
}

fn comment_created(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let post_id = require(envelope, "postId")?;
    if is_self_action(envelope) {
        return Ok(Drafts::new());
    }

    let message = match excerpt(envelope) {
        Some(text) => format!("{} commented on your post: {}", actor_name(envelope), text),
        None => format!("{} commented on your post", actor_name(envelope)),
    };

    single(
        social(envelope, NotificationType::CommentOnOwnPost, "New comment", message)
            .with_metadata("postId", post_id)
            .with_payload_ref(envelope, "commentId"),
    )
}

fn post_liked(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let post_id = require(envelope, "postId")?;
    if is_self_action(envelope) {
        return Ok(Drafts::new());
    }

    single(
        social(
            envelope,
            NotificationType::PostLiked,
            "New like",
            format!("{} liked your post", actor_name(envelope)),
        )
        .with_metadata("postId", post_id),
    )
}

fn user_followed(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    require(envelope, "actorId")?;
    single(social(
        envelope,
        NotificationType::NewFollower,
        "New follower",
        format!("{} started following you", actor_name(envelope)),
    ))
}

fn follow_requested(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    require(envelope, "actorId")?;
    single(social(
        envelope,
        NotificationType::FollowRequest,
        "Follow request",
        format!("{} wants to follow you", actor_name(envelope)),
    ))
}

fn follow_approved(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    require(envelope, "actorId")?;
    single(social(
        envelope,
        NotificationType::FollowApproved,
        "Follow request accepted",
        format!("{} accepted your follow request", actor_name(envelope)),
    ))
}

fn message_sent(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let conversation_id = require(envelope, "conversationId")?;
    require(envelope, "actorId")?;

    let message = excerpt(envelope)
        .unwrap_or_else(|| format!("{} sent you a message", actor_name(envelope)));

    single(
        social(
            envelope,
            NotificationType::DirectMessage,
            &format!("Message from {}", actor_name(envelope)),
            message,
        )
        .with_metadata("conversationId", conversation_id)
        .with_payload_ref(envelope, "messageId")
        .with_payload_ref(envelope, "content"),
    )
}

fn message_requested(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    require(envelope, "actorId")?;
    single(
        social(
            envelope,
            NotificationType::MessageRequest,
            "Message request",
            format!("{} wants to send you a message", actor_name(envelope)),
        )
        .with_payload_ref(envelope, "conversationId"),
    )
}

fn group_invited(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let group_id = require(envelope, "groupId")?;
    let group_name = envelope.payload_str("groupName").unwrap_or("a group");

    single(
        social(
            envelope,
            NotificationType::GroupInvitation,
            "Group invitation",
            format!("{} invited you to join {}", actor_name(envelope), group_name),
        )
        .with_metadata("groupId", group_id),
    )
}

fn content_share_requested(
    envelope: &EventEnvelope,
    _: &BuildContext<'_>,
) -> Result<Drafts, EnvelopeError> {
    let content_id = require(envelope, "contentId")?;
    single(
        social(
            envelope,
            NotificationType::ContentShareRequest,
            "Content shared with you",
            format!("{} wants to share content with you", actor_name(envelope)),
        )
        .with_metadata("contentId", content_id),
    )
}

fn repost_created(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let original_post_id = require(envelope, "postId")?;
    let repost_id = require(envelope, "repostId")?;
    if is_self_action(envelope) {
        return Ok(Drafts::new());
    }

    let repost_type = envelope.payload_str("repostType").unwrap_or("simple");
    let quote_text = envelope.payload_str("quoteText").map(str::to_string);
    let message = match quote_text {
        Some(_) => format!("{} quoted your post", actor_name(envelope)),
        None => format!("{} reposted your post", actor_name(envelope)),
    };

    single(
        social(envelope, NotificationType::Repost, "New repost", message).with_kind(
            NotificationKind::Repost {
                original_post_id: original_post_id.to_string(),
                repost_id: repost_id.to_string(),
                repost_type: repost_type.to_string(),
                quote_text,
            },
        ),
    )
}

fn severity(envelope: &EventEnvelope) -> SafetySeverity {
    match envelope.payload_str("severity") {
        Some("info") => SafetySeverity::Info,
        Some("critical") => SafetySeverity::Critical,
        _ => SafetySeverity::Warning,
    }
}

/// Alerts about a minor go to their guardian; anyone else is told directly.
fn safety_alert(envelope: &EventEnvelope, ctx: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let reason = envelope
        .payload_str("reason")
        .unwrap_or("Potentially unsafe activity was detected");

    let (recipient, kid_account_id) = match (&ctx.subject.guardian_id, ctx.subject.is_minor) {
        (Some(guardian), true) => (guardian.clone(), Some(envelope.subject_user_id.clone())),
        _ => (envelope.subject_user_id.clone(), None),
    };

    let draft = NotificationDraft::new(recipient, NotificationType::SafetyAlert, "Safety alert", reason)
        .with_kind(NotificationKind::SafetyAlert {
            severity: severity(envelope),
            auto_resolved: envelope.payload_bool("autoResolved").unwrap_or(false),
            kid_account_id,
        })
        .with_payload_ref(envelope, "contentId");

    single(draft)
}

fn system_alert(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let message = require(envelope, "message")?;
    let title = envelope.payload_str("title").unwrap_or("System notice");

    let mut draft =
        NotificationDraft::new(&envelope.subject_user_id, NotificationType::SystemAlert, title, message);
    if envelope.payload_bool("critical").unwrap_or(false) {
        draft = draft.with_priority(Priority::Urgent);
    }
    single(draft)
}

fn educational_content(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let title = require(envelope, "title")?;
    let message = envelope
        .payload_str("summary")
        .unwrap_or("New learning content is available");

    single(
        NotificationDraft::new(
            &envelope.subject_user_id,
            NotificationType::EducationalContent,
            title,
            message,
        )
        .with_kind(NotificationKind::Educational {
            education_type: envelope
                .payload_str("educationType")
                .unwrap_or("tip")
                .to_string(),
            subject: envelope.payload_str("subject").map(str::to_string),
        })
        .with_payload_ref(envelope, "contentId"),
    )
}

fn achievement_earned(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let name = require(envelope, "achievementName")?;
    single(
        NotificationDraft::new(
            &envelope.subject_user_id,
            NotificationType::AchievementEarned,
            "Achievement unlocked",
            format!("You earned {}", name),
        )
        .with_payload_ref(envelope, "achievementId"),
    )
}

fn guardian_message(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let message = require(envelope, "message")?;
    require(envelope, "actorId")?;
    single(social(
        envelope,
        NotificationType::GuardianMessage,
        &format!("Message from {}", actor_name(envelope)),
        message.to_string(),
    ))
}

fn safety_reminder(envelope: &EventEnvelope, _: &BuildContext<'_>) -> Result<Drafts, EnvelopeError> {
    let message = envelope
        .payload_str("message")
        .unwrap_or("Remember to keep your personal information private");
    single(NotificationDraft::new(
        &envelope.subject_user_id,
        NotificationType::SafetyReminder,
        "Safety reminder",
        message,
    ))
}

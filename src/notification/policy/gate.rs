//! Kid-safety gate.
//!
//! Every draft addressed to a gated minor passes through [`KidSafetyGate::check`].
//! The gate is the only place that decides what a minor may receive:
//!
//! - request types are held for guardian approval unless already approved
//! - types outside [`KID_ALLOWED_TYPES`](crate::notification::KID_ALLOWED_TYPES)
//!   are blocked
//! - low safety scores and flagged words are blocked
//! - anything that passes is rewritten to the `Kid` kind, in-app only

use std::collections::HashSet;

use crate::broker::EventEnvelope;
use crate::error::NotifyError;
use crate::guardian::ApprovalRequest;
use crate::notification::{
    AccountProfile, ChannelSet, GuardianRequestType, NotificationKind, NotificationType, Priority,
    SafetySeverity,
};

use super::registry::NotificationDraft;

/// Words that block kid-bound text outright.
const FLAGGED_WORDS: &[&str] = &["violence", "adult", "inappropriate"];

const DEFAULT_SAFETY_SCORE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationReason {
    NotAllowed,
    LowSafetyScore(f64),
    FlaggedContent(&'static str),
    NoGuardian,
}

impl ViolationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationReason::NotAllowed => "not_allowed",
            ViolationReason::LowSafetyScore(_) => "low_safety_score",
            ViolationReason::FlaggedContent(_) => "flagged_content",
            ViolationReason::NoGuardian => "no_guardian",
        }
    }

    fn describe(&self) -> String {
        match self {
            ViolationReason::NotAllowed => "type is not on the allow-list".to_string(),
            ViolationReason::LowSafetyScore(score) => format!("safety score {:.2} below threshold", score),
            ViolationReason::FlaggedContent(word) => format!("content flagged for '{}'", word),
            ViolationReason::NoGuardian => "request requires a guardian but none is linked".to_string(),
        }
    }
}

/// A notification withheld from a minor.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyViolation {
    pub recipient_id: String,
    pub notification_type: NotificationType,
    pub reason: ViolationReason,
}

impl SafetyViolation {
    pub fn to_error(&self) -> NotifyError {
        NotifyError::KidSafetyViolation {
            recipient_id: self.recipient_id.clone(),
            notification_type: self.notification_type,
            reason: self.reason.describe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Deliver the (possibly rewritten) draft; optionally mirror it to the guardian
    Deliver {
        draft: NotificationDraft,
        mirror: Option<ApprovalRequest>,
    },
    /// Hold the draft until the guardian decides
    Intercept(ApprovalRequest),
    /// Drop the draft; alert the guardian when there is one
    Block {
        violation: SafetyViolation,
        alert: Option<NotificationDraft>,
    },
}

#[derive(Debug, Clone)]
pub struct KidSafetyGate {
    safety_score_threshold: f64,
    guardian_visible: HashSet<NotificationType>,
}

impl KidSafetyGate {
    pub fn new(safety_score_threshold: f64, guardian_visible: impl IntoIterator<Item = NotificationType>) -> Self {
        Self {
            safety_score_threshold,
            guardian_visible: guardian_visible.into_iter().collect(),
        }
    }

    pub fn check(
        &self,
        envelope: &EventEnvelope,
        mut draft: NotificationDraft,
        recipient: &AccountProfile,
        approved: bool,
    ) -> GateDecision {
        if !recipient.is_gated() {
            return GateDecision::Deliver {
                draft,
                mirror: None,
            };
        }

        let guardian = recipient.guardian_id.as_deref();

        if let Some(request_type) = draft.notification_type.guardian_request_type() {
            if approved {
                approve_draft(&mut draft, envelope, request_type);
            } else {
                return match guardian {
                    Some(guardian) => GateDecision::Intercept(ApprovalRequest::from_draft(
                        envelope,
                        &draft,
                        guardian,
                        request_type,
                    )),
                    None => self.block(draft, recipient, ViolationReason::NoGuardian),
                };
            }
        }

        let safety_score = envelope
            .payload_f64("safetyScore")
            .unwrap_or(DEFAULT_SAFETY_SCORE);

        if !draft.notification_type.is_kid_allowed() {
            return self.block(draft, recipient, ViolationReason::NotAllowed);
        }
        if safety_score < self.safety_score_threshold {
            return self.block(draft, recipient, ViolationReason::LowSafetyScore(safety_score));
        }
        if let Some(word) = flagged_word(&draft) {
            return self.block(draft, recipient, ViolationReason::FlaggedContent(word));
        }

        let guardian_visible = self.guardian_visible.contains(&draft.notification_type);

        // Keep the variant detail around; the kind itself must be Kid
        let prior = std::mem::replace(
            &mut draft.kind,
            NotificationKind::Kid {
                guardian_visible,
                safety_score,
                requires_guardian_action: false,
            },
        );
        if prior != NotificationKind::Social {
            if let Ok(detail) = serde_json::to_value(&prior) {
                draft.metadata.insert("detail".to_string(), detail);
            }
        }

        draft.channels = Some(ChannelSet::in_app_only());
        if draft.notification_type != NotificationType::SafetyAlert {
            draft.priority = Some(Priority::Low);
        }

        let mirror = match guardian {
            Some(guardian)
                if guardian_visible && draft.sender_id.as_deref() != Some(guardian) =>
            {
                Some(ApprovalRequest::from_draft(
                    envelope,
                    &draft,
                    guardian,
                    GuardianRequestType::ActivityReview,
                ))
            }
            _ => None,
        };

        GateDecision::Deliver { draft, mirror }
    }

    fn block(
        &self,
        draft: NotificationDraft,
        recipient: &AccountProfile,
        reason: ViolationReason,
    ) -> GateDecision {
        let alert = recipient
            .guardian_id
            .as_ref()
            .filter(|_| reason != ViolationReason::NoGuardian)
            .map(|guardian| {
                NotificationDraft::new(
                    guardian.clone(),
                    NotificationType::SafetyAlert,
                    "Safety alert",
                    format!(
                        "A {} notification for your child was blocked",
                        draft.notification_type.as_str().replace('_', " ")
                    ),
                )
                .with_kind(NotificationKind::SafetyAlert {
                    severity: SafetySeverity::Warning,
                    auto_resolved: true,
                    kid_account_id: Some(recipient.user_id.clone()),
                })
                .with_metadata("reason", reason.as_str())
                .with_metadata("blockedType", draft.notification_type.as_str())
            });

        GateDecision::Block {
            violation: SafetyViolation {
                recipient_id: recipient.user_id.clone(),
                notification_type: draft.notification_type,
                reason,
            },
            alert,
        }
    }
}

/// Swap a request for what the minor sees once it is approved. The text is
/// rewritten with the type so the notice no longer reads as a request.
fn approve_draft(draft: &mut NotificationDraft, envelope: &EventEnvelope, request_type: GuardianRequestType) {
    let actor = envelope.payload_str("actorName").unwrap_or("Someone");
    let (title, message) = match request_type {
        GuardianRequestType::FollowRequest => {
            ("Follow approved".to_string(), format!("{} can now follow you", actor))
        }
        GuardianRequestType::MessageRequest => {
            ("Messages approved".to_string(), format!("{} can now message you", actor))
        }
        other => (
            "Request approved".to_string(),
            format!("Your guardian approved a {} from {}", other.describe(), actor),
        ),
    };
    draft.notification_type = draft.notification_type.approved_form();
    draft.title = title;
    draft.message = message;
    draft.metadata.insert("approvedRequest".to_string(), request_type.as_str().into());
}

/// Screens every piece of text the minor could see, including metadata and
/// the kind detail that ends up in metadata. Identifier fields are skipped.
fn flagged_word(draft: &NotificationDraft) -> Option<&'static str> {
    flagged_in(&draft.title)
        .or_else(|| flagged_in(&draft.message))
        .or_else(|| flagged_in_fields(&draft.metadata))
        .or_else(|| match serde_json::to_value(&draft.kind) {
            Ok(serde_json::Value::Object(fields)) => flagged_in_fields(&fields),
            _ => None,
        })
}

fn flagged_in_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Option<&'static str> {
    fields
        .iter()
        .filter(|(key, _)| !is_identifier(key))
        .find_map(|(_, value)| flagged_in_value(value))
}

fn is_identifier(key: &str) -> bool {
    key.ends_with("Id") || key.ends_with("_id") || key == "id" || key == "type"
}

fn flagged_in(text: &str) -> Option<&'static str> {
    let text = text.to_lowercase();
    FLAGGED_WORDS.iter().copied().find(|word| text.contains(word))
}

fn flagged_in_value(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::String(text) => flagged_in(text),
        serde_json::Value::Array(items) => items.iter().find_map(flagged_in_value),
        serde_json::Value::Object(fields) => flagged_in_fields(fields),
        _ => None,
    }
}

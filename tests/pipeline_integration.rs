//! End-to-end tests over the in-memory environment: broker, policy engine,
//! delivery router, presence, inbox, approvals and the HTTP surface.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use haven_notification_service::broker::{EventEnvelope, MemoryBrokerBackend};
use haven_notification_service::config::Settings;
use haven_notification_service::notification::{AccountDirectory, AccountProfile};
use haven_notification_service::server::AppState;
use haven_notification_service::websocket::ServerMessage;

const JWT_SECRET: &str = "integration-secret";
const API_KEY: &str = "integration-key";

fn settings() -> Settings {
    serde_json::from_value(json!({
        "server": { "host": "127.0.0.1", "port": 0 },
        "jwt": { "secret": JWT_SECRET },
        "api": { "key": API_KEY },
        "broker": { "consumer": { "failure_policy": "halt_on_error" } }
    }))
    .unwrap()
}

async fn state() -> AppState {
    let state = AppState::new(settings(), Arc::new(MemoryBrokerBackend::new()), None, None);
    state
        .directory
        .upsert(AccountProfile::minor("kid-1", "parent-1"))
        .await
        .unwrap();
    state
        .directory
        .upsert(AccountProfile::adult("adult-1"))
        .await
        .unwrap();
    state
}

fn like(subject: &str) -> EventEnvelope {
    EventEnvelope::new(
        "post.liked",
        "social-service",
        subject,
        json!({ "postId": "p1", "actorId": "fan-1", "actorName": "Fan" }),
    )
}

mod idempotence_tests {
    use super::*;
    use haven_notification_service::broker::Topic;

    #[tokio::test]
    async fn test_publish_and_handle_twice_stores_once() {
        let state = state().await;
        let envelope = like("adult-1");

        let first = state.producer.publish(Topic::Social, &envelope).await.unwrap();
        let second = state.producer.publish(Topic::Social, &envelope).await.unwrap();
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());

        let handled = state.pipeline.process(&envelope).await.unwrap();
        let replayed = state.pipeline.process(&envelope).await.unwrap();
        assert_eq!(handled.stored, 1);
        assert_eq!(replayed.stored, 0);
        assert_eq!(replayed.duplicates, 1);

        let pending = state.inbox.undelivered("adult-1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_event_id, envelope.id);
    }
}

mod kid_safety_tests {
    use super::*;
    use haven_notification_service::notification::KID_ALLOWED_TYPES;

    #[tokio::test]
    async fn test_no_disallowed_type_reaches_a_minor() {
        let state = state().await;
        let payload = json!({
            "postId": "p1",
            "actorId": "stranger",
            "actorName": "Stranger",
            "conversationId": "c1",
            "messageId": "m1",
            "content": "hello there",
            "groupId": "g1",
            "groupName": "Group",
            "contentId": "x1",
            "repostId": "r1",
            "repostType": "simple",
            "title": "Title",
            "message": "Body",
            "reason": "review",
            "severity": "low",
            "educationType": "tip",
            "achievementName": "First post",
        });

        let mut event_types: Vec<String> = state
            .engine
            .registry()
            .event_types()
            .into_iter()
            .map(str::to_string)
            .collect();
        event_types.extend(
            ["", "nope", "post.liked.extra", "GUARDIAN.MESSAGE", "system.alert ", "💥"]
                .into_iter()
                .map(str::to_string),
        );

        for event_type in &event_types {
            let envelope =
                EventEnvelope::new(event_type.as_str(), "fuzz", "kid-1", payload.clone());
            // Unknown or malformed events are rejected; that is also fine here
            let _ = state.pipeline.process(&envelope).await;
        }

        let received = state.inbox.undelivered("kid-1", 1_000).await.unwrap();
        assert!(!received.is_empty());
        for notification in received {
            assert!(
                KID_ALLOWED_TYPES.contains(&notification.notification_type),
                "{:?} reached a minor",
                notification.notification_type
            );
        }
    }
}

mod realtime_tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_recipient_gets_push_and_it_is_delivered() {
        let state = state().await;
        let (tx, mut rx) = mpsc::channel(8);
        state.presence.connect("adult-1", tx).unwrap();

        let report = state.pipeline.process(&like("adult-1")).await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.pushed, 1);

        let Some(ServerMessage::Notification { notification }) = rx.recv().await else {
            panic!("expected a notification push");
        };
        let stored = state.inbox.get(notification.id).await.unwrap().unwrap();
        assert!(stored.delivered);
        assert!(state.inbox.undelivered("adult-1", 10).await.unwrap().is_empty());
    }
}

mod offline_tests {
    use super::*;
    use haven_notification_service::inbox::pull_undelivered;

    #[tokio::test]
    async fn test_offline_recipient_pulls_then_acks() {
        let state = state().await;
        state.pipeline.process(&like("adult-1")).await.unwrap();

        let batch = pull_undelivered(state.inbox.as_ref(), "adult-1", None, 100)
            .await
            .unwrap();
        assert_eq!(batch.notifications.len(), 1);
        assert_eq!(batch.unread_count, 1);
        assert!(!batch.has_more);

        let id = batch.notifications[0].id;
        let marked = state.inbox.mark_delivered("adult-1", &[id]).await;
        assert_eq!(tokio_test::assert_ok!(marked), 1);

        let after = pull_undelivered(state.inbox.as_ref(), "adult-1", None, 100)
            .await
            .unwrap();
        assert!(after.notifications.is_empty());
        // Delivered is not read
        assert_eq!(after.unread_count, 1);
    }
}

mod approval_tests {
    use super::*;
    use haven_notification_service::guardian::{ApprovalStatus, ExpirySummary};

    #[tokio::test]
    async fn test_untouched_approval_expires_exactly_once() {
        let state = state().await;
        let envelope = EventEnvelope::new(
            "follow.requested",
            "social-service",
            "kid-1",
            json!({ "actorId": "stranger", "actorName": "Stranger" }),
        );
        let report = state.pipeline.process(&envelope).await.unwrap();
        assert_eq!(report.approvals, 1);

        let pending = state.approvals.pending_for_guardian("parent-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        let approval_id = pending[0].id();

        let later = Utc::now() + Duration::hours(73);
        let first = state.approvals.expire_due(later).await.unwrap();
        let second = state.approvals.expire_due(later).await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(second, ExpirySummary::default());

        let record = state.approvals.get(approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Expired);
        assert!(record.outcome_emitted);
        assert_eq!(state.inbox.undelivered("stranger", 10).await.unwrap().len(), 1);
        assert!(state.inbox.undelivered("kid-1", 10).await.unwrap().is_empty());
    }
}

mod messaging_tests {
    use super::*;
    use haven_notification_service::messaging::MessageType;
    use haven_notification_service::presence::{MemberRole, RoomDirectory, RoomMember};

    #[tokio::test]
    async fn test_offline_participant_gets_inbox_entry_with_same_content() {
        let state = state().await;
        state
            .presence
            .rooms()
            .set_members(
                "c1",
                vec![
                    RoomMember::new("alice", MemberRole::Member),
                    RoomMember::new("bob", MemberRole::Member),
                ],
            )
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let alice = state.presence.connect("alice", tx).unwrap();
        state
            .conversations
            .join(alice.session.connection_id, "alice", "c1")
            .await
            .unwrap();

        let unread_before = state.inbox.unread_count("bob").await.unwrap();
        let message = state
            .conversations
            .send_message("alice", "c1", "see you at four", MessageType::Text, None)
            .await
            .unwrap();

        assert_eq!(state.inbox.unread_count("bob").await.unwrap(), unread_before + 1);
        assert_eq!(state.conversations.unread_count("c1", "bob"), 1);

        let pulled = state.inbox.undelivered("bob", 10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].metadata["content"], message.content.as_str());
        assert_eq!(pulled[0].metadata["conversationId"], "c1");
    }
}

mod minor_comment_tests {
    use super::*;
    use haven_notification_service::notification::{ChannelSet, NotificationKind, Priority};

    #[tokio::test]
    async fn test_high_priority_comment_is_toned_down_for_a_minor() {
        let state = state().await;
        let envelope = EventEnvelope::new(
            "comment.created",
            "social-service",
            "kid-1",
            json!({ "postId": "p1", "actorId": "friend", "excerpt": "nice drawing" }),
        )
        .with_priority(Priority::High);

        state.pipeline.process(&envelope).await.unwrap();

        let received = state.inbox.undelivered("kid-1", 10).await.unwrap();
        assert_eq!(received.len(), 1);
        let notification = &received[0];
        assert!(matches!(notification.kind, NotificationKind::Kid { .. }));
        assert_eq!(notification.channels, ChannelSet::in_app_only());
        assert_eq!(notification.priority, Priority::Low);
    }
}

mod http_tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use haven_notification_service::auth::Claims;
    use haven_notification_service::server::create_app;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt;

    fn token(user_id: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + 3600,
            iat: now,
            roles: Vec::new(),
            extra: Default::default(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn publish(topic: &str, api_key: Option<&str>) -> Request<Body> {
        let body = json!({
            "eventType": "post.liked",
            "producerId": "social-service",
            "subjectUserId": "adult-1",
            "payload": { "postId": "p1", "actorId": "fan-1" }
        });
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/events/{}", topic))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_publish_accepts_known_topic() {
        let app = create_app(state().await);
        let response = app.oneshot(publish("social", Some(API_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["topic"], "social");
        assert_eq!(json["duplicate"], false);
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_topic() {
        let app = create_app(state().await);
        let response = app.oneshot(publish("bogus", Some(API_KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_requires_api_key() {
        let app = create_app(state().await);
        let response = app.oneshot(publish("social", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_inbox_requires_token() {
        let app = create_app(state().await);
        let request = Request::builder()
            .uri("/api/v1/inbox/undelivered")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_inbox_sync_with_token() {
        let state = state().await;
        state.pipeline.process(&like("adult-1")).await.unwrap();
        let app = create_app(state);

        let request = Request::builder()
            .uri("/api/v1/inbox/undelivered?limit=5")
            .header(header::AUTHORIZATION, format!("Bearer {}", token("adult-1")))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["notifications"].as_array().unwrap().len(), 1);
        assert_eq!(json["has_more"], false);
    }

    #[tokio::test]
    async fn test_health_reports_memory_broker() {
        let app = create_app(state().await);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["broker"]["backend"], "memory");
    }
}

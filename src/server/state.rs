use std::sync::Arc;
use std::time::Instant;

use crate::auth::JwtValidator;
use crate::broker::{create_client, create_producer, BrokerBackend, BrokerClient, EventProducer};
use crate::config::Settings;
use crate::delivery::{create_dispatcher, DeliveryRouter};
use crate::guardian::{
    create_approval_store, create_independence_store, ApprovalPolicy, ApprovalService,
    IndependenceRules, IndependenceService,
};
use crate::inbox::{create_inbox_backend, InboxBackend, RetentionPolicy};
use crate::messaging::ConversationService;
use crate::notification::{
    create_account_directory, AccountDirectory, BuilderRegistry, KidSafetyGate, PolicyEngine,
};
use crate::pipeline::NotificationPipeline;
use crate::postgres::PostgresPool;
use crate::presence::{MemoryRoomDirectory, PresenceGateway, PresenceLimits, RoomDirectory};
use crate::redis::RedisPool;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub directory: Arc<dyn AccountDirectory>,
    pub presence: Arc<PresenceGateway>,
    pub inbox: Arc<dyn InboxBackend>,
    pub router: Arc<DeliveryRouter>,
    pub engine: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalService>,
    pub pipeline: Arc<NotificationPipeline>,
    pub conversations: Arc<ConversationService>,
    pub independence: Arc<IndependenceService>,
    pub producer: Arc<EventProducer>,
    pub broker: Arc<BrokerClient>,
    pub retention: RetentionPolicy,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every component from settings. Storage pools are optional; a
    /// missing pool falls back to the in-memory backend.
    pub fn new(
        settings: Settings,
        broker_backend: Arc<dyn BrokerBackend>,
        postgres_pool: Option<Arc<PostgresPool>>,
        redis_pool: Option<Arc<RedisPool>>,
    ) -> Self {
        let directory = create_account_directory(&settings.directory, postgres_pool.clone());
        let rooms: Arc<dyn RoomDirectory> = Arc::new(MemoryRoomDirectory::new());
        Self::with_directories(settings, broker_backend, directory, rooms, postgres_pool, redis_pool)
    }

    pub fn with_directories(
        settings: Settings,
        broker_backend: Arc<dyn BrokerBackend>,
        directory: Arc<dyn AccountDirectory>,
        rooms: Arc<dyn RoomDirectory>,
        postgres_pool: Option<Arc<PostgresPool>>,
        redis_pool: Option<Arc<RedisPool>>,
    ) -> Self {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt));

        let presence = Arc::new(PresenceGateway::new(
            rooms,
            PresenceLimits::from(&settings.presence),
        ));
        let inbox = create_inbox_backend(&settings.inbox, postgres_pool.clone());
        let approval_store = create_approval_store(&settings.guardian, postgres_pool.clone());
        let dispatcher = create_dispatcher(&settings.dispatch);

        let router = Arc::new(DeliveryRouter::new(
            inbox.clone(),
            presence.clone(),
            dispatcher,
        ));
        let engine = Arc::new(PolicyEngine::new(
            BuilderRegistry::with_defaults(),
            directory.clone(),
            approval_store.clone(),
            KidSafetyGate::new(
                settings.guardian.safety_score_threshold,
                settings.guardian.guardian_visible_types.iter().copied(),
            ),
        ));

        let producer = Arc::new(create_producer(&settings.broker, broker_backend.clone()));
        let broker = Arc::new(create_client(&settings.broker, broker_backend));

        let approvals = Arc::new(ApprovalService::new(
            approval_store,
            router.clone(),
            engine.clone(),
            producer.clone(),
            ApprovalPolicy::from(&settings.guardian),
        ));
        let pipeline = Arc::new(NotificationPipeline::new(
            engine.clone(),
            router.clone(),
            approvals.clone(),
        ));
        let conversations = Arc::new(ConversationService::new(
            presence.clone(),
            pipeline.clone(),
        ));
        let independence = Arc::new(IndependenceService::new(
            IndependenceRules::from(&settings.independence),
            create_independence_store(&settings.independence, postgres_pool.clone()),
            directory.clone(),
            pipeline.clone(),
        ));

        let retention = RetentionPolicy::from(&settings.inbox.retention);

        Self {
            settings: Arc::new(settings),
            jwt_validator,
            directory,
            presence,
            inbox,
            router,
            engine,
            approvals,
            pipeline,
            conversations,
            independence,
            producer,
            broker,
            retention,
            postgres_pool,
            redis_pool,
            start_time: Instant::now(),
        }
    }
}

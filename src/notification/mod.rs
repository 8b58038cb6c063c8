//! Notification model, account directory and the policy engine.

mod directory;
pub mod policy;
mod types;

pub use directory::{
    create_account_directory, AccountDirectory, AccountProfile, DirectoryError,
    MemoryAccountDirectory, PostgresAccountDirectory,
};
pub use policy::{
    materialize, BuildContext, BuilderRegistry, KidSafetyGate, NotificationDraft, PolicyEngine,
    PolicyOutcome, SafetyViolation, ViolationReason,
};
pub use types::{
    ApprovalStatus, Channel, ChannelSet, GuardianRequestType, IndependencePhase, Notification,
    NotificationKind, NotificationType, Priority, SafetySeverity, KID_ALLOWED_TYPES,
};

//! Guardian approvals and the independence transition.
//!
//! The kid-safety gate holds requests addressed to minors and hands them
//! here as [`ApprovalRequest`]s. Each becomes an [`ApprovalRecord`] that a
//! guardian approves or denies, or that expires into its configured
//! [`DefaultOutcome`].

mod approval;
mod factory;
mod independence;
mod independence_store;
mod service;
mod store;

pub use crate::notification::ApprovalStatus;
pub use approval::{
    ApprovalError, ApprovalPolicy, ApprovalRecord, ApprovalRequest, DefaultOutcome, Resolution,
};
pub use factory::{create_approval_store, create_independence_store};
pub use independence::{
    EvaluationSummary, IndependenceProfile, IndependenceRules, IndependenceService,
    IndependenceUpdate,
};
pub use independence_store::{
    IndependenceStore, IndependenceStoreError, MemoryIndependenceStore, PostgresIndependenceStore,
};
pub use service::{ApprovalService, ExpirySummary};
pub use store::{ApprovalStore, MemoryApprovalStore, PostgresApprovalStore};

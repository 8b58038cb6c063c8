//! Background tasks. Each one runs until the shutdown broadcast fires.

mod approval_sweeper;
mod evaluator;
mod liveness;
mod retention;

pub use approval_sweeper::ApprovalSweeper;
pub use evaluator::IndependenceEvaluator;
pub use liveness::LivenessTask;
pub use retention::{RetentionPass, RetentionTask};

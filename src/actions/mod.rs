//! Durable scheduling of single actions.
//!
//! The scheduler persists a PENDING row and enqueues exactly one queue
//! job; the executor claims the row with a conditional update and
//! performs the side effect; the sweeper re-drives rows stuck past
//! their due time.

pub mod executor;
pub mod model;
pub mod scheduler;
pub mod sweeper;

pub use executor::{ActionExecutor, ExecutionOutcome};
pub use model::{
    ActionKind, ActionPayload, ActionStatus, DELAYABLE_KINDS, ScheduleRequest, ScheduledAction,
    SchedulingStatus,
};
pub use scheduler::ActionScheduler;
pub use sweeper::RecoverySweeper;

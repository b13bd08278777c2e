//! Account Scheduler: sticky-session affinity, group-filtered priority
//! ranking, and fair FIFO queueing across sticky and fallback waitlists.

mod bucket;
mod lease;
mod scheduler;

pub(crate) use scheduler::SchedulerInner;

pub use lease::Lease;
pub use scheduler::{ScheduleRequest, Scheduler};

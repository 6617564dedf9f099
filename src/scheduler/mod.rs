pub mod job;
pub mod limiter;
pub mod queue;

pub use job::{JobCtrl, JobMessage, JobRuntime, JobState, MirrorJob};
pub use limiter::{Limiter, SyncingGuard};
pub use queue::ScheduleQueue;

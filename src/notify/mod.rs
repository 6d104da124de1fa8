//! Notification delivery: bounded priority queue, trailing-window rate
//! budgets, and the drain pipeline.

pub mod limiter;
pub mod pipeline;
pub mod queue;

pub use limiter::SlidingWindow;
pub use pipeline::{NotificationPipeline, PipelineStats};
pub use queue::{NotificationQueue, Priority, QueueStats};

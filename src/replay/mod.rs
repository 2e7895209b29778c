//! Replay Scheduler (H, §4.5-§4.6): per-session virtual clock, buffer
//! drain/aggregation, and historical-store prefetch.

pub mod buffer;
pub mod scheduler;

pub use buffer::ReplayBuffer;

pub mod queue;

pub use queue::{DurableQueue, QueueStats};

pub mod frame;
pub mod link;

pub use link::{RetryPolicy, SensorLink, SerialSettings, TtyOpener};

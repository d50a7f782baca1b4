pub mod collector;
pub mod connectivity;
pub mod http;

pub use collector::{Acceptance, AssignmentReply, Collector, Registration, Registry};
pub use connectivity::{ConnectivityCache, ConnectivityState, Probe};
pub use http::HttpCollector;

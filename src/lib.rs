pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod node;
pub mod replay;
pub mod resilience;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use config::CoordinatorConfig;
pub use error::{CoordError, Result};
pub use node::{Coordinator, Escalation};

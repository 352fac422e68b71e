//! Edge QoS enforcer.
//!
//! Embedded in each proxy instance. Makes per-request admit/reject
//! decisions against the locally-held violation tables, shapes every
//! forwarded payload chunk against the user's per-direction bandwidth
//! share, and emits usage events to the local collector over UDP. A
//! background client keeps the violation tables and limit shares fed
//! from the policy generator.

pub mod admission;
pub mod config;
pub mod edge;
pub mod emitter;
pub mod error;
pub mod policy_client;
pub mod shaper;
pub mod time;
pub mod user_limits;
pub mod violations;

pub use admission::{Admission, RequestGuard, RequestMeta, Violation};
pub use config::EnforcerConfig;
pub use edge::EdgeQos;
pub use error::EnforcerError;
pub use shaper::Shape;

pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod keys;
pub mod liveness;
pub mod logging;
pub mod manager;
pub mod models;
pub mod notifications;
pub mod session;
pub mod store;
pub mod url_state;

// Re-export main types for library usage
pub use error::SessionError;
pub use keys::SessionKeys;
pub use liveness::{classify_workers, run_heartbeat, WorkerLiveness};
pub use manager::{SessionLookup, SessionManager};
pub use models::{HintStatus, SessionMeta, SessionStatus, SCHEMA_VERSION};
pub use notifications::{StatsEvent, StatsEventKind, StatsSubscription, SubscribeTarget};
pub use session::Session;
pub use url_state::{UrlState, UrlStatus};

pub mod admin_api;
pub mod audit;
pub mod config_providers;
pub mod log_levels;
pub mod policy_store;

/// Re-export commonly used types from adapters
pub use audit::TracingAuditSink;
pub use config_providers::FileConfigProvider;
pub use log_levels::LogLevelOverrides;
pub use policy_store::{InMemoryPolicyStore, JsonFilePolicyStore};

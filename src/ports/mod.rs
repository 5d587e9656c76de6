pub mod audit_sink;
pub mod config_provider;
pub mod log_levels;
pub mod policy_store;

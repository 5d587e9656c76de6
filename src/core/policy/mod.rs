//! Typed gateway policies with a write-through cache.
pub mod evaluate;
pub mod ip;
pub mod model;
pub mod runtime;

pub use evaluate::{IpVerdict, PolicyViolation, evaluate_ip};
pub use ip::{CidrError, IpNetwork};
pub use model::{
    CacheConfig, CorsConfig, IpConfig, PolicyConfig, PolicyEntry, PolicyMode, PolicyType,
    RateLimitPolicyConfig,
};
pub use runtime::{PolicyError, PolicyRuntime};

//! Rate limit configuration, partitioned limiting and rejection reporting.
pub mod limiter;
pub mod rejections;
pub mod runtime;

pub use limiter::{PartitionedRateLimiter, RateLimitDecision};
pub use rejections::{PartitionCount, RateLimitRejectionAggregator, RejectionSnapshot};
pub use runtime::{
    RateLimitApplyError, RateLimitConfigDto, RateLimitDefaults, RateLimitRouteOverride,
    RateLimitRuntime, ResolvedLimits,
};

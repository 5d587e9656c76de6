pub mod audit;
pub mod gateway;
pub mod output_cache;
pub mod policy;
pub mod rate_limit;
pub mod routes;
pub mod tenant;
pub mod tls;

pub use gateway::{Admission, GatewayService, ReloadSummary};
pub use tenant::TenantResolver;

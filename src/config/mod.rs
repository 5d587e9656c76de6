pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{SAMPLE_CONFIG, load_config};
pub use models::*;
pub use validation::{GatewayConfigValidator, ValidationError, ValidationResult};

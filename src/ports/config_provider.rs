use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::GatewayConfig;

/// Source of gateway configuration that can signal changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Take the change-signal receiver. Only the first call gets it; each
    /// signal means the caller should reload through `load_config`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}

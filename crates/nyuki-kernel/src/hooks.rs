use anyhow::Result;
use async_trait::async_trait;

use crate::nyuki::NyukiHandle;

/// Agent-specific setup and teardown.
///
/// `on_start` runs once the bus connection is initiated and the API is
/// listening; `on_stop` runs before the API and the bus go down. Errors are
/// logged and do not abort the transition.
#[async_trait]
pub trait NyukiHooks: Send + Sync + 'static {
    async fn on_start(&self, _nyuki: &NyukiHandle) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _nyuki: &NyukiHandle) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl NyukiHooks for NoHooks {}

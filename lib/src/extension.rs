//! Product logic entry point
//!
//! The agent activates exactly one [`Extension`] during `initialize`. The
//! extension registers commands, providers and panels against the host; it is
//! the consumer of the host API, never the other way around.

use crate::error::Result;
use crate::host::HostContext;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Extension: Send + Sync {
    /// Called once per session after the client info is known
    ///
    /// An error here is fatal for the session.
    async fn activate(&self, host: Arc<HostContext>) -> Result<()>;
}

/// Extension that registers nothing
#[derive(Debug, Default)]
pub struct NoopExtension;

#[async_trait]
impl Extension for NoopExtension {
    async fn activate(&self, _host: Arc<HostContext>) -> Result<()> {
        Ok(())
    }
}

//! Plugin pipeline extension points.
//!
//! Plugins are consulted in registration order at four fixed points of the
//! poll/execute cycle. Every method defaults to a no-op, so a plugin
//! implements only the hooks it cares about. Hook errors are caught and
//! logged by the engine; they never abort a job or the loop.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::Result;
use crate::handler::JobError;
use crate::job::JobRecord;

/// Context handed to [`Plugin::init`].
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Name of the queue the engine is processing.
    pub queue_name: String,
}

/// Directive returned by [`Plugin::before_poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDirective {
    /// Keep polling.
    Continue,
    /// Exit the run loop; disposers still run.
    Stop,
}

/// Future returned by a disposer.
pub type DisposeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Cleanup callback optionally returned by [`Plugin::init`].
///
/// Disposers run in reverse registration order when the loop exits, on every
/// exit path; a failing disposer is logged and does not prevent later ones
/// from running.
pub type Disposer = Box<dyn FnOnce() -> DisposeFuture + Send>;

/// An optional-capability collaborator wrapped around the engine loop.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once when the run loop starts; may return a cleanup disposer.
    async fn init(&self, _ctx: &PluginContext) -> Result<Option<Disposer>> {
        Ok(None)
    }

    /// Called before every poll; returning [`PollDirective::Stop`] exits the
    /// loop.
    async fn before_poll(&self) -> Result<PollDirective> {
        Ok(PollDirective::Continue)
    }

    /// Called with every claimed job before its handler runs.
    async fn before_job(&self, _job: &JobRecord) -> Result<()> {
        Ok(())
    }

    /// Called after every job regardless of outcome, with the error if any.
    async fn after_job(&self, _job: &JobRecord, _error: Option<&JobError>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Plugin for Noop {}

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        let plugin = Noop;
        let ctx = PluginContext {
            queue_name: "toil".to_string(),
        };
        assert!(plugin.init(&ctx).await.unwrap().is_none());
        assert_eq!(plugin.before_poll().await.unwrap(), PollDirective::Continue);
    }
}

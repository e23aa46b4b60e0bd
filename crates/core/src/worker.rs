//! Thin worker driver around the engine loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::Result;

/// Handle for stopping a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Request the worker to stop after the current run-loop pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Driver that repeatedly invokes the engine's run loop until stopped.
pub struct Worker {
    engine: Engine,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Create a new worker for the given engine.
    pub fn new(engine: Engine, poll_timeout: Duration) -> Self {
        Self {
            engine,
            poll_timeout,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get a stop handle.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Drive the engine until [`WorkerHandle::stop`] is called or an engine
    /// error propagates.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("worker started");
        while self.running.load(Ordering::SeqCst) {
            self.engine.run(false, self.poll_timeout).await?;
        }
        tracing::info!("worker stopped");
        Ok(())
    }
}

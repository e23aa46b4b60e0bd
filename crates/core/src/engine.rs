//! Processing engine: submission, handler dispatch, and the poll loop.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::backend::{Backend, SharedBackend};
use crate::config::EngineConfig;
use crate::error::{Result, ToilError};
use crate::events::EventHooks;
use crate::handler::{Handlers, JobContext, JobError, JobResult};
use crate::job::{unix_now, JobId, JobMeta, JobRecord, JobStatus, SubmitOptions};
use crate::plugin::{Disposer, Plugin, PluginContext, PollDirective};

struct EngineInner {
    backend: SharedBackend,
    config: EngineConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    events: EventHooks,
    handlers: RwLock<Option<Arc<Handlers>>>,
}

/// The processing engine.
///
/// Accepts job submissions, owns the handler registry, and runs the
/// poll -> reserve -> execute -> resolve loop against a storage backend.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create a new builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Submit a job with default options.
    pub async fn submit<T: Serialize>(&self, name: &str, payload: &T) -> Result<JobId> {
        self.submit_with_options(name, payload, SubmitOptions::default())
            .await
    }

    /// Submit a job with explicit scheduling options.
    ///
    /// Fires the "submitted" notification before the backend insert and
    /// "submitted-acknowledged" with the assigned id after it. Backend
    /// errors propagate to the caller.
    pub async fn submit_with_options<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        options: SubmitOptions,
    ) -> Result<JobId> {
        let meta = JobMeta {
            ttr_secs: options
                .ttr
                .unwrap_or(self.inner.config.default_ttr)
                .as_secs(),
            delay_secs: options.delay.unwrap_or_default().as_secs(),
            priority: options.priority,
            pushed_at: unix_now(),
            ..Default::default()
        };
        self.inner.events.emit_submitted(name, &meta);
        let body = serde_json::to_vec(payload)?;
        let id = self.inner.backend.insert(name, &body, meta).await?;
        self.inner.events.emit_accepted(&id, name);
        tracing::debug!(job_id = %id, job_name = name, "job submitted");
        Ok(id)
    }

    /// Replace the entire handler registry atomically and mark the engine
    /// ready to run.
    pub fn register_handlers(&self, handlers: Handlers) {
        let mut slot = self
            .inner
            .handlers
            .write()
            .expect("handler registry poisoned");
        *slot = Some(Arc::new(handlers));
    }

    /// Current lifecycle stage of a job.
    ///
    /// A job the backend no longer knows is reported as `Done` (archived).
    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self
            .inner
            .backend
            .status(id)
            .await?
            .unwrap_or(JobStatus::Done))
    }

    /// Run the engine's control loop.
    ///
    /// With `repeat` false the loop exits on the first empty poll; otherwise
    /// it sleeps [`EngineConfig::idle_sleep`] and polls again until a
    /// plugin's `before_poll` returns stop or a backend error occurs.
    /// Plugin disposers run in reverse registration order on every exit
    /// path. Fails with a configuration error if handlers were never
    /// registered.
    pub async fn run(&self, repeat: bool, poll_timeout: Duration) -> Result<()> {
        let handlers = self
            .inner
            .handlers
            .read()
            .expect("handler registry poisoned")
            .clone()
            .ok_or_else(|| {
                ToilError::Config("run called before register_handlers".to_string())
            })?;

        let ctx = PluginContext {
            queue_name: self.inner.config.queue_name.clone(),
        };
        let mut disposers: Vec<Disposer> = Vec::new();
        for plugin in &self.inner.plugins {
            match plugin.init(&ctx).await {
                Ok(Some(disposer)) => disposers.push(disposer),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "plugin init failed"),
            }
        }

        tracing::info!(queue = %self.inner.config.queue_name, repeat, "engine loop started");
        let result = self.run_loop(repeat, poll_timeout, &handlers).await;

        for disposer in disposers.into_iter().rev() {
            if let Err(e) = disposer().await {
                tracing::warn!(error = %e, "plugin disposer failed");
            }
        }
        tracing::info!(queue = %self.inner.config.queue_name, "engine loop stopped");
        result
    }

    async fn run_loop(
        &self,
        repeat: bool,
        poll_timeout: Duration,
        handlers: &Handlers,
    ) -> Result<()> {
        'poll: loop {
            for plugin in &self.inner.plugins {
                match plugin.before_poll().await {
                    Ok(PollDirective::Continue) => {}
                    Ok(PollDirective::Stop) => {
                        tracing::info!("polling stopped by plugin");
                        break 'poll;
                    }
                    Err(e) => tracing::warn!(error = %e, "before_poll hook failed"),
                }
            }

            // A reserve/complete/fail error means the synchronization
            // primitive itself is compromised; it propagates and stops the
            // loop (disposers still run in the caller).
            let record = match self.inner.backend.reserve(poll_timeout).await? {
                Some(record) => record,
                None => {
                    if !repeat {
                        break;
                    }
                    tokio::time::sleep(self.inner.config.idle_sleep).await;
                    continue;
                }
            };

            self.process(record, handlers).await?;
        }
        Ok(())
    }

    async fn process(&self, record: JobRecord, handlers: &Handlers) -> Result<()> {
        for plugin in &self.inner.plugins {
            if let Err(e) = plugin.before_job(&record).await {
                tracing::warn!(job_id = %record.id, error = %e, "before_job hook failed");
            }
        }

        let outcome: JobResult = match handlers.get(&record.name) {
            None => Err(JobError::new(format!(
                "no handler registered for job '{}'",
                record.name
            ))),
            Some(handler) => {
                self.inner.events.emit_started(&record);
                tracing::debug!(
                    job_id = %record.id,
                    job_name = %record.name,
                    attempt = record.meta.attempt,
                    "processing job"
                );
                match serde_json::from_slice(&record.body) {
                    Ok(payload) => {
                        let ctx = JobContext::new(
                            record.id.clone(),
                            record.name.clone(),
                            payload,
                            record.meta.clone(),
                            self.clone(),
                        );
                        handler(ctx).await
                    }
                    Err(e) => Err(JobError::new(format!("invalid payload: {}", e))),
                }
            }
        };

        match &outcome {
            Ok(()) => self.inner.events.emit_succeeded(&record),
            Err(e) => self.inner.events.emit_failed(&record, &e.message),
        }

        for plugin in &self.inner.plugins {
            if let Err(e) = plugin.after_job(&record, outcome.as_ref().err()).await {
                tracing::warn!(job_id = %record.id, error = %e, "after_job hook failed");
            }
        }

        match outcome {
            Ok(()) => {
                tracing::debug!(job_id = %record.id, "job completed");
                self.inner.backend.complete(&record).await
            }
            Err(e) => {
                tracing::warn!(job_id = %record.id, error = %e.message, "job failed");
                self.inner.backend.fail(&record, &e.message).await
            }
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    backend: Option<SharedBackend>,
    config: EngineConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    events: EventHooks,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: None,
            config: EngineConfig::default(),
            plugins: Vec::new(),
            events: EventHooks::default(),
        }
    }

    /// Set the storage backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a plugin; plugins run in registration order.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Subscribe to the "submitted" notification.
    pub fn on_submitted(
        mut self,
        f: impl Fn(&str, &JobMeta) + Send + Sync + 'static,
    ) -> Self {
        self.events.on_submitted(f);
        self
    }

    /// Subscribe to the "submitted-acknowledged" notification.
    pub fn on_accepted(
        mut self,
        f: impl Fn(&JobId, &str) + Send + Sync + 'static,
    ) -> Self {
        self.events.on_accepted(f);
        self
    }

    /// Subscribe to the "execution-started" notification.
    pub fn on_started(mut self, f: impl Fn(&JobRecord) + Send + Sync + 'static) -> Self {
        self.events.on_started(f);
        self
    }

    /// Subscribe to the "execution-succeeded" notification.
    pub fn on_succeeded(mut self, f: impl Fn(&JobRecord) + Send + Sync + 'static) -> Self {
        self.events.on_succeeded(f);
        self
    }

    /// Subscribe to the "execution-failed" notification.
    pub fn on_failed(
        mut self,
        f: impl Fn(&JobRecord, &str) + Send + Sync + 'static,
    ) -> Self {
        self.events.on_failed(f);
        self
    }

    /// Build the Engine; the backend is required.
    pub fn build(self) -> Result<Engine> {
        let backend = self
            .backend
            .ok_or_else(|| ToilError::Config("Backend is required".to_string()))?;
        Ok(Engine {
            inner: Arc::new(EngineInner {
                backend,
                config: self.config,
                plugins: self.plugins,
                events: self.events,
                handlers: RwLock::new(None),
            }),
        })
    }
}

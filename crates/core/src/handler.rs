//! Handler registry and job execution context.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::engine::Engine;
use crate::error::Result;
use crate::job::{JobId, JobMeta};

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
///
/// Failures are terminal: the record is marked failed and never retried by
/// the engine. The only redelivery mechanism is lease expiry of abandoned
/// (unresolved) work.
#[derive(Debug)]
pub struct JobError {
    /// Error message, recorded on the job and passed to notifications.
    pub message: String,
}

impl JobError {
    /// Create a new job error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// Execution context handed to a job handler.
///
/// Carries the claimed record's identity, payload, and metadata, plus an
/// [`Engine`] clone so handlers can submit follow-up jobs or query status.
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    name: String,
    payload: serde_json::Value,
    meta: JobMeta,
    engine: Engine,
}

impl JobContext {
    pub(crate) fn new(
        id: JobId,
        name: String,
        payload: serde_json::Value,
        meta: JobMeta,
        engine: Engine,
    ) -> Self {
        Self {
            id,
            name,
            payload,
            meta,
            engine,
        }
    }

    /// The job's backend-assigned id.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// The job name this context was dispatched for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decoded payload value.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Scheduling metadata, including the current attempt count.
    pub fn meta(&self) -> &JobMeta {
        &self.meta
    }

    /// The engine processing this job, for follow-up submissions.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Boxed future returned by a registered handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

type HandlerFn = dyn Fn(JobContext) -> HandlerFuture + Send + Sync;

/// Mapping from job name to handler function.
///
/// The full map is supplied wholesale to [`Engine::register_handlers`];
/// a job name with no entry is a per-job failure at dispatch time, while
/// running with no registration at all is a configuration error.
#[derive(Default)]
pub struct Handlers {
    map: HashMap<String, Arc<HandlerFn>>,
}

impl Handlers {
    /// Create an empty handler map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `name`.
    ///
    /// The payload is decoded into `T` before the handler runs; a decode
    /// failure fails the job without invoking the handler. This pins the
    /// name-to-payload-type mapping at registration time.
    pub fn on<T, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.on_raw(name, move |ctx: JobContext| {
            let decoded = ctx.payload_as::<T>().map(|payload| f(payload, ctx));
            async move {
                match decoded {
                    Ok(fut) => fut.await,
                    Err(e) => Err(JobError::new(format!("invalid payload: {}", e))),
                }
            }
        })
    }

    /// Register a handler that receives the raw JSON payload via the
    /// context, without upfront decoding.
    pub fn on_raw<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: Arc<HandlerFn> =
            Arc::new(move |ctx: JobContext| -> HandlerFuture { Box::pin(f(ctx)) });
        self.map.insert(name.into(), handler);
        self
    }

    /// Whether a handler is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<HandlerFn>> {
        self.map.get(name).cloned()
    }
}

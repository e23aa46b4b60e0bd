//! Typed lifecycle notifications.
//!
//! Five notification kinds are emitted synchronously at fixed points in the
//! submit and execute paths. Subscribers are observation-only: they run
//! inline with the loop but cannot change the outcome of a job.

use crate::job::{JobId, JobMeta, JobRecord};

type SubmittedFn = Box<dyn Fn(&str, &JobMeta) + Send + Sync>;
type AcceptedFn = Box<dyn Fn(&JobId, &str) + Send + Sync>;
type StartedFn = Box<dyn Fn(&JobRecord) + Send + Sync>;
type SucceededFn = Box<dyn Fn(&JobRecord) + Send + Sync>;
type FailedFn = Box<dyn Fn(&JobRecord, &str) + Send + Sync>;

/// Fixed set of subscriber lists, one per notification kind.
#[derive(Default)]
pub struct EventHooks {
    submitted: Vec<SubmittedFn>,
    accepted: Vec<AcceptedFn>,
    started: Vec<StartedFn>,
    succeeded: Vec<SucceededFn>,
    failed: Vec<FailedFn>,
}

impl EventHooks {
    /// Subscribe to the "submitted" notification, fired with the job name
    /// and metadata just before the backend insert.
    pub fn on_submitted(&mut self, f: impl Fn(&str, &JobMeta) + Send + Sync + 'static) {
        self.submitted.push(Box::new(f));
    }

    /// Subscribe to the "submitted-acknowledged" notification, fired with
    /// the backend-assigned id after a successful insert.
    pub fn on_accepted(&mut self, f: impl Fn(&JobId, &str) + Send + Sync + 'static) {
        self.accepted.push(Box::new(f));
    }

    /// Subscribe to the "execution-started" notification.
    pub fn on_started(&mut self, f: impl Fn(&JobRecord) + Send + Sync + 'static) {
        self.started.push(Box::new(f));
    }

    /// Subscribe to the "execution-succeeded" notification.
    pub fn on_succeeded(&mut self, f: impl Fn(&JobRecord) + Send + Sync + 'static) {
        self.succeeded.push(Box::new(f));
    }

    /// Subscribe to the "execution-failed" notification, fired with the
    /// error text for handler failures and synthesized failures alike.
    pub fn on_failed(&mut self, f: impl Fn(&JobRecord, &str) + Send + Sync + 'static) {
        self.failed.push(Box::new(f));
    }

    pub(crate) fn emit_submitted(&self, name: &str, meta: &JobMeta) {
        for f in &self.submitted {
            f(name, meta);
        }
    }

    pub(crate) fn emit_accepted(&self, id: &JobId, name: &str) {
        for f in &self.accepted {
            f(id, name);
        }
    }

    pub(crate) fn emit_started(&self, record: &JobRecord) {
        for f in &self.started {
            f(record);
        }
    }

    pub(crate) fn emit_succeeded(&self, record: &JobRecord) {
        for f in &self.succeeded {
            f(record);
        }
    }

    pub(crate) fn emit_failed(&self, record: &JobRecord, error: &str) {
        for f in &self.failed {
            f(record, error);
        }
    }
}

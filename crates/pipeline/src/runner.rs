use std::sync::Arc;
use std::time::Duration;

use keel_apply::StatusPatcher;
use keel_core::{Error, Kind, ObjectStore, ReconcileRequest, Schedule, Signal};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use metrics::counter;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{env_secs, execute, Steps};

/// Scheduling delays handed to the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Delay for a plain `Requeue`.
    pub requeue_after: Duration,
    /// Delay after an error.
    pub backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self { Self { requeue_after: Duration::from_secs(5), backoff: Duration::from_secs(30) } }
}

impl RunnerConfig {
    /// Read `KEEL_REQUEUE_SECS` and `KEEL_BACKOFF_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            requeue_after: env_secs("KEEL_REQUEUE_SECS", d.requeue_after.as_secs()),
            backoff: env_secs("KEEL_BACKOFF_SECS", d.backoff.as_secs()),
        }
    }
}

/// Controller-specific half of a reconcile: which kind it owns and how to plan a pass.
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> &Kind;

    /// Build the ordered step list for the freshly fetched top-level resource.
    /// Called once per invocation, before any step runs.
    fn plan(&self, resource: &DynamicObject) -> keel_core::Result<Steps>;
}

/// Runs one reconcile pass per request: fetch, plan, execute, classify.
///
/// Holds no mutable state; concurrent passes coordinate only through the store.
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn ObjectStore>,
    status: StatusPatcher,
    cfg: RunnerConfig,
}

impl Runner {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: RunnerConfig) -> Self {
        let status = StatusPatcher::new(store.clone());
        Self { store, status, cfg }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    pub fn config(&self) -> RunnerConfig { self.cfg }

    /// Reconcile `req` with `reconciler` and return the terminal signal.
    pub async fn reconcile(&self, reconciler: &dyn Reconciler, req: &ReconcileRequest) -> Signal {
        let span = info_span!("reconcile", kind = %req.key.kind, ns = req.namespace().unwrap_or(""), name = %req.name());
        async {
            let signal = self.run_once(reconciler, req).await;
            let signal = self.finish(req, signal).await;
            counter!("pipeline_runs", 1u64, "outcome" => outcome_label(&signal));
            signal
        }
        .instrument(span)
        .await
    }

    async fn run_once(&self, reconciler: &dyn Reconciler, req: &ReconcileRequest) -> Signal {
        if &req.key.kind != reconciler.kind() {
            return Signal::Error(Error::malformed("request", format!("{} routed to the {} reconciler", req.key, reconciler.kind())));
        }
        let resource = match self.store.get(&req.key).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!("resource not found; assuming it was deleted");
                return Signal::Halt;
            }
            Err(e) => return Signal::from_error(e),
        };
        let steps = match reconciler.plan(&resource) {
            Ok(s) => s,
            Err(e) => {
                // An undecodable spec stays broken until someone edits it; surface it in status.
                match self.status.set_failed(&req.key, &e.to_string()).await {
                    Ok(_) => {}
                    Err(se) if se.is_not_found() => return Signal::Halt,
                    Err(se) => warn!(error = %se, "failed to record failed status"),
                }
                return Signal::from_error(e);
            }
        };
        execute(&steps, req).await
    }

    /// Log every error outcome; turn non-retryable errors into a failed status and a clean halt.
    async fn finish(&self, req: &ReconcileRequest, signal: Signal) -> Signal {
        let Some(err) = signal.error() else { return signal };
        if !err.is_retryable() {
            error!(error = %err, "reconcile cannot succeed without a change; marking failed");
            return match self.status.set_failed(&req.key, &err.to_string()).await {
                Ok(_) => Signal::Halt,
                Err(e) if e.is_not_found() => Signal::Halt,
                Err(e) => {
                    warn!(error = %e, "failed to record failed status");
                    Signal::RequeueWithError(e)
                }
            };
        }
        if err.is_conflict() {
            info!(error = %err, "write conflict; retrying with backoff");
        } else {
            warn!(error = %err, "reconcile failed; retrying with backoff");
        }
        signal
    }

    /// Translate a terminal signal into the scheduler contract. Errors are returned as
    /// `Err` so the scheduler's error policy applies its backoff.
    pub fn action(&self, signal: Signal) -> Result<Action, Error> {
        match (signal.schedule(), signal) {
            (Schedule::Done, _) => Ok(Action::await_change()),
            (Schedule::Requeue, _) => Ok(Action::requeue(self.cfg.requeue_after)),
            (Schedule::Backoff, Signal::RequeueWithError(e) | Signal::Error(e)) => Err(e),
            (Schedule::Backoff, _) => Ok(Action::requeue(self.cfg.backoff)),
        }
    }

    /// Error policy for the scheduler: retry after the configured backoff.
    pub fn error_policy(&self, _err: &Error) -> Action { Action::requeue(self.cfg.backoff) }
}

fn outcome_label(signal: &Signal) -> &'static str {
    match signal {
        Signal::Continue | Signal::Halt => "halt",
        Signal::Requeue => "requeue",
        Signal::RequeueWithError(_) => "requeue_with_error",
        Signal::Error(_) => "error",
    }
}

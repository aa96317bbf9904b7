//! Keel pipeline: ordered reconcile steps with an explicit early-exit contract.
//!
//! A reconcile pass is a flat list of [`Step`]s. Steps run strictly in order and the
//! first non-[`Signal::Continue`] outcome ends the pass; the next invocation starts
//! from the first step again, so every step must be safe to repeat.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{ReconcileRequest, Signal};
use tracing::{debug, trace};

mod runner;

pub use runner::{Reconciler, Runner, RunnerConfig};

/// One idempotent unit of reconcile work.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, req: &ReconcileRequest) -> Signal;
}

/// A [`Step`] backed by an async function of the request.
pub struct FnStep<F> {
    name: &'static str,
    f: F,
}

pub fn step_fn<F, Fut>(name: &'static str, f: F) -> FnStep<F>
where
    F: Fn(ReconcileRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Signal> + Send,
{
    FnStep { name, f }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(ReconcileRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Signal> + Send,
{
    fn name(&self) -> &str { self.name }

    async fn run(&self, req: &ReconcileRequest) -> Signal { (self.f)(req.clone()).await }
}

pub type Steps = Vec<Box<dyn Step>>;

/// Run `steps` in order and return the terminal signal.
///
/// The first non-`Continue` signal stops the sequence; later steps never run. A
/// sequence that continues through every step ends in `Halt`.
pub async fn execute(steps: &[Box<dyn Step>], req: &ReconcileRequest) -> Signal {
    for step in steps {
        let signal = step.run(req).await;
        trace!(step = step.name(), ?signal, "step finished");
        if !signal.is_continue() {
            debug!(step = step.name(), ?signal, "pipeline stopped");
            return signal;
        }
    }
    Signal::Halt
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(var).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default))
}

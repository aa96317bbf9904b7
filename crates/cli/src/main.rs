use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use keel_controllers::{
    bridge_kind, config_map_kind, deployment_kind, homeserver_kind, homeserver_of, persistent_volume_claim_kind, service_kind, BridgeReconciler, Context,
    HomeserverReconciler,
};
use keel_core::{Error, Kind, ObjectKey, ObjectStore, ReconcileRequest};
use keel_kubehub::KubeStore;
use keel_pipeline::{Reconciler, Runner, RunnerConfig};
use kube::core::DynamicObject;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel controller manager")]
struct Cli {
    /// Namespace to watch; all namespaces when omitted
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Homeserver and Bridge controllers until interrupted
    Run,
    /// Run a single reconcile pass for one resource and print the outcome
    Reconcile {
        #[arg(value_enum)]
        kind: Target,
        name: String,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Target {
    Homeserver,
    Bridge,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Everything a controller's reconcile callback needs.
struct Shared {
    runner: Runner,
    reconciler: Box<dyn Reconciler>,
}

async fn reconcile(obj: Arc<DynamicObject>, shared: Arc<Shared>) -> Result<Action, Error> {
    // Watch payloads are only a wake-up; the runner re-reads the object.
    let key = ObjectKey {
        kind: shared.reconciler.kind().clone(),
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone().unwrap_or_default(),
    };
    let signal = shared.runner.reconcile(shared.reconciler.as_ref(), &ReconcileRequest::new(key)).await;
    shared.runner.action(signal)
}

fn error_policy(obj: Arc<DynamicObject>, err: &Error, shared: Arc<Shared>) -> Action {
    debug!(name = ?obj.metadata.name, error = %err, "scheduling retry");
    shared.runner.error_policy(err)
}

/// Objects each controller creates and owns.
fn owned_kinds(kind: &Kind) -> Vec<Kind> {
    let mut kinds = vec![config_map_kind(), service_kind(), deployment_kind()];
    if *kind == bridge_kind() {
        kinds.push(persistent_volume_claim_kind());
    }
    kinds
}

/// Controller for `kind`, woken by its own changes and by changes to the objects it owns.
/// Homeservers are also woken by any change to a Bridge that points at them.
async fn control(store: Arc<KubeStore>, shared: Arc<Shared>, ns: Option<String>) -> Result<()> {
    let kind = shared.reconciler.kind().clone();
    let (ar, _) = store.api_resource(&kind).await.with_context(|| format!("resolving {kind}"))?;
    let mut controller = Controller::new_with(store.api(&kind, ns.as_deref()).await?, watcher::Config::default(), ar.clone());
    for child in owned_kinds(&kind) {
        let (child_ar, _) = store.api_resource(&child).await.with_context(|| format!("resolving {child}"))?;
        controller = controller.owns_with(store.api(&child, ns.as_deref()).await?, child_ar, watcher::Config::default());
    }
    if kind == homeserver_kind() {
        let bridges = bridge_kind();
        let (bridge_ar, _) = store.api_resource(&bridges).await.with_context(|| format!("resolving {bridges}"))?;
        let hs_ar = ar;
        controller = controller.watches_with(store.api(&bridges, ns.as_deref()).await?, bridge_ar, watcher::Config::default(), move |b: DynamicObject| {
            homeserver_of(&b).map(|k| ObjectRef::new_with(&k.name, hs_ar.clone()).within(k.namespace.as_deref().unwrap_or_default()))
        });
    }
    info!(%kind, ns = ?ns, "controller started");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, shared)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!(%kind, "controller stopped");
    Ok(())
}

fn reconciler_for(target: Target, ctx: Arc<Context>) -> Box<dyn Reconciler> {
    match target {
        Target::Homeserver => Box::new(HomeserverReconciler::new(ctx)),
        Target::Bridge => Box::new(BridgeReconciler::new(ctx)),
    }
}

fn kind_of(target: Target) -> Kind {
    match target {
        Target::Homeserver => homeserver_kind(),
        Target::Bridge => bridge_kind(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = Arc::new(KubeStore::try_default().await?);
    let dyn_store: Arc<dyn ObjectStore> = store.clone();
    let ctx = Context::new(dyn_store.clone());
    let cfg = RunnerConfig::from_env();
    info!(requeue = ?cfg.requeue_after, backoff = ?cfg.backoff, "runner configured");

    match cli.command {
        Commands::Run => {
            let shared = |t| Arc::new(Shared { runner: Runner::new(dyn_store.clone(), cfg), reconciler: reconciler_for(t, ctx.clone()) });
            let ns = cli.namespace;
            let (hs, br) = tokio::join!(
                control(store.clone(), shared(Target::Homeserver), ns.clone()),
                control(store.clone(), shared(Target::Bridge), ns),
            );
            hs?;
            br?;
        }
        Commands::Reconcile { kind, name } => {
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let req = ReconcileRequest::new(ObjectKey::namespaced(kind_of(kind), ns, &name));
            let runner = Runner::new(dyn_store, cfg);
            let signal = runner.reconcile(reconciler_for(kind, ctx).as_ref(), &req).await;
            println!("{}: {:?}", req.key, signal);
            match runner.action(signal) {
                Ok(action) => println!("next: {:?}", action),
                Err(e) => println!("next: retry after backoff ({})", e),
            }
        }
    }
    Ok(())
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use steward_k8s::client::KubeStore;
use steward_k8s::controller::bundle::BundleShape;
use steward_k8s::controller::watch::{KubeWatchSource, WatchSource};
use steward_k8s::controller::{Controller, ControllerConfig, HookErrorPolicy, Pipeline};
use steward_k8s::crd::Bundle;
use steward_k8s::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show cluster information
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace, also used for the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Only reconcile Bundles in this namespace (all namespaces if unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Requeue delay while a dependency is missing or not ready
    #[arg(long, env = "DEPENDENCY_BACKOFF_SECS", default_value_t = 30)]
    dependency_backoff_secs: u64,

    #[arg(long, env = "FIELD_MANAGER", default_value = "steward-operator")]
    field_manager: String,

    /// How an after-hook error combines with the prior result (replace, preserve-prior)
    #[arg(long, env = "HOOK_ERROR_POLICY", default_value = "replace")]
    hook_error_policy: HookErrorPolicy,

    /// Address of the /healthz and /metrics endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Only run workers while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION")]
    leader_election: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Steward Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Bundle> = Api::namespaced(client, &args.namespace);
    let bundles = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed Bundles: {}", bundles.items.len());
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (json, text) = match format {
        LogFormat::Json => (Some(fmt::layer().json().with_target(true)), None),
        LogFormat::Text => (None, Some(fmt::layer().with_target(true))),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(text);

    // OTLP export only when an endpoint is configured
    let otel_layer = steward_k8s::telemetry::init_telemetry(&registry);
    let otel_enabled = otel_layer.is_some();
    registry.with(otel_layer).init();
    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!("Starting Steward Operator v{}", env!("CARGO_PKG_VERSION"));

    let config = ControllerConfig {
        workers: args.workers,
        dependency_backoff: Duration::from_secs(args.dependency_backoff_secs),
        field_manager: args.field_manager.clone(),
        hook_error_policy: args.hook_error_policy,
        ..ControllerConfig::default()
    };
    config.validate()?;

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    // Verify CRD exists
    let bundles: Api<Bundle> = Api::all(client.clone());
    if let Err(e) = bundles.list(&Default::default()).await {
        tracing::error!("Bundle CRD not found. Please install the CRD first: {:?}", e);
        return Err(Error::ConfigError("Bundle CRD not installed".to_string()));
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    #[cfg(feature = "metrics")]
    {
        let addr = args.metrics_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = steward_k8s::server::run_server(addr, shutdown).await {
                tracing::error!("Metrics server error: {:?}", e);
            }
        });
    }

    if args.leader_election {
        let leader_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let is_leader = Arc::new(AtomicBool::new(false));
        {
            let lease_client = client.clone();
            let is_leader_bg = Arc::clone(&is_leader);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_leader_election(
                    lease_client,
                    &leader_namespace,
                    &holder_identity,
                    is_leader_bg,
                    shutdown,
                )
                .await;
            });
        }
        while !is_leader.load(Ordering::Relaxed) {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    steward_k8s::telemetry::shutdown_telemetry();
                    return Ok(());
                }
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    let store = Arc::new(KubeStore::new(client.clone(), args.field_manager));
    let controller = Arc::new(Controller::<Bundle>::new(
        "bundle",
        store,
        config,
        Pipeline::standard(Arc::new(BundleShape)),
        |dispatcher| -> Arc<dyn WatchSource> {
            Arc::new(KubeWatchSource::new(
                client.clone(),
                args.watch_namespace.clone(),
                dispatcher,
                shutdown.clone(),
            ))
        },
    )?);

    let result = controller.run(shutdown).await;

    // Flush any remaining traces
    steward_k8s::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "steward-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        let wait = match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                RENEW_INTERVAL
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}, shutting down", LEASE_NAME);
                    shutdown.cancel();
                }
                is_leader.store(false, Ordering::Relaxed);
                RETRY_INTERVAL
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                RETRY_INTERVAL
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    let expiry = renew.0 + chrono::Duration::seconds(duration as i64);
                    now > expiry
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }
            info!(
                "Lease held by {:?} has expired, taking over",
                current_holder
            );
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

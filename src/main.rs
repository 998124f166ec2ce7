//! Unified Replication Operator Entry Point
//!
//! Starts the controllers and the admission webhook after winning leader
//! election.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_leader_election::{LeaseLock, LeaseLockParams};
use unified_replication_operator::adapters::registry;
use unified_replication_operator::config::OperatorConfig;
use unified_replication_operator::{controller, Error};

#[derive(Parser, Debug)]
#[command(name = "unified-replication-operator", version, about)]
struct Args {
    /// Optional YAML file with per-adapter tuning
    #[arg(long, env = "OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Disable the admission webhook server
    #[arg(long, env = "DISABLE_WEBHOOK", default_value_t = false)]
    disable_webhook: bool,

    /// Port the admission webhook listens on
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 9443)]
    webhook_port: u16,

    /// Directory with a mounted tls.crt/tls.key pair for the webhook
    #[arg(long, env = "WEBHOOK_CERT_DIR")]
    webhook_cert_dir: Option<PathBuf>,

    /// Service name the webhook certificate must cover
    #[arg(long, env = "WEBHOOK_SERVICE", default_value = "unified-replication-webhook")]
    webhook_service: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer().with_target(true);
    let registry_sub = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    if otel_enabled {
        let otel_layer = unified_replication_operator::telemetry::init_telemetry();
        registry_sub.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry_sub.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!(
        "Starting Unified Replication Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let operator_config = match &args.config {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };

    registry::register_builtin()?;

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    // Leader election: only one replica reconciles at a time.
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", hostname);

    let lease_ttl = std::time::Duration::from_secs(15);
    let lock = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            lease_name: "unified-replication-operator-leader".into(),
            holder_id: hostname.clone(),
            lease_ttl,
        },
    );

    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership lease");
                break;
            }
            Ok(_) => info!("Waiting for leadership lease"),
            Err(e) => warn!("Leader election error: {}", e),
        }
        tokio::time::sleep(lease_ttl / 3).await;
    }
    // Keep renewing in the background while the controllers run.
    let renewer = lock;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lease_ttl / 3);
        loop {
            ticker.tick().await;
            if let Err(e) = renewer.try_acquire_or_renew().await {
                warn!("Lease renewal failed: {}", e);
            }
        }
    });

    let state = Arc::new(controller::ControllerState::new(
        client.clone(),
        operator_config,
    ));

    #[cfg(feature = "admission-webhook")]
    if !args.disable_webhook {
        let opts = unified_replication_operator::webhook::WebhookOptions {
            port: args.webhook_port,
            cert_dir: args.webhook_cert_dir.clone(),
            service_name: args.webhook_service.clone(),
            namespace: namespace.clone(),
        };
        let webhook_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) =
                unified_replication_operator::webhook::run_webhook(webhook_client, opts).await
            {
                tracing::error!("Admission webhook error: {:?}", e);
            }
        });
    }

    let result = controller::run_controller(state).await;

    unified_replication_operator::telemetry::shutdown_telemetry();

    Ok(result?)
}

//! Cluster conformance suite runner.
//!
//! Runs every check inside one freshly created namespace, exports per-test
//! metrics, and exits non-zero if any check failed.

use e2e_harness::config::TelemetryConfig;
use e2e_harness::environment::{random_name, Environment};
use e2e_harness::observability::{MetricsCollector, MetricsPipeline};
use env_tests::checks;
use env_tests::config::SuiteConfig;
use env_tests::kube_cluster::KubeCluster;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Total length of the generated namespace name.
const NAMESPACE_NAME_LEN: usize = 16;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting conformance suite"
    );

    let suite_config = match SuiteConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let telemetry_config = match TelemetryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load telemetry configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        namespace_prefix = %suite_config.namespace_prefix,
        parallel = suite_config.parallel,
        run_timeout = ?suite_config.run_timeout,
        telemetry = ?telemetry_config,
        "Configuration loaded successfully"
    );

    // No metrics, no run
    let pipeline = match MetricsPipeline::setup(&telemetry_config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to set up metrics pipeline: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let collector = MetricsCollector::new(&pipeline);

    let cluster = match KubeCluster::connect(suite_config.kubeconfig.as_deref()).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("Failed to create cluster client: {}", e);
            shutdown_pipeline(pipeline).await;
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    if let Some(timeout) = suite_config.run_timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(?timeout, "Run timeout reached, cancelling");
                    cancel.cancel();
                }
            }
        });
    }

    let namespace = random_name(&suite_config.namespace_prefix, NAMESPACE_NAME_LEN);
    let environment = Environment::new(Arc::new(cluster), namespace, collector, cancel.clone())
        .parallel(suite_config.parallel);

    let summary = environment.run(checks::suite()).await;
    // Stops the signal and timeout watchers
    cancel.cancel();

    shutdown_pipeline(pipeline).await;

    if let Some(reason) = &summary.setup_error {
        error!(%reason, "Run did not start");
    } else if summary.success() {
        info!(passed = summary.passed.len(), "All checks passed");
    } else {
        error!(
            passed = summary.passed.len(),
            failed = ?summary.failed,
            "Some checks failed"
        );
    }

    ExitCode::from(summary.exit_code())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "env_tests=info,e2e_harness=info".into());
    let json = std::env::var("E2E_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_pipeline(pipeline: MetricsPipeline) {
    if let Err(e) = pipeline.shutdown().await {
        error!("Failed to shut down metrics pipeline: {}", e);
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM. Returns early once `cancel` fires for
/// another reason.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, cancelling run..."),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, cancelling run...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    cancel.cancel();
}

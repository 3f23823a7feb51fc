use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vjailbreak_upgrade::config::{DEFAULT_MANIFEST_BASE_URL, DEFAULT_NAMESPACE};
use vjailbreak_upgrade::health::{HealthState, run_health_server};
use vjailbreak_upgrade::{
    Context, Executor, HttpManifestSource, KubeStore, UpgradeConfig, UpgradeError, UpgradeResult,
};

#[derive(Parser, Debug)]
#[command(name = "vjailbreak-upgrade", version, about = "Upgrade or roll back a vjailbreak installation")]
struct Cli {
    /// Namespace vjailbreak is installed in
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_NAMESPACE, global = true)]
    namespace: String,

    /// Scopes the progress record to this job
    #[arg(long, env = "JOB_ID", global = true)]
    job_id: Option<String>,

    /// Recorded on the progress record; defaults to the host name
    #[arg(long, env = "POD_NAME", global = true)]
    pod_name: Option<String>,

    /// Release artifact base URL; `${TAG}` is replaced by the version
    #[arg(long, env = "MANIFEST_BASE_URL", default_value = DEFAULT_MANIFEST_BASE_URL, global = true)]
    manifest_base_url: String,

    /// Serve /healthz, /readyz and /metrics on this port
    #[arg(long, env = "METRICS_PORT", global = true)]
    metrics_port: Option<u16>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upgrade to a release
    Upgrade {
        #[arg(long, env = "TARGET_VERSION")]
        target_version: String,

        /// Delete blocking resources once if the pre-upgrade checks fail
        #[arg(long, env = "AUTO_CLEANUP")]
        auto_cleanup: bool,
    },
    /// Roll back from a release
    Rollback {
        /// Version being rolled back from
        #[arg(long, env = "TARGET_VERSION")]
        target_version: String,

        /// Version to roll back to; leave empty to restore a backup
        #[arg(long, env = "PREVIOUS_VERSION", default_value = "")]
        previous_version: String,

        #[arg(long, env = "BACKUP_ID")]
        backup_id: Option<String>,
    },
    /// Run the pre-upgrade checks and print the result
    Check {
        #[arg(long, env = "TARGET_VERSION", default_value = "")]
        target_version: String,
    },
    /// Print the persisted progress record
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    init_tracing(cli.log_format)?;

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Job failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("vjailbreak_upgrade=info".parse()?)
        .add_directive("kube=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn run(cli: Cli) -> UpgradeResult<i32> {
    let pod_name = cli.pod_name.unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let config = UpgradeConfig::new(&cli.namespace)
        .with_job_id(cli.job_id)
        .with_pod_name(pod_name);

    info!(
        namespace = %config.namespace,
        job_id = ?config.job_id,
        pod_name = %config.pod_name,
        "Starting vjailbreak-upgrade"
    );

    let health_state = Arc::new(HealthState::new());
    if let Some(port) = cli.metrics_port {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        });
    }

    let store = KubeStore::try_default().await?;
    info!("Connected to Kubernetes cluster");
    health_state.set_ready(true).await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Received shutdown signal, cancelling");
            cancel.cancel();
        });
    }

    let ctx = Context::new(
        Arc::new(store),
        Arc::new(HttpManifestSource::new(cli.manifest_base_url)),
        config,
    )
    .with_health_state(health_state)
    .with_cancellation(cancel);
    let executor = Executor::new(ctx);

    match cli.command {
        Command::Upgrade {
            target_version,
            auto_cleanup,
        } => {
            let progress = executor.execute(&target_version, auto_cleanup).await?;
            print_json(&progress)?;
            Ok(0)
        }
        Command::Rollback {
            target_version,
            previous_version,
            backup_id,
        } => {
            let progress = executor
                .execute_rollback(&previous_version, &target_version, backup_id.as_deref())
                .await?;
            print_json(&progress)?;
            Ok(0)
        }
        Command::Check { target_version } => {
            let result = executor.check(&target_version).await?;
            print_json(&result)?;
            if result.passed_all() {
                Ok(0)
            } else {
                Ok(UpgradeError::PreUpgradeChecksFailed(result).exit_code())
            }
        }
        Command::Status => {
            match executor.status().await? {
                Some(progress) => print_json(&progress)?,
                None => info!("No progress record found"),
            }
            Ok(0)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> UpgradeResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

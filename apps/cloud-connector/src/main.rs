use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cloud_connector::bridge::Bridge;
use cloud_connector::bus::nats::NatsBus;
use cloud_connector::config::Config;
use cloud_connector::telemetry::logging::{self, LogConfig, LogLevel};
use cloud_connector::transport::websocket::WebSocketVzConn;
use cloud_connector::vizier::api::ApiVizierInfo;
use cloud_connector::vizier::health::HttpHealthChecker;
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "cloud-connector",
    about = "Bridges the vizier's local bus to the cloud control plane",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "PL_CLOUD_STREAM_URL",
        help = "WebSocket endpoint of the control plane bridge stream"
    )]
    cloud_stream_url: Url,

    #[arg(
        long,
        env = "PL_CLOUD_API_URL",
        help = "HTTPS endpoint of the control plane API (enrollment)"
    )]
    cloud_api_url: Url,

    #[arg(
        long,
        env = "PL_NATS_URL",
        default_value = "nats://pl-nats:4222",
        help = "Local NATS server"
    )]
    nats_url: String,

    #[arg(
        long,
        env = "PL_OPERATOR_API_URL",
        help = "In-cluster orchestrator API endpoint"
    )]
    operator_api_url: Url,

    #[arg(
        long,
        env = "PL_HEALTH_CHECK_URL",
        help = "Data-plane health probe endpoint"
    )]
    health_check_url: Url,

    #[arg(long, env = "PL_CLUSTER_ID", help = "Cluster id, if already enrolled")]
    cluster_id: Option<Uuid>,

    #[arg(long, env = "PL_JWT_SIGNING_KEY", hide_env_values = true)]
    jwt_signing_key: String,

    #[arg(
        long,
        env = "PL_DEPLOY_KEY",
        default_value = "",
        hide_env_values = true,
        help = "Deploy key, used once at enrollment"
    )]
    deploy_key: String,

    #[arg(long, env = "PL_BOOTSTRAP_MODE", default_value_t = false)]
    bootstrap_mode: bool,

    #[arg(long, env = "PL_BOOTSTRAP_VERSION", default_value = "")]
    bootstrap_version: String,

    #[arg(
        long = "log-level",
        value_enum,
        env = "PL_LOG_LEVEL",
        default_value_t = LogLevel::Info
    )]
    log_level: LogLevel,

    #[arg(long = "log-file", value_name = "PATH", env = "PL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let session_id = Config::session_id_from_clock();
    let config = Config {
        vizier_id: cli.cluster_id,
        jwt_signing_key: cli.jwt_signing_key.clone(),
        deploy_key: cli.deploy_key.clone(),
        session_id,
        bootstrap_mode: cli.bootstrap_mode,
        bootstrap_version: cli.bootstrap_version.clone(),
    };

    let bus = Arc::new(
        NatsBus::connect(&cli.nats_url)
            .await
            .context("failed to connect to NATS")?,
    );
    let client = Arc::new(
        WebSocketVzConn::new(cli.cloud_stream_url.clone(), cli.cloud_api_url.clone())
            .context("failed to build the control plane client")?,
    );
    let vz_info = Arc::new(
        ApiVizierInfo::new(cli.operator_api_url.clone())
            .context("failed to build the orchestrator client")?,
    );
    let checker = Arc::new(HttpHealthChecker::spawn(cli.health_check_url.clone()));

    let bridge = Arc::new(Bridge::new(config, client, vz_info, bus, checker));

    let shutdown = bridge.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.stop();
        }
    });

    info!(session_id, "starting cloud connector bridge");
    if let Err(err) = bridge.run().await {
        error!(error = %err, "bridge exited with a fatal error");
        return Err(err.into());
    }
    info!("bridge stopped");
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use onebot_relay::config::AppConfig;
use onebot_relay::notify::{MailNotifier, OutageNotifier};
use onebot_relay::transport::ws::WsConnector;
use onebot_relay::{logging, RelayEngine, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "onebot-relay", version, about = "Fan one OneBot endpoint out to many consumers")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "app.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    // Flushes the file sink on drop
    let _log_guard = logging::init(&config.logger).context("failed to initialise logging")?;
    for warning in config.warnings() {
        tracing::warn!("Configuration: {warning}");
    }

    let notifier: Option<Arc<dyn OutageNotifier>> = match &config.notice {
        Some(notice) => {
            let mailer = MailNotifier::from_config(notice).context("invalid notice settings")?;
            tracing::info!(smtp = %notice.smtp, port = notice.port, "Outage notices enabled");
            Some(Arc::new(mailer))
        }
        None => None,
    };

    let upstream = config.upstream_url();
    tracing::info!(upstream = %upstream, "Starting relay");

    let connector = Arc::new(WsConnector::new(upstream));
    let engine = RelayEngine::new(config.relay_config(), connector, notifier);
    let server = RelayServer::new(config.server_config()?, Arc::clone(&engine));

    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl+c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("Shutting down");
    engine.shutdown().await;

    result.context("relay server failed")
}

use std::sync::Arc;

use clap::Parser;
use paywatch::db::handlers::{InMemoryInvoiceRepository, InMemoryWebhookRepository};
use paywatch::webhooks::ReqwestTransport;
use paywatch::{Collaborators, Config, Engine, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Parse CLI args
    let args = paywatch::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;
    let metrics = telemetry::get_or_install_prometheus_handle();

    tracing::debug!("{:?}", args);

    let collaborators = Collaborators::builder()
        .invoices(Arc::new(InMemoryInvoiceRepository::new()))
        .webhooks(Arc::new(InMemoryWebhookRepository::new()))
        .transport(Arc::new(ReqwestTransport::new(config.webhooks.timeout)?))
        .build();

    let engine = Engine::start(config, collaborators);
    let resumed = engine.rehydrate().await?;
    tracing::info!(
        invoices = resumed.invoices,
        redeliveries = resumed.redeliveries,
        "Resumed work from previous run"
    );

    shutdown_signal().await;

    engine.shutdown().await;
    tracing::debug!("Final metrics:\n{}", metrics.render());
    telemetry::shutdown_telemetry();
    Ok(())
}

use cctp_relayer::config::{Config, LogFormat};
use cctp_relayer::relayer::Relayer;
use cctp_relayer::shutdown::{wait_for_shutdown_signal, Shutdown};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;

    init_logging(config.log_format);

    tracing::info!("Starting CCTP Relayer");
    tracing::info!(
        chains = ?config.chains.iter().map(|c| c.name()).collect::<Vec<_>>(),
        routes = config.enabled_routes.len(),
        flush_only = config.flush.flush_only_mode,
        "Configuration loaded"
    );

    let relayer = Relayer::new(config)?;

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let result = relayer.run(shutdown).await;
    if let Err(e) = &result {
        tracing::error!(error = ?e, "Relayer stopped with error");
    }

    tracing::info!("CCTP Relayer stopped");
    result
}

/// Initialize tracing/logging with structured output
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cctp_relayer=debug"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init(),
    }
}

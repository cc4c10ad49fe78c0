use clap::Parser;
use scrapeflow::{setup_logging, validate_config_file, Cli, CliRunner, Commands};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting scrapeflow v{}", env!("CARGO_PKG_VERSION"));

    // Validation must not launch any browser
    if let Commands::Validate { config } = &args.command {
        return validate_config_file(config);
    }

    let config = args.load_config()?;
    let runner = CliRunner::start(config, args.metrics_port).await?;

    let shutdown = CancellationToken::new();
    let _shutdown_handler = setup_shutdown_handler(shutdown.clone());

    let result = tokio::select! {
        result = runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown.cancelled() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    runner.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("scrapeflow stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        shutdown.cancel();
    })
}

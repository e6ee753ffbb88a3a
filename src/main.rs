use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use matter_server::{config, logging, server::MatterServer};

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("can't install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = config::env_file_from_args(std::env::args());
    config::load_dotenv(env_file.as_deref())?;

    let cli = config::Cli::parse();
    let cfg = config::load(&cli)?;
    logging::init(&cfg.log.level, &cfg.log.format).context("failed to init logging")?;

    log::info!(
        "matter server {} (vendor {:#06x}, fabric {})",
        env!("CARGO_PKG_VERSION"),
        cfg.vendor_id,
        cfg.fabric_id
    );

    let server = MatterServer::new(cfg)?;
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("received shutdown signal");
        t.cancel();
    });

    server.run(token).await
}

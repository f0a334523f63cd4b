use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::{info, warn};

use seatwise::config::Config;
use seatwise::directory::InMemoryDirectory;
use seatwise::intake;
use seatwise::service::BookingService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    seatwise::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let directory = Arc::new(InMemoryDirectory::new());
    if let Some(seed) = &config.trains {
        for train in InMemoryDirectory::parse_seed(seed)? {
            info!("train {}: {} seats", train.id, train.total_seats);
            directory.insert(train);
        }
    }

    let service = Arc::new(
        BookingService::open(config.wal_path(), directory.clone(), config.max_attempts).await?,
    );
    service.start(&config).await;

    info!("seatwise ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  workers: {}", config.workers);
    info!("  max_attempts: {}", config.max_attempts);
    info!("  trains: {}", directory.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop reading on SIGTERM/ctrl-c or EOF, then drain workers
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    intake::serve(
        service.clone(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await?;

    // Let workers finish what is in flight (up to 10s)
    info!("draining workers...");
    if tokio::time::timeout(Duration::from_secs(10), service.shutdown())
        .await
        .is_err()
    {
        warn!(
            "drain timeout, {} job(s) still waiting; they will be delivered on next start",
            service.queue().waiting_len().await
        );
    }

    info!("seatwise stopped");
    Ok(())
}

//! Registration engine reconciliation daemon.
//!
//! Runs the expiration sweeper: one repair pass at startup, then a pass on
//! every interval tick. The synchronous service API is embedded by the
//! serving layer; this binary only needs the fallback loop.

use registration_desk::checkout::HostedCheckoutGateway;
use registration_desk::config::Config;
use registration_desk::notify::LogNotifier;
use registration_desk::sweeper::Sweeper;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "registration_desk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting registration reconciliation daemon");

    let config = Config::from_env();
    info!(
        database_url = %config.database.url,
        grace_period_secs = config.sweeper.grace_period_secs,
        interval_secs = config.sweeper.interval_secs,
        "Configuration loaded"
    );

    info!("Connecting to registration database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(&config.database.url)
        .await?;

    info!("Running migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    registration_desk::metrics::register_business_metrics();

    let gateway = Arc::new(HostedCheckoutGateway::new(&config.checkout)?);
    let sweeper = Sweeper::new(pool, gateway, Arc::new(LogNotifier), &config.sweeper);

    let interval = config.sweeper.interval();
    tokio::select! {
        () = sweeper.run(interval) => {
            error!("sweeper loop exited unexpectedly");
        }
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("Shutdown signal received, stopping sweeper");
        }
    }

    Ok(())
}

//! Coupon Radar server.
//!
//! Configuration is read from `COUPON_RADAR_*` environment variables; see
//! [`coupon_radar::config::Config::from_env`].

use std::net::SocketAddr;

use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use coupon_radar::api::{AppState, router};
use coupon_radar::config::Config;
use coupon_radar::providers::default_adapters;
use coupon_radar::seed::load_sample_data;
use coupon_radar::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("coupon_radar=info".parse()?))
        .init();

    let config = Config::from_env();

    info!(
        port = config.port,
        db_url = %config.database_url,
        acquisition_radius_m = config.engine.acquisition_radius_m,
        schedule_match = ?config.engine.schedule_match,
        "Starting Coupon Radar server"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    if config.seed_sample_data && load_sample_data(&storage, Utc::now()).await? {
        info!("Seeded sample stores and coupons");
    }

    if config.providers.hotpepper_key.is_none() {
        warn!("No HotPepper key configured; HotPepper results will be synthetic");
    }
    if config.providers.yahoo_app_id.is_none() {
        warn!("No Yahoo! app id configured; Yahoo! results will be synthetic");
    }

    let providers = default_adapters(&config.providers)?;
    info!(count = providers.len(), "Provider adapters ready");

    let app = router(AppState::new(storage, providers, config.engine.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Coupon Radar is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

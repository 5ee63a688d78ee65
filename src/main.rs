use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use garden_planner::auth::Sessions;
use garden_planner::config::Config;
use garden_planner::provider::TrefleClient;
use garden_planner::routes::{self, AppState};
use garden_planner::{db, Result};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("garden_planner=info,warp=info")),
        )
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "garden planner stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let pool = db::init_pool(&config.database_url, config.pool_size)?;
    let provider = TrefleClient::new(
        &config.provider_url,
        config.provider_token.clone(),
        config.provider_timeout,
    )?;

    let state = AppState {
        pool,
        provider: Arc::new(provider),
        sessions: Sessions::new(config.session_ttl),
        bcrypt_cost: config.bcrypt_cost,
    };

    tracing::info!(addr = %config.bind_addr, db = %config.database_url, "serving garden planner");
    warp::serve(routes::api(state)).run(config.bind_addr).await;
    Ok(())
}

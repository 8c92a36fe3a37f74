//! Standalone migration runner, separated from `main` so migrations can be
//! applied ahead of a deploy without booting the worker process.

use dotenvy::dotenv;
use remit835::infrastructure::{config::Config, db};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    remit835::telemetry::init();

    let config = Config::from_env()?;
    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await?;
    info!("database migrations applied successfully");

    Ok(())
}

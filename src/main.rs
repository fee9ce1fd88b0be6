use std::env;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::http::Http;
use serenity::prelude::*;
use surrealdb::engine::local::{Mem, RocksDb};
use tracing::{error, info};

use sakura_bot::config::AppConfig;
use sakura_bot::database::Database;
use sakura_bot::handler::Handler;
use sakura_bot::platform::HttpInviteResolver;
use sakura_bot::queue::ValidationQueue;
use sakura_bot::{ingest, maintenance, App, DB};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_default(),
        ))
        .init();

    let config = AppConfig::from_env()?;
    info!(config = ?config, "loaded configuration");

    match &config.db_path {
        Some(path) => DB.connect::<RocksDb>(path.as_path()).await?,
        None => DB.connect::<Mem>(()).await?,
    }
    DB.use_ns("SakuraBot").use_db("SakuraBot").await?;

    let db = Database::new(DB.clone(), config.cipher()?);
    db.init().await?;

    let http = Arc::new(Http::new(config.discord_token.as_str()));
    let queue = ValidationQueue::new(Arc::new(HttpInviteResolver::new(http)), config.queue.clone());
    let (sender, receiver) = async_channel::unbounded();
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;
    let token = config.discord_token.clone();
    let app = Arc::new(App {
        db,
        queue,
        config,
        ingest: sender,
    });

    let mut client = Client::builder(token.as_str(), intents)
        .event_handler(Handler::new(app.clone()))
        .await?;
    ingest::start(app.clone(), receiver);
    maintenance::start(app);

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not register ctrl+c handler");
            return;
        }
        info!("shutting down");
        shard_manager.lock().await.shutdown_all().await;
    });

    if let Err(why) = client.start().await {
        error!(error = %why, "An error occurred while running the client");
    }
    Ok(())
}

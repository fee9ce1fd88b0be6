pub mod audit;
pub mod check;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod extract;
pub mod handler;
pub mod ingest;
pub mod invites;
pub mod maintenance;
pub mod platform;
pub mod queue;
pub mod settings;
pub mod utils;

#[macro_use]
extern crate tracing;

use std::sync::LazyLock;

use async_channel::Sender;
use surrealdb::engine::local::Db;
use surrealdb::Surreal;

use config::AppConfig;
use database::Database;
use ingest::PendingInvite;
use queue::ValidationQueue;

pub static DB: LazyLock<Surreal<Db>> = LazyLock::new(Surreal::init);

/// Shared state handed to the event handler and background tasks.
pub struct App {
    pub db: Database,
    pub queue: ValidationQueue,
    pub config: AppConfig,
    pub ingest: Sender<PendingInvite>,
}

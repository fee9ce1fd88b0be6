use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::audit::AuditEvent;
use crate::config::MaintenanceConfig;
use crate::database::Database;
use crate::error::StoreResult;
use crate::invites::{BatchOrder, InviteFilter, InviteRecord, InviteStatus};
use crate::queue::{Priority, ValidationQueue};
use crate::App;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub recycled: usize,
    pub validated: usize,
    pub refreshed: usize,
}

pub fn start(app: Arc<App>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(app.config.maintenance.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match run_once(&app.db, &app.queue, &app.config.maintenance).await {
                Ok(report) => info!(?report, "invite maintenance finished"),
                Err(e) => error!(error = %e, "invite maintenance failed"),
            }
        }
    })
}

/// One pass of every job. A failing job does not stop the others.
#[instrument(skip_all)]
pub async fn run_once(
    db: &Database,
    queue: &ValidationQueue,
    config: &MaintenanceConfig,
) -> StoreResult<MaintenanceReport> {
    let recycled = recycle(db, config.retention_days).await;
    let validated = validate_unchecked(db, queue, config.batch).await;
    let refreshed = refresh_checked(db, queue, config.batch).await;

    Ok(MaintenanceReport {
        recycled: recycled?,
        validated: validated?,
        refreshed: refreshed?,
    })
}

/// Retires old records and audits how many codes came back as unchecked.
pub async fn recycle(db: &Database, retention_days: u32) -> StoreResult<usize> {
    let reinserted = db.recycle(retention_days).await?;
    db.create_audit_entry(
        AuditEvent::InviteRecycle,
        json!({ "retentionDays": retention_days, "total": reinserted }),
    )
    .await?;
    Ok(reinserted)
}

/// Validates codes the passive listener stored, oldest first.
pub async fn validate_unchecked(
    db: &Database,
    queue: &ValidationQueue,
    batch: usize,
) -> StoreResult<usize> {
    let invites = db
        .read_batch(InviteFilter::Unchecked, batch, BatchOrder::OldestCreated)
        .await?;
    revalidate(db, queue, invites).await
}

/// Re-validates the least recently confirmed valid records.
pub async fn refresh_checked(
    db: &Database,
    queue: &ValidationQueue,
    batch: usize,
) -> StoreResult<usize> {
    let invites = db
        .read_batch(InviteFilter::CheckedValid, batch, BatchOrder::OldestUpdated)
        .await?;
    revalidate(db, queue, invites).await
}

async fn revalidate(
    db: &Database,
    queue: &ValidationQueue,
    invites: Vec<InviteRecord>,
) -> StoreResult<usize> {
    let lookups = join_all(
        invites
            .iter()
            .map(|invite| queue.submit(invite.code.clone(), Priority::Background)),
    )
    .await;

    for (invite, lookup) in invites.iter().zip(&lookups) {
        db.update_invite(&invite.id, InviteStatus::from_lookup(lookup.as_ref()))
            .await?;
    }
    Ok(invites.len())
}

use std::sync::Arc;

use async_channel::Receiver;
use serenity::model::prelude::{ChannelId, GuildId};
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::settings::Setting;
use crate::App;

/// Upper bound on pairs handed to a single store write.
pub const INGEST_BATCH: usize = 50;

/// A code seen in passing, not yet validated.
pub type PendingInvite = (GuildId, String);

/// Whether a message in `channel` (under `parent`) should be scanned by the
/// passive listener.
pub fn should_ingest(setting: &Setting, parent: Option<ChannelId>, channel: ChannelId) -> bool {
    let Some(parent) = parent else {
        return false;
    };
    setting.category_channel_ids.contains(&parent)
        && !setting.ignored_channel_ids.contains(&channel)
        && setting.results_channel_id != Some(channel)
}

pub fn start(app: Arc<App>, receiver: Receiver<PendingInvite>) -> JoinHandle<()> {
    tokio::spawn(async move {
        drain(&app.db, receiver).await;
        info!("invite ingest stopped");
    })
}

/// Writes pending codes until every sender is gone. Store errors drop the
/// batch; the codes will be picked up again the next time they are posted.
pub async fn drain(db: &Database, receiver: Receiver<PendingInvite>) {
    while let Ok(first) = receiver.recv().await {
        let mut batch = Vec::with_capacity(INGEST_BATCH);
        batch.push(first);
        while batch.len() < INGEST_BATCH {
            match receiver.try_recv() {
                Ok(pending) => batch.push(pending),
                Err(_) => break,
            }
        }

        match db.insert_unchecked(&batch).await {
            Ok(inserted) => debug!(received = batch.len(), inserted, "ingested invites"),
            Err(e) => error!(received = batch.len(), error = %e, "failed to ingest invites"),
        }
    }
}

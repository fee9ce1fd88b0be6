//! The invite check: guards, the `Idle -> Checking -> Idle` transition, and
//! the ordered walk over a guild's configured channel groups.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use serenity::async_trait;
use serenity::model::prelude::{ChannelId, GuildId};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::audit::AuditEvent;
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::extract::{extract_codes, ExtractMode};
use crate::invites::{InviteRecord, InviteStatus};
use crate::queue::{Priority, ValidationQueue};
use crate::settings::{CheckState, Setting};

/// A category and the text channels under it, as the platform reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub id: ChannelId,
    pub name: String,
    pub position: i64,
    pub channels: Vec<ScanChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanChannel {
    pub id: ChannelId,
    pub position: i64,
    /// The bot can view the channel and read its history.
    pub readable: bool,
    /// The channel has ever had a message.
    pub has_messages: bool,
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Every category in the guild with its text/news channels.
    async fn channel_groups(&self, guild_id: GuildId) -> anyhow::Result<Vec<ChannelGroup>>;

    /// Contents of the most recent `limit` messages, newest first.
    async fn recent_messages(&self, channel_id: ChannelId, limit: u8) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelCounts {
    pub channel_id: ChannelId,
    pub good: u32,
    pub bad: u32,
}

impl ChannelCounts {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            good: 0,
            bad: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCounts {
    pub name: String,
    pub channels: Vec<ChannelCounts>,
    /// Channels whose messages could not be fetched.
    pub issues: u32,
    /// Channels that need a human to look at them.
    pub manual: Vec<ChannelId>,
}

impl CategoryCounts {
    fn new(name: String) -> Self {
        Self {
            name,
            channels: Vec::new(),
            issues: 0,
            manual: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTotals {
    pub total_bad: u32,
    pub total_channels: u32,
    pub total_good: u32,
    pub total_invites: u32,
}

impl CheckTotals {
    pub fn from_categories(categories: &[CategoryCounts]) -> Self {
        let mut totals = Self::default();
        for category in categories {
            totals.total_channels +=
                (category.channels.len() + category.manual.len()) as u32 + category.issues;
            for channel in &category.channels {
                totals.total_bad += channel.bad;
                totals.total_good += channel.good;
            }
        }
        totals.total_invites = totals.total_bad + totals.total_good;
        totals
    }

    pub fn percent_bad(&self) -> f64 {
        percent(self.total_bad, self.total_invites)
    }

    pub fn percent_good(&self) -> f64 {
        percent(self.total_good, self.total_invites)
    }
}

/// `100 * part / total` rounded to two places; zero when there is nothing
/// to divide by.
fn percent(part: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (10_000.0 * f64::from(part) / f64::from(total)).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckSummary {
    pub categories: Vec<CategoryCounts>,
    pub totals: CheckTotals,
    pub elapsed: Duration,
}

/// Progress stream for whoever renders the check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckEvent {
    Started { embed_color: u32 },
    Category { embed_color: u32, counts: CategoryCounts },
    Finished { embed_color: u32, summary: CheckSummary },
}

/// Why a check did not start. Nothing has been written when one of these is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("This server has not been set up yet.")]
    NotConfigured,
    #[error("You may run an invite check again on <t:{}:f> (<t:{}:R>).", .next_eligible.timestamp(), .next_eligible.timestamp())]
    Cooldown { next_eligible: DateTime<Utc> },
    #[error("No check channel has been set for this guild. Please set one before running an invite check.")]
    NoResultsChannel,
    #[error("This command can only be run in <#{0}>.")]
    WrongChannel(ChannelId),
    #[error("There are no categories to check. Please add some before running an invite check.")]
    NoCategories,
    #[error("An invite check is already running in this server. Another one may not be started.")]
    AlreadyRunning,
    #[error("Invites for this server are still being processed. Please try again at a later time.")]
    Unreconciled,
    #[error("All invites have not been updated since your last invite check. Please try again at a later time.")]
    Stale,
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Rejected(#[from] GuardRejection),
    #[error("invite check aborted: {0}")]
    Persistence(#[from] StoreError),
    #[error("could not list channels: {0}")]
    Platform(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub cooldown: chrono::Duration,
    pub message_window: u8,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::days(1),
            message_window: 10,
        }
    }
}

/// Guards that only need the cached settings, in the order users see them.
pub fn check_setting(
    setting: Option<&Setting>,
    invoking_channel: ChannelId,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> Result<(), GuardRejection> {
    let setting = setting.ok_or(GuardRejection::NotConfigured)?;

    if let Some(last_check) = setting.last_check {
        let next_eligible = last_check + cooldown;
        if now <= next_eligible {
            return Err(GuardRejection::Cooldown { next_eligible });
        }
    }
    match setting.results_channel_id {
        None => return Err(GuardRejection::NoResultsChannel),
        Some(results) if results != invoking_channel => {
            return Err(GuardRejection::WrongChannel(results))
        }
        Some(_) => {}
    }
    if setting.category_channel_ids.is_empty() {
        return Err(GuardRejection::NoCategories);
    }
    if setting.state() == CheckState::Checking {
        return Err(GuardRejection::AlreadyRunning);
    }
    Ok(())
}

/// Guards over the stored invites: nothing may still be waiting for its
/// first validation, and every valid invite must have been refreshed since
/// the last check.
pub fn check_invites<'a>(
    invites: impl IntoIterator<Item = &'a InviteRecord> + Clone,
    last_check: Option<DateTime<Utc>>,
) -> Result<(), GuardRejection> {
    if !invites.clone().into_iter().all(|invite| invite.is_checked) {
        return Err(GuardRejection::Unreconciled);
    }
    if let Some(last_check) = last_check {
        let fresh = invites
            .into_iter()
            .filter(|invite| invite.is_valid)
            .all(|invite| invite.updated_at > last_check);
        if !fresh {
            return Err(GuardRejection::Stale);
        }
    }
    Ok(())
}

pub struct InviteCheck<'a, P: ?Sized> {
    db: &'a Database,
    queue: &'a ValidationQueue,
    platform: &'a P,
    options: &'a CheckOptions,
}

impl<'a, P: ChatPlatform + ?Sized> InviteCheck<'a, P> {
    pub fn new(
        db: &'a Database,
        queue: &'a ValidationQueue,
        platform: &'a P,
        options: &'a CheckOptions,
    ) -> Self {
        Self {
            db,
            queue,
            platform,
            options,
        }
    }

    /// Runs one check for `guild_id`, streaming progress into `progress`.
    ///
    /// A guard rejection leaves no trace. Once the guild is `Checking`, any
    /// failure tries to put it back to `Idle` before returning; if that also
    /// fails the flag stays set until the next startup recovery.
    #[instrument(skip(self, progress), fields(guild_id = %guild_id))]
    pub async fn run(
        &self,
        guild_id: GuildId,
        invoking_channel: ChannelId,
        progress: &UnboundedSender<CheckEvent>,
    ) -> Result<CheckSummary, CheckError> {
        let now = Utc::now();
        check_setting(
            self.db.read_setting(guild_id).as_ref(),
            invoking_channel,
            now,
            self.options.cooldown,
        )?;

        let known = self.db.read_guild_invites(guild_id).await?;
        let last_check = self.db.read_setting(guild_id).and_then(|s| s.last_check);
        check_invites(known.values(), last_check)?;

        let setting = self
            .db
            .begin_check(guild_id)
            .await?
            .ok_or(GuardRejection::AlreadyRunning)?;
        info!(invites = known.len(), "invite check started");

        match self.execute(setting, known, now, progress).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(error = %e, "invite check aborted");
                if let Err(release) = self.db.release_check(guild_id).await {
                    warn!(error = %release, "could not clear check flag, startup recovery will");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        setting: Setting,
        mut known: HashMap<String, InviteRecord>,
        now: DateTime<Utc>,
        progress: &UnboundedSender<CheckEvent>,
    ) -> Result<CheckSummary, CheckError> {
        let guild_id = setting.guild_id;
        let embed_color = setting.embed_color;
        self.db
            .create_audit_entry(
                AuditEvent::InviteCheckStart,
                json!({ "guildId": guild_id.to_string() }),
            )
            .await?;
        let timer = Instant::now();
        let _ = progress.send(CheckEvent::Started { embed_color });

        let mut groups = self
            .platform
            .channel_groups(guild_id)
            .await
            .map_err(CheckError::Platform)?;
        groups.retain(|group| setting.category_channel_ids.contains(&group.id));
        groups.sort_by_key(|group| group.position);

        let mut categories = Vec::with_capacity(groups.len());
        for group in groups {
            let mut counts = CategoryCounts::new(group.name);
            let mut channels: Vec<ScanChannel> = group
                .channels
                .into_iter()
                .filter(|channel| !setting.ignored_channel_ids.contains(&channel.id))
                .collect();
            channels.sort_by_key(|channel| channel.position);

            if channels.is_empty() {
                let _ = progress.send(CheckEvent::Category { embed_color, counts });
                continue;
            }

            for channel in channels {
                if !channel.readable {
                    counts.manual.push(channel.id);
                    continue;
                }
                if !channel.has_messages {
                    counts.channels.push(ChannelCounts::new(channel.id));
                    continue;
                }

                let messages = match self
                    .platform
                    .recent_messages(channel.id, self.options.message_window)
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(channel_id = %channel.id, error = %e, "could not fetch messages");
                        counts.issues += 1;
                        continue;
                    }
                };
                if messages.is_empty() {
                    counts.manual.push(channel.id);
                    continue;
                }

                let mut tally = ChannelCounts::new(channel.id);
                let codes = extract_codes(messages.iter().map(String::as_str), ExtractMode::Exhaustive);
                for code in codes {
                    if self.resolve(guild_id, &code, &mut known, now).await? {
                        tally.good += 1;
                    } else {
                        tally.bad += 1;
                    }
                }
                counts.channels.push(tally);
            }

            let _ = progress.send(CheckEvent::Category {
                embed_color,
                counts: counts.clone(),
            });
            categories.push(counts);
        }

        let elapsed = timer.elapsed();
        let totals = CheckTotals::from_categories(&categories);
        self.db.finish_check(guild_id, Utc::now()).await?;

        let mut metadata = json!(totals);
        metadata["guildId"] = json!(guild_id.to_string());
        metadata["elapsedTime"] = json!(elapsed.as_millis() as u64);
        // The check is committed; a lost audit entry must not turn it into a failure.
        if let Err(e) = self
            .db
            .create_audit_entry(AuditEvent::InviteCheckFinish, metadata)
            .await
        {
            warn!(error = %e, "could not audit finished check");
        }
        info!(?totals, elapsed = ?elapsed, "invite check finished");

        let summary = CheckSummary {
            categories,
            totals,
            elapsed,
        };
        let _ = progress.send(CheckEvent::Finished {
            embed_color,
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Validity of one code. Known, checked codes are answered from the
    /// store; anything else goes through the queue and the result is saved.
    /// `known` is a snapshot, so codes missing from it are saved through
    /// [`Database::insert_invite`], which picks up records stored since.
    async fn resolve(
        &self,
        guild_id: GuildId,
        code: &str,
        known: &mut HashMap<String, InviteRecord>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if let Some(invite) = known.get(code).filter(|invite| invite.is_checked) {
            return Ok(invite.is_valid_at(now));
        }

        let lookup = self.queue.submit(code, Priority::Interactive).await;
        let status = InviteStatus::from_lookup(lookup.as_ref());

        let record = match known.get(code) {
            Some(existing) => {
                self.db.update_invite(&existing.id, status).await?;
                InviteRecord {
                    is_permanent: status.is_permanent,
                    is_valid: status.is_valid,
                    is_checked: true,
                    expires_at: status.expires_at,
                    updated_at: Utc::now(),
                    ..existing.clone()
                }
            }
            None => self.db.insert_invite(guild_id, code, status).await?,
        };
        known.insert(code.to_string(), record);
        Ok(status.is_valid)
    }
}

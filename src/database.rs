use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use serenity::model::prelude::GuildId;
use surrealdb::engine::local::Db;
use surrealdb::Surreal;
use tokio::sync::Mutex;

use crate::audit::AuditEvent;
use crate::crypto::InviteCipher;
use crate::error::{StoreError, StoreResult};
use crate::settings::{Setting, SettingUpdate, SettingsCache};

/// Owns the SurrealDB handle, the invite cipher and the settings cache.
///
/// Every settings mutation goes through here so that the cache only ever
/// reflects what was persisted.
#[derive(Debug)]
pub struct Database {
    pub(crate) db: Surreal<Db>,
    pub(crate) cipher: InviteCipher,
    settings: SettingsCache,
    /// Serialises invite writes per guild, see [`Database::insert_invite`].
    pub(crate) invite_locks: DashMap<GuildId, Arc<Mutex<()>>>,
}

impl Database {
    pub fn new(db: Surreal<Db>, cipher: InviteCipher) -> Self {
        Self {
            db,
            cipher,
            settings: SettingsCache::default(),
            invite_locks: DashMap::new(),
        }
    }

    /// Startup recovery and cache load.
    ///
    /// A process that died mid-check leaves `in_check` set, which would wedge
    /// that guild forever. Nothing can be checking before this runs, so every
    /// flag is cleared before the settings are mirrored into the cache.
    pub async fn init(&self) -> StoreResult<usize> {
        let mut response = self
            .db
            .query("UPDATE setting SET in_check = false WHERE in_check = true RETURN BEFORE")
            .query("SELECT * FROM setting")
            .await?;
        let recovered: Vec<Setting> = response.take(0)?;
        let settings: Vec<Setting> = response.take(1)?;

        for setting in &recovered {
            warn!(guild_id = %setting.guild_id, "cleared check flag left over from a previous run");
        }

        let count = settings.len();
        self.settings.replace_all(settings);
        info!(guilds = count, "loaded guild settings");
        Ok(count)
    }

    pub fn settings(&self) -> &SettingsCache {
        &self.settings
    }

    pub fn read_setting(&self, guild_id: GuildId) -> Option<Setting> {
        self.settings.get(guild_id)
    }

    pub async fn create_setting(&self, guild_id: GuildId) -> StoreResult<Setting> {
        let created: Option<Setting> = self
            .db
            .create(("setting", guild_id.to_string()))
            .content(Setting::new(guild_id))
            .await?;
        let setting = created.ok_or(StoreError::MissingSetting(guild_id))?;
        self.settings.put(setting.clone());

        self.create_audit_entry(
            AuditEvent::GuildCreate,
            json!({ "guildId": guild_id.to_string(), "total": self.settings.len() }),
        )
        .await?;
        Ok(setting)
    }

    /// Removes the guild's settings and every invite recorded for it.
    pub async fn delete_setting(&self, guild_id: GuildId) -> StoreResult<()> {
        let _: Option<Setting> = self.db.delete(("setting", guild_id.to_string())).await?;
        self.settings.remove(guild_id);
        self.delete_guild_invites(guild_id).await?;

        self.create_audit_entry(
            AuditEvent::GuildDelete,
            json!({ "guildId": guild_id.to_string(), "total": self.settings.len() }),
        )
        .await
    }

    /// Applies a partial update. Refused while the guild is checking; the
    /// guard lives in the query so a check starting concurrently still wins.
    pub async fn update_setting(
        &self,
        guild_id: GuildId,
        update: SettingUpdate,
    ) -> StoreResult<Setting> {
        let mut setting = self
            .settings
            .get(guild_id)
            .ok_or(StoreError::MissingSetting(guild_id))?;
        if setting.in_check {
            return Err(StoreError::CheckRunning(guild_id));
        }
        let fields = update.changed_fields();
        setting.merge(update);

        let changes = json!({
            "category_channel_ids": setting.category_channel_ids,
            "ignored_channel_ids": setting.ignored_channel_ids,
            "results_channel_id": setting.results_channel_id,
            "embed_color": setting.embed_color,
        });
        let mut response = self
            .db
            .query("UPDATE type::thing('setting', $key) MERGE $changes WHERE in_check = false RETURN AFTER")
            .bind(("key", guild_id.to_string()))
            .bind(("changes", changes))
            .await?;
        let updated: Vec<Setting> = response.take(0)?;
        let setting = updated
            .into_iter()
            .next()
            .ok_or(StoreError::CheckRunning(guild_id))?;
        self.settings.put(setting.clone());

        self.create_audit_entry(
            AuditEvent::SettingUpdate,
            json!({ "guildId": guild_id.to_string(), "fields": fields }),
        )
        .await?;
        Ok(setting)
    }

    /// `Idle -> Checking`. Returns `None` when the guild is already checking
    /// (or has no settings); the flag is only flipped if it was clear, so two
    /// racing callers cannot both win.
    pub async fn begin_check(&self, guild_id: GuildId) -> StoreResult<Option<Setting>> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('setting', $key) SET in_check = true WHERE in_check = false RETURN AFTER",
            )
            .bind(("key", guild_id.to_string()))
            .await?;
        let updated: Vec<Setting> = response.take(0)?;

        Ok(updated.into_iter().next().map(|setting| {
            self.settings.put(setting.clone());
            setting
        }))
    }

    /// `Checking -> Idle`, stamping the completion time.
    pub async fn finish_check(&self, guild_id: GuildId, at: DateTime<Utc>) -> StoreResult<Setting> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('setting', $key) SET in_check = false, last_check = $at RETURN AFTER",
            )
            .bind(("key", guild_id.to_string()))
            .bind(("at", at.timestamp_millis()))
            .await?;
        let updated: Vec<Setting> = response.take(0)?;
        let setting = updated
            .into_iter()
            .next()
            .ok_or(StoreError::MissingSetting(guild_id))?;
        self.settings.put(setting.clone());
        Ok(setting)
    }

    /// `Checking -> Idle` without touching `last_check`, for aborted runs.
    pub async fn release_check(&self, guild_id: GuildId) -> StoreResult<()> {
        let mut response = self
            .db
            .query("UPDATE type::thing('setting', $key) SET in_check = false RETURN AFTER")
            .bind(("key", guild_id.to_string()))
            .await?;
        let updated: Vec<Setting> = response.take(0)?;
        if let Some(setting) = updated.into_iter().next() {
            self.settings.put(setting);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;
    use serenity::model::prelude::ChannelId;
    use surrealdb::engine::local::Mem;

    use super::*;
    use crate::crypto::test_cipher;
    use crate::settings::CheckState;

    pub(crate) async fn memory_database() -> Database {
        let db = Surreal::new::<Mem>(()).await.unwrap();
        db.use_ns("sakura").use_db("test").await.unwrap();
        Database::new(db, test_cipher())
    }

    #[tokio::test]
    async fn create_update_and_delete_setting() {
        let db = memory_database().await;
        let guild = GuildId(10);

        db.create_setting(guild).await.unwrap();
        let updated = db
            .update_setting(
                guild,
                SettingUpdate {
                    category_channel_ids: Some(vec![ChannelId(1)]),
                    results_channel_id: Some(ChannelId(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.category_channel_ids, vec![ChannelId(1)]);
        assert_eq!(db.read_setting(guild), Some(updated));

        db.delete_setting(guild).await.unwrap();
        assert!(db.read_setting(guild).is_none());

        let audit = db
            .read_audit_entries(Utc::now() - Duration::minutes(1), Utc::now())
            .await
            .unwrap();
        let events: Vec<AuditEvent> = audit.iter().map(|e| e.event).collect();
        assert_eq!(events.len(), 3);
        for event in [AuditEvent::GuildCreate, AuditEvent::SettingUpdate, AuditEvent::GuildDelete] {
            assert!(events.contains(&event), "missing {event:?}");
        }
    }

    #[tokio::test]
    async fn update_of_unknown_guild_fails() {
        let db = memory_database().await;
        let err = db
            .update_setting(GuildId(5), SettingUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingSetting(GuildId(5))));
    }

    #[tokio::test]
    async fn update_is_refused_while_checking() {
        let db = memory_database().await;
        let guild = GuildId(13);
        db.create_setting(guild).await.unwrap();
        db.begin_check(guild).await.unwrap();

        let err = db
            .update_setting(
                guild,
                SettingUpdate {
                    embed_color: Some(0x123456),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckRunning(GuildId(13))));

        let setting = db.read_setting(guild).unwrap();
        assert_eq!(setting.state(), CheckState::Checking);
        assert_eq!(setting.embed_color, crate::settings::DEFAULT_EMBED_COLOR);
    }

    #[tokio::test]
    async fn begin_check_is_exclusive() {
        let db = memory_database().await;
        let guild = GuildId(11);
        db.create_setting(guild).await.unwrap();

        let first = db.begin_check(guild).await.unwrap();
        assert_eq!(first.map(|s| s.state()), Some(CheckState::Checking));
        assert!(db.begin_check(guild).await.unwrap().is_none());

        let at = Utc::now();
        let finished = db.finish_check(guild, at).await.unwrap();
        assert_eq!(finished.state(), CheckState::Idle);
        assert_eq!(
            finished.last_check.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
        assert!(db.begin_check(guild).await.unwrap().is_some());

        db.release_check(guild).await.unwrap();
        let released = db.read_setting(guild).unwrap();
        assert_eq!(released.state(), CheckState::Idle);
        assert_eq!(released.last_check, finished.last_check);
    }

    #[tokio::test]
    async fn init_clears_stuck_checks() {
        let db = memory_database().await;
        let guild = GuildId(12);
        db.create_setting(guild).await.unwrap();
        db.begin_check(guild).await.unwrap();

        // Same store, fresh process.
        let restarted = Database::new(db.db.clone(), test_cipher());
        assert_eq!(restarted.init().await.unwrap(), 1);

        let setting = restarted.read_setting(guild).unwrap();
        assert_eq!(setting.state(), CheckState::Idle);
        assert!(restarted.begin_check(guild).await.unwrap().is_some());
    }
}

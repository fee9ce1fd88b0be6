use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::prelude::{ChannelId, GuildId};

pub const DEFAULT_EMBED_COLOR: u32 = 0xF8_C8_DC;

/// One settings record per guild.
///
/// `in_check` and `last_check` are never touched through [`SettingUpdate`];
/// they only move through the check transitions on the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub guild_id: GuildId,
    #[serde(default)]
    pub category_channel_ids: Vec<ChannelId>,
    #[serde(default)]
    pub ignored_channel_ids: Vec<ChannelId>,
    #[serde(default)]
    pub results_channel_id: Option<ChannelId>,
    pub embed_color: u32,
    #[serde(default)]
    pub in_check: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_check: Option<DateTime<Utc>>,
}

impl Setting {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            category_channel_ids: Vec::new(),
            ignored_channel_ids: Vec::new(),
            results_channel_id: None,
            embed_color: DEFAULT_EMBED_COLOR,
            in_check: false,
            last_check: None,
        }
    }

    pub fn state(&self) -> CheckState {
        if self.in_check {
            CheckState::Checking
        } else {
            CheckState::Idle
        }
    }

    pub fn merge(&mut self, update: SettingUpdate) {
        if let Some(ids) = update.category_channel_ids {
            self.category_channel_ids = ids;
        }
        if let Some(ids) = update.ignored_channel_ids {
            self.ignored_channel_ids = ids;
        }
        if let Some(id) = update.results_channel_id {
            self.results_channel_id = Some(id);
        }
        if let Some(color) = update.embed_color {
            self.embed_color = color;
        }
    }
}

/// Per-guild check state. `Checking` is exclusive: a guild holds it for at
/// most one run, and startup recovery forces every guild back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    Checking,
}

/// Partial change to a [`Setting`]. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingUpdate {
    pub category_channel_ids: Option<Vec<ChannelId>>,
    pub ignored_channel_ids: Option<Vec<ChannelId>>,
    pub results_channel_id: Option<ChannelId>,
    pub embed_color: Option<u32>,
}

impl SettingUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.category_channel_ids.is_some() {
            fields.push("category_channel_ids");
        }
        if self.ignored_channel_ids.is_some() {
            fields.push("ignored_channel_ids");
        }
        if self.results_channel_id.is_some() {
            fields.push("results_channel_id");
        }
        if self.embed_color.is_some() {
            fields.push("embed_color");
        }
        fields
    }
}

/// In-memory mirror of every guild's [`Setting`].
///
/// Reads are synchronous. Writes are crate-private: the database persists
/// first and then stores what it got back, so the cache never holds a value
/// the store rejected.
#[derive(Debug, Default)]
pub struct SettingsCache {
    settings: DashMap<GuildId, Setting>,
}

impl SettingsCache {
    pub fn get(&self, guild_id: GuildId) -> Option<Setting> {
        self.settings.get(&guild_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub(crate) fn put(&self, setting: Setting) {
        self.settings.insert(setting.guild_id, setting);
    }

    pub(crate) fn remove(&self, guild_id: GuildId) {
        self.settings.remove(&guild_id);
    }

    pub(crate) fn replace_all(&self, settings: impl IntoIterator<Item = Setting>) {
        self.settings.clear();
        for setting in settings {
            self.put(setting);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_touches_set_fields() {
        let mut setting = Setting::new(GuildId(1));
        setting.ignored_channel_ids = vec![ChannelId(9)];

        setting.merge(SettingUpdate {
            category_channel_ids: Some(vec![ChannelId(2), ChannelId(3)]),
            results_channel_id: Some(ChannelId(4)),
            ..Default::default()
        });

        assert_eq!(setting.category_channel_ids, vec![ChannelId(2), ChannelId(3)]);
        assert_eq!(setting.ignored_channel_ids, vec![ChannelId(9)]);
        assert_eq!(setting.results_channel_id, Some(ChannelId(4)));
        assert_eq!(setting.embed_color, DEFAULT_EMBED_COLOR);
        assert_eq!(setting.state(), CheckState::Idle);
    }

    #[test]
    fn changed_fields_lists_set_fields() {
        let update = SettingUpdate {
            embed_color: Some(0xFF0000),
            ignored_channel_ids: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(update.changed_fields(), vec!["ignored_channel_ids", "embed_color"]);
        assert!(SettingUpdate::default().is_empty());
    }

    #[test]
    fn cache_replace_all_drops_stale_guilds() {
        let cache = SettingsCache::default();
        cache.put(Setting::new(GuildId(1)));
        cache.replace_all([Setting::new(GuildId(2))]);

        assert!(cache.get(GuildId(1)).is_none());
        assert_eq!(cache.get(GuildId(2)).map(|s| s.guild_id), Some(GuildId(2)));
        assert_eq!(cache.len(), 1);
    }
}

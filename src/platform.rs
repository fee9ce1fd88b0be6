use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use serenity::async_trait;
use serenity::http::Http;
use serenity::model::prelude::{ChannelId, ChannelType, GuildId, Invite};
use serenity::model::Permissions;
use serenity::prelude::Context;

use crate::check::{ChannelGroup, ChatPlatform, ScanChannel};
use crate::queue::{InviteLookup, InviteResolver};

/// What the bot needs on a channel before it will read it.
pub const MINIMUM_PERMISSIONS: Permissions =
    Permissions::VIEW_CHANNEL.union(Permissions::READ_MESSAGE_HISTORY);

pub fn is_scannable(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Text | ChannelType::News)
}

/// Guild and channel access through a live gateway context.
pub struct SerenityPlatform {
    ctx: Context,
}

impl SerenityPlatform {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatPlatform for SerenityPlatform {
    async fn channel_groups(&self, guild_id: GuildId) -> anyhow::Result<Vec<ChannelGroup>> {
        let channels = guild_id.channels(&self.ctx.http).await?;
        let me = self.ctx.cache.current_user_id();

        let mut groups: HashMap<ChannelId, ChannelGroup> = channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Category)
            .map(|category| {
                let group = ChannelGroup {
                    id: category.id,
                    name: category.name.clone(),
                    position: category.position,
                    channels: Vec::new(),
                };
                (category.id, group)
            })
            .collect();

        for channel in channels.values().filter(|c| is_scannable(c.kind)) {
            let Some(group) = channel.parent_id.and_then(|parent| groups.get_mut(&parent)) else {
                continue;
            };
            let readable = channel
                .permissions_for_user(&self.ctx, me)
                .map(|permissions| permissions.contains(MINIMUM_PERMISSIONS))
                .unwrap_or(false);

            group.channels.push(ScanChannel {
                id: channel.id,
                position: channel.position,
                readable,
                has_messages: channel.last_message_id.is_some(),
            });
        }

        Ok(groups.into_values().collect())
    }

    async fn recent_messages(&self, channel_id: ChannelId, limit: u8) -> anyhow::Result<Vec<String>> {
        let messages = channel_id
            .messages(&self.ctx.http, |request| request.limit(u64::from(limit)))
            .await?;
        Ok(messages.into_iter().map(|message| message.content).collect())
    }
}

/// Resolves invite codes against the Discord REST API.
pub struct HttpInviteResolver {
    http: Arc<Http>,
}

impl HttpInviteResolver {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl InviteResolver for HttpInviteResolver {
    async fn resolve(&self, code: &str) -> anyhow::Result<InviteLookup> {
        let invite = Invite::get(&self.http, code, false, true, None).await?;
        Ok(InviteLookup {
            expires_at: invite
                .expires_at
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
            // Only the invite's owner can see these; a public lookup never has them.
            max_age: None,
            max_uses: None,
        })
    }
}

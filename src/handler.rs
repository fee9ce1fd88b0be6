use std::sync::Arc;

use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::prelude::*;
use serenity::prelude::*;
use tracing::Instrument;
use tracing::Level;

use crate::commands;
use crate::extract::{extract_codes, ExtractMode};
use crate::ingest::should_ingest;
use crate::platform::is_scannable;
use crate::utils::interaction_reply_ephemeral;
use crate::App;

pub struct Handler {
    app: Arc<App>,
}

impl Handler {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    async fn ensure_setting(&self, guild_id: GuildId) {
        if self.app.db.read_setting(guild_id).is_some() {
            return;
        }
        match self.app.db.create_setting(guild_id).await {
            Ok(_) => info!(guild_id = %guild_id, "created settings for new guild"),
            Err(e) => error!(error = %e, guild_id = %guild_id, "failed to create guild settings"),
        }
    }
}

async fn register_commands(ctx: &Context, guild_id: GuildId) {
    let commands = GuildId::set_application_commands(&guild_id, ctx, commands::register_all).await;

    if let Err(why) = commands {
        error!(error = %why, guild_id = %guild_id, "Failed to register commands.");
    }
}

#[async_trait]
impl EventHandler for Handler {
    /// Passive listener: queues codes posted in configured channels.
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(setting) = self.app.db.read_setting(guild_id) else {
            return;
        };
        let Some(channel) = msg.channel_id.to_channel_cached(&ctx).and_then(Channel::guild) else {
            return;
        };
        if !is_scannable(channel.kind) || !should_ingest(&setting, channel.parent_id, channel.id) {
            return;
        }

        for code in extract_codes([msg.content.as_str()], ExtractMode::Passive) {
            if self.app.ingest.send((guild_id, code)).await.is_err() {
                warn!(guild_id = %guild_id, "invite ingest is not running");
                return;
            }
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = ?ready.user, "Bot is connected!");

        for guild in ready.guilds {
            register_commands(&ctx, guild.id).await;
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: bool) {
        register_commands(&ctx, guild.id).await;
        if is_new {
            debug!(guild_id = %guild.id, "joined guild");
        }
        self.ensure_setting(guild.id).await;
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // Outages report the guild as unavailable; only a real removal drops data.
        if incomplete.unavailable {
            return;
        }
        match self.app.db.delete_setting(incomplete.id).await {
            Ok(()) => info!(guild_id = %incomplete.id, "removed guild settings"),
            Err(e) => error!(error = %e, guild_id = %incomplete.id, "failed to remove guild settings"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::ApplicationCommand(command) => {
                let span = span!(
                    Level::DEBUG,
                    "application_command",
                    interaction_id = command.id.0,
                    guild_id = %command.guild_id.unwrap_or_default(),
                    channel_id = %command.channel_id,
                    user = %command.user,
                    command_name = %command.data.name
                );

                async {
                    trace!(command = ?command, "received command interaction");
                    let res = match command.data.name.as_str() {
                        "check" => commands::check::run(&command, ctx.clone(), &self.app).await,
                        "settings" => commands::settings::run(&command, ctx.clone(), &self.app).await,
                        _ => {
                            warn!(command_name = %command.data.name, command_options = ?command.data.options, "unknown command received");
                            interaction_reply_ephemeral(&command, ctx.clone(), "Command is currently not implemented").await
                        }
                    };

                    if let Err(why) = res {
                        warn!(error = %why, "Cannot respond to slash command");
                    }
                }
                .instrument(span)
                .await;
            }
            _ => {
                trace!("ignoring non-command interaction");
            }
        }
    }
}

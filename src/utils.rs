use serenity::model::prelude::application_command::ApplicationCommandInteraction;
use serenity::model::prelude::InteractionResponseType;
use serenity::prelude::Context;
use thiserror::Error;

use crate::error::StoreError;

pub async fn interaction_reply_ephemeral(
    command: &ApplicationCommandInteraction,
    ctx: Context,
    content: impl ToString,
) -> Result<(), anyhow::Error> {
    command
        .create_interaction_response(&ctx.http, |response| {
            response
                .kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|message| message.content(content).ephemeral(true))
        })
        .await?;
    Ok(())
}

/// Acknowledges now, answers later with [`interaction_reply_edit`].
pub async fn interaction_defer(
    command: &ApplicationCommandInteraction,
    ctx: Context,
    ephemeral: bool,
) -> Result<(), anyhow::Error> {
    command
        .create_interaction_response(&ctx.http, |response| {
            response
                .kind(InteractionResponseType::DeferredChannelMessageWithSource)
                .interaction_response_data(|message| message.ephemeral(ephemeral))
        })
        .await?;
    Ok(())
}

pub async fn interaction_reply_edit(
    command: &ApplicationCommandInteraction,
    ctx: Context,
    content: impl ToString,
) -> Result<(), anyhow::Error> {
    command
        .edit_original_interaction_response(&ctx.http, |response| response.content(content))
        .await?;
    Ok(())
}

/// Failures a user can do something about, rendered as an ephemeral reply.
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("This command can only be used in a server.")]
    NoGuild,
    #[error("This server has no invite settings yet. Try again in a moment.")]
    NotConfigured,
    #[error("An invite check is running in this server. Settings can be changed once it finishes.")]
    CheckRunning,
    #[error("`{0}` is not a hex colour, try something like `#F8C8DC`.")]
    InvalidColor(String),
    #[error("Nothing to change. Pick at least one option.")]
    NoChanges,
    #[error("Database error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CmdError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CheckRunning(_) => Self::CheckRunning,
            StoreError::MissingSetting(_) => Self::NotConfigured,
            other => Self::Store(other),
        }
    }
}

impl CmdError {
    pub async fn reply(
        self,
        ctx: &Context,
        command: &ApplicationCommandInteraction,
    ) -> Result<(), anyhow::Error> {
        if let Self::Store(e) = &self {
            error!(error = %e, "command failed on the store");
        }
        interaction_reply_ephemeral(command, ctx.clone(), format!(":x: {self}")).await
    }
}

use std::fmt::Write;
use std::time::Duration;

use serenity::builder::CreateApplicationCommand;
use serenity::model::prelude::application_command::ApplicationCommandInteraction;
use serenity::model::Permissions;
use serenity::prelude::Context;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::check::{CategoryCounts, CheckError, CheckEvent, CheckSummary, CheckTotals, InviteCheck};
use crate::platform::SerenityPlatform;
use crate::utils::{interaction_defer, interaction_reply_edit, CmdError};
use crate::App;

#[instrument(skip_all, fields(guild_id = ?command.guild_id))]
pub async fn run(
    command: &ApplicationCommandInteraction,
    ctx: Context,
    app: &App,
) -> Result<(), anyhow::Error> {
    let Some(guild_id) = command.guild_id else {
        return CmdError::NoGuild.reply(&ctx, command).await;
    };
    interaction_defer(command, ctx.clone(), false).await?;

    let platform = SerenityPlatform::new(ctx.clone());
    let (events, receiver) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render(ctx.clone(), command.clone(), receiver));

    let outcome = InviteCheck::new(&app.db, &app.queue, &platform, &app.config.check)
        .run(guild_id, command.channel_id, &events)
        .await;
    drop(events);
    if let Err(e) = renderer.await? {
        warn!(error = %e, "failed to post invite check progress");
    }

    match outcome {
        Ok(summary) => {
            info!(total_invites = summary.totals.total_invites, elapsed = ?summary.elapsed, "invite check finished");
            Ok(())
        }
        Err(CheckError::Rejected(reason)) => {
            debug!(reason = ?reason, "invite check rejected");
            interaction_reply_edit(command, ctx, format!(":x: {reason}")).await
        }
        Err(e) => {
            error!(error = %e, "invite check failed");
            interaction_reply_edit(
                command,
                ctx,
                ":x: The invite check could not be completed. Please try again later.",
            )
            .await
        }
    }
}

/// Posts progress as it arrives. Every event is consumed even after a send
/// fails, so the check is never held up by the renderer.
async fn render(
    ctx: Context,
    command: ApplicationCommandInteraction,
    mut receiver: UnboundedReceiver<CheckEvent>,
) -> Result<(), anyhow::Error> {
    let mut result = Ok(());
    while let Some(event) = receiver.recv().await {
        let sent = match event {
            CheckEvent::Started { .. } => {
                let name = ctx.cache.current_user().name;
                interaction_reply_edit(&command, ctx.clone(), format!("{name} is checking your invites now!")).await
            }
            CheckEvent::Category { embed_color, counts } => command
                .channel_id
                .send_message(&ctx.http, |m| {
                    m.embed(|e| {
                        e.title(&counts.name)
                            .description(category_description(&counts))
                            .color(embed_color);
                        if !counts.manual.is_empty() {
                            e.field("Manual check", mention_list(&counts), false);
                        }
                        if counts.issues > 0 {
                            e.field("Issues", format!("{} channel(s) could not be read", counts.issues), false);
                        }
                        e
                    })
                })
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            CheckEvent::Finished { embed_color, summary } => command
                .channel_id
                .send_message(&ctx.http, |m| {
                    m.add_embed(|e| {
                        e.title("Invite check complete!")
                            .description(format!("Finished in {}.", elapsed(&summary)))
                            .color(embed_color)
                    })
                    .add_embed(|e| {
                        e.title("Results")
                            .description(results_description(&summary.totals))
                            .color(embed_color)
                    })
                })
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
        };
        if result.is_ok() {
            result = sent;
        }
    }
    result
}

fn category_description(counts: &CategoryCounts) -> String {
    if counts.channels.is_empty() && counts.manual.is_empty() && counts.issues == 0 {
        return "No channels to check.".to_string();
    }
    let mut description = String::new();
    for channel in &counts.channels {
        let marker = if channel.bad > 0 { ":red_circle:" } else { ":green_circle:" };
        let _ = writeln!(
            description,
            "{marker} <#{}> **{}** total, **{}** bad",
            channel.channel_id,
            channel.good + channel.bad,
            channel.bad
        );
    }
    description
}

fn mention_list(counts: &CategoryCounts) -> String {
    counts
        .manual
        .iter()
        .map(|id| format!("<#{id}>"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn results_description(totals: &CheckTotals) -> String {
    format!(
        "**{}** channels checked\n**{}** invites checked\n**{}** invalid invites ({:.2}%)\n**{}** valid invites ({:.2}%)",
        totals.total_channels,
        totals.total_invites,
        totals.total_bad,
        totals.percent_bad(),
        totals.total_good,
        totals.percent_good(),
    )
}

fn elapsed(summary: &CheckSummary) -> String {
    humantime::format_duration(Duration::from_secs(summary.elapsed.as_secs())).to_string()
}

pub fn register(command: &mut CreateApplicationCommand) -> &mut CreateApplicationCommand {
    command
        .name("check")
        .description("Check every invite posted in the configured categories")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .dm_permission(false)
}

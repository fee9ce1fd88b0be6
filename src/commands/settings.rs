use serenity::builder::CreateApplicationCommand;
use serenity::model::prelude::application_command::{
    ApplicationCommandInteraction, CommandDataOptionValue,
};
use serenity::model::prelude::command::CommandOptionType;
use serenity::model::prelude::{ChannelId, ChannelType};
use serenity::model::Permissions;
use serenity::prelude::Context;

use crate::settings::{CheckState, Setting, SettingUpdate};
use crate::utils::{interaction_reply_ephemeral, CmdError};
use crate::App;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    ResultsChannel(ChannelId),
    AddCategory(ChannelId),
    RemoveCategory(ChannelId),
    Ignore(ChannelId),
    Unignore(ChannelId),
    Color(u32),
}

pub async fn run(
    command: &ApplicationCommandInteraction,
    ctx: Context,
    app: &App,
) -> Result<(), anyhow::Error> {
    debug!(command_options = ?command.data.options, "command options");

    let Some(guild_id) = command.guild_id else {
        return CmdError::NoGuild.reply(&ctx, command).await;
    };
    let changes = match parse_changes(command) {
        Ok(changes) => changes,
        Err(e) => return e.reply(&ctx, command).await,
    };

    let current = match app.db.read_setting(guild_id) {
        Some(setting) => setting,
        None => match app.db.create_setting(guild_id).await {
            Ok(setting) => setting,
            Err(e) => return CmdError::from(e).reply(&ctx, command).await,
        },
    };
    if current.state() == CheckState::Checking {
        return CmdError::CheckRunning.reply(&ctx, command).await;
    }

    let update = build_update(&current, &changes);
    if update.is_empty() {
        return interaction_reply_ephemeral(command, ctx, describe(&current)).await;
    }

    match app.db.update_setting(guild_id, update).await {
        Ok(setting) => {
            info!(guild_id = %guild_id, "settings updated");
            interaction_reply_ephemeral(
                command,
                ctx,
                format!(":white_check_mark: Settings updated.\n{}", describe(&setting)),
            )
            .await
        }
        Err(e) => CmdError::from(e).reply(&ctx, command).await,
    }
}

fn parse_changes(command: &ApplicationCommandInteraction) -> Result<Vec<Change>, CmdError> {
    let mut changes = Vec::new();
    for option in &command.data.options {
        let change = match (option.name.as_str(), option.resolved.as_ref()) {
            ("results_channel", Some(CommandDataOptionValue::Channel(c))) => Change::ResultsChannel(c.id),
            ("add_category", Some(CommandDataOptionValue::Channel(c))) => Change::AddCategory(c.id),
            ("remove_category", Some(CommandDataOptionValue::Channel(c))) => Change::RemoveCategory(c.id),
            ("ignore_channel", Some(CommandDataOptionValue::Channel(c))) => Change::Ignore(c.id),
            ("unignore_channel", Some(CommandDataOptionValue::Channel(c))) => Change::Unignore(c.id),
            ("color", Some(CommandDataOptionValue::String(raw))) => Change::Color(parse_color(raw)?),
            _ => {
                warn!(option = %option.name, "unexpected settings option");
                continue;
            }
        };
        changes.push(change);
    }
    Ok(changes)
}

fn parse_color(raw: &str) -> Result<u32, CmdError> {
    let hex = raw.trim().trim_start_matches('#');
    match u32::from_str_radix(hex, 16) {
        Ok(color) if hex.len() == 6 => Ok(color),
        _ => Err(CmdError::InvalidColor(raw.to_string())),
    }
}

/// Folds the requested changes over the current settings. Lists are only
/// part of the update when they actually change.
fn build_update(current: &Setting, changes: &[Change]) -> SettingUpdate {
    let mut categories = current.category_channel_ids.clone();
    let mut ignored = current.ignored_channel_ids.clone();
    let mut update = SettingUpdate::default();

    for change in changes {
        match *change {
            Change::ResultsChannel(id) => update.results_channel_id = Some(id),
            Change::Color(color) => update.embed_color = Some(color),
            Change::AddCategory(id) if !categories.contains(&id) => categories.push(id),
            Change::RemoveCategory(id) => categories.retain(|c| *c != id),
            Change::Ignore(id) if !ignored.contains(&id) => ignored.push(id),
            Change::Unignore(id) => ignored.retain(|c| *c != id),
            _ => {}
        }
    }

    if categories != current.category_channel_ids {
        update.category_channel_ids = Some(categories);
    }
    if ignored != current.ignored_channel_ids {
        update.ignored_channel_ids = Some(ignored);
    }
    update
}

fn describe(setting: &Setting) -> String {
    let mentions = |ids: &[ChannelId]| {
        if ids.is_empty() {
            "none".to_string()
        } else {
            ids.iter().map(|id| format!("<#{id}>")).collect::<Vec<_>>().join(", ")
        }
    };
    format!(
        "**Results channel:** {}\n**Categories:** {}\n**Ignored channels:** {}\n**Colour:** #{:06X}",
        setting
            .results_channel_id
            .map(|id| format!("<#{id}>"))
            .unwrap_or_else(|| "not set".to_string()),
        mentions(&setting.category_channel_ids),
        mentions(&setting.ignored_channel_ids),
        setting.embed_color,
    )
}

pub fn register(command: &mut CreateApplicationCommand) -> &mut CreateApplicationCommand {
    command
        .name("settings")
        .description("View or change the invite check settings for this server")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .dm_permission(false)
        .create_option(|option| {
            option
                .name("results_channel")
                .description("Channel where /check runs and posts its results")
                .kind(CommandOptionType::Channel)
                .channel_types(&[ChannelType::Text])
                .required(false)
        })
        .create_option(|option| {
            option
                .name("add_category")
                .description("Category whose channels should be checked")
                .kind(CommandOptionType::Channel)
                .channel_types(&[ChannelType::Category])
                .required(false)
        })
        .create_option(|option| {
            option
                .name("remove_category")
                .description("Category to stop checking")
                .kind(CommandOptionType::Channel)
                .channel_types(&[ChannelType::Category])
                .required(false)
        })
        .create_option(|option| {
            option
                .name("ignore_channel")
                .description("Channel to skip during checks")
                .kind(CommandOptionType::Channel)
                .channel_types(&[ChannelType::Text, ChannelType::News])
                .required(false)
        })
        .create_option(|option| {
            option
                .name("unignore_channel")
                .description("Channel to include in checks again")
                .kind(CommandOptionType::Channel)
                .channel_types(&[ChannelType::Text, ChannelType::News])
                .required(false)
        })
        .create_option(|option| {
            option
                .name("color")
                .description("Embed colour as hex, e.g. #F8C8DC")
                .kind(CommandOptionType::String)
                .required(false)
        })
}

#[cfg(test)]
mod tests {
    use serenity::model::prelude::GuildId;

    use super::*;

    #[test]
    fn colours_must_be_six_hex_digits() {
        assert_eq!(parse_color("#F8C8DC").unwrap(), 0xF8C8DC);
        assert_eq!(parse_color("00ff00").unwrap(), 0x00FF00);
        assert!(matches!(parse_color("#FFF"), Err(CmdError::InvalidColor(_))));
        assert!(matches!(parse_color("pink"), Err(CmdError::InvalidColor(_))));
    }

    #[test]
    fn changes_fold_into_one_update() {
        let mut current = Setting::new(GuildId(1));
        current.category_channel_ids = vec![ChannelId(10), ChannelId(11)];
        current.ignored_channel_ids = vec![ChannelId(20)];

        let update = build_update(
            &current,
            &[
                Change::AddCategory(ChannelId(12)),
                Change::AddCategory(ChannelId(10)),
                Change::RemoveCategory(ChannelId(11)),
                Change::Unignore(ChannelId(20)),
                Change::ResultsChannel(ChannelId(30)),
            ],
        );

        assert_eq!(update.category_channel_ids, Some(vec![ChannelId(10), ChannelId(12)]));
        assert_eq!(update.ignored_channel_ids, Some(vec![]));
        assert_eq!(update.results_channel_id, Some(ChannelId(30)));
        assert_eq!(update.embed_color, None);
    }

    #[test]
    fn no_op_changes_leave_update_empty() {
        let mut current = Setting::new(GuildId(1));
        current.category_channel_ids = vec![ChannelId(10)];

        let update = build_update(
            &current,
            &[Change::AddCategory(ChannelId(10)), Change::Unignore(ChannelId(99))],
        );
        assert!(update.is_empty());
    }
}

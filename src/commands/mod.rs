pub mod check;
pub mod settings;

use serenity::builder::CreateApplicationCommands;

pub fn register_all(commands: &mut CreateApplicationCommands) -> &mut CreateApplicationCommands {
    commands
        .create_application_command(|command| check::register(command))
        .create_application_command(|command| settings::register(command))
}

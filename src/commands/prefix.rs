use anyhow::Result;
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};

use super::{App, defer, reply, session, string_option};

const MAX_PREFIX_LEN: usize = 5;

pub fn definition() -> CreateCommand {
    let opt = CreateCommandOption::new(CommandOptionType::String, "value", "New prefix")
        .max_length(MAX_PREFIX_LEN as u16)
        .required(false);
    CreateCommand::new("prefix")
        .description("Show or change this server's command prefix")
        .add_option(opt)
}

fn valid_prefix(value: &str) -> bool {
    !value.is_empty()
        && value.chars().count() <= MAX_PREFIX_LEN
        && !value.chars().any(char::is_whitespace)
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let content = match string_option(cmd, "value") {
        None => format!("The prefix is `{}`", session.prefix()),
        Some(value) if !valid_prefix(value) => format!(
            ":x: A prefix is 1 to {MAX_PREFIX_LEN} characters without spaces"
        ),
        Some(value) => {
            session.set_prefix(value);
            format!(":white_check_mark: Prefix set to `{}`", session.prefix())
        }
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

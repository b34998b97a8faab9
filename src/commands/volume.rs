use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};

use super::{App, defer, integer_option, reply, session};
use crate::player::MAX_VOLUME;

pub fn definition() -> CreateCommand {
    let opt = CreateCommandOption::new(CommandOptionType::Integer, "value", "Volume in percent")
        .min_int_value(0)
        .max_int_value(u64::from(MAX_VOLUME))
        .required(true);
    CreateCommand::new("volume")
        .description("Set the playback volume")
        .add_option(opt)
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    let value = integer_option(cmd, "value").ok_or_else(|| anyhow!("missing value"))?;
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;

    let volume = session
        .player()
        .set_volume(value.clamp(0, i64::from(MAX_VOLUME)) as u8)
        .await?;
    reply(ctx, cmd, format!(":loud_sound: Volume set to {volume}%")).await;
    Ok(())
}

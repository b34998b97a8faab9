use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("pause").description("Pause or resume playback")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let player = session.player();

    let content = if player.pause().await? {
        ":pause_button: Paused"
    } else if player.resume().await? {
        ":arrow_forward: Resumed"
    } else {
        "Nothing is playing."
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback, clear the queue and leave")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;

    if session.player().connection().await.is_none() {
        reply(ctx, cmd, "Not connected.").await;
        return Ok(());
    }
    session.leave().await?;
    reply(ctx, cmd, "Stopped, cleared queue, and disconnected.").await;
    Ok(())
}

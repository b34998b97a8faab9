use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("next").description("Skip to the next queued track")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;

    if session.player().connection().await.is_none() {
        reply(ctx, cmd, "Not connected.").await;
        return Ok(());
    }
    session.player().skip().await?;

    let content = match session.queue().head() {
        Some(entry) => format!(":track_next: Skipped. Up now: **{}**", entry.metadata().title),
        None => ":track_next: Skipped. The queue is now empty.".to_string(),
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

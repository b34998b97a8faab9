use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};
use tracing::warn;

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("video").description("Link the video stream of the current song")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let content = match session.now_playing_video().await {
        None => "Nothing is playing.".to_string(),
        Some(Ok(stream)) => format!(":film_frames: {}", stream.url()),
        Some(Err(e)) => {
            warn!("guild {}: no video stream: {e}", session.guild_id());
            ":x: No video stream is available for this song".to_string()
        }
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

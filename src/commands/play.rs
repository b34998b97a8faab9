use std::sync::Arc;

use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption,
};
use tracing::warn;

use super::{
    App, added_by, defer, ensure_joined, linked_message, reply, session, string_option,
};
use crate::{
    error::QueueError,
    messaging::{ChatOutput, MessageProgress, SerenityChat},
    queue::Progress,
    session::PlayOutcome,
    source::{custom::is_raw_audio_url, is_playlist_url},
};

pub fn definition() -> CreateCommand {
    let opt =
        CreateCommandOption::new(CommandOptionType::String, "url", "URL to play").required(true);
    CreateCommand::new("play")
        .description("Queue and play audio from a URL")
        .add_option(opt)
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    let raw = string_option(cmd, "url").ok_or_else(|| anyhow!("missing url"))?;
    defer(ctx, cmd).await;

    // a message link plays the audio file attached to that message
    let url = match linked_message(ctx, cmd, raw).await {
        Ok(None) => raw.to_string(),
        Ok(Some(msg)) => match msg.attachments.first() {
            Some(a) if is_raw_audio_url(&a.url) => a.url.clone(),
            _ => {
                reply(ctx, cmd, ":x: The linked message has no audio file").await;
                return Ok(());
            }
        },
        Err(e) => {
            reply(ctx, cmd, format!(":x: {e}")).await;
            return Ok(());
        }
    };
    let url = url.as_str();

    let session = session(app, ctx, cmd).await?;
    if !ensure_joined(&session, ctx, cmd).await? {
        return Ok(());
    }

    let progress: Box<dyn Progress> = if is_playlist_url(url) {
        let chat: Arc<dyn ChatOutput> = Arc::new(SerenityChat::new(ctx.http.clone()));
        let status = chat.post(cmd.channel_id, "Processing songs…").await?;
        Box::new(MessageProgress::new(chat, status))
    } else {
        Box::new(())
    };

    let content = match session
        .play_from_url(url, added_by(cmd), false, progress.as_ref())
        .await
    {
        Ok(PlayOutcome::Track(meta)) => format!(":white_check_mark: Added **{}**", meta.title),
        Ok(PlayOutcome::Playlist(outcome)) if outcome.cancelled => format!(
            ":stop_button: Canceled after adding {} songs",
            outcome.added
        ),
        Ok(PlayOutcome::Playlist(outcome)) => {
            let mut msg = format!(":white_check_mark: Completed: added {} songs", outcome.added);
            if outcome.failed > 0 {
                msg.push_str(&format!(" ({} failed)", outcome.failed));
            }
            msg
        }
        Ok(PlayOutcome::Cancelled) => ":stop_button: Canceled".to_string(),
        Err(QueueError::Full(max)) => format!(":x: The queue is full ({max} songs)"),
        Err(e) => {
            warn!("guild {}: failed to add {url}: {e}", session.guild_id());
            ":x: Failed to add the song".to_string()
        }
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

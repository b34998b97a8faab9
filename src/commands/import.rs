use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use serenity::all::{
    Attachment, CommandInteraction, CommandOptionType, Context as SerenityContext, CreateCommand,
    CreateCommandOption, Message, UserId,
};

use super::{
    App, added_by, defer, ensure_joined, export::QUEUE_FILE_NAME, linked_message, reply, session,
    string_option,
};
use crate::{
    error::QueueError,
    messaging::{ChatOutput, MessageProgress, SerenityChat},
    queue::PortableQueue,
};

pub fn definition() -> CreateCommand {
    let opt = CreateCommandOption::new(
        CommandOptionType::String,
        "link",
        "Link to the message /export posted",
    )
    .required(true);
    CreateCommand::new("import")
        .description("Queue every song from an exported queue file")
        .add_option(opt)
}

fn is_queue_file(filename: &str) -> bool {
    let ext = QUEUE_FILE_NAME.rsplit_once('.').map_or("", |(_, ext)| ext);
    filename
        .rsplit_once('.')
        .is_some_and(|(_, e)| e.eq_ignore_ascii_case(ext))
}

/// The queue file attached to a message this bot posted.
fn queue_attachment(msg: &Message, bot_id: UserId) -> Result<&Attachment, &'static str> {
    if msg.author.id != bot_id {
        return Err("That message wasn't posted by me");
    }
    msg.attachments
        .iter()
        .find(|a| is_queue_file(&a.filename))
        .ok_or("That message has no queue file attached")
}

async fn download(attachment: &Attachment) -> Result<PortableQueue> {
    let body = attachment.download().await?;
    serde_json::from_slice(&body).context("not a queue file")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    let link = string_option(cmd, "link").ok_or_else(|| anyhow!("missing link"))?;
    defer(ctx, cmd).await;

    let session = session(app, ctx, cmd).await?;
    let Some(msg) = linked_message(ctx, cmd, link).await? else {
        reply(ctx, cmd, ":x: That isn't a message link").await;
        return Ok(());
    };
    let bot_id = ctx.cache.current_user().id;
    let attachment = match queue_attachment(&msg, bot_id) {
        Ok(a) => a,
        Err(why) => {
            reply(ctx, cmd, format!(":x: {why}")).await;
            return Ok(());
        }
    };
    let portable = match download(attachment).await {
        Ok(p) => p,
        Err(e) => {
            reply(ctx, cmd, format!(":x: Couldn't read the queue file: {e:#}")).await;
            return Ok(());
        }
    };
    if !ensure_joined(&session, ctx, cmd).await? {
        return Ok(());
    }

    let chat: Arc<dyn ChatOutput> = Arc::new(SerenityChat::new(ctx.http.clone()));
    let status = chat.post(cmd.channel_id, "Processing songs…").await?;
    let progress = MessageProgress::new(chat, status);

    let content = match session
        .import_portable(portable, &added_by(cmd), &progress)
        .await
    {
        Ok(outcome) if outcome.cancelled => {
            format!(":stop_button: Canceled after importing {} songs", outcome.added)
        }
        Ok(outcome) => format!(":white_check_mark: Imported {} songs", outcome.added),
        Err(QueueError::VersionMismatch { current, found }) => format!(
            ":x: This queue file is incompatible (current v{current}; file v{found})"
        ),
        Err(e) => format!(":x: Import failed: {e}"),
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

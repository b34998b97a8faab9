use anyhow::Result;
use serenity::all::{
    CommandInteraction, Context as SerenityContext, CreateAttachment, CreateCommand, CreateMessage,
};

use super::{App, defer, reply, session};

pub const QUEUE_FILE_NAME: &str = "queue.ymx";

pub fn definition() -> CreateCommand {
    CreateCommand::new("export").description("Post the queue as a file that /import can read")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let portable = session.export_queue();
    if portable.data.is_empty() {
        reply(ctx, cmd, "The queue is empty.").await;
        return Ok(());
    }

    let count = portable.data.len();
    let body = serde_json::to_vec(&portable)?;
    let msg = CreateMessage::new()
        .content(format!(":floppy_disk: Exported {count} songs"))
        .add_file(CreateAttachment::bytes(body, QUEUE_FILE_NAME));
    let posted = cmd.channel_id.send_message(&ctx.http, msg).await?;
    reply(
        ctx,
        cmd,
        format!("Import it later with `/import {}`", posted.link()),
    )
    .await;
    Ok(())
}

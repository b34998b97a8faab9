use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("cancel").description("Cancel running playlist or import processing")
}

pub async fn handle(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let content = if session.cancel_all() {
        ":stop_button: Canceling running tasks…"
    } else {
        "Nothing to cancel."
    };
    reply(ctx, cmd, content).await;
    Ok(())
}

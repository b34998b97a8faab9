use anyhow::Result;
use serenity::all::{CommandInteraction, Context as SerenityContext, CreateCommand};

use super::{App, defer, reply, session};

pub fn definition() -> CreateCommand {
    CreateCommand::new("loop").description("Toggle repeating the current track")
}

pub fn queue_definition() -> CreateCommand {
    CreateCommand::new("queueloop").description("Toggle repeating the whole queue")
}

pub async fn handle(
    app: &App,
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
    whole_queue: bool,
) -> Result<()> {
    defer(ctx, cmd).await;
    let session = session(app, ctx, cmd).await?;
    let queue = session.queue();

    let (label, on) = if whole_queue {
        let on = !queue.queue_loop_enabled();
        queue.set_queue_loop_enabled(on);
        ("Queue loop", on)
    } else {
        let on = !queue.loop_enabled();
        queue.set_loop_enabled(on);
        ("Loop", on)
    };
    let state = if on { "enabled" } else { "disabled" };
    reply(ctx, cmd, format!(":repeat: {label} {state}")).await;
    Ok(())
}

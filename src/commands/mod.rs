use std::sync::Arc;

use anyhow::{Result, anyhow};
use serenity::all::{
    ChannelId, CommandDataOptionValue, CommandInteraction, Context as SerenityContext,
    CreateCommand, CreateInteractionResponse, CreateInteractionResponseMessage,
    EditInteractionResponse, GuildId, Message, MessageId,
};
use tracing::error;
use url::Url;

use crate::{
    backup::BackupSynchronizer,
    config::Config,
    error::JoinError,
    queue::AddedBy,
    session::{GuildRegistry, GuildSession, JoinRequest},
};

pub mod cancel;
pub mod export;
pub mod import;
pub mod loop_mode;
pub mod next;
pub mod pause;
pub mod play;
pub mod prefix;
pub mod stop;
pub mod video;
pub mod volume;

/// Everything command handlers need beyond the serenity context.
pub struct App {
    pub registry: Arc<GuildRegistry>,
    pub backup: Option<Arc<BackupSynchronizer>>,
    pub config: Config,
}

pub fn definitions() -> Vec<CreateCommand> {
    vec![
        play::definition(),
        next::definition(),
        stop::definition(),
        cancel::definition(),
        loop_mode::definition(),
        loop_mode::queue_definition(),
        import::definition(),
        export::definition(),
        pause::definition(),
        volume::definition(),
        video::definition(),
        prefix::definition(),
    ]
}

pub async fn dispatch(app: &App, ctx: &SerenityContext, cmd: &CommandInteraction) {
    let name = cmd.data.name.as_str();
    let result = match name {
        "play" => play::handle(app, ctx, cmd).await,
        "next" => next::handle(app, ctx, cmd).await,
        "stop" => stop::handle(app, ctx, cmd).await,
        "cancel" => cancel::handle(app, ctx, cmd).await,
        "loop" => loop_mode::handle(app, ctx, cmd, false).await,
        "queueloop" => loop_mode::handle(app, ctx, cmd, true).await,
        "import" => import::handle(app, ctx, cmd).await,
        "export" => export::handle(app, ctx, cmd).await,
        "pause" => pause::handle(app, ctx, cmd).await,
        "volume" => volume::handle(app, ctx, cmd).await,
        "video" => video::handle(app, ctx, cmd).await,
        "prefix" => prefix::handle(app, ctx, cmd).await,
        _ => return,
    };
    if let Err(why) = result {
        error!("/{name} failed: {why:?}");
        reply(ctx, cmd, format!(":x: {why}")).await;
    }
}

pub(crate) async fn defer(ctx: &SerenityContext, cmd: &CommandInteraction) {
    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
    )
    .await
    .ok();
}

pub(crate) async fn reply(ctx: &SerenityContext, cmd: &CommandInteraction, content: impl Into<String>) {
    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await
        .ok();
}

pub(crate) fn string_option<'a>(cmd: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| match &o.value {
            CommandDataOptionValue::String(s) => Some(s.as_str()),
            _ => None,
        })
}

pub(crate) fn integer_option(cmd: &CommandInteraction, name: &str) -> Option<i64> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_i64())
}

/// Guild, channel and message ids of a `discord.com/channels/…` message link.
pub(crate) fn parse_message_link(raw: &str) -> Option<(GuildId, ChannelId, MessageId)> {
    let url = Url::parse(raw).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?;
    let host = ["www.", "canary.", "ptb."]
        .iter()
        .find_map(|sub| host.strip_prefix(sub))
        .unwrap_or(host);
    if host != "discord.com" && host != "discordapp.com" {
        return None;
    }
    let mut segments = url.path_segments()?;
    if segments.next()? != "channels" {
        return None;
    }
    let mut id = || segments.next()?.parse::<u64>().ok().filter(|n| *n != 0);
    let (guild, channel, message) = (id()?, id()?, id()?);
    if segments.next().is_some() {
        return None;
    }
    Some((
        GuildId::new(guild),
        ChannelId::new(channel),
        MessageId::new(message),
    ))
}

/// Fetches the message a link points at. `Ok(None)` when `raw` isn't a
/// message link; links into other guilds are refused.
pub(crate) async fn linked_message(
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
    raw: &str,
) -> Result<Option<Message>> {
    let Some((guild_id, channel_id, message_id)) = parse_message_link(raw) else {
        return Ok(None);
    };
    if Some(guild_id) != cmd.guild_id {
        return Err(anyhow!("that message is in another server"));
    }
    let msg = channel_id
        .message(ctx, message_id)
        .await
        .map_err(|e| anyhow!("couldn't read the linked message: {e}"))?;
    Ok(Some(msg))
}

pub(crate) fn added_by(cmd: &CommandInteraction) -> AddedBy {
    let display_name = cmd
        .member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .unwrap_or_else(|| cmd.user.display_name().to_string());
    AddedBy {
        display_name,
        user_id: cmd.user.id.to_string(),
    }
}

/// Reads the author's voice channel and the relevant permissions from cache.
pub(crate) fn join_request(ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<JoinRequest> {
    let guild_id = cmd.guild_id.ok_or_else(|| anyhow!("not in a guild"))?;
    let guild = ctx
        .cache
        .guild(guild_id)
        .ok_or_else(|| anyhow!("guild not in cache"))?;
    let voice_channel = guild
        .voice_states
        .get(&cmd.user.id)
        .and_then(|vs| vs.channel_id);
    let bot_id = ctx.cache.current_user().id;
    let bot_can_connect = match (
        voice_channel.and_then(|c| guild.channels.get(&c)),
        guild.members.get(&bot_id),
    ) {
        (Some(channel), Some(me)) => guild.user_permissions_in(channel, me).connect(),
        // not cached; let the transport decide
        _ => true,
    };
    let can_move_members = cmd
        .member
        .as_ref()
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.move_members());
    Ok(JoinRequest {
        voice_channel,
        can_move_members,
        bot_can_connect,
    })
}

/// Session for the interaction's guild, with the bound text channel updated.
pub(crate) async fn session(
    app: &App,
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
) -> Result<Arc<GuildSession>> {
    let guild_id = cmd.guild_id.ok_or_else(|| anyhow!("not in a guild"))?;
    let request = join_request(ctx, cmd)?;
    let session = app.registry.get_or_create(guild_id);
    session
        .update_bound_channel(cmd.channel_id, request.voice_channel)
        .await;
    Ok(session)
}

pub(crate) fn join_error_message(e: &JoinError) -> String {
    match e {
        JoinError::NoVoiceChannel => "You must be in a voice channel first.".to_string(),
        JoinError::AlreadyJoinedElsewhere => {
            "I'm already playing in another voice channel.".to_string()
        }
        JoinError::MissingConnectPermission => {
            "I don't have permission to connect to your voice channel.".to_string()
        }
        JoinError::Transport(_) => "Failed to connect to the voice channel.".to_string(),
    }
}

/// Joins the author's channel, replying with the failure reason if it can't.
pub(crate) async fn ensure_joined(
    session: &GuildSession,
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
) -> Result<bool> {
    let request = join_request(ctx, cmd)?;
    match session.join_voice_channel(request).await {
        Ok(_) => Ok(true),
        Err(e) => {
            reply(ctx, cmd, join_error_message(&e)).await;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_is_defined_once() {
        assert_eq!(definitions().len(), 12);
    }

    #[test]
    fn message_links_parse() {
        let ids = parse_message_link("https://discord.com/channels/1/22/333").unwrap();
        assert_eq!(ids, (GuildId::new(1), ChannelId::new(22), MessageId::new(333)));
        assert!(parse_message_link("https://canary.discordapp.com/channels/1/2/3").is_some());
        assert!(parse_message_link("http://ptb.discord.com/channels/1/2/3").is_some());
    }

    #[test]
    fn other_links_are_not_message_links() {
        for raw in [
            "https://discord.com/channels/1/2",
            "https://discord.com/channels/1/2/3/4",
            "https://discord.com/channels/1/2/x",
            "https://discord.com/channels/0/2/3",
            "https://evil.com/channels/1/2/3",
            "https://discord.com/invite/abc",
            "https://cdn.discordapp.com/attachments/1/2/track.mp3",
            "ftp://discord.com/channels/1/2/3",
        ] {
            assert!(parse_message_link(raw).is_none(), "{raw}");
        }
    }

    #[test]
    fn join_errors_read_differently() {
        let perm = join_error_message(&JoinError::MissingConnectPermission);
        let transport = join_error_message(&JoinError::Transport(anyhow!("boom")));
        assert_ne!(perm, transport);
    }
}

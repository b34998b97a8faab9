use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use once_cell::sync::OnceCell;
use serenity::{
    all::{
        Command as AppCommand, Context as SerenityContext, GatewayIntents, Guild, Interaction,
        Permissions, Ready, UnavailableGuild,
    },
    async_trait,
};
use songbird::{Config as VoiceConfig, Songbird, serenity::SerenityInit};
use tracing::{error, info, warn};

mod backup;
mod cancellation;
mod commands;
mod config;
mod database;
mod error;
mod messaging;
mod metrics;
mod player;
mod queue;
mod session;
mod source;
mod voice_manager;

use crate::{
    backup::{BackupSynchronizer, DirtyMarks},
    commands::App,
    config::Config,
    messaging::SerenityChat,
    metrics::METRICS,
    session::{GuildRegistry, SessionDeps},
    source::{SourceResolver, StrategySet, YtDlpPlaylists},
    voice_manager::SongbirdTransport,
};

struct Handler {
    app: Arc<OnceCell<Arc<App>>>,
    started: AtomicBool,
}

#[async_trait]
impl serenity::prelude::EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!("Logged in as {}", ready.user.name);
        METRICS.set_ready(true);

        for def in commands::definitions() {
            if let Err(e) = AppCommand::create_global_command(&ctx.http, def).await {
                error!("failed to register global command: {e:?}");
            }
        }

        // READY fires again on every reconnect; restore and schedule only once
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(app) = self.app.get() else {
            return;
        };
        if let Some(backup) = &app.backup {
            let guild_ids: Vec<_> = ready.guilds.iter().map(|g| g.id).collect();
            let restored = backup.restore(&guild_ids).await;
            info!("Restored {restored} of {} guilds from backup", guild_ids.len());
            backup.clone().spawn(app.config.backup_interval);
        }
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction
            && let Some(app) = self.app.get()
        {
            commands::dispatch(app, &ctx, &cmd).await;
        }
    }

    async fn guild_delete(&self, _ctx: SerenityContext, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // unavailable means an outage, not a removal
        if incomplete.unavailable {
            return;
        }
        let Some(app) = self.app.get() else {
            return;
        };
        let guild_id = incomplete.id;
        if let Some(session) = app.registry.remove(guild_id)
            && let Err(e) = session.leave().await
        {
            warn!("guild {guild_id}: failed to leave after removal: {e:?}");
        }
        if let Some(backup) = &app.backup {
            backup.delete_guild(guild_id).await;
        }
        info!("guild {guild_id}: removed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = config::read_discord_token()?;
    let config = Config::from_env();

    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;
    // preallocated_tracks avoids allocations on play; one track at a time so softclip is unnecessary
    let voice_cfg = VoiceConfig::default()
        .preallocated_tracks(2)
        .use_softclip(false)
        .mix_mode(config.mix_mode);
    let manager = Songbird::serenity_from_config(voice_cfg);

    let app_cell = Arc::new(OnceCell::new());
    let mut client = serenity::Client::builder(token, intents)
        .event_handler(Handler {
            app: app_cell.clone(),
            started: AtomicBool::new(false),
        })
        .register_songbird_with(manager.clone())
        .await?;

    let strategies = Arc::new(StrategySet::default_chain(
        &config.piped_url,
        config.primary_strategies,
    ));
    let deps = SessionDeps {
        transport: Arc::new(SongbirdTransport::new(manager, config.bitrate)),
        chat: Arc::new(SerenityChat::new(client.http.clone())),
        resolver: SourceResolver::new(strategies),
        playlists: Arc::new(YtDlpPlaylists),
        marks: Arc::new(DirtyMarks::default()),
        prefix: config.prefix.clone(),
        max_queue: config.max_queue,
    };
    let registry = Arc::new(GuildRegistry::new(deps));
    let backup = match config.backup_url.as_deref() {
        Some(url) => Some(Arc::new(BackupSynchronizer::new(
            backup::store::open(url)?,
            registry.clone(),
        ))),
        None => {
            info!("CHORUS_BACKUP_URL not set; backups disabled");
            None
        }
    };
    let _ = app_cell.set(Arc::new(App {
        registry,
        backup,
        config: config.clone(),
    }));

    // Log an invite URL early (before gateway READY), so it's visible immediately
    let app = client.http.get_current_application_info().await?;
    let perms = Permissions::CONNECT | Permissions::SPEAK;
    let invite = format!(
        "https://discord.com/api/oauth2/authorize?client_id={}&permissions={}&scope=bot%20applications.commands",
        app.id,
        perms.bits()
    );
    info!("Invite this bot: {} (app_id={})", invite, app.id);

    info!("Commands: /play url, /next, /stop, /cancel, /loop, /queueloop, /import url, /pause, /volume value");
    info!(
        "Tunables: CHORUS_PREFIX, CHORUS_PRIMARY_STRATEGIES, CHORUS_PIPED_URL, CHORUS_BACKUP_URL, CHORUS_BACKUP_INTERVAL_SECS, CHORUS_MAX_QUEUE, CHORUS_BITRATE=16000..192000, CHORUS_MIX_MODE=mono|stereo"
    );
    metrics::spawn_reporter(std::time::Duration::from_secs(300));

    if let Err(why) = client.start_autosharded().await {
        error!("Client error: {why:?}");
    }
    Ok(())
}

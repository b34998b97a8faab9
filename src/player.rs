//! Drives connect → play → advance → disconnect for one guild.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::Result;
use serenity::all::{ChannelId, GuildId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::{
    cancellation::CancellationToken,
    error::ResolveError,
    messaging::ChatOutput,
    queue::{AddedBy, Queue},
    source::{AudioSource, SourceType, StreamInfo},
    voice_manager::{TrackEnd, VoiceConnection},
};

pub const DEFAULT_VOLUME: u8 = 100;
pub const MAX_VOLUME: u8 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Connecting,
    Playing,
    Paused,
}

struct PlayerInner {
    state: PlayerState,
    connection: Option<Arc<dyn VoiceConnection>>,
    volume: u8,
}

type ChangeHook = Arc<dyn Fn() + Send + Sync>;

pub struct Player {
    guild_id: GuildId,
    queue: Arc<Queue>,
    chat: Arc<dyn ChatOutput>,
    bound_channel: Arc<RwLock<Option<ChannelId>>>,
    inner: AsyncMutex<PlayerInner>,
    /// Bumped whenever the current track is replaced, so stale end events are ignored.
    generation: AtomicU64,
    /// Cancelled by stop/disconnect to break out of live waits without taking `inner`.
    abort: Mutex<CancellationToken>,
    add_related: AtomicBool,
    on_change: Option<ChangeHook>,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        queue: Arc<Queue>,
        chat: Arc<dyn ChatOutput>,
        bound_channel: Arc<RwLock<Option<ChannelId>>>,
    ) -> Self {
        Self {
            guild_id,
            queue,
            chat,
            bound_channel,
            inner: AsyncMutex::new(PlayerInner {
                state: PlayerState::Idle,
                connection: None,
                volume: DEFAULT_VOLUME,
            }),
            generation: AtomicU64::new(0),
            abort: Mutex::new(CancellationToken::new()),
            add_related: AtomicBool::new(false),
            on_change: None,
        }
    }

    pub fn with_change_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(hook));
        self
    }

    fn changed(&self) {
        if let Some(hook) = &self.on_change {
            hook();
        }
    }

    fn current_abort(&self) -> CancellationToken {
        self.abort
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn reset_abort(&self) {
        if let Ok(mut token) = self.abort.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
    }

    async fn report(&self, content: &str) {
        let channel = self.bound_channel.read().ok().and_then(|c| *c);
        if let Some(channel) = channel
            && let Err(e) = self.chat.post(channel, content).await
        {
            error!("guild {}: failed to send message: {e:?}", self.guild_id);
        }
    }

    pub async fn state(&self) -> PlayerState {
        self.inner.lock().await.state
    }

    pub async fn is_playing(&self) -> bool {
        matches!(self.state().await, PlayerState::Playing | PlayerState::Paused)
    }

    pub async fn is_paused(&self) -> bool {
        self.state().await == PlayerState::Paused
    }

    pub async fn connection(&self) -> Option<Arc<dyn VoiceConnection>> {
        self.inner.lock().await.connection.clone()
    }

    pub async fn volume(&self) -> u8 {
        self.inner.lock().await.volume
    }

    pub fn add_related(&self) -> bool {
        self.add_related.load(Ordering::Relaxed)
    }

    pub fn set_add_related(&self, on: bool) {
        self.add_related.store(on, Ordering::Relaxed);
        self.changed();
    }

    /// Installs a fresh connection, replacing (not disconnecting) any old one.
    pub async fn set_connection(&self, connection: Arc<dyn VoiceConnection>) {
        self.inner.lock().await.connection = Some(connection);
        self.changed();
    }

    /// Clears the connection if it is still `connection`; used when the
    /// transport reports it destroyed.
    pub async fn connection_lost(&self, connection: &Arc<dyn VoiceConnection>) {
        let mut inner = self.inner.lock().await;
        if inner
            .connection
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            self.reset_abort();
            self.generation.fetch_add(1, Ordering::SeqCst);
            inner.connection = None;
            inner.state = PlayerState::Idle;
            drop(inner);
            warn!("guild {}: voice connection destroyed", self.guild_id);
            self.changed();
        }
    }

    /// Starts the head of the queue unless something is already playing or
    /// starting. Entries that fail to start are reported, discarded and
    /// skipped; at most one attempt per queued entry is made.
    ///
    /// `inner` is only held for the state transitions, never while resolving
    /// or waiting for a broadcast, so stop/skip/disconnect and status reads
    /// stay responsive. A start that was overtaken by one of those while it
    /// ran is dropped at commit time.
    pub async fn play(self: &Arc<Self>) -> Result<()> {
        let (connection, volume, generation, abort) = {
            let mut inner = self.inner.lock().await;
            if inner.state != PlayerState::Idle {
                return Ok(());
            }
            let Some(connection) = inner.connection.clone() else {
                return Ok(());
            };
            if self.queue.is_empty() {
                return Ok(());
            }
            inner.state = PlayerState::Connecting;
            (
                connection,
                inner.volume,
                self.generation.load(Ordering::SeqCst),
                self.current_abort(),
            )
        };
        let max_failures = self.queue.len();
        let mut failures = 0;

        loop {
            let Some(entry) = self.queue.head() else {
                break;
            };
            let mut source = entry.source.clone();
            let title = source.metadata().title.clone();

            let started = self
                .start(connection.as_ref(), &mut source, volume, &abort)
                .await;

            let mut inner = self.inner.lock().await;
            if abort.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation {
                // overtaken; whoever bumped the generation owns the state now
                if started.is_ok() && inner.state == PlayerState::Idle {
                    connection.stop().await;
                }
                return Ok(());
            }
            match started {
                Ok(end) => {
                    inner.state = PlayerState::Playing;
                    if inner.volume != volume
                        && let Err(e) = connection.set_volume(f32::from(inner.volume) / 100.0).await
                    {
                        warn!("guild {}: failed to apply volume: {e:?}", self.guild_id);
                    }
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.queue.update_head(source);
                    drop(inner);
                    info!("guild {}: now playing {title}", self.guild_id);
                    self.report(&format!(":arrow_forward: Now playing: **{title}**"))
                        .await;
                    self.watch_end(generation, end);
                    self.changed();
                    return Ok(());
                }
                Err(e) => {
                    drop(inner);
                    error!("guild {}: failed to start {title}: {e:#}", self.guild_id);
                    self.report(&format!(":x: Failed to play **{title}**: {e}"))
                        .await;
                    self.queue.discard_head();
                    failures += 1;
                    if failures >= max_failures {
                        break;
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if self.generation.load(Ordering::SeqCst) == generation
                && inner.state == PlayerState::Connecting
            {
                inner.state = PlayerState::Idle;
            }
        }
        self.changed();
        Ok(())
    }

    async fn start(
        &self,
        connection: &dyn VoiceConnection,
        source: &mut AudioSource,
        volume: u8,
        abort: &CancellationToken,
    ) -> Result<tokio::sync::oneshot::Receiver<TrackEnd>> {
        if let AudioSource::YouTube(yt) = source
            && yt.available_after().is_some()
        {
            self.report(&format!(
                ":hourglass: Waiting for **{}** to go live…",
                yt.metadata().title
            ))
            .await;
            yt.wait_for_live(abort, || {}).await?;
            if abort.is_cancelled() {
                return Err(ResolveError::NoData.into());
            }
        }
        let stream: StreamInfo = source.fetch(connection.prefers_direct_url()).await?;
        connection.play(stream, f32::from(volume) / 100.0).await
    }

    fn watch_end(self: &Arc<Self>, generation: u64, end: tokio::sync::oneshot::Receiver<TrackEnd>) {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            // a dropped sender means the track was torn down, not finished
            if let Ok(outcome) = end.await {
                player.on_track_end(generation, outcome).await;
            }
        });
    }

    async fn on_track_end(self: &Arc<Self>, generation: u64, outcome: TrackEnd) {
        {
            let mut inner = self.inner.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation
                || !matches!(inner.state, PlayerState::Playing | PlayerState::Paused)
            {
                return;
            }
            inner.state = PlayerState::Idle;
        }

        match outcome {
            TrackEnd::Finished => {
                self.queue_related_if_ending().await;
                self.queue.advance();
            }
            TrackEnd::Errored(reason) => {
                let title = self
                    .queue
                    .head()
                    .map(|e| e.metadata().title.clone())
                    .unwrap_or_default();
                warn!("guild {}: playback of {title} errored: {reason}", self.guild_id);
                self.report(&format!(":x: Playback of **{title}** failed")).await;
                self.queue.discard_head();
            }
        }

        if let Err(e) = self.play().await {
            error!("guild {}: failed to continue playback: {e:?}", self.guild_id);
        }
    }

    async fn queue_related_if_ending(&self) {
        if !self.add_related()
            || self.queue.len() != 1
            || self.queue.loop_enabled()
            || self.queue.queue_loop_enabled()
        {
            return;
        }
        let Some(related) = self
            .queue
            .head()
            .and_then(|e| e.source.related().first().cloned())
        else {
            return;
        };
        let auto = AddedBy {
            display_name: "Auto related".to_string(),
            user_id: "0".to_string(),
        };
        if let Err(e) = self
            .queue
            .add_queue_only(related, Some(SourceType::YouTube), auto, false)
            .await
        {
            warn!("guild {}: failed to queue related track: {e}", self.guild_id);
        }
    }

    pub async fn pause(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.state != PlayerState::Playing {
            return Ok(false);
        }
        if let Some(conn) = &inner.connection {
            conn.pause().await?;
        }
        inner.state = PlayerState::Paused;
        drop(inner);
        self.changed();
        Ok(true)
    }

    pub async fn resume(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.state != PlayerState::Paused {
            return Ok(false);
        }
        if let Some(conn) = &inner.connection {
            conn.resume().await?;
        }
        inner.state = PlayerState::Playing;
        drop(inner);
        self.changed();
        Ok(true)
    }

    /// Skips the current track and starts the next one.
    pub async fn skip(self: &Arc<Self>) -> Result<()> {
        self.reset_abort();
        {
            let mut inner = self.inner.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Some(conn) = &inner.connection {
                conn.stop().await;
            }
            inner.state = PlayerState::Idle;
        }
        self.queue.skip();
        self.play().await
    }

    /// Stops playback but stays connected.
    pub async fn stop(&self) {
        self.reset_abort();
        let mut inner = self.inner.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = &inner.connection {
            conn.stop().await;
        }
        inner.state = PlayerState::Idle;
        drop(inner);
        self.changed();
    }

    /// Tears down the voice connection and forces `Idle`, whatever the state.
    pub async fn disconnect(&self) -> Result<()> {
        self.reset_abort();
        let mut inner = self.inner.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        inner.state = PlayerState::Idle;
        let connection = inner.connection.take();
        drop(inner);
        self.changed();
        if let Some(conn) = connection {
            conn.stop().await;
            conn.disconnect().await?;
            info!("guild {}: disconnected", self.guild_id);
        }
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> Result<u8> {
        let volume = volume.min(MAX_VOLUME);
        let mut inner = self.inner.lock().await;
        inner.volume = volume;
        if let Some(conn) = &inner.connection {
            conn.set_volume(f32::from(volume) / 100.0).await?;
        }
        drop(inner);
        self.changed();
        Ok(volume)
    }
}

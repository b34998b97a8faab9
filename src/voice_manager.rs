use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, anyhow};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serenity::{
    all::{ChannelId, GuildId},
    async_trait,
};
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
    driver::Bitrate,
    input::{HttpRequest, Input, YoutubeDl},
    tracks::TrackHandle,
};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tracing::{info, warn};

use crate::{metrics::METRICS, source::StreamInfo};

/// How long a single join attempt may take before it counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEnd {
    Finished,
    Errored(String),
}

/// A live voice connection for one guild.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    /// True when the transport wants direct media urls rather than page urls.
    fn prefers_direct_url(&self) -> bool {
        true
    }

    /// Starts `stream`, replacing whatever was playing. The receiver fires once
    /// when the track stops on its own.
    async fn play(&self, stream: StreamInfo, volume: f32) -> Result<oneshot::Receiver<TrackEnd>>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop(&self);
    async fn set_volume(&self, volume: f32) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Resolves once the connection is destroyed from either side.
    async fn closed(&self);
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Arc<dyn VoiceConnection>>;
}

type ClosedSlot = Arc<Mutex<watch::Sender<bool>>>;

/// Per-guild slot the driver-disconnect handler reports through. A call is
/// reused when the bot moves channels, so its handler is registered once and
/// each new connection just swaps in a fresh sender.
#[derive(Default)]
struct DisconnectSlots {
    slots: Mutex<HashMap<GuildId, ClosedSlot>>,
}

struct Registration {
    closed: watch::Receiver<bool>,
    /// Set when the call has no handler yet and needs this one installed.
    install: Option<ClosedSlot>,
}

impl DisconnectSlots {
    fn register(&self, guild_id: GuildId, reused_call: bool) -> Registration {
        let (tx, closed) = watch::channel(false);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if reused_call && let Some(slot) = slots.get(&guild_id) {
            if let Ok(mut current) = slot.lock() {
                *current = tx;
            }
            return Registration {
                closed,
                install: None,
            };
        }
        let slot = Arc::new(Mutex::new(tx));
        slots.insert(guild_id, slot.clone());
        Registration {
            closed,
            install: Some(slot),
        }
    }
}

/// Voice transport backed by the songbird manager registered on the client.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    bitrate: i32,
    disconnects: DisconnectSlots,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, bitrate: u32) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            bitrate: bitrate as i32,
            disconnects: DisconnectSlots::default(),
        }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Arc<dyn VoiceConnection>> {
        let reused_call = self.manager.get(guild_id).is_some();
        let mut attempts = 0;
        let max_attempts = 3;

        let call = loop {
            info!(
                "Attempting to join voice channel {} in guild {} (attempt {}/{})",
                channel_id,
                guild_id,
                attempts + 1,
                max_attempts
            );
            let err = match tokio::time::timeout(CONNECT_TIMEOUT, self.manager.join(guild_id, channel_id)).await {
                Ok(Ok(call)) => break call,
                Ok(Err(e)) => anyhow!(e),
                Err(_) => anyhow!("timed out waiting for the voice connection"),
            };
            attempts += 1;
            if attempts >= max_attempts {
                let _ = self.manager.remove(guild_id).await;
                return Err(err.context(format!("failed to join voice channel after {max_attempts} attempts")));
            }
            // exponential backoff capped at 5s
            let delay_ms = std::cmp::min(5000, 1000 * (2_u64.pow(attempts as u32 - 1)));
            warn!("Voice channel join attempt {attempts} failed: {err:#}. Retrying in {delay_ms}ms...");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        };

        let registration = self.disconnects.register(guild_id, reused_call);
        {
            let mut handler = call.lock().await;
            handler.set_bitrate(Bitrate::BitsPerSecond(self.bitrate));
            if let Some(slot) = registration.install {
                handler.add_global_event(
                    Event::Core(CoreEvent::DriverDisconnect),
                    DisconnectNotifier { tx: slot },
                );
            }
        }
        if !reused_call {
            METRICS.inc_connections();
        }
        info!("Connected to voice channel {channel_id} in guild {guild_id}");

        Ok(Arc::new(SongbirdConnection {
            manager: self.manager.clone(),
            http: self.http.clone(),
            guild_id,
            channel_id,
            call,
            current: AsyncMutex::new(None),
            closed: registration.closed,
            ytdlp_on_path: which::which("yt-dlp").is_ok(),
        }))
    }
}

struct DisconnectNotifier {
    tx: ClosedSlot,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(true);
        }
        None
    }
}

struct TrackEndNotifier {
    tx: Arc<Mutex<Option<oneshot::Sender<TrackEnd>>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let outcome = match ctx {
            EventContext::Track(tracks) => match tracks.first().map(|(state, _)| &state.playing) {
                Some(songbird::tracks::PlayMode::Errored(e)) => TrackEnd::Errored(format!("{e:?}")),
                _ => TrackEnd::Finished,
            },
            _ => TrackEnd::Finished,
        };
        if let Some(tx) = self.tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(outcome);
        }
        Some(Event::Cancel)
    }
}

pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    guild_id: GuildId,
    channel_id: ChannelId,
    call: Arc<AsyncMutex<Call>>,
    current: AsyncMutex<Option<TrackHandle>>,
    closed: watch::Receiver<bool>,
    ytdlp_on_path: bool,
}

impl SongbirdConnection {
    fn input(&self, stream: StreamInfo) -> Input {
        match stream {
            StreamInfo::Url { url, user_agent, .. } => {
                let mut headers = HeaderMap::new();
                if let Some(ua) = user_agent.and_then(|ua| HeaderValue::from_str(&ua).ok()) {
                    headers.insert(USER_AGENT, ua);
                }
                HttpRequest::new_with_headers(self.http.clone(), url, headers).into()
            }
            StreamInfo::YtDlp { url } => YoutubeDl::new(self.http.clone(), url).into(),
        }
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn prefers_direct_url(&self) -> bool {
        // songbird's yt-dlp input only looks on PATH
        !self.ytdlp_on_path
    }

    async fn play(&self, stream: StreamInfo, volume: f32) -> Result<oneshot::Receiver<TrackEnd>> {
        let input = self.input(stream);
        let (tx, rx) = oneshot::channel();
        let notifier = Arc::new(Mutex::new(Some(tx)));

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            let _ = previous.stop();
        }
        let handle = {
            let mut call = self.call.lock().await;
            call.stop();
            call.play_input(input)
        };
        handle.set_volume(volume)?;
        handle.add_event(
            Event::Track(TrackEvent::End),
            TrackEndNotifier {
                tx: notifier.clone(),
            },
        )?;
        handle.add_event(Event::Track(TrackEvent::Error), TrackEndNotifier { tx: notifier })?;
        *current = Some(handle);
        Ok(rx)
    }

    async fn pause(&self) -> Result<()> {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.pause()?;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.play()?;
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.current.lock().await.take() {
            let _ = handle.stop();
        }
    }

    async fn set_volume(&self, volume: f32) -> Result<()> {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.set_volume(volume)?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop().await;
        let res = self.manager.remove(self.guild_id).await;
        METRICS.dec_connections();
        res.map_err(|e| anyhow!(e))
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

//! Per-guild aggregate: queue, player, voice connection lifecycle and the
//! registry of cancellable bulk tasks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serenity::all::{ChannelId, GuildId};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    backup::{DirtyMarks, RecordKind},
    cancellation::{BoundCancellation, CancellationRegistry},
    error::{JoinError, QueueError, ResolveError},
    messaging::ChatOutput,
    player::{Player, PlayerState},
    queue::{
        AddOutcome, AddQueueOptions, AddedBy, PlaylistOutcome, PortableQueue, Progress, Queue,
        QueueChange, QUEUE_FORMAT_VERSION,
    },
    source::{
        PlaylistLister, SourceResolver, SourceType, StreamInfo, TrackMetadata, classify,
        is_playlist_url,
    },
    voice_manager::VoiceTransport,
};

/// Sentinel for "not connected / not playing" in the status export.
pub const NO_CHANNEL: &str = "0";

/// Exported connection and playback flags of one guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusExport {
    pub voice_channel_id: String,
    pub bound_channel_id: String,
    pub loop_enabled: bool,
    pub queue_loop_enabled: bool,
    pub add_related_songs: bool,
    pub equally_playback: bool,
    pub volume: u8,
}

/// What the command author can do, as seen by the chat platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinRequest {
    pub voice_channel: Option<ChannelId>,
    pub can_move_members: bool,
    pub bot_can_connect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Track(TrackMetadata),
    Playlist(PlaylistOutcome),
    Cancelled,
}

/// Collaborators shared by every guild session.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn VoiceTransport>,
    pub chat: Arc<dyn ChatOutput>,
    pub resolver: SourceResolver,
    pub playlists: Arc<dyn PlaylistLister>,
    pub marks: Arc<DirtyMarks>,
    pub prefix: String,
    pub max_queue: usize,
}

fn parse_channel(raw: &str) -> Option<ChannelId> {
    raw.parse::<u64>().ok().filter(|v| *v != 0).map(ChannelId::new)
}

pub struct GuildSession {
    guild_id: GuildId,
    prefix: RwLock<String>,
    bound_channel: Arc<RwLock<Option<ChannelId>>>,
    connecting: Mutex<Option<ChannelId>>,
    /// Guards the connection decision section of `join_voice_channel`.
    join_lock: AsyncMutex<()>,
    cancellations: CancellationRegistry,
    transport: Arc<dyn VoiceTransport>,
    playlists: Arc<dyn PlaylistLister>,
    marks: Arc<DirtyMarks>,
    queue: Arc<Queue>,
    player: Arc<Player>,
}

impl GuildSession {
    pub fn new(guild_id: GuildId, deps: &SessionDeps) -> Self {
        let queue_marks = deps.marks.clone();
        let queue = Arc::new(
            Queue::new(deps.resolver.clone(), deps.max_queue).with_change_hook(move |change| {
                let kind = match change {
                    QueueChange::Entries => RecordKind::Queue,
                    QueueChange::Flags => RecordKind::Status,
                };
                queue_marks.mark(kind, guild_id);
            }),
        );
        let bound_channel = Arc::new(RwLock::new(None));
        let player_marks = deps.marks.clone();
        let player = Arc::new(
            Player::new(
                guild_id,
                queue.clone(),
                deps.chat.clone(),
                bound_channel.clone(),
            )
            .with_change_hook(move || player_marks.mark(RecordKind::Status, guild_id)),
        );

        Self {
            guild_id,
            prefix: RwLock::new(deps.prefix.clone()),
            bound_channel,
            connecting: Mutex::new(None),
            join_lock: AsyncMutex::new(()),
            cancellations: CancellationRegistry::new(),
            transport: deps.transport.clone(),
            playlists: deps.playlists.clone(),
            marks: deps.marks.clone(),
            queue,
            player,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    pub fn prefix(&self) -> String {
        self.prefix
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn set_prefix(&self, prefix: impl Into<String>) {
        if let Ok(mut p) = self.prefix.write() {
            *p = prefix.into();
        }
    }

    pub fn bound_channel(&self) -> Option<ChannelId> {
        self.bound_channel.read().ok().and_then(|c| *c)
    }

    fn set_bound_channel(&self, channel: Option<ChannelId>) {
        let changed = match self.bound_channel.write() {
            Ok(mut bound) if *bound != channel => {
                *bound = channel;
                true
            }
            _ => false,
        };
        if changed {
            self.marks.mark(RecordKind::Status, self.guild_id);
        }
    }

    /// Rebinds the text channel for bot output. While connected, only a
    /// command issued from the bot's own voice channel may move it.
    pub async fn update_bound_channel(
        &self,
        text_channel: ChannelId,
        requester_voice: Option<ChannelId>,
    ) -> bool {
        let connected = self.player.connection().await.map(|c| c.channel_id());
        let allowed = match connected {
            None => true,
            Some(current) => requester_voice == Some(current),
        };
        if allowed {
            self.set_bound_channel(Some(text_channel));
        }
        allowed
    }

    pub fn connecting_channel(&self) -> Option<ChannelId> {
        self.connecting.lock().ok().and_then(|c| *c)
    }

    pub async fn voice_channel(&self) -> Option<ChannelId> {
        self.player.connection().await.map(|c| c.channel_id())
    }

    /// Ensures the bot sits in the requester's voice channel. The whole
    /// check-then-connect section runs under the per-guild join lock.
    pub async fn join_voice_channel(&self, request: JoinRequest) -> Result<ChannelId, JoinError> {
        let target = request.voice_channel.ok_or(JoinError::NoVoiceChannel)?;
        let _guard = self.join_lock.lock().await;

        let current = self.voice_channel().await;
        if current == Some(target) {
            return Ok(target);
        }
        if current.is_some() && !request.can_move_members {
            return Err(JoinError::AlreadyJoinedElsewhere);
        }
        if !request.bot_can_connect {
            return Err(JoinError::MissingConnectPermission);
        }

        let resume = current.is_some() && self.player.state().await != PlayerState::Idle;
        if current.is_some() {
            self.player.stop().await;
        }
        match self.join_voice_channel_only(target).await {
            Ok(()) => {
                if resume && let Err(e) = self.player.play().await {
                    error!("guild {}: failed to resume after move: {e:?}", self.guild_id);
                }
                Ok(target)
            }
            Err(e) => {
                error!("guild {}: failed to join {target}: {e:#}", self.guild_id);
                if let Err(e) = self.player.disconnect().await {
                    warn!("guild {}: disconnect after failed join: {e:?}", self.guild_id);
                }
                Err(JoinError::Transport(e))
            }
        }
    }

    /// Raw connect without the lock or permission checks; used by restore.
    pub async fn join_voice_channel_only(&self, channel: ChannelId) -> Result<()> {
        if let Ok(mut c) = self.connecting.lock() {
            *c = Some(channel);
        }
        let result = self.transport.connect(self.guild_id, channel).await;
        if let Ok(mut c) = self.connecting.lock() {
            *c = None;
        }
        let connection = result?;
        self.player.set_connection(connection.clone()).await;

        let player = Arc::clone(&self.player);
        tokio::spawn(async move {
            connection.closed().await;
            player.connection_lost(&connection).await;
        });
        info!("guild {}: joined voice channel {channel}", self.guild_id);
        Ok(())
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Cancels every running bulk task; true if any was still running.
    pub fn cancel_all(&self) -> bool {
        self.cancellations.cancel_all()
    }

    /// Queues `url` for `added_by` and kicks playback. Playlist urls are
    /// expanded in bulk under a bound cancellation token.
    pub async fn play_from_url(
        &self,
        url: &str,
        added_by: AddedBy,
        first: bool,
        progress: &dyn Progress,
    ) -> Result<PlayOutcome, QueueError> {
        let outcome = if classify(url) == SourceType::YouTube && is_playlist_url(url) {
            self.add_playlist(url, &added_by, progress).await?
        } else {
            let mut opts = AddQueueOptions::new(url, added_by);
            opts.first = first;
            opts.source_type = Some(classify(url));
            match self.queue.add_queue(opts).await? {
                AddOutcome::Added { meta, .. } => PlayOutcome::Track(meta),
                AddOutcome::Cancelled => PlayOutcome::Cancelled,
            }
        };

        if let Err(e) = self.player.play().await {
            error!("guild {}: failed to start playback: {e:?}", self.guild_id);
        }
        Ok(outcome)
    }

    async fn add_playlist(
        &self,
        url: &str,
        added_by: &AddedBy,
        progress: &dyn Progress,
    ) -> Result<PlayOutcome, QueueError> {
        let limit = self.queue.remaining_capacity();
        if limit == 0 {
            return Err(QueueError::Full(self.queue.len()));
        }
        let bound = BoundCancellation::new(&self.cancellations);
        let items = match self.playlists.list(url, limit).await {
            Ok(items) => items,
            Err(e) => {
                warn!("guild {}: failed to list playlist {url}: {e:#}", self.guild_id);
                return Err(QueueError::Resolve(ResolveError::Strategy {
                    name: "playlist",
                    source: e,
                }));
            }
        };
        let outcome = self
            .queue
            .process_playlist(
                items,
                bound.token(),
                Some(SourceType::YouTube),
                added_by,
                progress,
                |item| async move { Ok(item.to_metadata("")) },
            )
            .await;
        info!(
            "guild {}: playlist {url}: {} added, {} failed, cancelled={}",
            self.guild_id, outcome.added, outcome.failed, outcome.cancelled
        );
        Ok(PlayOutcome::Playlist(outcome))
    }

    pub async fn export_status(&self) -> StatusExport {
        let voice = match (self.player.connection().await, self.player.state().await) {
            (Some(conn), PlayerState::Playing) => conn.channel_id().to_string(),
            _ => NO_CHANNEL.to_string(),
        };
        StatusExport {
            voice_channel_id: voice,
            bound_channel_id: self
                .bound_channel()
                .map(|c| c.to_string())
                .unwrap_or_else(|| NO_CHANNEL.to_string()),
            loop_enabled: self.queue.loop_enabled(),
            queue_loop_enabled: self.queue.queue_loop_enabled(),
            add_related_songs: self.player.add_related(),
            equally_playback: self.queue.equal_playback(),
            volume: self.player.volume().await,
        }
    }

    /// Applies restored flags and, if the guild was playing, reconnects and
    /// resumes in the background. Reconnect failures are logged, not returned.
    /// The handle of the background task is returned when one was started.
    pub async fn import_status(self: &Arc<Self>, status: StatusExport) -> Option<JoinHandle<()>> {
        self.queue.set_loop_enabled(status.loop_enabled);
        self.queue.set_queue_loop_enabled(status.queue_loop_enabled);
        self.queue.set_equal_playback(status.equally_playback);
        self.player.set_add_related(status.add_related_songs);
        if let Err(e) = self.player.set_volume(status.volume).await {
            warn!("guild {}: failed to restore volume: {e:?}", self.guild_id);
        }
        self.set_bound_channel(parse_channel(&status.bound_channel_id));

        let voice = parse_channel(&status.voice_channel_id)?;
        let session = Arc::clone(self);
        Some(tokio::spawn(async move {
            {
                let _guard = session.join_lock.lock().await;
                if session.voice_channel().await.is_none()
                    && let Err(e) = session.join_voice_channel_only(voice).await
                {
                    error!("guild {}: failed to rejoin {voice}: {e:#}", session.guild_id);
                    return;
                }
            }
            if let Err(e) = session.player.play().await {
                error!("guild {}: failed to resume playback: {e:?}", session.guild_id);
            }
        }))
    }

    /// Combined audio+video stream of the track that is playing now.
    pub async fn now_playing_video(&self) -> Option<Result<StreamInfo, ResolveError>> {
        if !self.player.is_playing().await {
            return None;
        }
        self.queue.head().map(|entry| entry.source.fetch_video())
    }

    pub fn export_queue(&self) -> PortableQueue {
        self.queue.export()
    }

    /// All-or-nothing import used by backup restore.
    pub async fn import_queue(&self, portable: PortableQueue) -> Result<usize, QueueError> {
        self.queue.import(portable).await
    }

    /// Incremental import of a user-supplied queue file: honours capacity and
    /// can be cancelled between entries.
    pub async fn import_portable(
        &self,
        mut portable: PortableQueue,
        added_by: &AddedBy,
        progress: &dyn Progress,
    ) -> Result<PlaylistOutcome, QueueError> {
        if portable.version != QUEUE_FORMAT_VERSION {
            return Err(QueueError::VersionMismatch {
                current: QUEUE_FORMAT_VERSION,
                found: portable.version,
            });
        }
        portable.data.truncate(self.queue.remaining_capacity());
        let bound = BoundCancellation::new(&self.cancellations);
        let outcome = self
            .queue
            .process_playlist(
                portable.data,
                bound.token(),
                None,
                added_by,
                progress,
                |entry| async move { Ok(entry.meta) },
            )
            .await;
        drop(bound);

        if let Err(e) = self.player.play().await {
            error!("guild {}: failed to start playback: {e:?}", self.guild_id);
        }
        Ok(outcome)
    }

    /// Stops everything: bulk tasks, playback, queue and the voice connection.
    pub async fn leave(&self) -> Result<()> {
        self.cancel_all();
        self.queue.clear(false);
        self.player.disconnect().await
    }
}

/// All live guild sessions.
pub struct GuildRegistry {
    deps: SessionDeps,
    sessions: RwLock<HashMap<GuildId, Arc<GuildSession>>>,
}

impl GuildRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn marks(&self) -> &Arc<DirtyMarks> {
        &self.deps.marks
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions
            .read()
            .ok()
            .and_then(|s| s.get(&guild_id).cloned())
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildSession> {
        if let Some(session) = self.get(guild_id) {
            return session;
        }
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildSession::new(guild_id, &self.deps)))
            .clone()
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions
            .write()
            .ok()
            .and_then(|mut s| s.remove(&guild_id))
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.sessions
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::anyhow;
    use serenity::async_trait;

    use super::*;
    use crate::{
        messaging::tests::RecordingChat,
        player::tests::{FakeConnection, picky_queue, wait_for_state},
        queue::{
            PortableEntry,
            tests::{url, user},
        },
        source::{
            PlaylistItem,
            strategies::testing::{meta, upcoming_set},
        },
        voice_manager::VoiceConnection,
    };

    /// Connects after a short delay and records how many connects overlap.
    #[derive(Default)]
    pub struct SlowTransport {
        pub connects: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
        pub fail: bool,
        /// Never completes a connect.
        pub hang: bool,
    }

    #[async_trait]
    impl VoiceTransport for SlowTransport {
        async fn connect(
            &self,
            _guild_id: GuildId,
            channel_id: ChannelId,
        ) -> Result<Arc<dyn VoiceConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("voice gateway unreachable"));
            }
            Ok(FakeConnection::new(channel_id.get()))
        }
    }

    pub struct FakePlaylists {
        pub size: usize,
    }

    #[async_trait]
    impl PlaylistLister for FakePlaylists {
        async fn list(&self, _url: &str, limit: usize) -> Result<Vec<PlaylistItem>> {
            Ok((0..self.size.min(limit))
                .map(|n| PlaylistItem {
                    id: format!("list{n:07}"),
                    title: Some(format!("item {n}")),
                    duration: Some(60.0),
                    ..Default::default()
                })
                .collect())
        }
    }

    pub fn deps(transport: Arc<dyn VoiceTransport>, playlist_size: usize) -> SessionDeps {
        SessionDeps {
            transport,
            chat: Arc::new(RecordingChat::default()),
            resolver: picky_queue().resolver().clone(),
            playlists: Arc::new(FakePlaylists {
                size: playlist_size,
            }),
            marks: Arc::new(DirtyMarks::default()),
            prefix: ">".to_string(),
            max_queue: 999,
        }
    }

    /// Every YouTube url resolves to a premiere two hours away.
    pub fn upcoming_deps(transport: Arc<dyn VoiceTransport>) -> SessionDeps {
        let mut d = deps(transport, 0);
        d.resolver = SourceResolver::new(upcoming_set());
        d
    }

    fn session_with(transport: Arc<SlowTransport>) -> Arc<GuildSession> {
        Arc::new(GuildSession::new(GuildId::new(7), &deps(transport, 25)))
    }

    pub fn request(channel: u64, can_move: bool) -> JoinRequest {
        JoinRequest {
            voice_channel: Some(ChannelId::new(channel)),
            can_move_members: can_move,
            bot_can_connect: true,
        }
    }

    #[tokio::test]
    async fn concurrent_joins_connect_once() {
        let transport = Arc::new(SlowTransport::default());
        let session = session_with(transport.clone());

        let (a, b) = tokio::join!(
            session.join_voice_channel(request(100, false)),
            session.join_voice_channel(request(100, false)),
        );
        assert_eq!(a.unwrap(), ChannelId::new(100));
        assert_eq!(b.unwrap(), ChannelId::new(100));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_join_sees_first_connection() {
        let transport = Arc::new(SlowTransport::default());
        let session = session_with(transport.clone());

        let (a, b) = tokio::join!(
            session.join_voice_channel(request(100, false)),
            session.join_voice_channel(request(200, false)),
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(JoinError::AlreadyJoinedElsewhere)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn move_requires_permission() {
        let transport = Arc::new(SlowTransport::default());
        let session = session_with(transport.clone());
        session.join_voice_channel(request(100, false)).await.unwrap();

        let moved = session.join_voice_channel(request(200, true)).await.unwrap();
        assert_eq!(moved, ChannelId::new(200));
        assert_eq!(session.voice_channel().await, Some(ChannelId::new(200)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn join_rejections() {
        let transport = Arc::new(SlowTransport::default());
        let session = session_with(transport.clone());

        let none = session.join_voice_channel(JoinRequest::default()).await;
        assert!(matches!(none, Err(JoinError::NoVoiceChannel)));

        let mut no_perm = request(100, false);
        no_perm.bot_can_connect = false;
        let denied = session.join_voice_channel(no_perm).await;
        assert!(matches!(denied, Err(JoinError::MissingConnectPermission)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failure_leaves_no_connection() {
        let transport = Arc::new(SlowTransport {
            fail: true,
            ..Default::default()
        });
        let session = session_with(transport);

        let err = session.join_voice_channel(request(100, false)).await;
        assert!(matches!(err, Err(JoinError::Transport(_))));
        assert!(session.player().connection().await.is_none());
        assert_eq!(session.connecting_channel(), None);
    }

    #[tokio::test]
    async fn bound_channel_moves_only_from_bot_voice_channel() {
        let session = session_with(Arc::new(SlowTransport::default()));
        assert!(session.update_bound_channel(ChannelId::new(1), None).await);

        session.join_voice_channel(request(100, false)).await.unwrap();
        assert!(!session.update_bound_channel(ChannelId::new(2), None).await);
        assert_eq!(session.bound_channel(), Some(ChannelId::new(1)));
        assert!(
            session
                .update_bound_channel(ChannelId::new(3), Some(ChannelId::new(100)))
                .await
        );
        assert_eq!(session.bound_channel(), Some(ChannelId::new(3)));
    }

    #[tokio::test]
    async fn status_reports_channel_only_while_playing() {
        let session = session_with(Arc::new(SlowTransport::default()));
        session.join_voice_channel(request(100, false)).await.unwrap();
        assert_eq!(session.export_status().await.voice_channel_id, NO_CHANNEL);

        session
            .play_from_url(&url(1), user("a"), false, &())
            .await
            .unwrap();
        assert_eq!(session.export_status().await.voice_channel_id, "100");

        session.player().pause().await.unwrap();
        assert_eq!(session.export_status().await.voice_channel_id, NO_CHANNEL);
    }

    #[tokio::test]
    async fn status_import_reconnects_and_plays() {
        let transport = Arc::new(SlowTransport::default());
        let session = session_with(transport.clone());
        session
            .queue()
            .add_queue_only(meta(&url(1), "one"), None, user("a"), false)
            .await
            .unwrap();

        let resumed = session
            .import_status(StatusExport {
                voice_channel_id: "100".into(),
                bound_channel_id: "55".into(),
                loop_enabled: true,
                queue_loop_enabled: false,
                add_related_songs: true,
                equally_playback: false,
                volume: 80,
            })
            .await
            .expect("a voice channel was recorded");
        resumed.await.unwrap();

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(session.player().state().await, PlayerState::Playing);
        let status = session.export_status().await;
        assert_eq!(status.voice_channel_id, "100");
        assert_eq!(status.bound_channel_id, "55");
        assert!(status.loop_enabled && status.add_related_songs);
        assert_eq!(status.volume, 80);
    }

    #[tokio::test]
    async fn status_import_returns_before_reconnecting() {
        let transport = Arc::new(SlowTransport {
            hang: true,
            ..Default::default()
        });
        let session = session_with(transport.clone());
        let status = StatusExport {
            voice_channel_id: "100".into(),
            bound_channel_id: "55".into(),
            loop_enabled: false,
            queue_loop_enabled: true,
            add_related_songs: false,
            equally_playback: false,
            volume: 100,
        };
        let resumed = tokio::time::timeout(Duration::from_secs(1), session.import_status(status))
            .await
            .expect("import waited for the voice connection");
        assert!(resumed.is_some());
        assert!(session.queue().queue_loop_enabled());
        assert_eq!(session.bound_channel(), Some(ChannelId::new(55)));

        let idle = session
            .import_status(StatusExport {
                voice_channel_id: NO_CHANNEL.into(),
                bound_channel_id: NO_CHANNEL.into(),
                loop_enabled: false,
                queue_loop_enabled: false,
                add_related_songs: false,
                equally_playback: false,
                volume: 100,
            })
            .await;
        assert!(idle.is_none());
    }

    #[tokio::test]
    async fn live_wait_leaves_the_session_responsive() {
        let session = Arc::new(GuildSession::new(
            GuildId::new(7),
            &upcoming_deps(Arc::new(SlowTransport::default())),
        ));
        session.join_voice_channel(request(100, false)).await.unwrap();

        let playing = tokio::spawn({
            let session = session.clone();
            async move { session.play_from_url(&url(1), user("a"), false, &()).await }
        });
        wait_for_state(session.player(), PlayerState::Connecting).await;

        let limit = Duration::from_secs(1);
        let status = tokio::time::timeout(limit, session.export_status())
            .await
            .expect("status export blocked by the live wait");
        assert_eq!(status.voice_channel_id, NO_CHANNEL);
        assert!(
            tokio::time::timeout(
                limit,
                session.update_bound_channel(ChannelId::new(3), Some(ChannelId::new(100)))
            )
            .await
            .expect("bound channel update blocked by the live wait")
        );

        tokio::time::timeout(limit, session.player().stop())
            .await
            .expect("stop blocked by the live wait");
        let outcome = tokio::time::timeout(limit, playing)
            .await
            .expect("live wait was not aborted by stop")
            .unwrap();
        assert!(matches!(outcome, Ok(PlayOutcome::Track(_))));
        assert_eq!(session.player().state().await, PlayerState::Idle);
        assert_eq!(session.queue().len(), 1);
    }

    #[tokio::test]
    async fn video_link_only_while_playing() {
        let session = session_with(Arc::new(SlowTransport::default()));
        assert!(session.now_playing_video().await.is_none());

        session.join_voice_channel(request(100, false)).await.unwrap();
        let file = "https://cdn.example.com/a/song.mp3";
        session
            .play_from_url(file, user("a"), false, &())
            .await
            .unwrap();
        let video = session.now_playing_video().await.unwrap().unwrap();
        assert_eq!(video.url(), file);
    }

    #[tokio::test]
    async fn playlist_is_added_in_bulk_and_unbinds() {
        let session = session_with(Arc::new(SlowTransport::default()));
        let out = session
            .play_from_url(
                "https://www.youtube.com/playlist?list=PLchorus",
                user("a"),
                false,
                &(),
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            PlayOutcome::Playlist(PlaylistOutcome {
                added: 25,
                failed: 0,
                cancelled: false,
            })
        );
        assert_eq!(session.queue().len(), 25);
        assert_eq!(session.cancellations().len(), 0);
    }

    struct CancelAfterFirstReport(Arc<GuildSession>);

    #[async_trait]
    impl Progress for CancelAfterFirstReport {
        async fn report(&self, _done: usize, _total: usize) {
            self.0.cancel_all();
        }
    }

    #[tokio::test]
    async fn playlist_cancellation_stops_cleanly() {
        let session = session_with(Arc::new(SlowTransport::default()));
        let progress = CancelAfterFirstReport(session.clone());
        let out = session
            .play_from_url(
                "https://www.youtube.com/playlist?list=PLchorus",
                user("a"),
                false,
                &progress,
            )
            .await
            .unwrap();
        let PlayOutcome::Playlist(outcome) = out else {
            panic!("expected a playlist outcome, got {out:?}");
        };
        assert!(outcome.cancelled);
        assert_eq!(outcome.added, 10);
        assert_eq!(session.queue().len(), 10);
        assert_eq!(session.cancellations().len(), 0);
    }

    #[tokio::test]
    async fn import_rejects_other_versions() {
        let session = session_with(Arc::new(SlowTransport::default()));
        let portable = PortableQueue {
            version: QUEUE_FORMAT_VERSION + 1,
            data: vec![PortableEntry {
                meta: meta(&url(1), "one"),
                source_type: SourceType::YouTube,
                added_by: user("a"),
            }],
        };
        let err = session.import_portable(portable, &user("b"), &()).await;
        assert!(matches!(err, Err(QueueError::VersionMismatch { .. })));
        assert!(session.queue().is_empty());
    }

    #[tokio::test]
    async fn import_honours_capacity() {
        let mut d = deps(Arc::new(SlowTransport::default()), 0);
        d.max_queue = 3;
        let session = GuildSession::new(GuildId::new(7), &d);
        let portable = PortableQueue {
            version: QUEUE_FORMAT_VERSION,
            data: (0..5)
                .map(|n| PortableEntry {
                    meta: meta(&url(n), "x"),
                    source_type: SourceType::YouTube,
                    added_by: user("a"),
                })
                .collect(),
        };
        let out = session
            .import_portable(portable, &user("b"), &())
            .await
            .unwrap();
        assert_eq!(out.added, 3);
        assert_eq!(session.queue().len(), 3);
    }

    #[tokio::test]
    async fn queue_changes_mark_dirty() {
        let session = session_with(Arc::new(SlowTransport::default()));
        let marks = session.marks.clone();
        session
            .queue()
            .add_queue_only(meta(&url(1), "one"), None, user("a"), false)
            .await
            .unwrap();
        assert!(marks.is_marked(RecordKind::Queue, GuildId::new(7)));
        assert!(!marks.is_marked(RecordKind::Status, GuildId::new(7)));
        session.queue().set_loop_enabled(true);
        assert!(marks.is_marked(RecordKind::Status, GuildId::new(7)));
    }

    #[test]
    fn registry_reuses_sessions() {
        let registry = GuildRegistry::new(deps(Arc::new(SlowTransport::default()), 0));
        let a = registry.get_or_create(GuildId::new(1));
        let b = registry.get_or_create(GuildId::new(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.guild_ids(), vec![GuildId::new(1)]);
        assert!(registry.remove(GuildId::new(1)).is_some());
        assert!(registry.get(GuildId::new(1)).is_none());
    }
}

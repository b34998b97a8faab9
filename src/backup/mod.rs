//! Mirrors per-guild status and queue into a remote key-value store and
//! restores them on start.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serenity::all::GuildId;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::StoreError,
    queue::PortableQueue,
    session::{GuildRegistry, StatusExport},
};

pub mod store;

pub use store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Status,
    Queue,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Status, RecordKind::Queue];

    pub fn key(self, guild_id: GuildId) -> String {
        match self {
            RecordKind::Status => format!("status:{guild_id}"),
            RecordKind::Queue => format!("queue:{guild_id}"),
        }
    }
}

/// Guilds whose in-memory state differs from the last successful write.
///
/// Each mark carries a sequence number so a write only clears the mark if no
/// newer change arrived while it was in flight.
#[derive(Debug, Default)]
pub struct DirtyMarks {
    seq: AtomicU64,
    status: Mutex<HashMap<GuildId, u64>>,
    queue: Mutex<HashMap<GuildId, u64>>,
}

impl DirtyMarks {
    fn map(&self, kind: RecordKind) -> MutexGuard<'_, HashMap<GuildId, u64>> {
        let map = match kind {
            RecordKind::Status => &self.status,
            RecordKind::Queue => &self.queue,
        };
        map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark(&self, kind: RecordKind, guild_id: GuildId) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.map(kind).insert(guild_id, seq);
    }

    pub fn is_marked(&self, kind: RecordKind, guild_id: GuildId) -> bool {
        self.map(kind).contains_key(&guild_id)
    }

    pub fn snapshot(&self, kind: RecordKind) -> Vec<(GuildId, u64)> {
        self.map(kind).iter().map(|(g, s)| (*g, *s)).collect()
    }

    /// Clears the mark unless it was re-marked after `seq` was taken.
    pub fn clear(&self, kind: RecordKind, guild_id: GuildId, seq: u64) -> bool {
        let mut map = self.map(kind);
        if map.get(&guild_id) == Some(&seq) {
            map.remove(&guild_id);
            true
        } else {
            false
        }
    }

    pub fn forget(&self, guild_id: GuildId) {
        for kind in RecordKind::ALL {
            self.map(kind).remove(&guild_id);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub written: usize,
    pub failed: usize,
    /// Marks dropped because the guild's session no longer exists.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Failed,
    Skipped,
}

pub struct BackupSynchronizer {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<GuildRegistry>,
}

impl BackupSynchronizer {
    pub fn new(store: Arc<dyn KeyValueStore>, registry: Arc<GuildRegistry>) -> Self {
        Self { store, registry }
    }

    async fn payload(&self, kind: RecordKind, guild_id: GuildId) -> Option<Result<String, StoreError>> {
        let session = self.registry.get(guild_id)?;
        let json = match kind {
            RecordKind::Status => serde_json::to_string(&session.export_status().await),
            RecordKind::Queue => serde_json::to_string(&session.export_queue()),
        };
        Some(json.map_err(StoreError::from))
    }

    async fn write(&self, kind: RecordKind, guild_id: GuildId, seq: u64) -> WriteOutcome {
        let marks = self.registry.marks();
        let payload = match self.payload(kind, guild_id).await {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                error!("guild {guild_id}: failed to serialize {kind:?} backup: {e}");
                return WriteOutcome::Failed;
            }
            None => {
                // session is gone; nothing left to mirror
                marks.clear(kind, guild_id, seq);
                return WriteOutcome::Skipped;
            }
        };
        match self.store.set(&kind.key(guild_id), &payload).await {
            Ok(()) => {
                marks.clear(kind, guild_id, seq);
                debug!("guild {guild_id}: {kind:?} backed up");
                WriteOutcome::Written
            }
            Err(e) => {
                error!("guild {guild_id}: {kind:?} backup failed, will retry next tick: {e}");
                WriteOutcome::Failed
            }
        }
    }

    /// Writes every dirty record. Guilds are written independently; a failed
    /// write keeps only that guild's mark.
    pub async fn tick(&self) -> TickReport {
        let marks = self.registry.marks();
        let mut pending = Vec::new();
        for kind in RecordKind::ALL {
            for (guild_id, seq) in marks.snapshot(kind) {
                pending.push(self.write(kind, guild_id, seq));
            }
        }
        let results = futures_util::future::join_all(pending).await;
        let count = |want: WriteOutcome| results.iter().filter(|o| **o == want).count();
        TickReport {
            written: count(WriteOutcome::Written),
            failed: count(WriteOutcome::Failed),
            skipped: count(WriteOutcome::Skipped),
        }
    }

    /// Seeds sessions from the store. Missing records are skipped silently,
    /// malformed or incompatible ones with a warning.
    pub async fn restore(&self, guild_ids: &[GuildId]) -> usize {
        let mut restored = 0;
        for &guild_id in guild_ids {
            let status_key = RecordKind::Status.key(guild_id);
            let queue_key = RecordKind::Queue.key(guild_id);
            let (status, queue) = tokio::join!(
                self.store.get(&status_key),
                self.store.get(&queue_key),
            );
            let status = status.unwrap_or_else(|e| {
                warn!("guild {guild_id}: failed to read status backup: {e}");
                None
            });
            let queue = queue.unwrap_or_else(|e| {
                warn!("guild {guild_id}: failed to read queue backup: {e}");
                None
            });
            if status.is_none() && queue.is_none() {
                continue;
            }

            let session = self.registry.get_or_create(guild_id);
            if let Some(raw) = queue {
                match serde_json::from_str::<PortableQueue>(&raw) {
                    Ok(portable) => match session.import_queue(portable).await {
                        Ok(n) => info!("guild {guild_id}: restored {n} queued tracks"),
                        Err(e) => warn!("guild {guild_id}: skipping queue backup: {e}"),
                    },
                    Err(e) => warn!("guild {guild_id}: malformed queue backup: {e}"),
                }
            }
            if let Some(raw) = status {
                match serde_json::from_str::<StatusExport>(&raw) {
                    Ok(status) => {
                        // reconnecting runs in the background so one slow guild can't hold up the rest
                        session.import_status(status).await;
                    }
                    Err(e) => warn!("guild {guild_id}: malformed status backup: {e}"),
                }
            }
            // restored state matches the store
            self.registry.marks().forget(guild_id);
            restored += 1;
        }
        restored
    }

    /// Best-effort removal of both records; each deletion may fail alone.
    pub async fn delete_guild(&self, guild_id: GuildId) {
        self.registry.marks().forget(guild_id);
        let status_key = RecordKind::Status.key(guild_id);
        let queue_key = RecordKind::Queue.key(guild_id);
        let (status, queue) = tokio::join!(
            self.store.delete(&status_key),
            self.store.delete(&queue_key),
        );
        for (key, result) in [(status_key, status), (queue_key, queue)] {
            if let Err(e) = result {
                warn!("guild {guild_id}: failed to delete {key}: {e}");
            }
        }
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = self.tick().await;
                if report.written + report.failed + report.skipped > 0 {
                    info!(
                        "Backup tick: {} written, {} failed, {} skipped",
                        report.written, report.failed, report.skipped
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        backup::store::tests::MemoryStore,
        player::{PlayerState, tests::wait_for_state},
        queue::tests::{url, user},
        session::{
            NO_CHANNEL,
            tests::{SlowTransport, deps, request, upcoming_deps},
        },
        source::strategies::testing::meta,
    };

    fn setup() -> (Arc<MemoryStore>, Arc<GuildRegistry>, BackupSynchronizer) {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(GuildRegistry::new(deps(
            Arc::new(SlowTransport::default()),
            0,
        )));
        let sync = BackupSynchronizer::new(store.clone(), registry.clone());
        (store, registry, sync)
    }

    async fn touch(registry: &GuildRegistry, guild: u64) {
        registry
            .get_or_create(GuildId::new(guild))
            .queue()
            .add_queue_only(meta(&url(guild as usize), "t"), None, user("a"), false)
            .await
            .unwrap();
    }

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(RecordKind::Status.key(GuildId::new(42)), "status:42");
        assert_eq!(RecordKind::Queue.key(GuildId::new(42)), "queue:42");
    }

    #[test]
    fn newer_mark_survives_stale_clear() {
        let marks = DirtyMarks::default();
        let g = GuildId::new(1);
        marks.mark(RecordKind::Queue, g);
        let (_, seq) = marks.snapshot(RecordKind::Queue)[0];
        marks.mark(RecordKind::Queue, g);
        assert!(!marks.clear(RecordKind::Queue, g, seq));
        assert!(marks.is_marked(RecordKind::Queue, g));
    }

    #[tokio::test]
    async fn failed_guild_keeps_its_mark() {
        let (store, registry, sync) = setup();
        let (a, b) = (GuildId::new(1), GuildId::new(2));
        touch(&registry, 1).await;
        touch(&registry, 2).await;
        registry.get_or_create(a).queue().set_loop_enabled(true);
        registry.get_or_create(b).queue().set_loop_enabled(true);
        store.fail_on(&RecordKind::Status.key(a));

        let report = sync.tick().await;
        assert_eq!(report.failed, 1);
        let marks = registry.marks();
        assert!(marks.is_marked(RecordKind::Status, a));
        assert!(!marks.is_marked(RecordKind::Status, b));
        assert!(!marks.is_marked(RecordKind::Queue, a));
        assert!(store.value("status:2").is_some());

        store.heal();
        let report = sync.tick().await;
        assert_eq!(
            report,
            TickReport {
                written: 1,
                ..Default::default()
            }
        );
        assert!(!marks.is_marked(RecordKind::Status, a));
    }

    #[tokio::test]
    async fn vanished_sessions_are_skipped() {
        let (_store, registry, sync) = setup();
        touch(&registry, 1).await;
        registry
            .marks()
            .mark(RecordKind::Queue, GuildId::new(9));
        let report = sync.tick().await;
        assert_eq!(
            report,
            TickReport {
                written: 1,
                failed: 0,
                skipped: 1,
            }
        );
        assert!(!registry.marks().is_marked(RecordKind::Queue, GuildId::new(9)));
    }

    #[tokio::test]
    async fn live_wait_does_not_stall_the_tick() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(GuildRegistry::new(upcoming_deps(Arc::new(
            SlowTransport::default(),
        ))));
        let sync = BackupSynchronizer::new(store.clone(), registry.clone());

        let waiting = registry.get_or_create(GuildId::new(7));
        waiting.join_voice_channel(request(100, false)).await.unwrap();
        let playing = tokio::spawn({
            let waiting = waiting.clone();
            async move { waiting.play_from_url(&url(1), user("a"), false, &()).await }
        });
        wait_for_state(waiting.player(), PlayerState::Connecting).await;
        registry
            .get_or_create(GuildId::new(8))
            .queue()
            .set_loop_enabled(true);

        let report = tokio::time::timeout(Duration::from_secs(1), sync.tick())
            .await
            .expect("tick stalled behind a live wait");
        assert_eq!(report.failed, 0);
        assert!(store.value("status:8").is_some());
        assert!(!registry.marks().is_marked(RecordKind::Status, GuildId::new(8)));

        waiting.player().stop().await;
        playing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restore_does_not_wait_for_reconnects() {
        let store = Arc::new(MemoryStore::default());
        let status = StatusExport {
            voice_channel_id: "100".into(),
            bound_channel_id: "55".into(),
            loop_enabled: false,
            queue_loop_enabled: false,
            add_related_songs: false,
            equally_playback: false,
            volume: 100,
        };
        store
            .set("status:1", &serde_json::to_string(&status).unwrap())
            .await
            .unwrap();
        let idle = StatusExport {
            voice_channel_id: NO_CHANNEL.into(),
            loop_enabled: true,
            ..status
        };
        store
            .set("status:2", &serde_json::to_string(&idle).unwrap())
            .await
            .unwrap();

        // guild 1's reconnect never completes
        let registry = Arc::new(GuildRegistry::new(deps(
            Arc::new(SlowTransport {
                hang: true,
                ..Default::default()
            }),
            0,
        )));
        let sync = BackupSynchronizer::new(store.clone(), registry.clone());
        let restored = tokio::time::timeout(
            Duration::from_secs(1),
            sync.restore(&[GuildId::new(1), GuildId::new(2)]),
        )
        .await
        .expect("restore waited on a reconnect");
        assert_eq!(restored, 2);
        assert!(registry.get(GuildId::new(2)).unwrap().queue().loop_enabled());
    }

    #[tokio::test]
    async fn clean_guilds_are_not_rewritten() {
        let (store, registry, sync) = setup();
        touch(&registry, 1).await;
        sync.tick().await;
        let calls = store.calls.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(sync.tick().await, TickReport::default());
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn restore_round_trips_queue_and_flags() {
        let (store, registry, sync) = setup();
        touch(&registry, 1).await;
        touch(&registry, 1).await;
        registry.get_or_create(GuildId::new(1)).queue().set_queue_loop_enabled(true);
        sync.tick().await;

        let fresh = Arc::new(GuildRegistry::new(deps(Arc::new(SlowTransport::default()), 0)));
        let restore = BackupSynchronizer::new(store.clone(), fresh.clone());
        let n = restore
            .restore(&[GuildId::new(1), GuildId::new(3)])
            .await;
        assert_eq!(n, 1);
        assert!(fresh.get(GuildId::new(3)).is_none());

        let session = fresh.get(GuildId::new(1)).unwrap();
        assert_eq!(session.queue().len(), 2);
        assert!(session.queue().queue_loop_enabled());
        assert!(!fresh.marks().is_marked(RecordKind::Queue, GuildId::new(1)));
    }

    #[tokio::test]
    async fn restore_skips_bad_queue_records() {
        let (store, _registry, sync) = setup();
        store
            .set("queue:5", "{\"version\":1,\"data\":[]}")
            .await
            .unwrap();
        store.set("status:6", "not json").await.unwrap();
        assert_eq!(sync.restore(&[GuildId::new(5), GuildId::new(6)]).await, 2);
    }

    #[tokio::test]
    async fn delete_tolerates_partial_failure() {
        let (store, registry, sync) = setup();
        touch(&registry, 1).await;
        registry.get_or_create(GuildId::new(1)).queue().set_loop_enabled(true);
        sync.tick().await;
        store.fail_on("status:1");

        sync.delete_guild(GuildId::new(1)).await;
        assert!(store.value("queue:1").is_none());
        assert!(store.value("status:1").is_some());
    }
}

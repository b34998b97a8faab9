//! Per-guild play queue: ordered entries, loop flags, and the portable export format.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use serenity::async_trait;
use tracing::{debug, warn};

use crate::{
    cancellation::CancellationToken,
    error::QueueError,
    metrics::METRICS,
    source::{AudioSource, SourceResolver, SourceType, TrackMetadata},
};

/// Version tag of the portable queue format. Imports must match exactly.
pub const QUEUE_FORMAT_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedBy {
    pub display_name: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub source: AudioSource,
    pub added_by: AddedBy,
}

impl QueueEntry {
    pub fn metadata(&self) -> &TrackMetadata {
        self.source.metadata()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortableEntry {
    #[serde(flatten)]
    pub meta: TrackMetadata,
    #[serde(default)]
    pub source_type: SourceType,
    pub added_by: AddedBy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableQueue {
    pub version: u32,
    pub data: Vec<PortableEntry>,
}

pub struct AddQueueOptions {
    pub url: String,
    pub added_by: AddedBy,
    pub first: bool,
    pub source_type: Option<SourceType>,
    pub prefetched: Option<TrackMetadata>,
    pub force_cache: bool,
    pub cancellation: Option<CancellationToken>,
}

impl AddQueueOptions {
    pub fn new(url: impl Into<String>, added_by: AddedBy) -> Self {
        Self {
            url: url.into(),
            added_by,
            first: false,
            source_type: None,
            prefetched: None,
            force_cache: false,
            cancellation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Added { index: usize, meta: TrackMetadata },
    /// Resolution finished after the caller cancelled; nothing was queued.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaylistOutcome {
    pub added: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Receives bulk-processing progress, e.g. to edit a status message.
#[async_trait]
pub trait Progress: Send + Sync {
    async fn report(&self, done: usize, total: usize);
}

#[async_trait]
impl Progress for () {
    async fn report(&self, _done: usize, _total: usize) {}
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    loop_enabled: bool,
    queue_loop_enabled: bool,
    equal_playback: bool,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry, first: bool) -> usize {
        if first && !self.entries.is_empty() {
            // head is the playing track
            self.entries.insert(1, entry);
            1
        } else if first {
            self.entries.push_front(entry);
            0
        } else if self.equal_playback {
            let user = entry.added_by.user_id.clone();
            self.entries.push_back(entry);
            self.rebalance();
            // rebalancing keeps each submitter's entries in order, so ours is their last
            self.entries
                .iter()
                .rposition(|e| e.added_by.user_id == user)
                .unwrap_or(0)
        } else {
            self.entries.push_back(entry);
            self.entries.len() - 1
        }
    }

    /// Interleaves entries after the head round-robin by submitter.
    fn rebalance(&mut self) {
        if self.entries.len() <= 2 {
            return;
        }
        let Some(head) = self.entries.pop_front() else {
            return;
        };
        let mut groups: Vec<(String, VecDeque<QueueEntry>)> = Vec::new();
        for entry in self.entries.drain(..) {
            match groups.iter_mut().find(|(id, _)| *id == entry.added_by.user_id) {
                Some((_, g)) => g.push_back(entry),
                None => groups.push((entry.added_by.user_id.clone(), VecDeque::from([entry]))),
            }
        }
        self.entries.push_back(head);
        while groups.iter().any(|(_, g)| !g.is_empty()) {
            for (_, g) in groups.iter_mut() {
                if let Some(e) = g.pop_front() {
                    self.entries.push_back(e);
                }
            }
        }
    }
}

/// What a mutation touched: the entries themselves or only the loop/ordering flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueChange {
    Entries,
    Flags,
}

type ChangeHook = Arc<dyn Fn(QueueChange) + Send + Sync>;

/// Queue store for one guild. Cheap to share; the lock is never held across `.await`.
pub struct Queue {
    state: Mutex<QueueState>,
    resolver: SourceResolver,
    max_len: usize,
    on_change: Option<ChangeHook>,
}

impl Queue {
    pub fn new(resolver: SourceResolver, max_len: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            resolver,
            max_len,
            on_change: None,
        }
    }

    /// Called after every mutation; used for backup dirty-tracking.
    pub fn with_change_hook(mut self, hook: impl Fn(QueueChange) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(hook));
        self
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // a panicked holder leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn changed(&self) {
        self.notify(QueueChange::Entries);
    }

    fn notify(&self, change: QueueChange) {
        if let Some(hook) = &self.on_change {
            hook(change);
        }
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.max_len.saturating_sub(self.len())
    }

    pub fn head(&self) -> Option<QueueEntry> {
        self.state().entries.front().cloned()
    }

    pub fn metadata(&self) -> Vec<TrackMetadata> {
        self.state()
            .entries
            .iter()
            .map(|e| e.metadata().clone())
            .collect()
    }

    pub fn loop_enabled(&self) -> bool {
        self.state().loop_enabled
    }

    pub fn set_loop_enabled(&self, on: bool) {
        self.state().loop_enabled = on;
        self.notify(QueueChange::Flags);
    }

    pub fn queue_loop_enabled(&self) -> bool {
        self.state().queue_loop_enabled
    }

    pub fn set_queue_loop_enabled(&self, on: bool) {
        self.state().queue_loop_enabled = on;
        self.notify(QueueChange::Flags);
    }

    pub fn equal_playback(&self) -> bool {
        self.state().equal_playback
    }

    pub fn set_equal_playback(&self, on: bool) {
        let mut state = self.state();
        state.equal_playback = on;
        if on {
            state.rebalance();
        }
        drop(state);
        self.notify(QueueChange::Flags);
        if on {
            self.changed();
        }
    }

    /// Resolves `opts.url` and queues it. Resolution failures are returned and
    /// nothing is queued.
    pub async fn add_queue(&self, opts: AddQueueOptions) -> Result<AddOutcome, QueueError> {
        if self.len() >= self.max_len {
            return Err(QueueError::Full(self.max_len));
        }
        let source = self
            .resolver
            .resolve(&opts.url, opts.source_type, opts.prefetched, opts.force_cache)
            .await?;
        if opts
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            debug!("discarding {} after cancellation", opts.url);
            return Ok(AddOutcome::Cancelled);
        }
        Ok(self.push(source, opts.added_by, opts.first))
    }

    /// Queues a track whose metadata is already known, without any network call.
    pub async fn add_queue_only(
        &self,
        meta: TrackMetadata,
        source_type: Option<SourceType>,
        added_by: AddedBy,
        first: bool,
    ) -> Result<AddOutcome, QueueError> {
        if self.len() >= self.max_len {
            return Err(QueueError::Full(self.max_len));
        }
        let url = meta.url.clone();
        let source = self
            .resolver
            .resolve(&url, source_type, Some(meta), false)
            .await?;
        Ok(self.push(source, added_by, first))
    }

    fn push(&self, source: AudioSource, added_by: AddedBy, first: bool) -> AddOutcome {
        let meta = source.metadata().clone();
        let index = self
            .state()
            .insert(QueueEntry { source, added_by }, first);
        METRICS.inc_queue(1);
        self.changed();
        AddOutcome::Added { index, meta }
    }

    /// Maps each raw item through `normalize` and queues it without resolving,
    /// classifying each url when `source_type` is `None`, stopping early (without error) once `token` is cancelled. Items whose
    /// normalization fails are skipped and counted.
    pub async fn process_playlist<T, F, Fut>(
        &self,
        items: Vec<T>,
        token: &CancellationToken,
        source_type: Option<SourceType>,
        added_by: &AddedBy,
        progress: &dyn Progress,
        mut normalize: F,
    ) -> PlaylistOutcome
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<TrackMetadata>>,
    {
        let total = items.len();
        let mut outcome = PlaylistOutcome::default();
        for (i, item) in items.into_iter().enumerate() {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let meta = match normalize(item).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("skipping playlist item {i}: {e:#}");
                    outcome.failed += 1;
                    continue;
                }
            };
            match self
                .add_queue_only(meta, source_type, added_by.clone(), false)
                .await
            {
                Ok(AddOutcome::Added { .. }) => outcome.added += 1,
                Ok(AddOutcome::Cancelled) => {}
                Err(QueueError::Full(_)) => break,
                Err(e) => {
                    warn!("skipping playlist item {i}: {e}");
                    outcome.failed += 1;
                }
            }
            if total <= 10 || i % 10 == 9 {
                progress.report(i + 1, total).await;
            }
        }
        outcome.cancelled |= token.is_cancelled();
        outcome
    }

    /// Moves past the finished head according to the loop flags; returns the
    /// new head, if any.
    pub fn advance(&self) -> Option<QueueEntry> {
        let mut state = self.state();
        if state.loop_enabled {
            return state.entries.front().cloned();
        }
        let finished = state.entries.pop_front()?;
        if state.queue_loop_enabled {
            state.entries.push_back(finished);
        } else {
            METRICS.dec_queue(1);
        }
        let next = state.entries.front().cloned();
        drop(state);
        self.changed();
        next
    }

    /// Skips the head: single-track loop is ignored, queue loop still recycles it.
    pub fn skip(&self) -> Option<QueueEntry> {
        let mut state = self.state();
        let skipped = state.entries.pop_front()?;
        if state.queue_loop_enabled {
            state.entries.push_back(skipped);
        } else {
            METRICS.dec_queue(1);
        }
        let next = state.entries.front().cloned();
        drop(state);
        self.changed();
        next
    }

    /// Drops the head regardless of loop flags (failed track).
    pub fn discard_head(&self) -> Option<QueueEntry> {
        let removed = self.state().entries.pop_front();
        if removed.is_some() {
            METRICS.dec_queue(1);
            self.changed();
        }
        removed
    }

    /// Stores a refreshed source for the head if it is still the same track.
    pub fn update_head(&self, source: AudioSource) {
        let updated = {
            let mut state = self.state();
            match state.entries.front_mut() {
                Some(head) if head.metadata().url == source.metadata().url => {
                    head.source = source;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.changed();
        }
    }

    pub fn remove(&self, index: usize) -> Option<QueueEntry> {
        let removed = self.state().entries.remove(index);
        if removed.is_some() {
            METRICS.dec_queue(1);
            self.changed();
        }
        removed
    }

    /// Clears everything; with `keep_head` the playing track survives.
    pub fn clear(&self, keep_head: bool) {
        let mut state = self.state();
        let head = if keep_head {
            state.entries.pop_front()
        } else {
            None
        };
        let dropped = state.entries.len();
        state.entries.clear();
        if let Some(h) = head {
            state.entries.push_back(h);
        }
        drop(state);
        METRICS.dec_queue(dropped);
        self.changed();
    }

    pub fn export(&self) -> PortableQueue {
        PortableQueue {
            version: QUEUE_FORMAT_VERSION,
            data: self
                .state()
                .entries
                .iter()
                .map(|e| PortableEntry {
                    meta: e.metadata().clone(),
                    source_type: e.source.source_type(),
                    added_by: e.added_by.clone(),
                })
                .collect(),
        }
    }

    /// Appends every entry of `portable`; rejects the whole file on a version
    /// mismatch.
    pub async fn import(&self, portable: PortableQueue) -> Result<usize, QueueError> {
        if portable.version != QUEUE_FORMAT_VERSION {
            return Err(QueueError::VersionMismatch {
                current: QUEUE_FORMAT_VERSION,
                found: portable.version,
            });
        }
        let mut resolved = Vec::with_capacity(portable.data.len());
        for item in portable.data {
            let url = item.meta.url.clone();
            let source = self
                .resolver
                .resolve(&url, Some(item.source_type), Some(item.meta), false)
                .await?;
            resolved.push(QueueEntry {
                source,
                added_by: item.added_by,
            });
        }
        let count = resolved.len();
        {
            let mut state = self.state();
            for entry in resolved {
                state.insert(entry, false);
            }
        }
        METRICS.inc_queue(count);
        self.changed();
        Ok(count)
    }
}

use thiserror::Error;

/// Failures while turning a url into metadata or a playable stream.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no strategy could resolve {url} ({attempts} tried)")]
    AllStrategiesFailed { url: String, attempts: usize },
    #[error("no playable url found")]
    NoPlayableUrl,
    #[error("no available data found")]
    NoData,
    #[error("this is not an upcoming live stream")]
    NotUpcoming,
    #[error("unsupported url: {0}")]
    Unsupported(String),
    #[error("strategy {name} failed: {source}")]
    Strategy {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcomes of `GuildSession::join_voice_channel` that did not end connected.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("you must be in a voice channel")]
    NoVoiceChannel,
    #[error("already joined another voice channel")]
    AlreadyJoinedElsewhere,
    #[error("missing permission to connect to the voice channel")]
    MissingConnectPermission,
    #[error("failed to connect: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("incompatible queue file (current: v{current}; file: v{found})")]
    VersionMismatch { current: u32, found: u32 },
    #[error("queue is full ({0} entries)")]
    Full(usize),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backup store call timed out")]
    Timeout,
    #[error("backup store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backup store returned status {0}")]
    Status(u16),
    #[error("backup database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("backup database connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("malformed backup record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backup worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("backup worker stopped")]
    Closed,
}

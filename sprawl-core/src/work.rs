use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Stable identifier for a unit of work flowing through a stage.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkItemId(pub Uuid);

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything a stage worker can pull from its inbound queue.
///
/// Identity is fixed at construction; stages may narrow the payload of an item they own but must
/// never change its id.
pub trait WorkItem: Send + Sync + 'static {
    fn id(&self) -> WorkItemId;

    fn trace_id(&self) -> Option<Uuid> {
        None
    }
}

/// Outcome of processing one work item.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload")]
pub enum QueuedResult<S, F> {
    Success(S),
    Failed(F),
    /// The item cannot proceed yet. The worker parks it in the key/value store under its id.
    Waiting,
}

impl<S, F> QueuedResult<S, F> {
    pub fn is_success(&self) -> bool {
        matches!(self, QueuedResult::Success(_))
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, QueuedResult::Waiting)
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueuedResult::Success(_) => "success",
            QueuedResult::Failed(_) => "failed",
            QueuedResult::Waiting => "waiting",
        }
    }
}

/// Pipeline stages. Each stage runs its own worker over its own inbound queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Seed,
    Schedule,
    Ingest,
    Parse,
    Robots,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Seed => write!(f, "seed"),
            StageKind::Schedule => write!(f, "schedule"),
            StageKind::Ingest => write!(f, "ingest"),
            StageKind::Parse => write!(f, "parse"),
            StageKind::Robots => write!(f, "robots"),
        }
    }
}

/// Identifies the node that produced a completion notification.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub stage: StageKind,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, stage: StageKind) -> Self {
        Self {
            node_id: node_id.into(),
            stage,
        }
    }

    /// Node info for a stage hosted by the current process.
    pub fn local(stage: StageKind) -> Self {
        Self::new(format!("{}-{}", stage, std::process::id()), stage)
    }
}

/// Lifecycle of a stage worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Running,
    Paused,
    Completed,
    Cancelled,
    Faulted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Faulted
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::NotStarted => "not_started",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a worker, published after every processed item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub stage: StageKind,
    pub queue_depth: usize,
    pub tasks_in_use: usize,
    pub max_concurrency: usize,
    pub run_state: RunState,
}

impl ComponentStatus {
    pub fn idle(stage: StageKind, max_concurrency: usize) -> Self {
        Self {
            stage,
            queue_depth: 0,
            tasks_in_use: 0,
            max_concurrency,
            run_state: RunState::NotStarted,
        }
    }
}

/// Request handled by the schedule stage: a host plus the paths discovered on it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub id: WorkItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    /// Base URI; paths are resolved against it.
    pub uri: Url,
    pub paths: Vec<String>,
    pub depth: u32,
}

impl CrawlRequest {
    pub fn new(uri: Url, paths: Vec<String>, depth: u32) -> Self {
        Self {
            id: WorkItemId::new(),
            trace_id: None,
            uri,
            paths,
            depth,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.uri.host_str()
    }
}

impl WorkItem for CrawlRequest {
    fn id(&self) -> WorkItemId {
        self.id
    }

    fn trace_id(&self) -> Option<Uuid> {
        self.trace_id
    }
}

/// Request handled by the ingest stage: fetch exactly one URI.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IngestRequest {
    pub id: WorkItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    pub uri: Url,
    pub depth: u32,
    /// Schedule request that discovered this URI.
    pub origin_id: WorkItemId,
}

impl WorkItem for IngestRequest {
    fn id(&self) -> WorkItemId {
        self.id
    }

    fn trace_id(&self) -> Option<Uuid> {
        self.trace_id
    }
}

/// Side request asking the robots stage to fetch and cache rules for a host.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RobotsRequest {
    pub id: WorkItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    /// Location of the robots.txt document.
    pub uri: Url,
    /// Parked schedule request to resume once the rules are cached.
    pub waiting_request: WorkItemId,
}

impl WorkItem for RobotsRequest {
    fn id(&self) -> WorkItemId {
        self.id
    }

    fn trace_id(&self) -> Option<Uuid> {
        self.trace_id
    }
}

/// Success payload of the schedule stage.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    /// Paths accepted for ingest by this request; empty when everything was filtered or known.
    pub added_paths: Vec<String>,
}

/// Success payload of the ingest stage.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub uri: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Machine-readable failure reasons shared by all stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    MaxCrawlDepthExceeded,
    InvalidUri,
    FetchFailed,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCode::MaxCrawlDepthExceeded => "max_crawl_depth_exceeded",
            ErrorCode::InvalidUri => "invalid_uri",
            ErrorCode::FetchFailed => "fetch_failed",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Failure payload shared by all stages.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageFailure {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

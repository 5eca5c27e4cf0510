//! Shared types for kubetail
//!
//! This crate contains data structures exchanged between the node agent,
//! the dispatcher and client-side consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Kubernetes context information
#[derive(Clone, Debug)]
pub struct ContextInfo {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    pub is_current: bool,
}

impl ContextInfo {
    pub fn new(
        name: String,
        cluster: String,
        user: String,
        namespace: Option<String>,
        is_current: bool,
    ) -> Self {
        Self {
            name,
            cluster,
            user,
            namespace,
            is_current,
        }
    }
}

/// Agent pod information, used to route requests to the agent on a node
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub status: PodStatus,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            status: PodStatus::Unknown,
            node_name: None,
            pod_ip: None,
        }
    }

    /// Whether the pod can accept agent connections
    pub fn is_ready(&self) -> bool {
        self.status == PodStatus::Running && self.pod_ip.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodStatus {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Log File Types
// ============================================================================

/// Identity of a container log file, derived from its file name
/// `<pod>_<namespace>_<container>-<containerID>.log`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileSpec {
    pub node_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
}

impl LogFileSpec {
    /// File name the container runtime uses for this container's log symlink
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}-{}.log",
            self.pod_name,
            self.namespace,
            self.container_name,
            strip_runtime_prefix(&self.container_id)
        )
    }
}

/// Size and modification time of a log file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileInfo {
    pub size: i64,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// A container log file on a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileMetadata {
    /// Container ID, unique per log file
    pub id: String,
    pub spec: LogFileSpec,
    pub file_info: LogFileInfo,
}

impl LogFileMetadata {
    pub fn new(spec: LogFileSpec, file_info: LogFileInfo) -> Self {
        Self {
            id: spec.container_id.clone(),
            spec,
            file_info,
        }
    }
}

/// Kind of change reported by a watch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

/// A change to a container log file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileWatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: LogFileMetadata,
}

impl LogFileWatchEvent {
    pub fn new(event_type: WatchEventType, object: LogFileMetadata) -> Self {
        Self { event_type, object }
    }
}

/// Strip a runtime scheme such as `containerd://` or `docker://` from a container ID
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    match container_id.find("://") {
        Some(idx) => &container_id[idx + 3..],
        None => container_id,
    }
}

// ============================================================================
// Log Stream Types
// ============================================================================

/// Direction a log file is read in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    Forward,
    Backward,
}

impl StreamDirection {
    /// Subcommand understood by the line-processing engine
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Forward => "stream-forward",
            Self::Backward => "stream-backward",
        }
    }
}

/// Follow policy for forward streams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowFrom {
    /// Read to the end of the file and stop
    #[default]
    Noop,
    /// Read from the start (or start time) and keep following new writes
    Default,
    /// Skip existing content and follow only new writes
    End,
}

impl FollowFrom {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Default => "default",
            Self::End => "end",
        }
    }
}

/// Request to stream one container's log file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamRequest {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,

    /// Regular expression filter, empty means no filter
    #[serde(default)]
    pub grep: String,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,

    /// Only honored for forward streams
    #[serde(default)]
    pub follow_from: FollowFrom,
}

impl LogStreamRequest {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
            container_id: container_id.into(),
            ..Default::default()
        }
    }

    pub fn with_grep(mut self, grep: impl Into<String>) -> Self {
        self.grep = grep.into();
        self
    }

    pub fn with_time_range(
        mut self,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.stop_time = stop;
        self
    }

    pub fn with_follow_from(mut self, follow_from: FollowFrom) -> Self {
        self.follow_from = follow_from;
        self
    }
}

/// A single log record read from a container log file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,

    /// Source file identity, set once records from several files are multiplexed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LogFileSpec>,
}

impl LogRecord {
    pub fn new(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: LogFileSpec) -> Self {
        self.source = Some(source);
        self
    }
}

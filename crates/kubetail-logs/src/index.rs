//! Container log file discovery.
//!
//! The container runtime keeps one symlink per container in a flat directory
//! (usually `/var/log/containers`) named
//! `<pod>_<namespace>_<container>-<containerID>.log`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use kubetail_types::{LogFileInfo, LogFileMetadata, LogFileSpec, strip_runtime_prefix};

use crate::error::{LogError, Result};

// Underscore is the only segment delimiter; the last hyphen splits the container ID
static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<pod>[^_]+)_(?P<namespace>[^_]+)_(?P<container>[^_]+)-(?P<id>[^-_]+)\.log$")
        .expect("log file name pattern is valid")
});

/// Parse a log file name into its identity
pub fn parse_file_name(node_name: &str, file_name: &str) -> Result<LogFileSpec> {
    let caps = FILE_NAME_RE
        .captures(file_name)
        .ok_or_else(|| LogError::MalformedFileName(file_name.to_string()))?;

    Ok(LogFileSpec {
        node_name: node_name.to_string(),
        namespace: caps["namespace"].to_string(),
        pod_name: caps["pod"].to_string(),
        container_name: caps["container"].to_string(),
        container_id: caps["id"].to_string(),
    })
}

/// Whether `namespace` passes the filter; an empty entry allows everything
pub(crate) fn namespace_allowed(namespaces: &[String], namespace: &str) -> bool {
    namespaces.iter().any(|ns| ns.is_empty() || ns == namespace)
}

/// Read-only view of a node's container log directory
#[derive(Clone, Debug)]
pub struct LogFileIndex {
    dir: PathBuf,
    node_name: String,
}

impl LogFileIndex {
    pub fn new(dir: impl Into<PathBuf>, node_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            node_name: node_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// List log files in the given namespaces, ordered by file name.
    ///
    /// Every entry in the directory must parse; a malformed name fails the call.
    pub fn list(&self, namespaces: &[String]) -> Result<Vec<LogFileMetadata>> {
        if namespaces.is_empty() {
            return Err(LogError::NamespacesRequired);
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut files = Vec::new();
        for name in names {
            let spec = parse_file_name(&self.node_name, &name)?;
            if !namespace_allowed(namespaces, &spec.namespace) {
                continue;
            }
            let info = file_info(&self.dir.join(&name));
            files.push(LogFileMetadata::new(spec, info));
        }

        Ok(files)
    }

    /// Path of the log file for a container.
    ///
    /// Runtime prefixes such as `containerd://` are stripped from the ID.
    pub fn find(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        container_id: &str,
    ) -> Result<PathBuf> {
        let spec = self.spec(namespace, pod_name, container_name, container_id);
        let path = self.dir.join(spec.file_name());

        if fs::metadata(&path).is_ok() {
            Ok(path)
        } else {
            Err(LogError::NotFound(path))
        }
    }

    /// Identity of a container's log file on this node
    pub fn spec(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        container_id: &str,
    ) -> LogFileSpec {
        LogFileSpec {
            node_name: self.node_name.clone(),
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            container_name: container_name.to_string(),
            container_id: strip_runtime_prefix(container_id).to_string(),
        }
    }

    /// Metadata for a log symlink; a missing target yields empty file info
    pub fn metadata_for(&self, path: &Path) -> Result<LogFileMetadata> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let spec = parse_file_name(&self.node_name, &name)?;
        Ok(LogFileMetadata::new(spec, file_info(path)))
    }
}

/// Size and modification time, following symlinks
fn file_info(path: &Path) -> LogFileInfo {
    match fs::metadata(path) {
        Ok(meta) => LogFileInfo {
            size: meta.len() as i64,
            last_modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        },
        Err(_) => LogFileInfo::default(),
    }
}

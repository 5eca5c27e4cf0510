//! Error types for access reviews and list/watch reconciliation.

use thiserror::Error;

use crate::authz::Verb;

/// Machine-readable code carried by watch failures across the client boundary.
pub const WATCH_ERROR_CODE: &str = "WATCH_ERROR";

/// Errors returned by the permission gate.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// The caller supplied no namespaces.
    #[error("namespaces required")]
    NamespacesRequired,

    /// An access review denied the request.
    #[error("unauthenticated: permission denied: `{verb}` on pods/log in namespace `{namespace}`{}", reason_suffix(.reason))]
    Denied {
        verb: Verb,
        namespace: String,
        reason: String,
    },

    /// The access review did not answer in time.
    #[error("access review timed out for namespace `{0}`")]
    Timeout(String),

    /// The access review could not be performed.
    #[error("access review failed: {0}")]
    Review(#[from] kube::Error),
}

impl PermissionError {
    /// Whether this is an authorization denial rather than an infrastructure failure
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {reason}")
    }
}

/// Errors surfaced by list and watch calls.
#[derive(Debug, Clone, Error)]
pub enum WatchError {
    /// The resource version cursor is too old to resume from.
    #[error("watch expired: {0}")]
    Expired(String),

    /// The API server rejected the call.
    #[error("api error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    /// The connection failed or the response could not be decoded.
    #[error("transport error: {0}")]
    Transport(String),
}

impl WatchError {
    /// Classify an API status, detecting expired cursors
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        if code == 410 || matches!(reason, "Expired" | "Gone") {
            Self::Expired(message.to_string())
        } else {
            Self::Api {
                code,
                reason: reason.to_string(),
                message: message.to_string(),
            }
        }
    }

    /// Classify an error carried as a `code`/`reason` string pair
    pub fn from_extension(code: &str, reason: &str, message: &str) -> Self {
        if code == WATCH_ERROR_CODE && reason == "Expired" {
            Self::Expired(message.to_string())
        } else {
            Self::Transport(format!("{code} {reason}: {message}"))
        }
    }

    /// Whether a full resync is required
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }
}

impl From<kube::Error> for WatchError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Self::from_status(resp.code, &resp.reason, &resp.message),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_message_names_verb_and_namespace() {
        let err = PermissionError::Denied {
            verb: Verb::List,
            namespace: "ns2".to_string(),
            reason: String::new(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("unauthenticated"));
        assert!(msg.contains("`list`"));
        assert!(msg.contains("`ns2`"));
        assert!(err.is_denied());
    }

    #[test]
    fn denied_message_appends_reason() {
        let err = PermissionError::Denied {
            verb: Verb::Get,
            namespace: "ns1".to_string(),
            reason: "no RBAC policy matched".to_string(),
        };
        assert!(err.to_string().ends_with(": no RBAC policy matched"));
    }

    #[test]
    fn namespaces_required_is_not_denial() {
        assert!(!PermissionError::NamespacesRequired.is_denied());
        assert_eq!(
            PermissionError::NamespacesRequired.to_string(),
            "namespaces required"
        );
    }

    #[test]
    fn gone_status_is_expired() {
        assert!(WatchError::from_status(410, "Gone", "too old resource version").is_expired());
        assert!(WatchError::from_status(500, "Expired", "").is_expired());
        assert!(!WatchError::from_status(500, "InternalError", "boom").is_expired());
    }

    #[test]
    fn extension_pair_is_expired() {
        assert!(WatchError::from_extension("WATCH_ERROR", "Expired", "").is_expired());
        assert!(!WatchError::from_extension("WATCH_ERROR", "Timeout", "").is_expired());
        assert!(!WatchError::from_extension("INTERNAL", "Expired", "").is_expired());
    }
}

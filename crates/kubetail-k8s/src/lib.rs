//! Kubernetes integration for kubetail
//!
//! This crate provides client bootstrap from kubeconfig or in-cluster
//! configuration, the per-namespace permission gate, and the client-side
//! list+watch reconciler that keeps ordered resource collections live.

mod authz;
mod client;
mod collection;
mod error;
mod reconciler;

pub use authz::{AccessDecision, Authorizer, KubeAuthorizer, PermissionGate, StaticAuthorizer, Verb};
pub use client::{KubeClient, with_bearer_token};
pub use collection::{
    CollectionMeta, Counter, ListWatchState, ObjectCache, Page, ResourceEvent, WatchableCollection,
};
pub use error::{PermissionError, WATCH_ERROR_CODE, WatchError};
pub use reconciler::{
    ApiSource, DEFAULT_RETRY_INTERVAL, ListWatchSource, QueryScope, ReconcilerPhase,
    ResourceWatchReconciler,
};

// Re-export types that are used in our public API
pub use kubetail_types::{ContextInfo, PodInfo, PodStatus};

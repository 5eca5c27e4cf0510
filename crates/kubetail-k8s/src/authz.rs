//! Per-namespace permission checks for pod log access.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::Api;
use kube::api::PostParams;
use parking_lot::Mutex;

use crate::client::with_bearer_token;
use crate::error::PermissionError;

/// Default deadline for a single access review
pub const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(10);

/// Verb checked against `pods/log`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one access review
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Answers whether the caller may perform `verb` on pod logs in a namespace.
///
/// `token` is the caller's bearer token when the request carries one; an
/// empty namespace asks about all namespaces.
pub trait Authorizer: Send + Sync {
    fn review<'a>(
        &'a self,
        token: Option<&'a str>,
        namespace: &'a str,
        verb: Verb,
    ) -> BoxFuture<'a, Result<AccessDecision, PermissionError>>;
}

/// Authorizer backed by `SelfSubjectAccessReview`
pub struct KubeAuthorizer {
    config: kube::Config,
    client: kube::Client,
}

impl KubeAuthorizer {
    pub fn new(config: kube::Config) -> Result<Self, kube::Error> {
        let client = kube::Client::try_from(config.clone())?;
        Ok(Self { config, client })
    }

    fn client_for(&self, token: Option<&str>) -> Result<kube::Client, kube::Error> {
        match token {
            Some(token) => kube::Client::try_from(with_bearer_token(&self.config, token)),
            None => Ok(self.client.clone()),
        }
    }
}

impl Authorizer for KubeAuthorizer {
    fn review<'a>(
        &'a self,
        token: Option<&'a str>,
        namespace: &'a str,
        verb: Verb,
    ) -> BoxFuture<'a, Result<AccessDecision, PermissionError>> {
        Box::pin(async move {
            let reviews: Api<SelfSubjectAccessReview> = Api::all(self.client_for(token)?);

            let review = SelfSubjectAccessReview {
                spec: SelfSubjectAccessReviewSpec {
                    resource_attributes: Some(ResourceAttributes {
                        namespace: Some(namespace.to_string()),
                        group: Some(String::new()),
                        resource: Some("pods".to_string()),
                        subresource: Some("log".to_string()),
                        verb: Some(verb.as_str().to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            };

            let result = reviews.create(&PostParams::default(), &review).await?;
            let status = result.status.unwrap_or_default();

            Ok(AccessDecision {
                allowed: status.allowed,
                reason: status.reason.unwrap_or_default(),
            })
        })
    }
}

/// In-memory authorizer with a fixed allow list
///
/// Every review is recorded so callers can assert which checks ran.
#[derive(Default)]
pub struct StaticAuthorizer {
    allow_all: bool,
    allowed: HashSet<(String, Verb)>,
    reviews: Mutex<Vec<(String, Verb)>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow every verb in every namespace
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    pub fn allow(mut self, namespace: impl Into<String>, verb: Verb) -> Self {
        self.allowed.insert((namespace.into(), verb));
        self
    }

    /// Reviews performed so far, in order
    pub fn reviews(&self) -> Vec<(String, Verb)> {
        self.reviews.lock().clone()
    }
}

impl Authorizer for StaticAuthorizer {
    fn review<'a>(
        &'a self,
        _token: Option<&'a str>,
        namespace: &'a str,
        verb: Verb,
    ) -> BoxFuture<'a, Result<AccessDecision, PermissionError>> {
        self.reviews.lock().push((namespace.to_string(), verb));

        let decision = if self.allow_all || self.allowed.contains(&(namespace.to_string(), verb)) {
            AccessDecision::allow()
        } else {
            AccessDecision::deny("not in allow list")
        };
        Box::pin(futures::future::ready(Ok(decision)))
    }
}

/// Aggregates per-namespace access reviews into a single decision
#[derive(Clone)]
pub struct PermissionGate {
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
}

impl PermissionGate {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            timeout: DEFAULT_REVIEW_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check `verb` on pod logs in every namespace.
    ///
    /// Namespaces are reviewed one at a time, in order; the first denial
    /// fails the whole call.
    pub async fn check(
        &self,
        token: Option<&str>,
        namespaces: &[String],
        verb: Verb,
    ) -> Result<(), PermissionError> {
        if namespaces.is_empty() {
            return Err(PermissionError::NamespacesRequired);
        }

        for namespace in namespaces {
            let review = self.authorizer.review(token, namespace, verb);
            let decision = tokio::time::timeout(self.timeout, review)
                .await
                .map_err(|_| PermissionError::Timeout(namespace.clone()))??;

            if !decision.allowed {
                tracing::debug!(
                    %verb,
                    namespace = %namespace,
                    reason = %decision.reason,
                    "access denied"
                );
                return Err(PermissionError::Denied {
                    verb,
                    namespace: namespace.clone(),
                    reason: decision.reason,
                });
            }
        }

        Ok(())
    }
}

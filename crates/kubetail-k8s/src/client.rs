//! Kubernetes client bootstrap for kubetail

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};

use kubetail_types::{ContextInfo, PodInfo, PodStatus};

/// Kubernetes client factory
///
/// Desktop mode reads the user's kubeconfig and builds clients per context.
/// Cluster mode uses the pod's service account.
pub struct KubeClient {
    kubeconfig: Option<Kubeconfig>,
    current_context: Option<String>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn from_kubeconfig() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

        let current_context = kubeconfig.current_context.clone();

        Ok(Self {
            kubeconfig: Some(kubeconfig),
            current_context,
        })
    }

    /// Create a KubeClient that uses the in-cluster service account
    pub fn in_cluster() -> Self {
        Self {
            kubeconfig: None,
            current_context: None,
        }
    }

    /// Get all available contexts from kubeconfig
    pub fn get_contexts(&self) -> Vec<ContextInfo> {
        let Some(kubeconfig) = &self.kubeconfig else {
            return Vec::new();
        };

        kubeconfig
            .contexts
            .iter()
            .map(|ctx| {
                let context = ctx.context.as_ref();
                ContextInfo::new(
                    ctx.name.clone(),
                    context.map(|c| c.cluster.clone()).unwrap_or_default(),
                    context.and_then(|c| c.user.clone()).unwrap_or_default(),
                    context.and_then(|c| c.namespace.clone()),
                    Some(&ctx.name) == self.current_context.as_ref(),
                )
            })
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Build a client config for a context (kubeconfig mode) or the service account
    pub async fn config(&self, context_name: Option<&str>) -> Result<kube::Config> {
        match &self.kubeconfig {
            Some(kubeconfig) => kube::Config::from_custom_kubeconfig(
                kubeconfig.clone(),
                &KubeConfigOptions {
                    context: context_name.map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .context(format!(
                "Failed to create config for context: {}",
                context_name.unwrap_or("<current>")
            )),
            None => kube::Config::incluster().context("Failed to load in-cluster config"),
        }
    }

    /// Create a kube::Client for a specific context
    pub async fn client(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let config = self.config(context_name).await?;
        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name.unwrap_or("<current>")
        ))
    }

    /// Fetch agent pods matching a label selector
    pub async fn get_agent_pods(
        client: &kube::Client,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await
            .context(format!(
                "Failed to list agent pods in {} matching {}",
                namespace, label_selector
            ))?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let name = pod.metadata.name.unwrap_or_default();
                let mut info = PodInfo::new(name, namespace.to_string());

                if let Some(spec) = &pod.spec {
                    info.node_name = spec.node_name.clone();
                }

                if let Some(status) = pod.status {
                    info.pod_ip = status.pod_ip;
                    info.status = status
                        .phase
                        .as_deref()
                        .map(PodStatus::from)
                        .unwrap_or(PodStatus::Unknown);
                }

                info
            })
            .collect())
    }
}

/// Copy of a client config that authenticates with the given bearer token instead
pub fn with_bearer_token(config: &kube::Config, token: &str) -> kube::Config {
    let mut config = config.clone();
    config.auth_info = AuthInfo {
        token: Some(token.to_string().into()),
        ..Default::default()
    };
    config
}

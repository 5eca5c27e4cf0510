//! Client commands that talk to node agents

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::warn;

use kubetail_agent::{
    AgentError, AgentItem, AgentRequest, AgentResolver, ConnectionManager, PortForwardResolver,
    ServiceResolver, StaticResolver,
};
use kubetail_k8s::KubeClient;
use kubetail_types::{
    FollowFrom, LogFileMetadata, LogRecord, LogStreamRequest, StreamDirection,
};

use crate::config::DEFAULT_PORT;

/// How to reach the cluster and its agents
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Kubeconfig context (defaults to the current context)
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(long, global = true)]
    pub in_cluster: bool,

    /// Fixed agent address for a node, repeatable
    #[arg(long = "agent", value_name = "NODE=ADDR", value_parser = parse_agent, global = true)]
    pub agents: Vec<(String, SocketAddr)>,

    /// Reach agents by port-forwarding through the API server
    #[arg(long, global = true)]
    pub port_forward: bool,

    /// Namespace the agents run in
    #[arg(long, default_value = "kubetail-system", global = true)]
    pub agent_namespace: String,

    /// Service that selects the agents
    #[arg(long, default_value = "kubetail-cluster-agent", global = true)]
    pub agent_service: String,

    /// Label selector for agent pods (port-forward mode)
    #[arg(
        long,
        default_value = "app.kubernetes.io/component=cluster-agent",
        global = true
    )]
    pub agent_selector: String,

    /// Agent port
    #[arg(long, default_value_t = DEFAULT_PORT, global = true)]
    pub agent_port: u16,

    /// Bearer token forwarded to agents for access reviews
    #[arg(long, env = "KUBETAIL_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,
}

fn parse_agent(s: &str) -> Result<(String, SocketAddr), String> {
    let (node, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NODE=ADDR, got `{s}`"))?;
    if node.is_empty() {
        return Err(format!("missing node name in `{s}`"));
    }
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address `{addr}`: {e}"))?;
    Ok((node.to_string(), addr))
}

impl ConnectArgs {
    pub async fn kube_client(&self) -> Result<kube::Client> {
        if self.in_cluster {
            KubeClient::in_cluster().client(None).await
        } else {
            KubeClient::from_kubeconfig()?
                .client(self.context.as_deref())
                .await
        }
    }

    pub async fn connection_manager(&self) -> Result<ConnectionManager> {
        let resolver: Arc<dyn AgentResolver> = if !self.agents.is_empty() {
            let resolver = self
                .agents
                .iter()
                .fold(StaticResolver::new(), |resolver, (node, addr)| {
                    resolver.with_agent(node.clone(), *addr)
                });
            Arc::new(resolver)
        } else if self.port_forward {
            Arc::new(PortForwardResolver::new(
                self.kube_client().await?,
                &self.agent_namespace,
                &self.agent_selector,
                self.agent_port,
            ))
        } else {
            Arc::new(ServiceResolver::new(
                self.kube_client().await?,
                &self.agent_namespace,
                &self.agent_service,
                self.agent_port,
            ))
        };

        Ok(ConnectionManager::new(resolver))
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

#[derive(clap::Args, Debug)]
pub struct LsArgs {
    /// Namespaces to list, all when omitted
    #[arg(short, long = "namespace")]
    pub namespaces: Vec<String>,

    /// Only ask these nodes
    #[arg(long = "node")]
    pub nodes: Vec<String>,

    /// Keep running and print file changes
    #[arg(short, long)]
    pub watch: bool,
}

#[derive(clap::Args, Debug)]
pub struct TailArgs {
    /// Pod name
    pub pod: String,

    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Only this container
    #[arg(short, long)]
    pub container: Option<String>,

    /// Regular expression filter
    #[arg(short, long)]
    pub grep: Option<String>,

    /// Start of the time window (RFC 3339)
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// End of the time window (RFC 3339)
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,

    /// Keep following new lines
    #[arg(short, long)]
    pub follow: bool,

    /// Newest lines first
    #[arg(short, long, conflicts_with = "follow")]
    pub reverse: bool,
}

impl TailArgs {
    fn request(&self, file: &LogFileMetadata) -> LogStreamRequest {
        let follow_from = if self.follow {
            FollowFrom::Default
        } else {
            FollowFrom::Noop
        };

        let mut req = LogStreamRequest::new(
            &file.spec.namespace,
            &file.spec.pod_name,
            &file.spec.container_name,
            &file.spec.container_id,
        )
        .with_time_range(self.since, self.until)
        .with_follow_from(follow_from);
        if let Some(grep) = &self.grep {
            req = req.with_grep(grep);
        }
        req
    }

    fn direction(&self) -> StreamDirection {
        if self.reverse {
            StreamDirection::Backward
        } else {
            StreamDirection::Forward
        }
    }

    fn matches(&self, file: &LogFileMetadata) -> bool {
        file.spec.pod_name == self.pod
            && self
                .container
                .as_ref()
                .is_none_or(|c| *c == file.spec.container_name)
    }
}

async fn target_nodes(manager: &ConnectionManager, nodes: &[String]) -> Result<Vec<String>> {
    if !nodes.is_empty() {
        return Ok(nodes.to_vec());
    }
    let nodes = manager.nodes().await.context("Failed to discover agents")?;
    if nodes.is_empty() {
        bail!("no agents found");
    }
    Ok(nodes)
}

/// Collect log files from every node; unreachable nodes are reported and skipped
async fn collect_files(
    manager: &ConnectionManager,
    nodes: &[String],
    token: Option<&str>,
    namespaces: Vec<String>,
) -> Vec<LogFileMetadata> {
    let mut responses = manager
        .fanout(nodes, token, AgentRequest::ListLogFiles { namespaces })
        .await;

    let mut files = Vec::new();
    while let Some((node, item)) = responses.next().await {
        match item {
            Ok(AgentItem::LogFile(file)) => files.push(file),
            Ok(_) => warn!(node = %node, "Ignoring unexpected item"),
            Err(e) => warn!(node = %node, error = %e, "Failed to list log files"),
        }
    }

    files.sort_by(|a, b| {
        (&a.spec.namespace, &a.spec.pod_name, &a.spec.container_name, &a.spec.node_name).cmp(&(
            &b.spec.namespace,
            &b.spec.pod_name,
            &b.spec.container_name,
            &b.spec.node_name,
        ))
    });
    files
}

fn format_file(file: &LogFileMetadata) -> String {
    let modified = file
        .file_info
        .last_modified_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<20} {:<40} {:<20} {:<16} {:>10} {}",
        file.spec.namespace,
        file.spec.pod_name,
        file.spec.container_name,
        file.spec.node_name,
        file.file_info.size,
        modified
    )
}

fn format_record(record: &LogRecord) -> String {
    let ts = record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    match &record.source {
        Some(source) => format!(
            "{} {}/{} {}",
            ts, source.pod_name, source.container_name, record.message
        ),
        None => format!("{} {}", ts, record.message),
    }
}

/// `kubetail ls`
pub async fn ls(connect: &ConnectArgs, args: LsArgs) -> Result<()> {
    let manager = connect.connection_manager().await?;
    let nodes = target_nodes(&manager, &args.nodes).await?;
    let namespaces = if args.namespaces.is_empty() {
        vec![String::new()]
    } else {
        args.namespaces
    };

    let files = collect_files(&manager, &nodes, connect.token(), namespaces.clone()).await;
    for file in &files {
        println!("{}", format_file(file));
    }

    if args.watch {
        let mut events = manager
            .fanout(&nodes, connect.token(), AgentRequest::WatchLogFiles { namespaces })
            .await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                next = events.next() => match next {
                    Some((_, Ok(AgentItem::WatchEvent(event)))) => {
                        println!("{:<8} {}", event.event_type.as_str(), format_file(&event.object));
                    }
                    Some((node, Ok(_))) => warn!(node = %node, "Ignoring unexpected item"),
                    Some((node, Err(e))) => warn!(node = %node, error = %e, "Watch failed"),
                    None => break,
                },
            }
        }
    }

    manager.close();
    Ok(())
}

/// `kubetail tail`
pub async fn tail(connect: &ConnectArgs, args: TailArgs) -> Result<()> {
    let manager = connect.connection_manager().await?;
    let nodes = target_nodes(&manager, &[]).await?;

    let files: Vec<LogFileMetadata> = collect_files(
        &manager,
        &nodes,
        connect.token(),
        vec![args.namespace.clone()],
    )
    .await
    .into_iter()
    .filter(|file| args.matches(file))
    .collect();

    if files.is_empty() {
        bail!(
            "no log files found for pod '{}' in namespace '{}'",
            args.pod,
            args.namespace
        );
    }

    let mut streams: Vec<BoxStream<'static, Result<LogRecord, AgentError>>> = Vec::new();
    for file in &files {
        let conn = manager.get(&file.spec.node_name).await?;
        streams.push(conn.stream_logs(connect.token(), args.direction(), args.request(file))?);
    }
    let mut records = stream::select_all(streams);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = records.next() => match next {
                Some(Ok(record)) => println!("{}", format_record(&record)),
                Some(Err(e)) => {
                    manager.close();
                    return Err(e).context("Log stream failed");
                }
                None => break,
            },
        }
    }

    manager.close();
    Ok(())
}

//! Routing requests to node agents.
//!
//! An [`AgentResolver`] knows how to reach the agent on a node; the
//! [`ConnectionManager`] pools one live connection per node on top of it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::ListParams;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kubetail_k8s::KubeClient;

use crate::connection::AgentConnection;
use crate::error::{AgentError, Result};
use crate::protocol::{AgentItem, AgentRequest};

/// Byte stream to an agent
pub trait AgentIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AgentIo for T {}

pub type BoxedIo = Box<dyn AgentIo>;

/// Resolves node names to agent connections
pub trait AgentResolver: Send + Sync {
    /// Nodes that currently have an agent
    fn nodes(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Open a new byte stream to the agent on `node`
    fn connect<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<BoxedIo>>;
}

/// Fixed node to address map
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    addrs: HashMap<String, SocketAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, node: impl Into<String>, addr: SocketAddr) -> Self {
        self.addrs.insert(node.into(), addr);
        self
    }
}

impl AgentResolver for StaticResolver {
    fn nodes(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let mut nodes: Vec<String> = self.addrs.keys().cloned().collect();
        nodes.sort();
        Box::pin(async move { Ok(nodes) })
    }

    fn connect<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<BoxedIo>> {
        Box::pin(async move {
            let addr = self
                .addrs
                .get(node)
                .ok_or_else(|| AgentError::UnknownNode(node.to_string()))?;
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// In-cluster resolution through the agent Service's EndpointSlices
pub struct ServiceResolver {
    client: kube::Client,
    namespace: String,
    service: String,
    port: u16,
}

impl ServiceResolver {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        service: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
            port,
        }
    }

    /// Ready endpoint address per node
    async fn endpoints(&self) -> Result<HashMap<String, String>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("kubernetes.io/service-name={}", self.service);
        let slices = api.list(&ListParams::default().labels(&selector)).await?;

        let mut by_node = HashMap::new();
        for endpoint in slices.items.into_iter().flat_map(|s| s.endpoints) {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            let (Some(node), Some(addr)) = (endpoint.node_name, endpoint.addresses.first()) else {
                continue;
            };
            if ready {
                by_node.insert(node, addr.clone());
            }
        }
        Ok(by_node)
    }
}

impl AgentResolver for ServiceResolver {
    fn nodes(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut nodes: Vec<String> = self.endpoints().await?.into_keys().collect();
            nodes.sort();
            Ok(nodes)
        })
    }

    fn connect<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<BoxedIo>> {
        Box::pin(async move {
            let endpoints = self.endpoints().await?;
            let ip = endpoints
                .get(node)
                .ok_or_else(|| AgentError::UnknownNode(node.to_string()))?;
            debug!(node, ip = %ip, port = self.port, "Connecting to agent endpoint");
            let stream = TcpStream::connect((ip.as_str(), self.port)).await?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// Desktop resolution by port-forwarding to agent pods through the API server
pub struct PortForwardResolver {
    client: kube::Client,
    namespace: String,
    label_selector: String,
    port: u16,
}

impl PortForwardResolver {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            port,
        }
    }

    /// Running agent pod per node
    async fn pods(&self) -> Result<HashMap<String, String>> {
        let pods = KubeClient::get_agent_pods(&self.client, &self.namespace, &self.label_selector)
            .await
            .map_err(|e| AgentError::Resolve(format!("{e:#}")))?;

        Ok(pods
            .into_iter()
            .filter(|pod| pod.is_ready())
            .filter_map(|pod| pod.node_name.map(|node| (node, pod.name)))
            .collect())
    }
}

impl AgentResolver for PortForwardResolver {
    fn nodes(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut nodes: Vec<String> = self.pods().await?.into_keys().collect();
            nodes.sort();
            Ok(nodes)
        })
    }

    fn connect<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<BoxedIo>> {
        Box::pin(async move {
            let pods = self.pods().await?;
            let pod = pods
                .get(node)
                .ok_or_else(|| AgentError::UnknownNode(node.to_string()))?;

            debug!(node, pod = %pod, port = self.port, "Port-forwarding to agent");
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
            let mut forwarder = api.portforward(pod, &[self.port]).await?;
            let stream = forwarder
                .take_stream(self.port)
                .ok_or(AgentError::ConnectionClosed)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// Pool of agent connections, one per node.
///
/// The pool lock is never held across a connect, so a slow node does not
/// hold up other nodes or [`close`](Self::close).
pub struct ConnectionManager {
    resolver: Arc<dyn AgentResolver>,
    pool: Mutex<HashMap<String, AgentConnection>>,
    closed: CancellationToken,
}

impl ConnectionManager {
    pub fn new(resolver: Arc<dyn AgentResolver>) -> Self {
        Self {
            resolver,
            pool: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    pub async fn nodes(&self) -> Result<Vec<String>> {
        self.resolver.nodes().await
    }

    /// Live connection to the agent on `node`, reusing a pooled one when possible
    pub async fn get(&self, node: &str) -> Result<AgentConnection> {
        if self.closed.is_cancelled() {
            return Err(AgentError::ManagerClosed);
        }

        if let Some(conn) = self.pooled(node) {
            return Ok(conn);
        }

        let io = tokio::select! {
            _ = self.closed.cancelled() => return Err(AgentError::ManagerClosed),
            io = self.resolver.connect(node) => io?,
        };
        let conn = AgentConnection::new(io, self.closed.child_token());

        let mut pool = self.pool.lock();
        // close() cancels before draining, so this check and the insert
        // below cannot race it
        if self.closed.is_cancelled() {
            conn.close();
            return Err(AgentError::ManagerClosed);
        }
        if let Some(existing) = pool.get(node)
            && !existing.is_closed()
        {
            // Another caller connected first
            conn.close();
            return Ok(existing.clone());
        }
        info!(node, "Connected to agent");
        pool.insert(node.to_string(), conn.clone());
        Ok(conn)
    }

    fn pooled(&self, node: &str) -> Option<AgentConnection> {
        let pool = self.pool.lock();
        let conn = pool.get(node)?;
        if conn.is_closed() {
            debug!(node, "Replacing closed agent connection");
            return None;
        }
        Some(conn.clone())
    }

    /// Close every pooled connection and fail in-flight connects. Safe to
    /// call more than once.
    pub fn close(&self) {
        self.closed.cancel();

        let drained: Vec<_> = self.pool.lock().drain().collect();
        for (node, conn) in drained {
            conn.close();
            debug!(node = %node, "Closed agent connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send the same request to every node and merge the responses.
    ///
    /// Items are tagged with the node they came from; a node that fails to
    /// connect contributes a single error item.
    pub async fn fanout(
        &self,
        nodes: &[String],
        token: Option<&str>,
        body: AgentRequest,
    ) -> BoxStream<'static, (String, Result<AgentItem>)> {
        let mut streams = Vec::with_capacity(nodes.len());

        for node in nodes {
            let tagged = match self
                .get(node)
                .await
                .and_then(|conn| conn.request(token, body.clone()))
            {
                Ok(responses) => {
                    let node = node.clone();
                    responses.map(move |item| (node.clone(), item)).boxed()
                }
                Err(e) => stream::once(futures::future::ready((node.clone(), Err(e)))).boxed(),
            };
            streams.push(tagged);
        }

        stream::select_all(streams).boxed()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::protocol::{Frame, FrameReader, FrameWriter};
    use kubetail_types::{LogFileInfo, LogFileMetadata, LogFileSpec};

    /// Resolver over in-memory pipes; each agent answers list requests with
    /// one file named after its node
    #[derive(Default)]
    struct PipeResolver {
        connects: AtomicUsize,
    }

    impl PipeResolver {
        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl AgentResolver for PipeResolver {
        fn nodes(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            Box::pin(async { Ok(vec!["node-a".to_string(), "node-b".to_string()]) })
        }

        fn connect<'a>(&'a self, node: &'a str) -> BoxFuture<'a, Result<BoxedIo>> {
            Box::pin(async move {
                match node {
                    "down" => return Err(AgentError::UnknownNode(node.to_string())),
                    "stalled" => return futures::future::pending().await,
                    _ => {}
                }
                self.connects.fetch_add(1, Ordering::SeqCst);

                let (client, server) = tokio::io::duplex(64 * 1024);
                let node = node.to_string();
                tokio::spawn(async move {
                    let (read, write) = tokio::io::split(server);
                    let mut reader = FrameReader::new(read);
                    let mut writer = FrameWriter::new(write);
                    while let Ok(Some(Frame::Request { id, .. })) = reader.next().await {
                        let spec = LogFileSpec {
                            node_name: node.clone(),
                            container_id: node.clone(),
                            ..Default::default()
                        };
                        let file = LogFileMetadata::new(spec, LogFileInfo::default());
                        let _ = writer
                            .send(&Frame::Item { id, item: AgentItem::LogFile(file) })
                            .await;
                        let _ = writer.send(&Frame::End { id }).await;
                    }
                });

                Ok(Box::new(client) as BoxedIo)
            })
        }
    }

    #[tokio::test]
    async fn test_connections_are_pooled() {
        let resolver = Arc::new(PipeResolver::default());
        let manager = ConnectionManager::new(resolver.clone());

        let first = manager.get("node-a").await.unwrap();
        let _second = manager.get("node-a").await.unwrap();
        assert_eq!(resolver.connects(), 1);

        first.close();
        let third = manager.get("node-a").await.unwrap();
        assert!(!third.is_closed());
        assert_eq!(resolver.connects(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let resolver = Arc::new(PipeResolver::default());
        let manager = ConnectionManager::new(resolver);

        let conn = manager.get("node-a").await.unwrap();
        manager.close();
        manager.close();

        assert!(manager.is_closed());
        assert!(conn.is_closed());
        assert!(matches!(
            manager.get("node-a").await,
            Err(AgentError::ManagerClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_connect_blocks_nothing_else() {
        let manager = Arc::new(ConnectionManager::new(Arc::new(PipeResolver::default())));
        manager.get("node-a").await.unwrap();

        let stalled = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get("stalled").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pooled = timeout(Duration::from_secs(1), manager.get("node-a"))
            .await
            .expect("pooled get waited on another node's connect");
        assert!(!pooled.unwrap().is_closed());

        manager.close();
        let result = timeout(Duration::from_secs(1), stalled)
            .await
            .expect("close did not fail the in-flight connect")
            .unwrap();
        assert!(matches!(result, Err(AgentError::ManagerClosed)));
    }

    #[tokio::test]
    async fn test_fanout_tags_items_by_node() {
        let manager = ConnectionManager::new(Arc::new(PipeResolver::default()));
        let nodes = manager.nodes().await.unwrap();

        let mut items: Vec<(String, String)> = manager
            .fanout(&nodes, None, AgentRequest::ListLogFiles { namespaces: vec![String::new()] })
            .await
            .map(|(node, item)| match item.unwrap() {
                AgentItem::LogFile(file) => (node, file.id),
                other => panic!("unexpected item: {other:?}"),
            })
            .collect()
            .await;
        items.sort();

        assert_eq!(
            items,
            vec![
                ("node-a".to_string(), "node-a".to_string()),
                ("node-b".to_string(), "node-b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_fanout_reports_unreachable_node() {
        let manager = ConnectionManager::new(Arc::new(PipeResolver::default()));
        let nodes = vec!["node-a".to_string(), "down".to_string()];

        let items: Vec<(String, Result<AgentItem>)> = manager
            .fanout(&nodes, None, AgentRequest::ListLogFiles { namespaces: vec![String::new()] })
            .await
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        let down = items.iter().find(|(node, _)| node == "down").unwrap();
        assert!(matches!(down.1, Err(AgentError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_static_resolver_unknown_node() {
        let resolver = StaticResolver::new().with_agent("node-a", "127.0.0.1:1".parse().unwrap());
        assert_eq!(resolver.nodes().await.unwrap(), vec!["node-a"]);
        assert!(matches!(
            resolver.connect("node-b").await,
            Err(AgentError::UnknownNode(node)) if node == "node-b"
        ));
    }
}

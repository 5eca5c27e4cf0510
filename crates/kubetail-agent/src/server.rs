//! Node agent server.
//!
//! Serves the frame protocol over TCP. Each request runs in its own task
//! bound to a cancellation token; a `cancel` frame, the connection closing or
//! agent shutdown cancels it, which closes watchers and kills engine
//! processes.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubetail_k8s::{PermissionGate, Verb};
use kubetail_logs::{LogFileWatcher, LogStreamEngine, StreamDirection};
use kubetail_types::LogStreamRequest;

use crate::protocol::{AgentItem, AgentRequest, Frame, FrameReader, FrameWriter, RemoteError};

const OUTBOUND_BUFFER: usize = 256;
const RECORD_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AgentServer {
    engine: LogStreamEngine,
    gate: PermissionGate,
    shutdown: CancellationToken,
}

impl AgentServer {
    pub fn new(engine: LogStreamEngine, gate: PermissionGate, shutdown: CancellationToken) -> Self {
        Self {
            engine,
            gate,
            shutdown,
        }
    }

    /// Accept connections until shutdown
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Agent listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                                debug!(%peer, "Connection closed");
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        info!("Agent stopped");
        Ok(())
    }

    /// Serve one connection until the peer disconnects or the agent shuts down
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read);

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write);
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send(&frame).await {
                    debug!(error = %e, "Failed to write frame");
                    break;
                }
            }
        });

        let conn_cancel = self.shutdown.child_token();
        let mut requests: HashMap<u64, CancellationToken> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => break,
                Some(id) = done_rx.recv() => {
                    requests.remove(&id);
                }
                frame = reader.next() => match frame {
                    Ok(Some(Frame::Request { id, token, body })) => {
                        let cancel = conn_cancel.child_token();
                        if let Some(previous) = requests.insert(id, cancel.clone()) {
                            previous.cancel();
                        }

                        let server = self.clone();
                        let out = out_tx.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            server.handle_request(id, token, body, cancel, out).await;
                            let _ = done.send(id);
                        });
                    }
                    Ok(Some(Frame::Cancel { id })) => {
                        if let Some(cancel) = requests.remove(&id) {
                            debug!(id, "Request cancelled by client");
                            cancel.cancel();
                        }
                    }
                    Ok(Some(frame)) => warn!(id = frame.id(), "Ignoring unexpected frame"),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read frame");
                        break;
                    }
                },
            }
        }

        conn_cancel.cancel();
    }

    async fn handle_request(
        &self,
        id: u64,
        token: Option<String>,
        body: AgentRequest,
        cancel: CancellationToken,
        out: mpsc::Sender<Frame>,
    ) {
        let token = token.as_deref();
        let result = match body {
            AgentRequest::ListLogFiles { namespaces } => {
                self.list_log_files(id, token, &namespaces, &cancel, &out)
                    .await
            }
            AgentRequest::WatchLogFiles { namespaces } => {
                self.watch_log_files(id, token, &namespaces, &cancel, &out)
                    .await
            }
            AgentRequest::StreamForward(req) => {
                self.stream(id, StreamDirection::Forward, token, &req, &cancel, &out)
                    .await
            }
            AgentRequest::StreamBackward(req) => {
                self.stream(id, StreamDirection::Backward, token, &req, &cancel, &out)
                    .await
            }
        };

        let last = match result {
            Ok(()) => Frame::End { id },
            Err(e) => {
                debug!(id, error = %e, "Request failed");
                Frame::Error {
                    id,
                    error: RemoteError::from(&e),
                }
            }
        };
        let _ = out.send(last).await;
    }

    async fn list_log_files(
        &self,
        id: u64,
        token: Option<&str>,
        namespaces: &[String],
        cancel: &CancellationToken,
        out: &mpsc::Sender<Frame>,
    ) -> kubetail_logs::Result<()> {
        self.gate.check(token, namespaces, Verb::List).await?;

        for file in self.engine.index().list(namespaces)? {
            if !emit(out, cancel, id, AgentItem::LogFile(file)).await {
                break;
            }
        }
        Ok(())
    }

    async fn watch_log_files(
        &self,
        id: u64,
        token: Option<&str>,
        namespaces: &[String],
        cancel: &CancellationToken,
        out: &mpsc::Sender<Frame>,
    ) -> kubetail_logs::Result<()> {
        self.gate.check(token, namespaces, Verb::Watch).await?;

        let mut watcher = LogFileWatcher::new(self.engine.index(), namespaces)?;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = watcher.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !emit(out, cancel, id, AgentItem::WatchEvent(event)).await {
                break;
            }
        }

        watcher.close();
        Ok(())
    }

    async fn stream(
        &self,
        id: u64,
        direction: StreamDirection,
        token: Option<&str>,
        req: &LogStreamRequest,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Frame>,
    ) -> kubetail_logs::Result<()> {
        let (tx, mut rx) = mpsc::channel(RECORD_BUFFER);

        let engine = self.engine.stream(direction, token, req, cancel, tx);
        let forward = async move {
            while let Some(record) = rx.recv().await {
                if !emit(out, cancel, id, AgentItem::Record(record)).await {
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(engine, forward);
        result
    }
}

/// Send an item frame unless the request is cancelled; false means stop
async fn emit(
    out: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
    id: u64,
    item: AgentItem,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = out.send(Frame::Item { id, item }) => sent.is_ok(),
    }
}

//! Client side of an agent connection.
//!
//! One connection carries many concurrent requests. A reader task routes
//! response frames to per-request channels by id; dropping an
//! [`AgentStream`] before it finishes sends a `cancel` frame.
//!
//! Per-request channels are unbounded so the reader never waits on a slow
//! consumer; one stream that is not polled cannot stall the others.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kubetail_types::{
    LogFileMetadata, LogFileWatchEvent, LogRecord, LogStreamRequest, StreamDirection,
};

use crate::error::{AgentError, Result};
use crate::protocol::{AgentItem, AgentRequest, Frame, FrameReader, FrameWriter};

type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>>;

/// A multiplexed connection to one node agent
#[derive(Clone)]
pub struct AgentConnection {
    inner: Arc<Inner>,
}

struct Inner {
    out: mpsc::UnboundedSender<Frame>,
    pending: Pending,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl AgentConnection {
    /// Start the reader and writer tasks for `io`.
    ///
    /// The connection closes when `cancel` fires, the agent hangs up or
    /// [`close`](Self::close) is called.
    pub fn new<S>(io: S, cancel: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write);
            loop {
                let frame = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = writer.send(&frame).await {
                    debug!(error = %e, "Failed to write frame to agent");
                    break;
                }
            }
            writer_cancel.cancel();
        });

        let reader_cancel = cancel.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read);
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = reader.next() => match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "Failed to read frame from agent");
                            break;
                        }
                    },
                };
                route(&reader_pending, frame);
            }
            reader_cancel.cancel();
            // Dropping the senders ends every open stream
            reader_pending.lock().clear();
        });

        Self {
            inner: Arc::new(Inner {
                out,
                pending,
                next_id: AtomicU64::new(1),
                cancel,
            }),
        }
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Send a request and return its response stream
    pub fn request(&self, token: Option<&str>, body: AgentRequest) -> Result<AgentStream> {
        if self.is_closed() {
            return Err(AgentError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(id, tx);

        let frame = Frame::Request {
            id,
            token: token.map(str::to_string),
            body,
        };
        if self.inner.out.send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(AgentError::ConnectionClosed);
        }

        Ok(AgentStream {
            id,
            rx,
            out: self.inner.out.clone(),
            pending: self.inner.pending.clone(),
            done: false,
        })
    }

    /// List log files on the agent's node
    pub async fn list_log_files(
        &self,
        token: Option<&str>,
        namespaces: &[String],
    ) -> Result<Vec<LogFileMetadata>> {
        let mut stream = self.request(
            token,
            AgentRequest::ListLogFiles {
                namespaces: namespaces.to_vec(),
            },
        )?;

        let mut files = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                AgentItem::LogFile(file) => files.push(file),
                _ => return Err(AgentError::UnexpectedResponse("expected log file")),
            }
        }
        Ok(files)
    }

    /// Watch log files on the agent's node
    pub fn watch_log_files(
        &self,
        token: Option<&str>,
        namespaces: &[String],
    ) -> Result<BoxStream<'static, Result<LogFileWatchEvent>>> {
        let stream = self.request(
            token,
            AgentRequest::WatchLogFiles {
                namespaces: namespaces.to_vec(),
            },
        )?;

        Ok(stream
            .map(|item| match item? {
                AgentItem::WatchEvent(event) => Ok(event),
                _ => Err(AgentError::UnexpectedResponse("expected watch event")),
            })
            .boxed())
    }

    /// Stream one container's log records
    pub fn stream_logs(
        &self,
        token: Option<&str>,
        direction: StreamDirection,
        req: LogStreamRequest,
    ) -> Result<BoxStream<'static, Result<LogRecord>>> {
        let body = match direction {
            StreamDirection::Forward => AgentRequest::StreamForward(req),
            StreamDirection::Backward => AgentRequest::StreamBackward(req),
        };
        let stream = self.request(token, body)?;

        Ok(stream
            .map(|item| match item? {
                AgentItem::Record(record) => Ok(record),
                _ => Err(AgentError::UnexpectedResponse("expected log record")),
            })
            .boxed())
    }
}

fn route(pending: &Pending, frame: Frame) {
    let id = frame.id();
    let terminal = matches!(frame, Frame::End { .. } | Frame::Error { .. });

    let mut pending = pending.lock();
    let Some(sender) = pending.get(&id) else {
        debug!(id, "Dropping frame for unknown request");
        return;
    };
    if sender.send(frame).is_err() || terminal {
        pending.remove(&id);
    }
}

/// Response stream for one request.
///
/// Yields items until the agent ends the request. An agent error is yielded
/// once as `Err`; a lost connection yields [`AgentError::ConnectionClosed`].
pub struct AgentStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
    out: mpsc::UnboundedSender<Frame>,
    pending: Pending,
    done: bool,
}

impl AgentStream {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for AgentStream {
    type Item = Result<AgentItem>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Item { item, .. })) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Frame::End { .. })) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Frame::Error { error, .. })) => {
                self.done = true;
                Poll::Ready(Some(Err(error.into())))
            }
            Poll::Ready(Some(_)) => Poll::Ready(Some(Err(AgentError::UnexpectedResponse(
                "unexpected frame kind",
            )))),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(AgentError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.pending.lock().remove(&self.id);
        let _ = self.out.send(Frame::Cancel { id: self.id });
    }
}

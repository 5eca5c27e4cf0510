//! List+watch reconciliation loop.
//!
//! A reconciler fetches every page of a list, following `continue` tokens,
//! then watches from the final resource version and merges each event into
//! its state. Expired cursors trigger a full resync; any other failure is
//! retried at a fixed interval until the caller cancels.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::collection::{ListWatchState, Page, ResourceEvent};
use crate::error::WatchError;

/// Fixed delay between retries of a failed list or watch call
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Server-side watch timeout, kept below the API server's 295s ceiling
const WATCH_TIMEOUT_SECS: u32 = 290;

pub type EventStream<K> = BoxStream<'static, Result<ResourceEvent<K>, WatchError>>;

/// Source of list pages and watch streams for one resource collection
pub trait ListWatchSource<K>: Send + Sync {
    fn list<'a>(
        &'a self,
        continue_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Page<K>, WatchError>>;

    fn watch<'a>(
        &'a self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<EventStream<K>, WatchError>>;
}

/// Selectors and page size applied to list and watch calls
#[derive(Clone, Debug, Default)]
pub struct QueryScope {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub page_limit: Option<u32>,
}

impl QueryScope {
    fn list_params(&self, continue_token: Option<&str>) -> ListParams {
        let mut params = ListParams::default();
        if let Some(limit) = self.page_limit {
            params = params.limit(limit);
        }
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }
        params
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }
}

/// List+watch source backed by the Kubernetes API
pub struct ApiSource<K> {
    api: Api<K>,
    scope: QueryScope,
}

impl<K> ApiSource<K> {
    pub fn new(api: Api<K>, scope: QueryScope) -> Self {
        Self { api, scope }
    }
}

impl<K> ListWatchSource<K> for ApiSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn list<'a>(
        &'a self,
        continue_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Page<K>, WatchError>> {
        Box::pin(async move {
            let list = self
                .api
                .list(&self.scope.list_params(continue_token))
                .await?;

            Ok(Page {
                continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
                resource_version: list.metadata.resource_version.unwrap_or_default(),
                remaining_item_count: list.metadata.remaining_item_count,
                items: list.items,
            })
        })
    }

    fn watch<'a>(
        &'a self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<EventStream<K>, WatchError>> {
        Box::pin(async move {
            let stream = self
                .api
                .watch(&self.scope.watch_params(), resource_version)
                .await?;

            Ok(stream
                .map_err(WatchError::from)
                .and_then(|event| async move {
                    match event {
                        WatchEvent::Added(obj) => Ok(ResourceEvent::Added(obj)),
                        WatchEvent::Modified(obj) => Ok(ResourceEvent::Modified(obj)),
                        WatchEvent::Deleted(obj) => Ok(ResourceEvent::Deleted(obj)),
                        WatchEvent::Bookmark(bookmark) => {
                            Ok(ResourceEvent::Bookmark(bookmark.metadata.resource_version))
                        }
                        WatchEvent::Error(status) => Err(WatchError::from_status(
                            status.code,
                            &status.reason,
                            &status.message,
                        )),
                    }
                })
                .boxed())
        })
    }
}

/// Where a reconciler is in its list+watch cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcilerPhase {
    Idle,
    Fetching { continue_token: Option<String> },
    Watching { resource_version: String },
}

/// Drives one collection through list+watch and publishes every change
///
/// All merges for the collection happen on the task running [`run`], in the
/// order events arrive.
///
/// [`run`]: ResourceWatchReconciler::run
pub struct ResourceWatchReconciler<K, S, St> {
    source: S,
    state: St,
    phase: ReconcilerPhase,
    retry_interval: Duration,
    updates: watch::Sender<St>,
    _resource: PhantomData<fn() -> K>,
}

impl<K, S, St> ResourceWatchReconciler<K, S, St>
where
    K: Send + 'static,
    S: ListWatchSource<K>,
    St: ListWatchState<K>,
{
    /// Create a reconciler and a receiver that observes its state
    pub fn new(source: S, state: St) -> (Self, watch::Receiver<St>) {
        let (updates, rx) = watch::channel(state.clone());
        let reconciler = Self {
            source,
            state,
            phase: ReconcilerPhase::Idle,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            updates,
            _resource: PhantomData,
        };
        (reconciler, rx)
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn phase(&self) -> &ReconcilerPhase {
        &self.phase
    }

    pub fn state(&self) -> &St {
        &self.state
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                step = self.step() => step,
            };

            match step {
                Ok(()) => {}
                Err(err) if err.is_expired() => {
                    tracing::info!(error = %err, "watch expired, resyncing");
                    self.phase = ReconcilerPhase::Idle;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        phase = ?self.phase,
                        retry_in = ?self.retry_interval,
                        "list/watch failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }

        tracing::debug!(phase = ?self.phase, "reconciler stopped");
    }

    /// Perform the operation for the current phase and advance it on success.
    ///
    /// On failure the phase is left pointing at the operation to retry.
    pub async fn step(&mut self) -> Result<(), WatchError> {
        match self.phase.clone() {
            ReconcilerPhase::Idle => {
                self.state.reset();
                self.publish();
                self.transition(ReconcilerPhase::Fetching {
                    continue_token: None,
                });
                Ok(())
            }
            ReconcilerPhase::Fetching { continue_token } => {
                let page = self.source.list(continue_token.as_deref()).await?;
                let next = page.continue_token.clone();
                self.state.apply_page(page);
                self.publish();

                let phase = match next {
                    Some(token) => ReconcilerPhase::Fetching {
                        continue_token: Some(token),
                    },
                    None => ReconcilerPhase::Watching {
                        resource_version: self.state.resource_version().to_string(),
                    },
                };
                self.transition(phase);
                Ok(())
            }
            ReconcilerPhase::Watching { resource_version } => {
                let mut events = self.source.watch(&resource_version).await?;

                while let Some(event) = events.next().await {
                    self.state.apply_event(event?);
                    self.publish();
                    self.phase = ReconcilerPhase::Watching {
                        resource_version: self.state.resource_version().to_string(),
                    };
                }

                // The server closed the watch; resume from the latest cursor
                tracing::debug!(phase = ?self.phase, "watch stream ended");
                Ok(())
            }
        }
    }

    fn transition(&mut self, phase: ReconcilerPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "reconciler phase");
        self.phase = phase;
    }

    fn publish(&self) {
        self.updates.send_replace(self.state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Counter, WatchableCollection};
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn pod(name: &str, uid: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    type Script<T> = Mutex<VecDeque<Result<T, WatchError>>>;

    /// Scripted source; records every call it receives
    #[derive(Default)]
    struct FakeSource {
        pages: Script<Page<Pod>>,
        watches: Script<Vec<Result<ResourceEvent<Pod>, WatchError>>>,
        list_calls: Mutex<Vec<Option<String>>>,
        watch_calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn page(self, items: Vec<Pod>, continue_token: Option<&str>, rv: &str) -> Self {
            self.pages.lock().push_back(Ok(Page {
                items,
                continue_token: continue_token.map(str::to_string),
                resource_version: rv.to_string(),
                remaining_item_count: None,
            }));
            self
        }

        fn list_error(self, err: WatchError) -> Self {
            self.pages.lock().push_back(Err(err));
            self
        }

        fn watch(self, events: Vec<Result<ResourceEvent<Pod>, WatchError>>) -> Self {
            self.watches.lock().push_back(Ok(events));
            self
        }
    }

    impl ListWatchSource<Pod> for Arc<FakeSource> {
        fn list<'a>(
            &'a self,
            continue_token: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Page<Pod>, WatchError>> {
            self.list_calls.lock().push(continue_token.map(str::to_string));
            let next = self
                .pages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(WatchError::Transport("no more pages".to_string())));
            Box::pin(futures::future::ready(next))
        }

        fn watch<'a>(
            &'a self,
            resource_version: &'a str,
        ) -> BoxFuture<'a, Result<EventStream<Pod>, WatchError>> {
            self.watch_calls.lock().push(resource_version.to_string());
            let next = self.watches.lock().pop_front();
            Box::pin(async move {
                match next {
                    Some(Ok(events)) => Ok(futures::stream::iter(events).boxed()),
                    Some(Err(err)) => Err(err),
                    // Nothing scripted: behave like an idle watch
                    None => Ok(futures::stream::pending().boxed()),
                }
            })
        }
    }

    fn names(c: &WatchableCollection<Pod>) -> Vec<String> {
        c.items()
            .iter()
            .map(|p| p.metadata.name.clone().unwrap_or_default())
            .collect()
    }

    async fn steps<S: ListWatchState<Pod>>(
        r: &mut ResourceWatchReconciler<Pod, Arc<FakeSource>, S>,
        n: usize,
    ) {
        for _ in 0..n {
            r.step().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_follows_continue_then_watches() {
        let source = Arc::new(
            FakeSource::default()
                .page(vec![pod("b", "u2", "1")], Some("tok-1"), "10")
                .page(vec![pod("a", "u1", "1")], Some("tok-2"), "11")
                .page(vec![pod("c", "u3", "1")], None, "12"),
        );
        let (mut r, rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source.clone(), WatchableCollection::new());

        // idle + three pages
        steps(&mut r, 4).await;

        assert_eq!(
            r.phase(),
            &ReconcilerPhase::Watching {
                resource_version: "12".to_string()
            }
        );
        assert_eq!(
            *source.list_calls.lock(),
            vec![None, Some("tok-1".to_string()), Some("tok-2".to_string())]
        );
        assert_eq!(names(&rx.borrow()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_watch_merges_events_and_tracks_version() {
        let source = Arc::new(
            FakeSource::default()
                .page(vec![pod("a", "u1", "1")], None, "5")
                .watch(vec![
                    Ok(ResourceEvent::Added(pod("b", "u2", "6"))),
                    Ok(ResourceEvent::Deleted(pod("a", "u1", "7"))),
                    Ok(ResourceEvent::Bookmark("9".to_string())),
                ]),
        );
        let (mut r, rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source.clone(), WatchableCollection::new());

        steps(&mut r, 3).await;

        assert_eq!(names(&rx.borrow()), vec!["b"]);
        assert_eq!(
            r.phase(),
            &ReconcilerPhase::Watching {
                resource_version: "9".to_string()
            }
        );
        assert_eq!(*source.watch_calls.lock(), vec!["5".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_watch_resyncs_from_scratch() {
        let source = Arc::new(
            FakeSource::default()
                .page(vec![pod("a", "u1", "1"), pod("b", "u2", "1")], None, "5")
                .watch(vec![Err(WatchError::from_status(410, "Expired", "too old"))])
                .page(vec![pod("c", "u3", "1")], None, "20"),
        );
        let (r, rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source.clone(), WatchableCollection::new());
        let r = r.with_retry_interval(Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(r.run(cancel.clone()));

        let mut rx_wait = rx.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx_wait.wait_for(|c| c.resource_version() == "20"),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(names(&rx.borrow()), vec!["c"]);
        assert_eq!(*source.list_calls.lock(), vec![None, None]);
        assert_eq!(source.watch_calls.lock()[0], "5");
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_page() {
        let source = Arc::new(
            FakeSource::default()
                .page(vec![pod("a", "u1", "1")], Some("tok-1"), "10")
                .list_error(WatchError::Transport("connection reset".to_string()))
                .list_error(WatchError::Api {
                    code: 500,
                    reason: "InternalError".to_string(),
                    message: "etcd".to_string(),
                })
                .page(vec![pod("b", "u2", "1")], None, "11"),
        );
        let (r, rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source.clone(), WatchableCollection::new());
        let r = r.with_retry_interval(Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(r.run(cancel.clone()));

        let mut rx_wait = rx.clone();
        tokio::time::timeout(Duration::from_secs(5), rx_wait.wait_for(|c| c.len() == 2))
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        task.await.unwrap();

        let tok = Some("tok-1".to_string());
        assert_eq!(
            *source.list_calls.lock(),
            vec![None, tok.clone(), tok.clone(), tok]
        );
        assert_eq!(names(&rx.borrow()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_step_leaves_phase_on_error() {
        let source = Arc::new(
            FakeSource::default().list_error(WatchError::Transport("refused".to_string())),
        );
        let (mut r, _rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source, WatchableCollection::new());

        r.step().await.unwrap();
        assert!(r.step().await.is_err());
        assert_eq!(
            r.phase(),
            &ReconcilerPhase::Fetching {
                continue_token: None
            }
        );
    }

    #[tokio::test]
    async fn test_counter_uses_same_cycle() {
        let source = Arc::new(
            FakeSource::default()
                .page(vec![pod("a", "u1", "1")], None, "3")
                .watch(vec![
                    Ok(ResourceEvent::Added(pod("b", "u2", "4"))),
                    Ok(ResourceEvent::Modified(pod("b", "u2", "5"))),
                    Ok(ResourceEvent::Added(pod("c", "u3", "6"))),
                    Ok(ResourceEvent::Deleted(pod("a", "u1", "7"))),
                ]),
        );
        let (mut r, rx) = ResourceWatchReconciler::<Pod, _, _>::new(source, Counter::new());

        steps(&mut r, 3).await;

        assert_eq!(rx.borrow().remaining_item_count(), 2);
        assert_eq!(ListWatchState::<Pod>::resource_version(&*rx.borrow()), "7");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let source = Arc::new(FakeSource::default().page(vec![], None, "1"));
        let (r, _rx) =
            ResourceWatchReconciler::<Pod, _, _>::new(source, WatchableCollection::new());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(r.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}

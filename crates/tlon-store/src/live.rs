//! Live queries: a query result that re-evaluates whenever a committed write
//! overlaps its filter.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::entity::{ChangeSet, Filter};
use crate::error::Result;
use crate::local::StoreReader;

/// What the UI renders: the data, whether a backfill is still running for
/// it, and the last error.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
        }
    }
}

enum Wake {
    Changed(std::result::Result<ChangeSet, RecvError>),
    Loading(bool),
    Closed,
}

/// A running query. Dropping it stops re-evaluation.
pub struct LiveQuery<T> {
    rx: watch::Receiver<QueryState<T>>,
    task: JoinHandle<()>,
}

impl<T> LiveQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Evaluate `load` now and again after every overlapping change.
    ///
    /// `loading`, when given, is mirrored into `is_loading` and also wakes
    /// the query when it flips.
    pub fn spawn<F>(
        reader: StoreReader,
        filter: Filter,
        loading: Option<watch::Receiver<bool>>,
        load: F,
    ) -> Self
    where
        F: Fn(&Database) -> Result<T> + Send + 'static,
    {
        // Subscribe first so no commit between evaluation and subscription
        // is missed.
        let mut changes = reader.subscribe();
        let initial = evaluate(&reader, &load, loading.as_ref(), None);
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(async move {
            let mut loading = loading;
            loop {
                let wake = tokio::select! {
                    res = changes.recv() => Wake::Changed(res),
                    res = loading_changed(&mut loading) => Wake::Loading(res),
                    _ = tx.closed() => Wake::Closed,
                };

                match wake {
                    Wake::Changed(Ok(set)) if !set.overlaps(&filter) => continue,
                    Wake::Changed(Ok(_)) => {}
                    Wake::Changed(Err(RecvError::Lagged(skipped))) => {
                        tracing::debug!(?filter, skipped, "live query lagged, re-running");
                    }
                    Wake::Changed(Err(RecvError::Closed)) | Wake::Closed => break,
                    Wake::Loading(true) => {}
                    Wake::Loading(false) => {
                        loading = None;
                    }
                }

                let previous = tx.borrow().data.clone();
                let next = evaluate(&reader, &load, loading.as_ref(), previous);
                if tx.send(next).is_err() {
                    break;
                }
            }
        });

        Self { rx, task }
    }

    pub fn current(&self) -> QueryState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next re-evaluation. `None` once the query stopped.
    pub async fn changed(&mut self) -> Option<QueryState<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&QueryState<T>) -> bool) -> Option<QueryState<T>> {
        let state = self.rx.wait_for(|s| pred(s)).await.ok()?;
        Some(state.clone())
    }

    pub fn receiver(&self) -> watch::Receiver<QueryState<T>> {
        self.rx.clone()
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolves with `true` when the flag changed, `false` when its sender is
/// gone; pends forever without a flag.
async fn loading_changed(loading: &mut Option<watch::Receiver<bool>>) -> bool {
    match loading {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

fn evaluate<T, F>(
    reader: &StoreReader,
    load: &F,
    loading: Option<&watch::Receiver<bool>>,
    previous: Option<T>,
) -> QueryState<T>
where
    F: Fn(&Database) -> Result<T>,
{
    let is_loading = loading.map(|rx| *rx.borrow()).unwrap_or(false);
    match reader.read(|db| load(db)) {
        Ok(data) => QueryState {
            data: Some(data),
            is_loading,
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "live query failed");
            QueryState {
                data: previous,
                is_loading,
                error: Some(e.to_string()),
            }
        }
    }
}

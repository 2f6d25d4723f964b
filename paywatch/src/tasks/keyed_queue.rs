//! Per-key serial job execution.
//!
//! Jobs sharing a key run one at a time, in submission order. Jobs with different keys run
//! concurrently. Each key with work has exactly one chain task that drains its deque; when
//! the deque is found empty the key is forgotten under the same lock that `enqueue` takes,
//! so a racing enqueue either lands in the old deque or starts a new chain, never both.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Inner<K> {
    chains: Mutex<HashMap<K, VecDeque<Job>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Cloneable handle to a set of per-key job chains.
pub struct KeyedQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyedQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Jobs observe a child of `shutdown`; cancelling it has the same effect as [`abort`](Self::abort)
    /// minus the draining.
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                chains: Mutex::new(HashMap::new()),
                shutdown: shutdown.child_token(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue `job` behind every job already queued for `key`.
    ///
    /// Returns false, dropping the job, once the queue has been aborted.
    pub fn enqueue<F, Fut>(&self, key: K, job: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job: Job = Box::new(move |token| job(token).boxed());

        let mut chains = self.inner.chains.lock();
        if self.inner.shutdown.is_cancelled() {
            debug!(?key, "Queue aborted, dropping job");
            return false;
        }
        match chains.get_mut(&key) {
            Some(queue) => queue.push_back(job),
            None => {
                chains.insert(key.clone(), VecDeque::from([job]));
                self.spawn_chain(key);
            }
        }
        true
    }

    fn spawn_chain(&self, key: K) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            loop {
                let job = {
                    let mut chains = inner.chains.lock();
                    let Some(queue) = chains.get_mut(&key) else {
                        // Cleared by abort
                        break;
                    };
                    match queue.pop_front() {
                        Some(job) => job,
                        None => {
                            chains.remove(&key);
                            break;
                        }
                    }
                };

                let token = inner.shutdown.clone();
                match AssertUnwindSafe(async move { job(token).await }).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(?key, error = %e, "Queued job failed"),
                    Err(_) => error!(?key, "Queued job panicked"),
                }
            }
        });
    }

    /// The token handed to jobs. Work done outside the queue on its behalf should observe it
    /// too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Number of keys with queued or running work.
    pub fn len(&self) -> usize {
        self.inner.chains.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel running jobs, drop queued ones and wait up to `timeout` for chains to finish.
    ///
    /// Returns true if every chain finished in time.
    pub async fn abort(&self, timeout: Duration) -> bool {
        let dropped: usize = {
            let mut chains = self.inner.chains.lock();
            self.inner.shutdown.cancel();
            chains.drain().map(|(_, queue)| queue.len()).sum()
        };
        if dropped > 0 {
            warn!(dropped, "Dropped queued jobs on abort");
        }

        self.inner.tracker.close();
        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(running = self.inner.tracker.len(), "Keyed queue did not drain before timeout");
                false
            }
        }
    }
}

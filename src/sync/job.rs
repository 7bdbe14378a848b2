//! Single-flight asynchronous jobs.
//!
//! An [`AsyncJob`] wraps one long-running operation so that any number of
//! independent callers can await it concurrently while the operation runs at
//! most once per cycle. Each waiter cancels only its own interest; the shared
//! run is abandoned only when the last registered waiter cancels, at which
//! point the job returns to idle and a later wait starts a fresh run.
//! Disposal cancels every outstanding waiter at once.
//!
//! State transitions are linearized under a single internal lock that is
//! never held across an await point. Completion fans out over a watch
//! channel, so waiters that join after completion still observe the cached
//! result for as long as the job lives.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

type Outcome<T, E> = Result<T, Arc<E>>;
type OpFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type OpFn<T, E> = dyn Fn(CancellationToken) -> OpFuture<T, E> + Send + Sync;

/// A deduplicated, cancelable unit of work shared by N waiters.
pub struct AsyncJob<T, E> {
    inner: Arc<JobInner<T, E>>,
}

impl<T, E> Clone for AsyncJob<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct JobInner<T, E> {
    op: Box<OpFn<T, E>>,
    state: Mutex<State<T, E>>,
    disposed: CancellationToken,
}

struct State<T, E> {
    phase: Phase<T, E>,
    waiters: usize,
    run_seq: u64,
}

enum Phase<T, E> {
    Idle,
    Running {
        cancel: CancellationToken,
        rx: watch::Receiver<Option<Outcome<T, E>>>,
    },
    Settled(Outcome<T, E>),
}

impl<T, E> AsyncJob<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    /// Wrap `op`. The operation is not started until the first wait.
    pub fn new<F, Fut>(op: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(JobInner {
                op: Box::new(move |cancel| Box::pin(op(cancel))),
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    waiters: 0,
                    run_seq: 0,
                }),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Register as a waiter and await the shared result.
    ///
    /// Starts the underlying operation if the job is idle. `caller` cancels
    /// only this waiter; the run itself is abandoned when the last waiter
    /// cancels.
    pub async fn wait(&self, caller: &CancellationToken) -> Result<T, JobError<E>> {
        if self.inner.disposed.is_cancelled() {
            return Err(JobError::Disposed);
        }
        if caller.is_cancelled() {
            return Err(JobError::Canceled);
        }

        let (mut rx, my_seq) = {
            let mut st = self.state();
            match &st.phase {
                Phase::Settled(outcome) => {
                    return outcome.clone().map_err(JobError::Faulted);
                }
                Phase::Running { rx, .. } => {
                    let rx = rx.clone();
                    st.waiters += 1;
                    (rx, st.run_seq)
                }
                Phase::Idle => {
                    let rx = self.start_run(&mut st);
                    st.waiters += 1;
                    (rx, st.run_seq)
                }
            }
        };

        let disposed = self.inner.disposed.clone();
        tokio::select! {
            biased;
            _ = disposed.cancelled() => {
                self.deregister(my_seq, false);
                Err(JobError::Disposed)
            }
            _ = caller.cancelled() => {
                self.deregister(my_seq, true);
                Err(JobError::Canceled)
            }
            res = rx.wait_for(|v| v.is_some()) => {
                let value = match &res {
                    Ok(guard) => guard.clone(),
                    Err(_) => None,
                };
                self.deregister(my_seq, false);
                match value {
                    Some(Ok(v)) => Ok(v),
                    Some(Err(e)) => Err(JobError::Faulted(e)),
                    // Run task went away without settling; treat as abandoned.
                    None => Err(JobError::Canceled),
                }
            }
        }
    }

    /// Cancel every outstanding waiter and retire the job permanently.
    pub fn dispose(&self) {
        let st = self.state();
        self.inner.disposed.cancel();
        if let Phase::Running { cancel, .. } = &st.phase {
            cancel.cancel();
        }
    }

    /// True once the run finished and every waiter has been served, i.e. the
    /// owner may drop this job and create a fresh one for the next request.
    pub fn try_retire(&self) -> bool {
        let st = self.state();
        st.waiters == 0 && matches!(st.phase, Phase::Settled(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state().phase, Phase::Idle)
    }

    /// Spawn the underlying operation exactly once for this run.
    fn start_run(&self, st: &mut State<T, E>) -> watch::Receiver<Option<Outcome<T, E>>> {
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        st.run_seq += 1;
        let seq = st.run_seq;
        st.phase = Phase::Running {
            cancel: cancel.clone(),
            rx: rx.clone(),
        };

        let inner = Arc::clone(&self.inner);
        let fut = (self.inner.op)(cancel);
        tokio::spawn(async move {
            let outcome = fut.await.map_err(Arc::new);
            {
                let mut st = inner
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                // A stale run (abandoned via last-waiter cancel) must not
                // clobber whatever state came after it.
                if st.run_seq == seq {
                    if let Phase::Running { .. } = st.phase {
                        st.phase = Phase::Settled(outcome.clone());
                    }
                }
            }
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    /// Drop one waiter registration; on a caller-initiated cancel, the last
    /// waiter out abandons the run and resets the job to idle.
    fn deregister(&self, seq: u64, caller_canceled: bool) {
        let mut st = self.state();
        st.waiters = st.waiters.saturating_sub(1);
        if caller_canceled && st.waiters == 0 && st.run_seq == seq {
            if let Phase::Running { cancel, .. } = &st.phase {
                cancel.cancel();
                st.phase = Phase::Idle;
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T, E>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

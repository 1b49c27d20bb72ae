//! Compiled scripts and the run scheduler surface.
//!
//! A [`Script`] is bound at compile time to one isolate and runnable against
//! any context of that same isolate. Runs come in two modes: [`Script::run`]
//! blocks the calling thread; [`Script::spawn`] returns a [`PendingRun`]
//! immediately and the evaluation proceeds on the isolate's worker. Runs
//! submitted against one isolate execute serially in submission order; runs
//! against distinct isolates proceed fully in parallel.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak, mpsc},
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::{
    context::Context,
    error::{Error, Result},
    evaluator::Evaluator,
    internal::{
        core::{InterruptState, IsolateCore},
        watchdog::global_watchdog,
        worker::{Job, RunJob},
    },
    reference::Transferable,
    value::Value,
};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Wall-clock budget. Cancellation is cooperative: the run is aborted at
    /// the evaluator's next suspension point and fails with
    /// [`Error::Timeout`]; the isolate stays usable afterward.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub struct Script<E: Evaluator> {
    unit: Arc<E::Unit>,
    core: Weak<IsolateCore>,
    isolate: u64,
    jobs: mpsc::Sender<Job<E>>,
}

impl<E: Evaluator> std::fmt::Debug for Script<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("isolate", &self.isolate)
            .finish_non_exhaustive()
    }
}

impl<E: Evaluator> Script<E> {
    pub(crate) fn new(
        core: &Arc<IsolateCore>,
        unit: E::Unit,
        jobs: mpsc::Sender<Job<E>>,
    ) -> Self {
        Self {
            unit: Arc::new(unit),
            core: Arc::downgrade(core),
            isolate: core.id,
            jobs,
        }
    }

    #[must_use]
    pub const fn isolate_id(&self) -> u64 {
        self.isolate
    }

    /// Submit a run and return a pending handle immediately.
    ///
    /// # Errors
    /// Fails with [`Error::CrossIsolate`] when `context` belongs to a
    /// different isolate (nothing is enqueued), or [`Error::Disposed`].
    pub fn spawn(&self, context: &Context, options: &RunOptions) -> Result<PendingRun> {
        let core = self.core.upgrade().ok_or(Error::Disposed)?;
        if context.isolate_id() != self.isolate {
            return Err(Error::CrossIsolate);
        }
        core.ensure_active()?;

        let interrupt = Arc::new(InterruptState::new());
        let deadline = match options.timeout {
            Some(timeout) => Some(
                global_watchdog()
                    .map_err(|e| Error::Engine(e.into()))?
                    .register(Instant::now() + timeout, Arc::clone(&interrupt)),
            ),
            None => None,
        };

        let (reply, rx) = oneshot::channel();
        let job = Job::Run(RunJob {
            unit: Arc::clone(&self.unit),
            context: context.id(),
            interrupt,
            timeout: options.timeout,
            reply,
            deadline,
        });
        self.jobs.send(job).map_err(|_| Error::Disposed)?;

        Ok(PendingRun {
            rx,
            core: self.core.clone(),
        })
    }

    /// Run to completion, blocking the calling thread.
    ///
    /// # Errors
    /// Returns the run's typed failure; see [`Error`].
    pub fn run(&self, context: &Context, options: &RunOptions) -> Result<Value> {
        self.spawn(context, options)?.wait()
    }

    /// Privileged one-time initialization: install `bindings` into the
    /// context's global object, run this script blocking, then remove the
    /// binding names from the guest-visible namespace again, whether or not
    /// the run succeeded. This is the capability-confinement bootstrap: the
    /// script gets exactly one chance to capture the bindings before they
    /// vanish.
    ///
    /// # Errors
    /// Returns the first binding or run failure.
    pub fn bootstrap<I>(&self, context: &Context, bindings: I) -> Result<Value>
    where
        I: IntoIterator<Item = (String, Transferable)>,
    {
        let global = context.global()?;
        let mut installed = Vec::new();
        let mut install_error = None;
        for (key, value) in bindings {
            match global.set(&key, value) {
                Ok(()) => installed.push(key),
                Err(e) => {
                    install_error = Some(e);
                    break;
                }
            }
        }

        let result = match install_error {
            Some(e) => Err(e),
            None => self.run(context, &RunOptions::default()),
        };

        for key in &installed {
            let _ = global.delete(key);
        }
        result
    }
}

/// Handle to a non-blocking run. Await it from async code or call
/// [`PendingRun::wait`] from a plain thread.
pub struct PendingRun {
    rx: oneshot::Receiver<Result<Value>>,
    core: Weak<IsolateCore>,
}

impl PendingRun {
    /// Block until the run resolves.
    ///
    /// # Errors
    /// Returns the run's typed failure; see [`Error`].
    pub fn wait(self) -> Result<Value> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(worker_gone(&self.core)),
        }
    }
}

impl Future for PendingRun {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(worker_gone(&this.core))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The worker dropped our reply channel without answering. Distinguish
/// orderly teardown from a crashed worker.
fn worker_gone(core: &Weak<IsolateCore>) -> Error {
    match core.upgrade() {
        Some(core) if !core.is_disposed() => Error::Corrupted(anyhow::anyhow!(
            "isolate worker terminated unexpectedly"
        )),
        _ => Error::Disposed,
    }
}

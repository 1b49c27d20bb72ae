use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use tokio::sync::oneshot;

use crate::{
    TRACE_TARGET_RUN,
    error::{Error, Result},
    evaluator::{EvalFault, Evaluator, Scope},
    internal::{
        core::{InterruptCause, InterruptState, IsolateCore},
        heap::ContextId,
        watchdog::DeadlineGuard,
    },
    value::Value,
};

/// Work item for an isolate's worker thread. Submission order on this
/// channel is execution order, which is what serializes runs within one
/// isolate.
pub(crate) enum Job<E: Evaluator> {
    Run(RunJob<E>),
    Shutdown,
}

pub(crate) struct RunJob<E: Evaluator> {
    pub unit: Arc<E::Unit>,
    pub context: ContextId,
    pub interrupt: Arc<InterruptState>,
    pub timeout: Option<Duration>,
    pub reply: oneshot::Sender<Result<Value>>,
    /// Keeps the watchdog deadline armed for the lifetime of the run.
    pub deadline: Option<DeadlineGuard>,
}

/// Spawn the single worker thread backing one isolate.
pub(crate) fn spawn<E: Evaluator>(
    core: Arc<IsolateCore>,
    evaluator: Arc<E>,
) -> std::io::Result<mpsc::Sender<Job<E>>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("cordon-isolate-{}", core.id))
        .spawn(move || worker_loop(&core, &*evaluator, &rx))?;
    Ok(tx)
}

fn worker_loop<E: Evaluator>(
    core: &Arc<IsolateCore>,
    evaluator: &E,
    jobs: &mpsc::Receiver<Job<E>>,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Run(job) => run_one(core, evaluator, job),
        }
    }
}

fn run_one<E: Evaluator>(core: &Arc<IsolateCore>, evaluator: &E, job: RunJob<E>) {
    let RunJob {
        unit,
        context,
        interrupt,
        timeout,
        reply,
        deadline,
    } = job;

    // The deadline may have passed (or the isolate been disposed) while the
    // job sat in the queue; such runs fail without executing at all.
    if let Some(cause) = interrupt.cause() {
        let _ = reply.send(Err(interrupt_error(cause, timeout)));
        return;
    }
    if let Err(e) = core.ensure_active() {
        let _ = reply.send(Err(e));
        return;
    }

    core.set_active_interrupt(Some(Arc::clone(&interrupt)));
    let result = {
        let span = tracing::debug_span!(target: TRACE_TARGET_RUN, "run", isolate = core.id, context);
        let _enter = span.enter();
        let mut scope = Scope::new(core, context, &interrupt);
        evaluator.execute(&unit, &mut scope)
        // Scope drop releases the run's scratch reservations.
    };
    core.set_active_interrupt(None);
    drop(deadline);

    let mapped = match result {
        // A run that finished while disposal raced it must still observe
        // disposal rather than hand back a value from a cleared heap.
        Ok(value) => match interrupt.cause() {
            Some(InterruptCause::Disposed) => Err(Error::Disposed),
            _ => Ok(value),
        },
        Err(fault) => Err(map_fault(core, fault, &interrupt, timeout)),
    };
    if let Err(error) = &mapped {
        tracing::debug!(target: TRACE_TARGET_RUN, isolate = core.id, %error, "run failed");
    }
    let _ = reply.send(mapped);
}

fn map_fault(
    core: &IsolateCore,
    fault: EvalFault,
    interrupt: &InterruptState,
    timeout: Option<Duration>,
) -> Error {
    match fault {
        EvalFault::Thrown { message } => Error::Runtime { message },
        EvalFault::OutOfMemory => Error::OutOfMemory {
            ceiling: core.accountant.ceiling(),
        },
        EvalFault::Interrupted => interrupt.cause().map_or_else(
            || Error::runtime("run interrupted"),
            |cause| interrupt_error(cause, timeout),
        ),
        EvalFault::Corrupted(error) => {
            core.poison();
            tracing::warn!(isolate = core.id, %error, "isolate poisoned");
            Error::Corrupted(error)
        }
    }
}

fn interrupt_error(cause: InterruptCause, timeout: Option<Duration>) -> Error {
    match cause {
        InterruptCause::Timeout => Error::Timeout(timeout.unwrap_or_default()),
        InterruptCause::Disposed => Error::Disposed,
    }
}

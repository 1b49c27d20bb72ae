//! Isolate lifecycle.
//!
//! An [`Isolate`] is an independently memory-accounted heap for untrusted
//! code. It exclusively owns its contexts, compiled scripts and the slot
//! table behind every reference rooted in it; disposal invalidates all of
//! them at once. Each isolate runs its work on a single dedicated worker
//! thread, so code inside one isolate executes cooperatively while distinct
//! isolates are independent units of parallelism with no shared mutable
//! memory.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
    mpsc,
};

use crate::{
    context::Context,
    error::{BoxError, Error, Result},
    evaluator::Evaluator,
    internal::{core::IsolateCore, worker, worker::Job},
    reference::{ApplyArguments, Reference, ReferenceKind},
    script::Script,
    value::Value,
};

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Creation-time configuration. The memory ceiling is mandatory: every
/// guest allocation is checked against it and the crossing allocation fails
/// deterministically with `OutOfMemory`.
#[derive(Debug, Clone, Copy)]
pub struct IsolateOptions {
    memory_ceiling: usize,
}

impl IsolateOptions {
    #[must_use]
    pub const fn new(memory_ceiling_bytes: usize) -> Self {
        Self {
            memory_ceiling: memory_ceiling_bytes,
        }
    }
}

pub struct Isolate<E: Evaluator> {
    core: Arc<IsolateCore>,
    evaluator: Arc<E>,
    jobs: mpsc::Sender<Job<E>>,
}

impl<E: Evaluator> Isolate<E> {
    /// Create an isolate backed by `evaluator`, spawning its worker thread.
    ///
    /// # Errors
    /// Fails with [`Error::Engine`] if the worker thread cannot be spawned.
    pub fn new(evaluator: E, options: IsolateOptions) -> Result<Self> {
        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(IsolateCore::new(id, options.memory_ceiling));
        let evaluator = Arc::new(evaluator);
        let jobs = worker::spawn(Arc::clone(&core), Arc::clone(&evaluator))
            .map_err(|e| Error::Engine(e.into()))?;
        tracing::debug!(
            isolate = id,
            ceiling = options.memory_ceiling,
            "isolate created"
        );
        Ok(Self {
            core,
            evaluator,
            jobs,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Create a context with its own empty global object. Contexts share the
    /// isolate's ceiling but nothing else.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] after teardown.
    pub fn context(&self) -> Result<Context> {
        self.core.ensure_active()?;
        let (id, global_slot) = self.core.heap.lock().create_context();
        Ok(Context::new(&self.core, id, global_slot))
    }

    /// Compile source text via the evaluator. A failed compile mutates no
    /// state.
    ///
    /// # Errors
    /// Surfaces the evaluator's [`CompileError`](crate::error::CompileError).
    pub fn compile(&self, source: &str) -> Result<Script<E>> {
        self.core.ensure_active()?;
        let unit = self.evaluator.compile(source)?;
        Ok(Script::new(&self.core, unit, self.jobs.clone()))
    }

    /// Register a host closure as a Function-kind reference, the host half
    /// of the bridge. Guest code can call it through the apply convention
    /// but never inspect it.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] after teardown.
    pub fn wrap_function<F>(&self, function: F) -> Result<Reference>
    where
        F: Fn(ApplyArguments) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.core.ensure_active()?;
        let slot = self.core.heap.lock().register_function(Arc::new(function));
        Ok(Reference::new(&self.core, slot, ReferenceKind::Function))
    }

    /// Tear the isolate down. Idempotent. The heap is released, in-flight
    /// runs observe disposal and fail cleanly, and every context, script and
    /// reference rooted here permanently fails with
    /// [`Error::Disposed`].
    ///
    /// Safe to call concurrently with non-blocking runs against this
    /// isolate.
    pub fn dispose(&self) {
        if self.core.dispose() {
            let _ = self.jobs.send(Job::Shutdown);
        }
    }

    /// Bytes currently accounted against this isolate's ceiling.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.core.accountant.used()
    }

    #[must_use]
    pub fn memory_ceiling(&self) -> usize {
        self.core.accountant.ceiling()
    }
}

impl<E: Evaluator> Drop for Isolate<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

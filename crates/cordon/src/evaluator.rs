//! The evaluator collaborator interface.
//!
//! The engine treats the script language as opaque: an [`Evaluator`] turns
//! source text into a compiled unit and later executes that unit against a
//! [`Scope`], which is the only window the evaluator gets onto the isolate:
//! global bindings, the allocation hook, the bridge and the cooperative
//! cancellation flag all go through it.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    error::CompileError,
    external_copy,
    internal::{
        core::{InterruptState, IsolateCore},
        heap::{Binding, ContextId, Slot},
    },
    reference::{ApplyArguments, Reference},
    value::Value,
};

/// Failure modes an evaluator can surface from a run. The scheduler maps
/// these onto the host-facing error taxonomy.
#[derive(Debug)]
pub enum EvalFault {
    /// Guest-level thrown error. Leaves the isolate intact.
    Thrown { message: String },
    /// An allocation was refused by the accountant. Terminates the run only.
    OutOfMemory,
    /// The cancellation flag fired at a suspension point.
    Interrupted,
    /// The evaluator cannot vouch for heap consistency anymore. Poisons the
    /// isolate; the host must dispose it.
    Corrupted(anyhow::Error),
}

impl EvalFault {
    #[must_use]
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown {
            message: message.into(),
        }
    }
}

pub trait Evaluator: Send + Sync + 'static {
    /// Compiled executable unit, bound to the isolate that compiled it.
    type Unit: Send + Sync + 'static;

    /// Parse and validate source text. Must not retain or mutate any
    /// execution state on failure.
    ///
    /// # Errors
    /// Returns a [`CompileError`] describing the malformed input.
    fn compile(&self, source: &str) -> Result<Self::Unit, CompileError>;

    /// Execute a compiled unit. Every guest-triggered allocation must go
    /// through [`Scope::alloc`], and [`Scope::check_interrupt`] must be
    /// consulted at suspension points for cancellation to work.
    ///
    /// # Errors
    /// Returns an [`EvalFault`] describing how the run failed.
    fn execute(&self, unit: &Self::Unit, scope: &mut Scope<'_>) -> Result<Value, EvalFault>;
}

/// Execution window handed to [`Evaluator::execute`] for one run.
///
/// Scratch reservations made through [`Scope::alloc`] are released when the
/// run ends, however it ends; only values installed into the global object
/// stay resident (and accounted) across runs.
pub struct Scope<'a> {
    core: &'a Arc<IsolateCore>,
    context: ContextId,
    interrupt: &'a InterruptState,
    scratch: usize,
}

impl<'a> Scope<'a> {
    pub(crate) const fn new(
        core: &'a Arc<IsolateCore>,
        context: ContextId,
        interrupt: &'a InterruptState,
    ) -> Self {
        Self {
            core,
            context,
            interrupt,
            scratch: 0,
        }
    }

    /// Cooperative cancellation point.
    ///
    /// # Errors
    /// Returns [`EvalFault::Interrupted`] once a timeout or disposal has
    /// flagged this run.
    pub fn check_interrupt(&self) -> Result<(), EvalFault> {
        if self.interrupt.cause().is_some() || self.core.ensure_active().is_err() {
            return Err(EvalFault::Interrupted);
        }
        Ok(())
    }

    /// Reserve `bytes` of run-scratch guest memory.
    ///
    /// # Errors
    /// Fails with [`EvalFault::OutOfMemory`] at the allocation that would
    /// cross the isolate's ceiling.
    pub fn alloc(&mut self, bytes: usize) -> Result<(), EvalFault> {
        self.check_interrupt()?;
        if !self.core.accountant.reserve(bytes) {
            return Err(EvalFault::OutOfMemory);
        }
        self.scratch += bytes;
        Ok(())
    }

    /// Return previously reserved scratch bytes.
    pub fn free(&mut self, bytes: usize) {
        let released = bytes.min(self.scratch);
        self.core.accountant.release(released);
        self.scratch -= released;
    }

    pub fn memory_used(&self) -> usize {
        self.core.accountant.used()
    }

    #[must_use]
    pub fn memory_ceiling(&self) -> usize {
        self.core.accountant.ceiling()
    }

    /// Read a global binding. Alias bindings resolve to a reference to the
    /// live slot.
    ///
    /// # Errors
    /// Fails with [`EvalFault::Interrupted`] if the isolate was torn down
    /// under the run.
    pub fn global_get(&self, key: &str) -> Result<Option<Value>, EvalFault> {
        let binding = self
            .core
            .global_get(self.context, key)
            .map_err(|_| EvalFault::Interrupted)?;
        Ok(binding.map(|binding| match binding {
            Binding::Value { value, .. } => value,
            Binding::Alias { slot } => Reference::for_slot(self.core, slot)
                .map_or(Value::Null, Value::Reference),
        }))
    }

    /// Install a value under `key` in the global object. The value's
    /// footprint stays charged until the binding is overwritten or deleted.
    ///
    /// # Errors
    /// Fails with [`EvalFault::OutOfMemory`] when residency would cross the
    /// ceiling.
    pub fn global_set(&mut self, key: &str, value: Value) -> Result<(), EvalFault> {
        self.check_interrupt()?;
        self.core
            .global_set_value(self.context, key, value)
            .map_err(|e| match e {
                crate::internal::core::HeapOpError::OutOfMemory => EvalFault::OutOfMemory,
                crate::internal::core::HeapOpError::Gone => EvalFault::Interrupted,
            })
    }

    /// Remove a global binding, releasing its accounted bytes.
    ///
    /// # Errors
    /// Fails with [`EvalFault::Interrupted`] if the isolate was torn down.
    pub fn global_delete(&mut self, key: &str) -> Result<bool, EvalFault> {
        self.core
            .global_delete(self.context, key)
            .map_err(|_| EvalFault::Interrupted)
    }

    /// Dereference a reference into this heap. Only valid for references
    /// owned by the isolate this run executes in; crossing heaps is a
    /// programmer error surfaced as a guest fault.
    ///
    /// # Errors
    /// Fails when the reference belongs to another isolate or its target is
    /// gone.
    pub fn deref(&self, reference: &Reference) -> Result<Value, EvalFault> {
        self.check_interrupt()?;
        if reference.isolate_id() != self.core.id {
            return Err(EvalFault::thrown(
                "cannot dereference a reference across heaps",
            ));
        }

        let heap = self.core.heap.lock();
        match heap.slot(reference.slot()) {
            Some(Slot::Function(_)) => Ok(Value::Reference(reference.clone())),
            Some(&Slot::Globals(context)) => {
                let Some(globals) = heap.globals(context) else {
                    return Err(EvalFault::thrown("dangling reference"));
                };
                let mut entries: Vec<(String, Value)> = globals
                    .entries
                    .iter()
                    .map(|(key, binding)| {
                        let value = match binding {
                            Binding::Value { value, .. } => value.clone(),
                            Binding::Alias { slot } => Reference::for_slot(self.core, *slot)
                                .map_or(Value::Null, Value::Reference),
                        };
                        (key.clone(), value)
                    })
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Value::Map(entries))
            }
            None => Err(EvalFault::thrown("dangling reference")),
        }
    }

    /// Invoke a function reference through the bridge.
    ///
    /// Arguments (and `this`) are deep-copied at the call boundary; a value
    /// with no clone representation fails here, before any host code runs.
    /// With `ignore == true` the call is dispatched to the host executor and
    /// its outcome (return value or error) is discarded, so the guest is
    /// never blocked or failed by the host closure.
    ///
    /// # Errors
    /// Awaited calls surface host-closure failures as thrown guest errors.
    pub fn apply(
        &mut self,
        reference: &Reference,
        this: Option<&Value>,
        args: &[Value],
        ignore: bool,
    ) -> Result<Value, EvalFault> {
        self.check_interrupt()?;

        let function = reference
            .resolve_function()
            .map_err(|e| EvalFault::thrown(e.to_string()))?;

        let detached_this = match this {
            Some(value) => external_copy::detach(value)
                .map_err(|e| EvalFault::thrown(e.to_string()))?,
            None => Value::Null,
        };
        let detached_args = args
            .iter()
            .map(external_copy::detach)
            .collect::<crate::error::Result<SmallVec<[Value; 2]>>>()
            .map_err(|e| EvalFault::thrown(e.to_string()))?;
        let arguments = ApplyArguments {
            this: detached_this,
            args: detached_args.into_vec(),
        };

        if ignore {
            crate::reference::dispatch_ignored(function, arguments)
                .map_err(|e| EvalFault::thrown(e.to_string()))?;
            return Ok(Value::Null);
        }

        // The guest suspends here; the host closure runs to completion on
        // this worker before control returns.
        let result = function(arguments)
            .map_err(|e| EvalFault::thrown(format!("host error: {e}")))?;
        let result = external_copy::detach(&result)
            .map_err(|e| EvalFault::thrown(e.to_string()))?;
        self.alloc(result.byte_size())?;
        Ok(result)
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        // Run-scratch memory never outlives the run.
        self.core.accountant.release(self.scratch);
    }
}

//! Cross-heap handles and the bridge calling convention.
//!
//! A [`Reference`] is a weak, capability-gated handle to a value owned by
//! one isolate. It confers no ownership: every access re-resolves the
//! opaque slot handle against the owning isolate's table and fails with
//! [`Error::Disposed`] once that isolate is gone. Data never crosses the
//! boundary through a reference directly: extraction goes through
//! [`ExternalCopy`] snapshots, and host callables are invoked through the
//! apply convention below.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::{
    context::Context,
    error::{BoxError, Error, Result},
    external_copy::{self, ExternalCopy},
    internal::{
        core::{HeapOpError, IsolateCore},
        dispatch::host_dispatcher,
        heap::{Binding, Slot, SlotHandle},
    },
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Object,
    Function,
}

/// Arguments delivered to a host closure through the bridge. Both `this`
/// and `args` are detached copies; mutating them cannot touch guest state.
#[derive(Debug, Clone)]
pub struct ApplyArguments {
    pub this: Value,
    pub args: Vec<Value>,
}

/// Host closure callable from guest code via a Function-kind reference.
pub type HostFunction = Arc<dyn Fn(ApplyArguments) -> Result<Value, BoxError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Fire-and-forget mode: dispatch the call asynchronously and discard
    /// its return value or error. The error is logged, never propagated.
    pub ignore_result: bool,
}

/// A value that can be installed under a key across the boundary.
pub enum Transferable {
    /// Materialize an independent copy in the target heap.
    Copy(ExternalCopy),
    /// Expose a live capability; the guest can call it but never inspect it.
    Reference(Reference),
    /// Re-bind a same-isolate target directly (see [`Reference::deref_into`]).
    Local(Local),
}

/// Product of [`Reference::deref_into`]: a direct re-binding token, valid
/// only inside the isolate that owns the dereferenced target.
#[derive(Debug, Clone, Copy)]
pub struct Local {
    isolate: u64,
    slot: SlotHandle,
}

#[derive(Clone)]
pub struct Reference {
    isolate: u64,
    slot: SlotHandle,
    kind: ReferenceKind,
    core: Weak<IsolateCore>,
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("isolate", &self.isolate)
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.isolate == other.isolate && self.slot == other.slot && self.kind == other.kind
    }
}

impl Reference {
    pub(crate) fn new(core: &Arc<IsolateCore>, slot: SlotHandle, kind: ReferenceKind) -> Self {
        Self {
            isolate: core.id,
            slot,
            kind,
            core: Arc::downgrade(core),
        }
    }

    /// Build a reference for an existing slot, inferring the kind.
    pub(crate) fn for_slot(core: &Arc<IsolateCore>, slot: SlotHandle) -> Option<Self> {
        let kind = match core.heap.lock().slot(slot)? {
            Slot::Globals(_) => ReferenceKind::Object,
            Slot::Function(_) => ReferenceKind::Function,
        };
        Some(Self::new(core, slot, kind))
    }

    #[must_use]
    pub const fn kind(&self) -> ReferenceKind {
        self.kind
    }

    #[must_use]
    pub const fn isolate_id(&self) -> u64 {
        self.isolate
    }

    pub(crate) const fn slot(&self) -> SlotHandle {
        self.slot
    }

    /// Liveness-checked access to the owning isolate.
    fn core(&self) -> Result<Arc<IsolateCore>> {
        let core = self.core.upgrade().ok_or(Error::Disposed)?;
        core.ensure_active()?;
        Ok(core)
    }

    fn target_context(&self, core: &IsolateCore) -> Result<crate::internal::heap::ContextId> {
        match core.heap.lock().slot(self.slot) {
            Some(&Slot::Globals(context)) => Ok(context),
            Some(Slot::Function(_)) => Err(Error::runtime("reference is not an object")),
            None => Err(Error::Disposed),
        }
    }

    /// Install `value` under `key` on an Object-kind target.
    ///
    /// Setting a [`Transferable::Reference`] exposes a live capability to
    /// guest code; setting a [`Transferable::Copy`] materializes an
    /// independent value charged against the isolate's ceiling.
    ///
    /// # Errors
    /// Fails with [`Error::OutOfMemory`] when residency would cross the
    /// ceiling, [`Error::CrossHeapDeref`] for a foreign [`Local`], or
    /// [`Error::Disposed`].
    pub fn set(&self, key: &str, value: Transferable) -> Result<()> {
        let core = self.core()?;
        let context = self.target_context(&core)?;

        let outcome = match value {
            Transferable::Copy(snapshot) => {
                core.global_set_value(context, key, snapshot.copy()?)
            }
            Transferable::Reference(reference) => {
                core.global_set_value(context, key, Value::Reference(reference))
            }
            Transferable::Local(local) => {
                if local.isolate != self.isolate {
                    return Err(Error::CrossHeapDeref);
                }
                core.global_set_alias(context, key, local.slot)
            }
        };
        outcome.map_err(|e| match e {
            HeapOpError::OutOfMemory => Error::OutOfMemory {
                ceiling: core.accountant.ceiling(),
            },
            HeapOpError::Gone => Error::Disposed,
        })
    }

    /// Extract `key` from an Object-kind target as a detached snapshot.
    ///
    /// # Errors
    /// Fails with [`Error::NotFound`] for a missing key and
    /// [`Error::NotClonable`] when the entry is a capability rather than
    /// data.
    pub fn get(&self, key: &str) -> Result<ExternalCopy> {
        let core = self.core()?;
        let context = self.target_context(&core)?;
        let binding = core
            .global_get(context, key)
            .map_err(|_| Error::Disposed)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        match binding {
            Binding::Value { value, .. } => ExternalCopy::of(&value),
            Binding::Alias { .. } => Err(Error::NotClonable),
        }
    }

    /// Remove `key` from an Object-kind target, releasing its accounted
    /// bytes. Returns whether the key existed.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] if the owning isolate is gone.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let core = self.core()?;
        let context = self.target_context(&core)?;
        core.global_delete(context, key).map_err(|_| Error::Disposed)
    }

    /// Own enumerable keys of an Object-kind target, sorted.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] if the owning isolate is gone.
    pub fn keys(&self) -> Result<Vec<String>> {
        let core = self.core()?;
        let context = self.target_context(&core)?;
        let heap = core.heap.lock();
        let globals = heap.globals(context).ok_or(Error::Disposed)?;
        let mut keys: Vec<String> = globals.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Invoke a Function-kind target from the host side.
    ///
    /// Arguments are deep-copied at the call boundary ([`Error::NotClonable`]
    /// fires here, never partway through host execution). With
    /// `ignore_result` the call is dispatched on the host executor and its
    /// outcome discarded; a failing closure is logged, nothing more.
    ///
    /// # Errors
    /// Awaited calls surface closure failures as [`Error::Host`].
    pub fn apply(&self, this: Option<&Value>, args: &[Value], options: &ApplyOptions) -> Result<Value> {
        let function = self.resolve_function()?;

        let detached_this = match this {
            Some(value) => external_copy::detach(value)?,
            None => Value::Null,
        };
        let detached_args = args
            .iter()
            .map(external_copy::detach)
            .collect::<Result<SmallVec<[Value; 2]>>>()?;
        let arguments = ApplyArguments {
            this: detached_this,
            args: detached_args.into_vec(),
        };

        if options.ignore_result {
            dispatch_ignored(function, arguments)?;
            return Ok(Value::Null);
        }

        let result = function(arguments).map_err(Error::Host)?;
        external_copy::detach(&result)
    }

    /// Convert this reference into a direct re-binding token for its own
    /// isolate. The only legitimate use is re-exposing an isolate's own
    /// bindings to itself (the bootstrap pattern); `context` must belong to
    /// the owning isolate.
    ///
    /// # Errors
    /// Fails with [`Error::CrossHeapDeref`] when `context` lives in a
    /// different isolate.
    pub fn deref_into(&self, context: &Context) -> Result<Local> {
        if context.isolate_id() != self.isolate {
            return Err(Error::CrossHeapDeref);
        }
        let _core = self.core()?;
        Ok(Local {
            isolate: self.isolate,
            slot: self.slot,
        })
    }

    pub(crate) fn resolve_function(&self) -> Result<HostFunction> {
        let core = self.core()?;
        let heap = core.heap.lock();
        match heap.slot(self.slot) {
            Some(Slot::Function(function)) => Ok(Arc::clone(function)),
            Some(Slot::Globals(_)) => Err(Error::runtime("reference is not callable")),
            None => Err(Error::Disposed),
        }
    }
}

/// Enqueue a fire-and-forget bridge call on the host executor. The outcome
/// travels into a one-shot channel nobody awaits; errors are logged and
/// otherwise dropped.
pub(crate) fn dispatch_ignored(function: HostFunction, arguments: ApplyArguments) -> Result<()> {
    let dispatcher = host_dispatcher().map_err(|e| Error::Engine(e.into()))?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    dispatcher.dispatch(move || {
        let result = function(arguments);
        if let Err(error) = &result {
            tracing::warn!(%error, "ignored apply: host closure failed");
        }
        let _ = tx.send(result);
    });
    drop(rx);
    Ok(())
}

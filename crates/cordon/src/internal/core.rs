use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    internal::{
        accountant::HeapAccountant,
        heap::{Binding, ContextId, Heap, SlotHandle},
    },
    value::Value,
};

const STATE_ACTIVE: u8 = 0;
const STATE_POISONED: u8 = 1;
const STATE_DISPOSED: u8 = 2;

/// Shared, non-generic core of one isolate.
///
/// Contexts, scripts and references all hold (weak) handles to this and
/// re-check lifecycle state on every access, so nothing rooted in a disposed
/// isolate can touch freed state.
pub(crate) struct IsolateCore {
    pub id: u64,
    pub accountant: HeapAccountant,
    pub heap: Mutex<Heap>,
    state: AtomicU8,
    /// Interrupt of the run currently executing on the worker, if any.
    /// Disposal flags it so in-flight runs unwind promptly.
    active_interrupt: Mutex<Option<Arc<InterruptState>>>,
}

impl IsolateCore {
    pub fn new(id: u64, memory_ceiling: usize) -> Self {
        Self {
            id,
            accountant: HeapAccountant::new(memory_ceiling),
            heap: Mutex::new(Heap::new()),
            state: AtomicU8::new(STATE_ACTIVE),
            active_interrupt: Mutex::new(None),
        }
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => Ok(()),
            STATE_POISONED => Err(Error::Corrupted(anyhow::anyhow!(
                "isolate poisoned by an earlier unrecoverable fault"
            ))),
            _ => Err(Error::Disposed),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DISPOSED
    }

    /// Mark the isolate unrecoverable. Further runs fail with `Corrupted`
    /// until the host disposes it.
    pub fn poison(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_POISONED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to disposed. Returns `true` on the first call only.
    ///
    /// Flags the in-flight run (if any) before releasing the heap, so a
    /// concurrently executing evaluator observes the interrupt instead of
    /// operating on cleared state.
    pub fn dispose(&self) -> bool {
        let prior = self.state.swap(STATE_DISPOSED, Ordering::AcqRel);
        if prior == STATE_DISPOSED {
            return false;
        }

        if let Some(interrupt) = self.active_interrupt.lock().take() {
            interrupt.trigger(InterruptCause::Disposed);
        }

        self.heap.lock().clear();
        self.accountant.reset();
        tracing::debug!(isolate = self.id, "isolate disposed");
        true
    }

    pub fn set_active_interrupt(&self, interrupt: Option<Arc<InterruptState>>) {
        let mut slot = self.active_interrupt.lock();
        // Disposal may have raced us; never resurrect an interrupt slot on a
        // disposed isolate without flagging it.
        if let Some(interrupt) = &interrupt
            && self.is_disposed()
        {
            interrupt.trigger(InterruptCause::Disposed);
        }
        *slot = interrupt;
    }

    /// Install a materialized value under `key` in a context's global
    /// object, charging the accountant for its residency.
    pub fn global_set_value(&self, context: ContextId, key: &str, value: Value) -> HeapOpResult {
        let bytes = key.len() + value.byte_size();
        if !self.accountant.reserve(bytes) {
            return Err(HeapOpError::OutOfMemory);
        }
        let mut heap = self.heap.lock();
        let Some(globals) = heap.globals_mut(context) else {
            self.accountant.release(bytes);
            return Err(HeapOpError::Gone);
        };
        let previous = globals
            .entries
            .insert(key.to_string(), Binding::Value { value, bytes });
        drop(heap);
        self.release_binding(previous);
        Ok(())
    }

    /// Install a same-isolate alias binding (the `deref_into` path).
    pub fn global_set_alias(&self, context: ContextId, key: &str, slot: SlotHandle) -> HeapOpResult {
        let mut heap = self.heap.lock();
        let Some(globals) = heap.globals_mut(context) else {
            return Err(HeapOpError::Gone);
        };
        let previous = globals
            .entries
            .insert(key.to_string(), Binding::Alias { slot });
        drop(heap);
        self.release_binding(previous);
        Ok(())
    }

    pub fn global_get(&self, context: ContextId, key: &str) -> Result<Option<Binding>, HeapOpError> {
        let heap = self.heap.lock();
        let globals = heap.globals(context).ok_or(HeapOpError::Gone)?;
        Ok(globals.entries.get(key).cloned())
    }

    /// Remove a binding, releasing its accounted bytes. `Ok(true)` when the
    /// key existed.
    pub fn global_delete(&self, context: ContextId, key: &str) -> Result<bool, HeapOpError> {
        let mut heap = self.heap.lock();
        let globals = heap.globals_mut(context).ok_or(HeapOpError::Gone)?;
        let previous = globals.entries.remove(key);
        drop(heap);
        let existed = previous.is_some();
        self.release_binding(previous);
        Ok(existed)
    }

    fn release_binding(&self, binding: Option<Binding>) {
        if let Some(Binding::Value { bytes, .. }) = binding {
            self.accountant.release(bytes);
        }
    }
}

pub(crate) type HeapOpResult = Result<(), HeapOpError>;

/// Failure of a heap-level binding operation, mapped by callers onto either
/// the host [`Error`] taxonomy or a guest fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeapOpError {
    /// The accountant refused the reservation.
    OutOfMemory,
    /// The owning context vanished (isolate disposed mid-operation).
    Gone,
}

const CAUSE_NONE: u8 = 0;
const CAUSE_TIMEOUT: u8 = 1;
const CAUSE_DISPOSED: u8 = 2;

/// Cooperative cancellation flag shared between a run, the watchdog and
/// disposal. First trigger wins.
pub(crate) struct InterruptState {
    cause: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptCause {
    Timeout,
    Disposed,
}

impl InterruptState {
    pub const fn new() -> Self {
        Self {
            cause: AtomicU8::new(CAUSE_NONE),
        }
    }

    pub fn trigger(&self, cause: InterruptCause) {
        let raw = match cause {
            InterruptCause::Timeout => CAUSE_TIMEOUT,
            InterruptCause::Disposed => CAUSE_DISPOSED,
        };
        let _ = self
            .cause
            .compare_exchange(CAUSE_NONE, raw, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn cause(&self) -> Option<InterruptCause> {
        match self.cause.load(Ordering::Acquire) {
            CAUSE_TIMEOUT => Some(InterruptCause::Timeout),
            CAUSE_DISPOSED => Some(InterruptCause::Disposed),
            _ => None,
        }
    }
}

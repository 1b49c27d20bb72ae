use std::collections::HashMap;

use crate::{reference::HostFunction, value::Value};

pub(crate) type SlotHandle = u64;
pub(crate) type ContextId = u64;

/// One isolate's slot table plus per-context global objects.
///
/// The slot table is the indirection layer behind every [`Reference`]: a
/// reference never carries a pointer into the heap, only an opaque handle
/// that is re-resolved (and liveness-checked) on each access.
///
/// [`Reference`]: crate::reference::Reference
pub(crate) struct Heap {
    slots: HashMap<SlotHandle, Slot>,
    next_slot: SlotHandle,
    globals: HashMap<ContextId, GlobalObject>,
    next_context: ContextId,
}

pub(crate) enum Slot {
    /// Object-kind target: the global object of one context.
    Globals(ContextId),
    /// Function-kind target: a host closure reachable through the bridge.
    Function(HostFunction),
}

pub(crate) struct GlobalObject {
    pub entries: HashMap<String, Binding>,
}

/// One entry in a global object.
#[derive(Clone)]
pub(crate) enum Binding {
    /// Materialized value, charged `bytes` against the accountant while it
    /// stays resident.
    Value { value: Value, bytes: usize },
    /// Same-isolate alias produced by `deref_into`. Resolves to the live
    /// slot on every read; carries no accounting of its own.
    Alias { slot: SlotHandle },
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_slot: 1,
            globals: HashMap::new(),
            next_context: 1,
        }
    }

    fn allocate_slot(&mut self, slot: Slot) -> SlotHandle {
        let handle = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(handle, slot);
        handle
    }

    /// Create a fresh context with an empty global object and an Object-kind
    /// slot pointing at it.
    pub fn create_context(&mut self) -> (ContextId, SlotHandle) {
        let id = self.next_context;
        self.next_context += 1;
        let slot = self.allocate_slot(Slot::Globals(id));
        self.globals.insert(
            id,
            GlobalObject {
                entries: HashMap::new(),
            },
        );
        (id, slot)
    }

    pub fn register_function(&mut self, function: HostFunction) -> SlotHandle {
        self.allocate_slot(Slot::Function(function))
    }

    pub fn slot(&self, handle: SlotHandle) -> Option<&Slot> {
        self.slots.get(&handle)
    }

    pub fn globals(&self, context: ContextId) -> Option<&GlobalObject> {
        self.globals.get(&context)
    }

    pub fn globals_mut(&mut self, context: ContextId) -> Option<&mut GlobalObject> {
        self.globals.get_mut(&context)
    }

    /// Drop every slot and global object. Called on disposal; the caller
    /// resets the accountant alongside.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.globals.clear();
    }
}

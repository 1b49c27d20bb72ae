//! Execution contexts.
//!
//! A [`Context`] is one global-object environment inside an isolate. Several
//! contexts can share an isolate (and therefore its memory ceiling) while
//! keeping fully independent global objects. A context never outlives its
//! isolate: it holds only a weak handle and fails with
//! [`Error::Disposed`](crate::error::Error::Disposed) after teardown.

use std::sync::{Arc, Weak};

use crate::{
    error::{Error, Result},
    internal::{
        core::IsolateCore,
        heap::{ContextId, SlotHandle},
    },
    reference::{Reference, ReferenceKind},
};

#[derive(Clone)]
pub struct Context {
    core: Weak<IsolateCore>,
    isolate: u64,
    id: ContextId,
    global_slot: SlotHandle,
}

impl Context {
    pub(crate) fn new(core: &Arc<IsolateCore>, id: ContextId, global_slot: SlotHandle) -> Self {
        Self {
            core: Arc::downgrade(core),
            isolate: core.id,
            id,
            global_slot,
        }
    }

    /// Handle to this context's global object, usable from the host to
    /// install bindings.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] after the isolate is torn down.
    pub fn global(&self) -> Result<Reference> {
        let core = self.core()?;
        Ok(Reference::new(&core, self.global_slot, ReferenceKind::Object))
    }

    #[must_use]
    pub const fn isolate_id(&self) -> u64 {
        self.isolate
    }

    pub(crate) const fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn core(&self) -> Result<Arc<IsolateCore>> {
        let core = self.core.upgrade().ok_or(Error::Disposed)?;
        core.ensure_active()?;
        Ok(core)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("isolate", &self.isolate)
            .field("id", &self.id)
            .finish()
    }
}

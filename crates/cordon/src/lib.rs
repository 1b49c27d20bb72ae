//! Sandboxed script execution with hard memory boundaries.
//!
//! cordon runs untrusted code inside isolated, memory-accounted heaps
//! ("isolates") while exposing a narrow, explicitly marshaled bridge to host
//! functionality. Values never alias live memory across the host/guest
//! boundary: the only cross-heap paths are [`Reference`] (opaque,
//! capability-gated) and [`ExternalCopy`] (deep, disconnected clone).
//!
//! Typical flow:
//! 1. Implement [`Evaluator`] for your script language (or bring one).
//! 2. Create an [`Isolate`] with a memory ceiling, then a [`Context`].
//! 3. Bind host capabilities into the context's global object via
//!    [`Reference`] / [`ExternalCopy`].
//! 4. Compile and run [`Script`]s, blocking or with [`Script::spawn`].

mod internal;

pub mod context;
pub mod error;
pub mod evaluator;
pub mod external_copy;
pub mod isolate;
pub mod reference;
pub mod script;
pub mod value;

/// Tracing target used for per-run spans and run failures.
pub const TRACE_TARGET_RUN: &str = "cordon::run";

pub use context::Context;
pub use error::{BoxError, CompileError, Error, Result, SourcePosition};
pub use evaluator::{EvalFault, Evaluator, Scope};
pub use external_copy::ExternalCopy;
pub use isolate::{Isolate, IsolateOptions};
pub use reference::{
    ApplyArguments, ApplyOptions, HostFunction, Local, Reference, ReferenceKind, Transferable,
};
pub use script::{PendingRun, RunOptions, Script};
pub use value::Value;

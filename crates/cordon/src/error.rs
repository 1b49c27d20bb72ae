use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Type-erased error returned by embedder-supplied host closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Source location reported by the evaluator for malformed scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

/// Compilation failure. Produced by the evaluator collaborator; compiling a
/// script never mutates isolate state, so a failed compile leaves everything
/// as it was.
#[derive(Error, Debug, Clone)]
#[error("compile error: {message}")]
pub struct CompileError {
    pub message: String,
    pub position: Option<SourcePosition>,
}

impl CompileError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }

    #[must_use]
    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            position: Some(SourcePosition { line, column }),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed source rejected by the evaluator.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Guest-level thrown error. The isolate is unaffected.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// A guest allocation would have crossed the isolate's memory ceiling.
    /// Terminates the current run only.
    #[error("out of memory: isolate ceiling of {ceiling} bytes exceeded")]
    OutOfMemory { ceiling: usize },

    /// Wall-clock budget exceeded; the run was aborted cooperatively.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Operation against a disposed isolate, or against a context, script or
    /// reference rooted in one.
    #[error("isolate disposed")]
    Disposed,

    /// Script and context belong to different isolates.
    #[error("script and context belong to different isolates")]
    CrossIsolate,

    /// Attempt to dereference a reference into a heap it does not own.
    #[error("reference cannot be dereferenced outside its owning isolate")]
    CrossHeapDeref,

    /// Value has no detached clone representation (it holds a live
    /// reference). Raised at the marshaling boundary, never mid-call.
    #[error("value has no clonable representation")]
    NotClonable,

    /// Missing key on a get against an object reference.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Unrecoverable internal state. The isolate is poisoned and must be
    /// disposed by the host before anything rooted in it can be trusted.
    #[error("isolate corrupted: {0}")]
    Corrupted(#[source] anyhow::Error),

    /// Host closure invoked through the bridge returned an error.
    #[error("host error: {0}")]
    Host(#[source] BoxError),

    /// Engine-internal failure (thread spawn, payload decode).
    #[error("engine error: {0}")]
    Engine(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

//! Error types for the Rose VM crate.
//!
//! Mirrors the two failure channels of the interpreter: compile errors
//! (reported by the external compiler) and runtime errors (raised by the
//! dispatch loop and unwound to the driver with a rendered backtrace).

use thiserror::Error;

/// Top-level result type returned by every fallible engine operation.
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can escape [`crate::vm::Vm::interpret`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// The external compiler failed to produce a `Function`.
    #[error("compile error: {0}")]
    Compile(String),

    /// A runtime fault raised from the dispatch loop. `backtrace` lists
    /// frames innermost-first, by closure name (or `"script"` for the
    /// top frame).
    #[error("{message}")]
    Runtime {
        message: String,
        backtrace: Vec<String>,
    },

    /// Fatal I/O failure while resolving an `INCLUDE`/`IMPORT` source file.
    #[error("I/O error: {0}")]
    Io(String),
}

impl VmError {
    /// Renders `message` followed by an indented call stack, innermost
    /// frame first, the way the reference driver prints an uncaught
    /// runtime fault to stderr.
    pub fn render(&self) -> String {
        match self {
            VmError::Runtime { message, backtrace } => {
                let mut out = message.clone();
                for frame in backtrace {
                    out.push_str("\n  at ");
                    out.push_str(frame);
                }
                out
            }
            other => other.to_string(),
        }
    }
}

impl VmError {
    pub fn compile(message: impl Into<String>) -> Self {
        VmError::Compile(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        VmError::Io(message.into())
    }
}

/// A runtime fault message in flight inside the dispatch loop, before it has
/// been paired with a backtrace. Instruction handlers return this; the run
/// loop captures it, renders the call stack, and converts it into a
/// [`VmError::Runtime`].
#[derive(Debug, Clone)]
pub(crate) struct RuntimeFault(pub String);

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeFault(message.into())
    }
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type used internally by opcode handlers, before a backtrace has
/// been attached.
pub(crate) type OpResult<T> = Result<T, RuntimeFault>;

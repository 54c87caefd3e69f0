//! `rose-vm`: the bytecode virtual machine core for the Rose scripting
//! language (§1 PURPOSE & SCOPE).
//!
//! This crate is the execution engine only: a stack-based bytecode
//! interpreter with closures, single-inheritance classes, a tagged value
//! representation with automatic string interning, and a mark-and-sweep
//! collector integrated with every allocation path. The lexer, parser,
//! compiler, native library packs, dynamic-library loader, and REPL driver
//! are external collaborators — represented here only by the
//! [`compiler::Compiler`] and [`resolver::SourceResolver`] traits and the
//! [`object::native_fn::NativeFn`] calling convention (§A of
//! SPEC_FULL.md).

pub mod builder;
pub mod chunk;
pub mod compiler;
pub mod config;
pub mod error;
pub mod heap;
pub mod intern;
pub mod native;
pub mod object;
pub mod op_code;
pub mod resolver;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::Chunk;
pub use compiler::Compiler;
pub use config::VmLimits;
pub use error::{VmError, VmResult};
pub use object::FunctionObj as CompiledFunction;
pub use resolver::SourceResolver;
pub use value::Value;
pub use vm::Vm;

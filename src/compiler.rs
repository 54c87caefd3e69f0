//! The external-compiler seam (§1, §6): this crate only needs a `Function`
//! shaped the way §3 describes — it has no opinion on lexing, parsing, or
//! code generation.

use crate::error::VmResult;
use crate::heap::Heap;
use crate::object::FunctionObj;

/// What `interpret`/`INCLUDE`/`IMPORT` need from a front end: turn source
/// text into a top-level [`FunctionObj`] (§6 `interpret`). A real lexer,
/// parser, and code generator live outside this crate; tests instead build
/// `FunctionObj`/`Chunk` values directly with [`crate::builder::ChunkBuilder`].
///
/// `compile` takes the VM's `Heap` because producing a `FunctionObj` means
/// interning at least the function's own name and every string constant in
/// its chunk (§3 invariant 2 applies to compiler-produced strings too) —
/// there is no other way to mint a canonical `ObjRef` a real front end
/// could hand back.
pub trait Compiler {
    /// Compiles `source` (whose logical name is `chunk_name`, used for
    /// diagnostics and the produced function's `name`) into a callable
    /// top-level function. `is_package` / `exe_dir` / `source_dir` are
    /// stashed by the compiler into the produced chunk's first three
    /// constant slots (§6 "Chunk binary layout"), so nested `INCLUDE`/
    /// `IMPORT` inside the compiled source resolve against them.
    fn compile(
        &self,
        heap: &mut Heap,
        source: &str,
        chunk_name: &str,
        is_package: bool,
        exe_dir: &str,
        source_dir: &str,
    ) -> VmResult<FunctionObj>;
}

/// Placeholder compiler for a [`crate::vm::Vm`] that was never handed a
/// real front end. `INCLUDE`/`IMPORT` against such a VM fail with a
/// `CompileError` rather than panicking.
pub struct NoCompiler;

impl Compiler for NoCompiler {
    fn compile(
        &self,
        _heap: &mut Heap,
        _source: &str,
        chunk_name: &str,
        _is_package: bool,
        _exe_dir: &str,
        _source_dir: &str,
    ) -> VmResult<FunctionObj> {
        Err(crate::error::VmError::compile(format!(
            "no compiler registered to build '{chunk_name}'"
        )))
    }
}

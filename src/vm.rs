//! The VM core (§4.1, §4.6, §4.7): value stack, frame stack, open-upvalue
//! list, globals, and the decode/dispatch loop.
//!
//! Deliberate rewrite decision (recorded in `DESIGN.md`): the C original
//! checks `bytes_allocated > next_gc` inside every individual `reallocate`
//! call, so a single bytecode instruction that allocates more than once
//! (e.g. `ADD` on two strings, which interns the concatenation) can in
//! principle collect mid-instruction, while a result it just computed sits
//! in a C local rather than on the value stack. This crate instead checks
//! once per *instruction*, at the top of the dispatch loop, before the
//! instruction has touched the stack: every live value is then either on
//! the value stack, in a reachable frame/closure, in `open_upvalues`, or in
//! `globals` — the rooting invariant §4.5 requires always holds at that
//! point, so collecting there can never free something still needed. This
//! is stricter than the original's hook but observably identical (§8 GC
//! safety): nothing reachable is ever collected either way.

use std::io::Write;

use crate::compiler::{Compiler, NoCompiler};
use crate::config::VmLimits;
use crate::error::{OpResult, RuntimeFault, VmError, VmResult};
use crate::heap::Heap;
use crate::native::NativeRegistry;
use crate::object::native_fn::NativeFn;
use crate::object::{
    BoundMethodObj, ClosureObj, FunctionObj, InstanceObj, NativeFnObj, ObjData, UpvalueObj,
    UpvalueState,
};
use crate::op_code::OpCode;
use crate::resolver::SourceResolver;
use crate::table::Table;
use crate::value::{ObjRef, Value};

/// An activation record (§4.1): the running closure, the instruction
/// pointer (a byte offset into that closure's function's chunk), and the
/// base slot of this frame within the value stack.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

enum Flow {
    Continue,
    Halt,
}

/// Owns every piece of state a single interpretation needs: the value and
/// frame stacks, the open-upvalue list, globals, the heap (which in turn
/// owns the string intern table), and the pluggable compiler/resolver
/// collaborators (§9 Design Notes, "Global VM singleton" — no two `Vm`
/// values share state).
pub struct Vm {
    stack: Vec<Value>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<ObjRef>,
    globals: Table,
    heap: Heap,
    construct_name: ObjRef,
    destruct_name: ObjRef,
    resolver: Box<dyn SourceResolver>,
    compiler: Box<dyn Compiler>,
    limits: VmLimits,
    output: Box<dyn Write>,
}

/// A resolver that refuses every include/import; the default for a `Vm`
/// built with [`Vm::new`] when the embedder has not supplied one.
struct NoResolver;

impl SourceResolver for NoResolver {
    fn resolve_include(&self, _current_dir: &str, path: &str) -> VmResult<(String, String)> {
        Err(VmError::io(format!("no source resolver registered to include '{path}'")))
    }

    fn resolve_import(&self, _exe_dir: &str, package: &str) -> VmResult<(String, String)> {
        Err(VmError::io(format!("no source resolver registered to import '{package}'")))
    }
}

impl Vm {
    /// `init_vm()` (§6): allocates the value/frame stacks, interns the
    /// distinguished `construct`/`destruct` names, and sets up empty
    /// globals. No native functions are registered here — call
    /// [`Vm::register_library`]/[`Vm::define_native`] afterwards, the way
    /// the reference driver calls into `library_runtime.c` after
    /// `initVM()`.
    pub fn new(limits: VmLimits) -> Self {
        let mut heap = Heap::new(limits);
        let construct_name = heap.intern_str("construct");
        let destruct_name = heap.intern_str("destruct");
        Vm {
            stack: vec![Value::Nil; limits.value_stack_size()],
            stack_top: 0,
            frames: Vec::with_capacity(limits.max_frames),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            heap,
            construct_name,
            destruct_name,
            resolver: Box::new(NoResolver),
            compiler: Box::new(NoCompiler),
            limits,
            output: Box::new(std::io::stdout()),
        }
    }

    pub fn with_resolver(mut self, resolver: impl SourceResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    /// Redirects `PRINT` output away from stdout (tests capture a `Vec<u8>`
    /// this way instead of scraping the process's real stdout).
    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    /// Forces a collection before every allocation (§4.5 "stress-GC
    /// enabled unconditionally"), used by GC-safety tests.
    pub fn set_stress_gc(&mut self, enabled: bool) {
        self.heap.stress_gc = enabled;
    }

    /// Exposes the heap so external tests can drive [`crate::builder::ChunkBuilder`]
    /// against the same `Heap` a `Vm` will run against, the way [`crate::resolver::MemoryResolver`]
    /// is exposed for integration tests that can't reach `#[cfg(test)]` items directly.
    #[cfg(any(test, feature = "test-support"))]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn heap_bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn heap_objects_live(&self) -> usize {
        self.heap.objects_live()
    }

    pub fn intern_str(&mut self, s: &str) -> ObjRef {
        self.heap.intern_str(s)
    }

    /// `define_native(name, fn)` (§6): interns `name`, wraps `func` as a
    /// `NativeFn` object, and installs it in globals.
    pub fn define_native(&mut self, name: &str, func: NativeFn) {
        let name_ref = self.heap.intern_str(name);
        let native_ref = self
            .heap
            .alloc(ObjData::NativeFn(NativeFnObj::new(name_ref, func)));
        self.globals.set(name_ref, Value::Obj(native_ref));
    }

    /// `define_global(name, value)` (§6).
    pub fn define_global(&mut self, name: &str, value: Value) {
        let name_ref = self.heap.intern_str(name);
        self.globals.set(name_ref, value);
    }

    /// Installs every entry of `registry`, namespacing names the way the
    /// original source's static library tables do (§C of SPEC_FULL.md).
    pub fn register_library(&mut self, registry: &NativeRegistry) {
        for entry in registry.entries() {
            let qualified = registry.qualified_name(entry.name);
            self.define_native(&qualified, entry.func);
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    pub fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn reset_stacks(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// `interpret(source, script_dir, exe_dir)` (§6): compiles `source`
    /// through the registered [`Compiler`], wraps the result in a
    /// `Closure`, pushes it as frame 0, and runs. Calling this twice on the
    /// same `Vm` preserves `globals` and the intern table across calls —
    /// only the value/frame stacks reset (§C of SPEC_FULL.md, the REPL
    /// property) — matching §7's note that the heap survives a runtime
    /// error because the next `interpret` call may reuse it.
    pub fn interpret(&mut self, source: &str, script_dir: &str, exe_dir: &str) -> VmResult<()> {
        let function = self
            .compiler
            .compile(&mut self.heap, source, "script", false, exe_dir, script_dir)?;
        self.interpret_function(function)
    }

    /// Runs an already-compiled top-level function directly — the entry
    /// point tests use with [`crate::builder::ChunkBuilder`] output instead
    /// of a real front end.
    pub fn interpret_function(&mut self, function: FunctionObj) -> VmResult<()> {
        self.reset_stacks();
        let function_ref = self.heap.alloc(ObjData::Function(function));
        let closure_ref = self.heap.alloc(ObjData::Closure(ClosureObj::new(
            function_ref,
            Box::new([]),
        )));
        self.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base: 0,
        });
        self.run()
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // ---- bytecode reads -------------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch loop requires an active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let closure_ref = self.current_frame().closure;
        let ip = self.frames.last().unwrap().ip;
        self.frames.last_mut().unwrap().ip += 1;
        closure_ref.as_closure().function.as_function().chunk.read_u8(ip)
    }

    fn read_u32_le(&mut self) -> u32 {
        let closure_ref = self.current_frame().closure;
        let ip = self.frames.last().unwrap().ip;
        self.frames.last_mut().unwrap().ip += 4;
        closure_ref
            .as_closure()
            .function
            .as_function()
            .chunk
            .read_u32_le(ip)
    }

    fn read_u16_be(&mut self) -> u16 {
        let closure_ref = self.current_frame().closure;
        let ip = self.frames.last().unwrap().ip;
        self.frames.last_mut().unwrap().ip += 2;
        closure_ref
            .as_closure()
            .function
            .as_function()
            .chunk
            .read_u16_be(ip)
    }

    fn read_constant(&self, idx: u32) -> Value {
        let closure_ref = self.current_frame().closure;
        closure_ref.as_closure().function.as_function().chunk.constants[idx as usize]
    }

    fn read_name(&mut self) -> ObjRef {
        let idx = self.read_u32_le();
        self.read_constant(idx)
            .as_obj()
            .expect("name constants are always strings")
    }

    // ---- main loop --------------------------------------------------

    fn run(&mut self) -> VmResult<()> {
        loop {
            self.maybe_collect();
            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(b) => return Err(self.runtime_error(format!("unknown opcode {b}"))),
            };
            match self.execute(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return Ok(()),
                Err(fault) => return Err(self.runtime_error(fault.0)),
            }
        }
    }

    fn execute(&mut self, op: OpCode) -> OpResult<Flow> {
        match op {
            OpCode::ConstantLong => {
                let idx = self.read_u32_le();
                let v = self.read_constant(idx);
                self.push(v);
            }
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()));
            }
            OpCode::Negate => {
                let v = self.peek(0);
                match v.as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(RuntimeFault::new("Operand must be a number.")),
                }
            }
            OpCode::Add => self.op_add()?,
            OpCode::Subtract => self.numeric_binop(|a, b| Value::Number(a - b))?,
            OpCode::Multiply => self.numeric_binop(|a, b| Value::Number(a * b))?,
            OpCode::Divide => self.numeric_binop(|a, b| Value::Number(a / b))?,
            OpCode::Greater => self.numeric_binop(|a, b| Value::Bool(a > b))?,
            OpCode::Less => self.numeric_binop(|a, b| Value::Bool(a < b))?,
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            OpCode::Print => {
                let v = self.pop();
                let _ = writeln!(self.output, "{v}");
            }
            OpCode::Pop => {
                self.pop();
            }
            OpCode::DefineGlobal => {
                let name = self.read_name();
                let value = self.pop();
                self.globals.set(name, value);
            }
            OpCode::GetGlobal => {
                let name = self.read_name();
                match self.globals.get(name) {
                    Some(v) => self.push(v),
                    None => {
                        return Err(RuntimeFault::new(format!(
                            "Undefined global variable '{}'.",
                            display_name(name)
                        )))
                    }
                }
            }
            OpCode::SetGlobal => {
                let name = self.read_name();
                let value = self.peek(0);
                if self.globals.set(name, value) {
                    self.globals.delete(name);
                    return Err(RuntimeFault::new(format!(
                        "Undefined global variable '{}'.",
                        display_name(name)
                    )));
                }
            }
            OpCode::GetLocal => {
                let slot = self.read_u32_le() as usize;
                let base = self.current_frame().base;
                self.push(self.stack[base + slot]);
            }
            OpCode::SetLocal => {
                let slot = self.read_u32_le() as usize;
                let base = self.current_frame().base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16_be();
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Jump => {
                let offset = self.read_u16_be();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::Loop => {
                let offset = self.read_u16_be();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            OpCode::Call => {
                let argc = self.read_byte();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            OpCode::Closure => self.op_closure()?,
            OpCode::GetUpvalue => {
                let idx = self.read_byte() as usize;
                let closure_ref = self.current_frame().closure;
                let uv = closure_ref.as_closure().upvalues[idx];
                let value = match uv.as_upvalue().state.get() {
                    UpvalueState::Open(slot) => self.stack[slot],
                    UpvalueState::Closed(v) => v,
                };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let idx = self.read_byte() as usize;
                let value = self.peek(0);
                let closure_ref = self.current_frame().closure;
                let uv = closure_ref.as_closure().upvalues[idx];
                match uv.as_upvalue().state.get() {
                    UpvalueState::Open(slot) => self.stack[slot] = value,
                    UpvalueState::Closed(_) => uv.as_upvalue().state.set(UpvalueState::Closed(value)),
                }
            }
            OpCode::CloseUpvalue => {
                let slot = self.stack_top - 1;
                self.close_upvalues(slot);
                self.pop();
            }
            OpCode::Class => {
                let name = self.read_name();
                let class_ref = self
                    .heap
                    .alloc(ObjData::Class(crate::object::ClassObj::new(name)));
                self.push(Value::Obj(class_ref));
            }
            OpCode::GetProperty => self.op_get_property()?,
            OpCode::SetProperty => self.op_set_property()?,
            OpCode::Method => {
                let name = self.read_name();
                let method = self.pop();
                let class_val = self.peek(0);
                let class_ref = class_val.as_obj().expect("METHOD target must be a class");
                class_ref.as_class().methods.borrow_mut().set(name, method);
            }
            OpCode::Invoke => self.op_invoke()?,
            OpCode::Inherit => self.op_inherit()?,
            OpCode::GetSuper => {
                let name = self.read_name();
                let superclass_val = self.pop();
                let superclass = superclass_val
                    .as_obj()
                    .filter(|r| r.is_class())
                    .ok_or_else(|| RuntimeFault::new("Superclass must be a class."))?;
                self.bind_method(superclass, name)?;
            }
            OpCode::SuperInvoke => {
                let name = self.read_name();
                let argc = self.read_byte();
                let superclass_val = self.pop();
                let superclass = superclass_val
                    .as_obj()
                    .filter(|r| r.is_class())
                    .ok_or_else(|| RuntimeFault::new("Superclass must be a class."))?;
                self.invoke_from_class(superclass, name, argc)?;
            }
            OpCode::Array => self.op_array()?,
            OpCode::Import => self.op_import()?,
            OpCode::Include => self.op_include()?,
            OpCode::Return => {
                let result = self.pop();
                let base = self.current_frame().base;
                self.close_upvalues(base);
                self.frames.pop();
                if self.frames.is_empty() {
                    self.stack_top = base;
                    return Ok(Flow::Halt);
                }
                self.stack_top = base;
                self.push(result);
            }
        }
        Ok(Flow::Continue)
    }

    fn numeric_binop(&mut self, f: impl Fn(f64, f64) -> Value) -> OpResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(an), Some(bn)) => {
                self.pop();
                self.pop();
                self.push(f(an, bn));
                Ok(())
            }
            _ => Err(RuntimeFault::new("Operands must be numbers.")),
        }
    }

    fn op_add(&mut self) -> OpResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_string() && b.is_string() {
            // Both operands still rooted on the stack (peeked, not
            // popped) — safe to check for collection before allocating
            // the concatenation (see module doc comment).
            self.maybe_collect();
            let b = self.pop().as_obj().unwrap();
            let a = self.pop().as_obj().unwrap();
            let result = self.heap.concat_strings(a, b);
            self.push(Value::Obj(result));
            Ok(())
        } else if a.is_number() && b.is_number() {
            self.pop();
            self.pop();
            self.push(Value::Number(a.as_number().unwrap() + b.as_number().unwrap()));
            Ok(())
        } else {
            Err(RuntimeFault::new(
                "Operands must be two numbers or two strings.",
            ))
        }
    }

    fn op_closure(&mut self) -> OpResult<()> {
        let idx = self.read_u32_le();
        let function_val = self.read_constant(idx);
        let function_ref = function_val
            .as_obj()
            .expect("CLOSURE operand must be a function constant");
        let upvalue_count = function_ref.as_function().upvalue_count;
        let base = self.current_frame().base;
        let enclosing = self.current_frame().closure;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let uv = if is_local {
                self.capture_upvalue(base + index)
            } else {
                enclosing.as_closure().upvalues[index]
            };
            upvalues.push(uv);
        }
        let closure_ref = self.heap.alloc(ObjData::Closure(ClosureObj::new(
            function_ref,
            upvalues.into_boxed_slice(),
        )));
        self.push(Value::Obj(closure_ref));
        Ok(())
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &uv in &self.open_upvalues {
            if matches!(uv.as_upvalue().state.get(), UpvalueState::Open(s) if s == slot) {
                return uv;
            }
        }
        let new_ref = self.heap.alloc(ObjData::Upvalue(UpvalueObj::new_open(slot)));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&uv| match uv.as_upvalue().state.get() {
                UpvalueState::Open(s) => s < slot,
                UpvalueState::Closed(_) => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, new_ref);
        new_ref
    }

    /// Closes every open upvalue pointing at or above `from_slot` (§4.6
    /// `CLOSE_UPVALUE`, `RETURN`). `open_upvalues` is kept in strictly
    /// decreasing slot order (§3 invariant 4), so the upvalues to close are
    /// always a prefix of the list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = match first.as_upvalue().state.get() {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => unreachable!("open_upvalues holds only open upvalues"),
            };
            if slot < from_slot {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[slot];
            first.as_upvalue().close(value);
        }
    }

    fn op_get_property(&mut self) -> OpResult<()> {
        let name = self.read_name();
        let receiver = self.peek(0);
        let inst_ref = receiver
            .as_obj()
            .filter(|r| r.is_instance())
            .ok_or_else(|| RuntimeFault::new("Only instances have properties."))?;
        let field = inst_ref.as_instance().fields.borrow().get(name);
        if let Some(v) = field {
            self.pop();
            self.push(v);
            Ok(())
        } else {
            let class = inst_ref.as_instance().class;
            self.bind_method(class, name)
        }
    }

    fn op_set_property(&mut self) -> OpResult<()> {
        let name = self.read_name();
        let receiver = self.peek(1);
        let inst_ref = receiver
            .as_obj()
            .filter(|r| r.is_instance())
            .ok_or_else(|| RuntimeFault::new("Only instances have fields."))?;
        let value = self.peek(0);
        inst_ref.as_instance().fields.borrow_mut().set(name, value);
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `bind_method` (§4.6): looks up `name` in `class`'s method table and
    /// pushes a `BoundMethod` over the receiver currently at the top of the
    /// stack, replacing it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> OpResult<()> {
        let method = class.as_class().methods.borrow().get(name);
        match method {
            Some(Value::Obj(method_ref)) => {
                let receiver = self.peek(0);
                self.maybe_collect();
                let bm = self
                    .heap
                    .alloc(ObjData::BoundMethod(BoundMethodObj::new(receiver, method_ref)));
                self.pop();
                self.push(Value::Obj(bm));
                Ok(())
            }
            _ => Err(RuntimeFault::new(format!(
                "Undefined property '{}'.",
                display_name(name)
            ))),
        }
    }

    fn op_invoke(&mut self) -> OpResult<()> {
        let name = self.read_name();
        let argc = self.read_byte();
        let receiver = self.peek(argc as usize);
        let inst_ref = receiver
            .as_obj()
            .filter(|r| r.is_instance())
            .ok_or_else(|| RuntimeFault::new("Only instances have methods."))?;
        let field = inst_ref.as_instance().fields.borrow().get(name);
        if let Some(value) = field {
            let slot = self.stack_top - argc as usize - 1;
            self.stack[slot] = value;
            self.call_value(value, argc)
        } else {
            let class = inst_ref.as_instance().class;
            self.invoke_from_class(class, name, argc)
        }
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> OpResult<()> {
        let method = class.as_class().methods.borrow().get(name);
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, argc),
            _ => Err(RuntimeFault::new(format!(
                "Undefined property '{}'.",
                display_name(name)
            ))),
        }
    }

    fn op_inherit(&mut self) -> OpResult<()> {
        let superclass_val = self.peek(1);
        let superclass = superclass_val
            .as_obj()
            .filter(|r| r.is_class())
            .ok_or_else(|| RuntimeFault::new("Superclass must be a class."))?;
        let subclass_val = self.peek(0);
        let subclass = subclass_val
            .as_obj()
            .filter(|r| r.is_class())
            .expect("INHERIT target must be a class");
        superclass
            .as_class()
            .methods
            .borrow()
            .add_all(&mut subclass.as_class().methods.borrow_mut());
        self.pop();
        Ok(())
    }

    fn op_array(&mut self) -> OpResult<()> {
        let count_val = self.pop();
        let count = count_val.as_number().expect("ARRAY count must be a number") as usize;
        self.maybe_collect();
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.pop());
        }
        items.reverse();
        let array_ref = self
            .heap
            .alloc(ObjData::Array(crate::object::ArrayObj::new(items)));
        self.push(Value::Obj(array_ref));
        Ok(())
    }

    // ---- calling ------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> OpResult<()> {
        let Some(obj) = callee.as_obj() else {
            return Err(RuntimeFault::new("Can only call functions and classes."));
        };
        match &obj.as_obj().data {
            ObjData::Closure(_) => self.call_closure(obj, argc),
            ObjData::Class(_) => self.call_class(obj, argc),
            ObjData::BoundMethod(_) => self.call_bound_method(obj, argc),
            ObjData::NativeFn(_) => self.call_native(obj, argc),
            _ => Err(RuntimeFault::new("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> OpResult<()> {
        let function = closure_ref.as_closure().function.as_function();
        if argc != function.arity {
            return Err(RuntimeFault::new(format!(
                "Expected {} arguments but got {}.",
                function.arity, argc
            )));
        }
        if self.frames.len() >= self.limits.max_frames {
            return Err(RuntimeFault::new("Stack overflow."));
        }
        let base = self.stack_top - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: u8) -> OpResult<()> {
        self.maybe_collect();
        let instance_ref = self
            .heap
            .alloc(ObjData::Instance(InstanceObj::new(class_ref)));
        let slot = self.stack_top - argc as usize - 1;
        self.stack[slot] = Value::Obj(instance_ref);
        let ctor = class_ref.as_class().methods.borrow().get(self.construct_name);
        match ctor {
            Some(Value::Obj(ctor_ref)) => self.call_closure(ctor_ref, argc),
            _ if argc == 0 => Ok(()),
            _ => Err(RuntimeFault::new(format!(
                "Expected 0 arguments but got {argc}."
            ))),
        }
    }

    fn call_bound_method(&mut self, bound_ref: ObjRef, argc: u8) -> OpResult<()> {
        let bound = bound_ref.as_bound_method();
        let slot = self.stack_top - argc as usize - 1;
        self.stack[slot] = bound.receiver;
        self.call_closure(bound.method, argc)
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: u8) -> OpResult<()> {
        let func = native_ref.as_native_fn().func;
        let start = self.stack_top - argc as usize;
        let argv: Vec<Value> = self.stack[start..self.stack_top].to_vec();
        let result = func(self, &argv);
        self.stack_top = start - 1;
        self.push(result);
        Ok(())
    }

    // ---- module loading (§4.6 INCLUDE/IMPORT) --------------------------

    /// Reads the `[is_package, exe_dir, source_dir]` metadata contract
    /// (§6 "Chunk binary layout") out of the currently executing function's
    /// constant pool.
    fn current_source_context(&self) -> (String, String) {
        let function = self.current_frame().closure.as_closure().function.as_function();
        let exe_dir = function
            .chunk
            .constants
            .get(1)
            .and_then(|v| v.as_obj())
            .map(obj_to_string)
            .unwrap_or_default();
        let source_dir = function
            .chunk
            .constants
            .get(2)
            .and_then(|v| v.as_obj())
            .map(obj_to_string)
            .unwrap_or_default();
        (exe_dir, source_dir)
    }

    fn load_and_call(
        &mut self,
        source: String,
        chunk_name: &str,
        is_package: bool,
        exe_dir: &str,
        new_dir: &str,
    ) -> OpResult<()> {
        // No `maybe_collect()` between `compile()` returning and `function`
        // being wrapped/pushed below: a real `Compiler` interns strings and
        // constants into this same heap while compiling, so until `function`
        // is wrapped in a Closure and pushed onto the value stack, those
        // objects are linked into the allocation list but reachable from no
        // root. Collecting here would sweep them out from under `function`.
        // The checkpoint at the top of `run()`'s loop already covers the
        // steady state once this frame is active.
        let function = self
            .compiler
            .compile(&mut self.heap, &source, chunk_name, is_package, exe_dir, new_dir)
            .map_err(|e| RuntimeFault::new(e.to_string()))?;
        let function_ref = self.heap.alloc(ObjData::Function(function));
        let closure_ref = self.heap.alloc(ObjData::Closure(ClosureObj::new(
            function_ref,
            Box::new([]),
        )));
        self.push(Value::Obj(closure_ref));
        self.call_closure(closure_ref, 0)
    }

    fn op_include(&mut self) -> OpResult<()> {
        let path_val = self.pop();
        let path_ref = path_val
            .as_obj()
            .filter(|r| matches!(r.as_obj().data, ObjData::String(_)))
            .ok_or_else(|| RuntimeFault::new("INCLUDE operand must be a string."))?;
        let path = obj_to_string(path_ref);
        let (exe_dir, source_dir) = self.current_source_context();
        let (source, new_dir) = self
            .resolver
            .resolve_include(&source_dir, &path)
            .map_err(|e| RuntimeFault::new(e.to_string()))?;
        self.load_and_call(source, &path, false, &exe_dir, &new_dir)
    }

    fn op_import(&mut self) -> OpResult<()> {
        let name_val = self.pop();
        let name_ref = name_val
            .as_obj()
            .filter(|r| matches!(r.as_obj().data, ObjData::String(_)))
            .ok_or_else(|| RuntimeFault::new("IMPORT operand must be a string."))?;
        let package = obj_to_string(name_ref);
        let (exe_dir, _source_dir) = self.current_source_context();
        let (source, new_dir) = self
            .resolver
            .resolve_import(&exe_dir, &package)
            .map_err(|e| RuntimeFault::new(e.to_string()))?;
        self.load_and_call(source, &package, true, &exe_dir, &new_dir)
    }

    // ---- errors ---------------------------------------------------------

    /// Renders the message plus an innermost-first backtrace (§4.8, §7),
    /// then resets the value/frame/open-upvalue stacks (globals and the
    /// heap survive, so a REPL can keep going, §C of SPEC_FULL.md).
    fn runtime_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        let mut backtrace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_closure().function.as_function();
            let line = function.chunk.line_of(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(n) => obj_to_string(n),
                None => "script".to_string(),
            };
            backtrace.push(format!("[line {line}] in {name}"));
        }
        log::warn!("runtime error: {message}");
        self.reset_stacks();
        VmError::Runtime { message, backtrace }
    }

    // ---- garbage collection (§4.5) --------------------------------------

    fn mark_value(value: Value, gray: &mut Vec<ObjRef>, heap: &Heap) {
        if let Value::Obj(r) = value {
            Self::mark_object(r, gray, heap);
        }
    }

    fn mark_object(r: ObjRef, gray: &mut Vec<ObjRef>, heap: &Heap) {
        if heap.mark(r) {
            gray.push(r);
        }
    }

    fn mark_table(table: &Table, gray: &mut Vec<ObjRef>, heap: &Heap) {
        for (k, v) in table.iter() {
            Self::mark_object(k, gray, heap);
            Self::mark_value(v, gray, heap);
        }
    }

    fn blacken_object(r: ObjRef, gray: &mut Vec<ObjRef>, heap: &Heap) {
        match &r.as_obj().data {
            ObjData::String(_) | ObjData::NativeFn(_) => {}
            ObjData::Function(f) => {
                if let Some(name) = f.name {
                    Self::mark_object(name, gray, heap);
                }
                for c in &f.chunk.constants {
                    Self::mark_value(*c, gray, heap);
                }
            }
            ObjData::Closure(c) => {
                Self::mark_object(c.function, gray, heap);
                for &uv in c.upvalues.iter() {
                    Self::mark_object(uv, gray, heap);
                }
            }
            ObjData::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state.get() {
                    Self::mark_value(v, gray, heap);
                }
            }
            ObjData::Class(c) => {
                Self::mark_object(c.name, gray, heap);
                Self::mark_table(&c.methods.borrow(), gray, heap);
            }
            ObjData::Instance(i) => {
                Self::mark_object(i.class, gray, heap);
                Self::mark_table(&i.fields.borrow(), gray, heap);
            }
            ObjData::BoundMethod(b) => {
                Self::mark_value(b.receiver, gray, heap);
                Self::mark_object(b.method, gray, heap);
            }
            ObjData::Array(a) => {
                for v in a.items.borrow().iter() {
                    Self::mark_value(*v, gray, heap);
                }
            }
        }
    }

    /// Runs one full mark-and-sweep cycle (§4.5).
    fn collect_garbage(&mut self) {
        log::debug!(
            "gc begin: {} bytes, {} objects live",
            self.heap.bytes_allocated(),
            self.heap.objects_live()
        );
        let mut gray: Vec<ObjRef> = Vec::new();

        for i in 0..self.stack_top {
            Self::mark_value(self.stack[i], &mut gray, &self.heap);
        }
        for frame in &self.frames {
            Self::mark_object(frame.closure, &mut gray, &self.heap);
        }
        for &uv in &self.open_upvalues {
            Self::mark_object(uv, &mut gray, &self.heap);
        }
        Self::mark_table(&self.globals, &mut gray, &self.heap);
        Self::mark_object(self.construct_name, &mut gray, &self.heap);
        Self::mark_object(self.destruct_name, &mut gray, &self.heap);

        while let Some(obj) = gray.pop() {
            Self::blacken_object(obj, &mut gray, &self.heap);
        }

        self.heap.weak_sweep_strings();
        self.heap.sweep();
        log::debug!("gc end: {} bytes live", self.heap.bytes_allocated());
    }
}

fn obj_to_string(r: ObjRef) -> String {
    String::from_utf8_lossy(&r.as_string().bytes).into_owned()
}

fn display_name(r: ObjRef) -> String {
    obj_to_string(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;

    /// §8 "Upvalue ordering": `open_upvalues` stays in strictly decreasing
    /// slot order regardless of capture order, and capturing the same slot
    /// twice returns the same upvalue rather than duplicating it.
    #[test]
    fn open_upvalues_stay_in_decreasing_order() {
        let mut vm = Vm::new(VmLimits::default());
        vm.push(Value::Number(1.0));
        vm.push(Value::Number(2.0));
        vm.push(Value::Number(3.0));

        vm.capture_upvalue(0);
        vm.capture_upvalue(2);
        let dup = vm.capture_upvalue(1);

        let slots: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|r| match r.as_upvalue().state.get() {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![2, 1, 0]);
        assert_eq!(vm.capture_upvalue(1), dup);
    }

    /// §8 "Stack balance": after a well-formed chunk runs to completion,
    /// `stack_top` is back at the base it started from (the frame-0 halt
    /// path resets it to the call's base slot, §4.6 `RETURN`).
    #[test]
    fn stack_balance_after_well_formed_script() {
        let mut vm = Vm::new(VmLimits::default());
        let function = {
            let mut b = ChunkBuilder::new_script(vm_heap_mut(&mut vm), false, "", "");
            b.op_const(OpCode::ConstantLong, Value::Number(1.0));
            b.op_const(OpCode::ConstantLong, Value::Number(2.0));
            b.op(OpCode::Add);
            b.op(OpCode::Pop);
            b.op(OpCode::Nil);
            b.op(OpCode::Return);
            b.finish(0, 0, None)
        };
        vm.interpret_function(function).unwrap();
        assert_eq!(vm.stack_top, 0);
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    /// §4.8 runtime-error path: an ill-typed `ADD` unwinds with the exact
    /// message §4.6 specifies and resets the stacks.
    #[test]
    fn add_type_mismatch_raises_runtime_error() {
        let mut vm = Vm::new(VmLimits::default());
        let function = {
            let b_heap = vm_heap_mut(&mut vm);
            let mut b = ChunkBuilder::new_script(b_heap, false, "", "");
            b.op_const(OpCode::ConstantLong, Value::Number(1.0));
            let x_val = Value::Obj(b.heap_mut().intern_str("x"));
            b.op_const(OpCode::ConstantLong, x_val);
            b.op(OpCode::Add);
            b.op(OpCode::Pop);
            b.op(OpCode::Nil);
            b.op(OpCode::Return);
            b.finish(0, 0, None)
        };
        let err = vm.interpret_function(function).unwrap_err();
        match err {
            VmError::Runtime { message, .. } => {
                assert_eq!(message, "Operands must be two numbers or two strings.");
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
        assert_eq!(vm.stack_top, 0);
        assert!(vm.frames.is_empty());
    }

    /// Test-only accessor: `Vm` has no public `&mut Heap` getter (no
    /// embedder needs one), but tests building chunks against the same
    /// heap a running `Vm` owns need it to drive [`ChunkBuilder`].
    fn vm_heap_mut(vm: &mut Vm) -> &mut Heap {
        &mut vm.heap
    }
}

//! End-to-end scenarios from spec §8, hand-assembled with `ChunkBuilder`
//! in place of a real compiler front end (this crate has none — see
//! `compiler::Compiler`). Each test plays the role a compiler would: emit
//! bytecode that implements the given source, then check the VM's
//! observable behavior against the scenario's expected output.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use rose_vm::builder::ChunkBuilder;
use rose_vm::object::ObjData;
use rose_vm::op_code::OpCode;
use rose_vm::{Value, Vm, VmError, VmLimits};

/// A `Write` sink tests can inspect after the VM finishes running — `Vm`
/// owns its output as a `Box<dyn Write>`, so the buffer has to be shared
/// rather than handed back.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

/// Scenario 1: `print (1 + 2) * 3;` → `9`.
#[test]
fn arithmetic_and_precedence() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());

    let function = {
        let mut b = ChunkBuilder::new_script(vm.heap_mut(), false, "", "");
        b.op_const(OpCode::ConstantLong, Value::Number(1.0));
        b.op_const(OpCode::ConstantLong, Value::Number(2.0));
        b.op(OpCode::Add);
        b.op_const(OpCode::ConstantLong, Value::Number(3.0));
        b.op(OpCode::Multiply);
        b.op(OpCode::Print);
        b.op(OpCode::Nil);
        b.op(OpCode::Return);
        b.finish(0, 0, None)
    };
    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "9\n");
}

/// Scenario 2: `var x = 2; x = x + 40; print x;` → `42`.
#[test]
fn globals_read_modify_write() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());

    let function = {
        let mut b = ChunkBuilder::new_script(vm.heap_mut(), false, "", "");
        b.op_const(OpCode::ConstantLong, Value::Number(2.0));
        b.op_name(OpCode::DefineGlobal, "x");
        b.op_name(OpCode::GetGlobal, "x");
        b.op_const(OpCode::ConstantLong, Value::Number(40.0));
        b.op(OpCode::Add);
        b.op_name(OpCode::SetGlobal, "x");
        b.op(OpCode::Pop);
        b.op_name(OpCode::GetGlobal, "x");
        b.op(OpCode::Print);
        b.op(OpCode::Nil);
        b.op(OpCode::Return);
        b.finish(0, 0, None)
    };
    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "42\n");
}

/// Builds the three nested functions shared by the closure scenarios:
/// `inc` captures `i` as its only upvalue, `make` creates `i` as a local
/// and returns a closure over it, and the returned top-level script binds
/// the result to global `f` and calls it three times.
fn build_closure_script(vm: &mut Vm) -> rose_vm::CompiledFunction {
    let heap = vm.heap_mut();

    let inc_ref = {
        let mut ib = ChunkBuilder::new(heap);
        ib.op(OpCode::GetUpvalue);
        ib.byte(0);
        ib.op_const(OpCode::ConstantLong, Value::Number(1.0));
        ib.op(OpCode::Add);
        ib.op(OpCode::SetUpvalue);
        ib.byte(0);
        ib.op(OpCode::Pop);
        ib.op(OpCode::GetUpvalue);
        ib.byte(0);
        ib.op(OpCode::Return);
        let inc_function = ib.finish(0, 1, Some("inc"));
        heap.alloc(ObjData::Function(inc_function))
    };

    let make_ref = {
        let mut mb = ChunkBuilder::new(heap);
        mb.op_const(OpCode::ConstantLong, Value::Number(0.0)); // slot 1: i
        let inc_const = mb.constant(Value::Obj(inc_ref));
        mb.op(OpCode::Closure);
        mb.u32_le(inc_const);
        mb.byte(1); // is_local
        mb.byte(1); // index: slot 1 (i)
        mb.op(OpCode::GetLocal);
        mb.u32_le(2); // slot 2: the inc closure just pushed
        mb.op(OpCode::Return);
        let make_function = mb.finish(0, 0, Some("make"));
        heap.alloc(ObjData::Function(make_function))
    };

    let mut sb = ChunkBuilder::new_script(heap, false, "", "");
    let make_const = sb.constant(Value::Obj(make_ref));
    sb.op(OpCode::Closure);
    sb.u32_le(make_const);
    sb.op(OpCode::Call);
    sb.byte(0);
    sb.op_name(OpCode::DefineGlobal, "f");
    for _ in 0..3 {
        sb.op_name(OpCode::GetGlobal, "f");
        sb.op(OpCode::Call);
        sb.byte(0);
        sb.op(OpCode::Print);
    }
    sb.op(OpCode::Nil);
    sb.op(OpCode::Return);
    sb.finish(0, 0, None)
}

/// Scenario 3: closures sharing a variable.
/// ```text
/// fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }
/// var f = make(); print f(); print f(); print f();
/// ```
/// The *same* closure is called three times, each mutation visible to the
/// next call through its shared upvalue — `1`, `2`, `3`.
#[test]
fn closures_share_a_captured_variable() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());
    let function = build_closure_script(&mut vm);
    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "1\n2\n3\n");
}

/// Same scenario under stress-GC (every allocation collects first): §8
/// "GC safety" — observable behavior must be identical.
#[test]
fn closures_share_a_captured_variable_under_stress_gc() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());
    vm.set_stress_gc(true);
    let function = build_closure_script(&mut vm);
    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "1\n2\n3\n");
}

/// Scenario 5: upvalue closing on return.
/// ```text
/// fun outer() { var x = "hi"; fun inner() { return x; } return inner; }
/// print outer()();
/// ```
/// → `hi`.
#[test]
fn upvalue_closes_when_its_frame_returns() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());
    let heap = vm.heap_mut();

    let inner_ref = {
        let mut ib = ChunkBuilder::new(heap);
        ib.op(OpCode::GetUpvalue);
        ib.byte(0);
        ib.op(OpCode::Return);
        let inner_function = ib.finish(0, 1, Some("inner"));
        heap.alloc(ObjData::Function(inner_function))
    };

    let outer_ref = {
        let mut ob = ChunkBuilder::new(heap);
        let hi_val = ob.string_value("hi");
        ob.op_const(OpCode::ConstantLong, hi_val); // slot 1: x
        let inner_const = ob.constant(Value::Obj(inner_ref));
        ob.op(OpCode::Closure);
        ob.u32_le(inner_const);
        ob.byte(1);
        ob.byte(1); // capture slot 1 (x)
        ob.op(OpCode::GetLocal);
        ob.u32_le(2);
        ob.op(OpCode::Return);
        let outer_function = ob.finish(0, 0, Some("outer"));
        heap.alloc(ObjData::Function(outer_function))
    };

    let function = {
        let mut sb = ChunkBuilder::new_script(heap, false, "", "");
        let outer_const = sb.constant(Value::Obj(outer_ref));
        sb.op(OpCode::Closure);
        sb.u32_le(outer_const);
        sb.op(OpCode::Call);
        sb.byte(0); // outer() -> inner closure
        sb.op(OpCode::Call);
        sb.byte(0); // inner() -> "hi"
        sb.op(OpCode::Print);
        sb.op(OpCode::Nil);
        sb.op(OpCode::Return);
        sb.finish(0, 0, None)
    };

    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "hi\n");
}

/// Scenario 4: constructor, method, single inheritance, `super`.
/// ```text
/// class A { construct(n) { this.n = n; } who() { return "A-" + this.n; } }
/// class B < A { who() { return "B:" + super.who(); } }
/// print B("x").who();
/// ```
/// → `B:A-x`.
#[test]
fn classes_constructor_inheritance_and_super() {
    let out = SharedBuf::default();
    let mut vm = Vm::new(VmLimits::default()).with_output(out.clone());
    let heap = vm.heap_mut();

    // A.construct(n): this.n = n; return this;
    let construct_ref = {
        let mut cb = ChunkBuilder::new(heap);
        cb.op(OpCode::GetLocal);
        cb.u32_le(0); // this
        cb.op(OpCode::GetLocal);
        cb.u32_le(1); // n
        cb.op_name(OpCode::SetProperty, "n");
        cb.op(OpCode::Pop);
        cb.op(OpCode::GetLocal);
        cb.u32_le(0);
        cb.op(OpCode::Return);
        let f = cb.finish(1, 0, Some("construct"));
        heap.alloc(ObjData::Function(f))
    };

    // A.who(): return "A-" + this.n;
    let who_a_ref = {
        let mut wb = ChunkBuilder::new(heap);
        let prefix = wb.string_value("A-");
        wb.op_const(OpCode::ConstantLong, prefix);
        wb.op(OpCode::GetLocal);
        wb.u32_le(0);
        wb.op_name(OpCode::GetProperty, "n");
        wb.op(OpCode::Add);
        wb.op(OpCode::Return);
        let f = wb.finish(0, 0, Some("who"));
        heap.alloc(ObjData::Function(f))
    };

    // B.who(): return "B:" + super.who();  (captures superclass A as upvalue 0)
    let who_b_ref = {
        let mut wb = ChunkBuilder::new(heap);
        let prefix = wb.string_value("B:");
        wb.op_const(OpCode::ConstantLong, prefix);
        wb.op(OpCode::GetLocal);
        wb.u32_le(0); // this, for the super call's receiver
        wb.op(OpCode::GetUpvalue);
        wb.byte(0); // superclass A
        wb.op_name(OpCode::SuperInvoke, "who");
        wb.byte(0); // argc
        wb.op(OpCode::Add);
        wb.op(OpCode::Return);
        let f = wb.finish(0, 1, Some("who"));
        heap.alloc(ObjData::Function(f))
    };

    let function = {
        let mut sb = ChunkBuilder::new_script(heap, false, "", "");

        // class A { construct(n) {...} who() {...} }
        sb.op_name(OpCode::Class, "A");
        sb.op_name(OpCode::DefineGlobal, "A");
        sb.op_name(OpCode::GetGlobal, "A");
        sb.op(OpCode::Closure);
        let construct_const = sb.constant(Value::Obj(construct_ref));
        sb.u32_le(construct_const);
        sb.op_name(OpCode::Method, "construct");
        sb.op(OpCode::Closure);
        let who_a_const = sb.constant(Value::Obj(who_a_ref));
        sb.u32_le(who_a_const);
        sb.op_name(OpCode::Method, "who");
        sb.op(OpCode::Pop); // drop the method-definition copy of A

        // class B < A { who() {...} }
        sb.op_name(OpCode::Class, "B");
        sb.op_name(OpCode::DefineGlobal, "B");
        sb.op_name(OpCode::GetGlobal, "A"); // superclass expr -> slot 1 ("super" local)
        sb.op_name(OpCode::GetGlobal, "B"); // subclass duplicate for INHERIT
        sb.op(OpCode::Inherit);
        sb.op_name(OpCode::GetGlobal, "B");
        sb.op(OpCode::Closure);
        let who_b_const = sb.constant(Value::Obj(who_b_ref));
        sb.u32_le(who_b_const);
        sb.byte(1); // is_local
        sb.byte(1); // capture slot 1 (A, the "super" local)
        sb.op_name(OpCode::Method, "who");
        sb.op(OpCode::Pop); // drop the method-definition copy of B
        sb.op(OpCode::CloseUpvalue); // close the "super" local's upvalue, then pop it

        // print B("x").who();
        sb.op_name(OpCode::GetGlobal, "B");
        let x_val = sb.string_value("x");
        sb.op_const(OpCode::ConstantLong, x_val);
        sb.op(OpCode::Call);
        sb.byte(1);
        sb.op_name(OpCode::Invoke, "who");
        sb.byte(0);
        sb.op(OpCode::Print);

        sb.op(OpCode::Nil);
        sb.op(OpCode::Return);
        sb.finish(0, 0, None)
    };

    vm.interpret_function(function).unwrap();
    assert_eq!(out.text(), "B:A-x\n");
}

/// Scenario 6: `print 1 + "x";` raises the exact runtime-error message §4.6
/// specifies for a mixed-type `ADD`.
#[test]
fn mismatched_add_raises_the_documented_runtime_error() {
    let mut vm = Vm::new(VmLimits::default());
    let function = {
        let heap = vm.heap_mut();
        let mut b = ChunkBuilder::new_script(heap, false, "", "");
        b.op_const(OpCode::ConstantLong, Value::Number(1.0));
        let x_val = b.string_value("x");
        b.op_const(OpCode::ConstantLong, x_val);
        b.op(OpCode::Add);
        b.op(OpCode::Pop);
        b.op(OpCode::Nil);
        b.op(OpCode::Return);
        b.finish(0, 0, None)
    };

    let err = vm.interpret_function(function).unwrap_err();
    match err {
        VmError::Runtime { message, backtrace } => {
            assert_eq!(message, "Operands must be two numbers or two strings.");
            assert!(!backtrace.is_empty());
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

/// Re-entrant `interpret_function` calls on the same `Vm` preserve globals
/// across runs (§C of SPEC_FULL.md, the REPL property).
#[test]
fn globals_survive_across_successive_runs() {
    let mut vm = Vm::new(VmLimits::default());
    let first = {
        let heap = vm.heap_mut();
        let mut b = ChunkBuilder::new_script(heap, false, "", "");
        b.op_const(OpCode::ConstantLong, Value::Number(7.0));
        b.op_name(OpCode::DefineGlobal, "g");
        b.op(OpCode::Nil);
        b.op(OpCode::Return);
        b.finish(0, 0, None)
    };
    vm.interpret_function(first).unwrap();

    let out = SharedBuf::default();
    vm = vm.with_output(out.clone());
    let second = {
        let heap = vm.heap_mut();
        let mut b = ChunkBuilder::new_script(heap, false, "", "");
        b.op_name(OpCode::GetGlobal, "g");
        b.op(OpCode::Print);
        b.op(OpCode::Nil);
        b.op(OpCode::Return);
        b.finish(0, 0, None)
    };
    vm.interpret_function(second).unwrap();
    assert_eq!(out.text(), "7\n");
}

mod common;

use std::sync::Arc;

use common::{captured, closure_value, count_proto, fib_proto, local, Asm};
use kelp_core::bytecode::{Constant, CtorDecl, DefaultArg, OpCode, RecordShape};
use kelp_core::vm::{DebugAction, Value, VM};
use kelp_core::{ErrorKind, VmConfig};
use parking_lot::Mutex;

fn vm_with_fib() -> VM {
    let mut vm = VM::new();
    vm.register_global("fib", closure_value(fib_proto()));
    vm
}

#[test]
fn test_fib() {
    let mut a = Asm::new("main.kp");
    a.function(fib_proto())
        .define_global("fib")
        .get_global("fib")
        .int(10)
        .call(1)
        .ret();
    let mut vm = VM::new();
    assert_eq!(vm.run_blocking(a.script()).unwrap(), Value::Int(55));
}

#[tokio::test]
async fn test_async_run_matches_blocking() {
    let mut a = Asm::new("main.kp");
    a.get_global("fib").int(15).call(1).ret();
    let mut vm = vm_with_fib();
    assert_eq!(vm.run(a.script()).await.unwrap(), Value::Int(610));
}

#[test]
fn test_division_by_zero_reports_line() {
    let mut a = Asm::new("main.kp");
    a.line(1).int(10).define_global("x");
    a.line(2).get_global("x").int(0).op(OpCode::Div).ret();

    let mut vm = VM::new();
    let err = vm.run_blocking(a.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.line(), 2);
    assert_eq!(err.file, "main.kp");
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_native_error_after_callback_reports_caller_line() {
    let mut inner = Asm::new("lib.kp");
    inner.line(1).int(5).ret();

    let mut vm = VM::new();
    vm.register_global("inner", closure_value(inner.func("inner", 0)));
    vm.register_native("calls_back_then_fails", 1, |caller, args| {
        caller.call(&args[0], vec![])?;
        Err("failed after callback".into())
    });

    let mut a = Asm::new("main.kp");
    a.line(1);
    for _ in 0..4 {
        a.int(0).op(OpCode::Pop);
    }
    a.line(9)
        .get_global("calls_back_then_fails")
        .get_global("inner")
        .call(1)
        .ret();

    let err = vm.run_blocking(a.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert_eq!(err.file, "main.kp");
    assert_eq!(err.line(), 9);
    assert_eq!(err.stack_trace.len(), 1);
    assert_eq!(err.stack_trace[0].line, 9);
}

#[test]
fn test_error_trace_lists_frames_innermost_first() {
    let mut body = Asm::new("lib.kp");
    body.line(7).get_local(1).int(0).op(OpCode::Mod).ret();
    let rem = body.func("rem_zero", 1);

    let mut a = Asm::new("main.kp");
    a.line(3).function(rem).int(4).call(1).ret();

    let err = VM::new().run_blocking(a.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.line(), 7);
    assert_eq!(err.stack_trace.len(), 2);
    assert_eq!(err.stack_trace[0].function_name, "rem_zero");
    assert_eq!(err.stack_trace[1].function_name, "<script>");
    assert_eq!(err.stack_trace[1].line, 3);
}

#[test]
fn test_counters_keep_separate_state() {
    let mut inc = Asm::new("counter.kp");
    inc.op_u16(OpCode::GetUpvalue, 0)
        .int(1)
        .op(OpCode::Add)
        .op_u16(OpCode::SetUpvalue, 0)
        .ret();
    let inc = Arc::new(inc.proto("inc", 0).with_upvalues(vec![local(1)]));

    let mut make = Asm::new("counter.kp");
    make.int(0).closure(inc).ret();
    let make = closure_value(make.func("make_counter", 0));

    let mut vm = VM::new();
    let first = vm.call(&make, vec![]).unwrap();
    let second = vm.call(&make, vec![]).unwrap();
    for _ in 0..2 {
        vm.call(&first, vec![]).unwrap();
    }
    assert_eq!(vm.call(&first, vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.call(&second, vec![]).unwrap(), Value::Int(1));
}

#[test]
fn test_sibling_closures_share_a_closed_cell() {
    let mut inc = Asm::new("pair.kp");
    inc.op_u16(OpCode::GetUpvalue, 0)
        .int(1)
        .op(OpCode::Add)
        .op_u16(OpCode::SetUpvalue, 0)
        .ret();
    let inc = Arc::new(inc.proto("inc", 0).with_upvalues(vec![local(1)]));
    let mut get = Asm::new("pair.kp");
    get.op_u16(OpCode::GetUpvalue, 0).ret();
    let get = Arc::new(get.proto("get", 0).with_upvalues(vec![local(1)]));

    let mut make = Asm::new("pair.kp");
    make.int(0)
        .closure(inc)
        .closure(get)
        .op_u16(OpCode::BuildList, 2)
        .ret();

    let mut vm = VM::new();
    let pair = vm.call(&closure_value(make.func("make_pair", 0)), vec![]).unwrap();
    let Some([inc, get]) = pair.as_list().and_then(|items| <&[Value; 2]>::try_from(items).ok())
    else {
        panic!("expected a pair, got {}", pair);
    };
    vm.call(inc, vec![]).unwrap();
    vm.call(inc, vec![]).unwrap();
    assert_eq!(vm.call(get, vec![]).unwrap(), Value::Int(2));
}

#[test]
fn test_capture_through_enclosing_upvalue() {
    let mut inner = Asm::new("nest.kp");
    inner.op_u16(OpCode::GetUpvalue, 0).ret();
    let inner = Arc::new(inner.proto("inner", 0).with_upvalues(vec![captured(0)]));
    let mut middle = Asm::new("nest.kp");
    middle.closure(inner).ret();
    let middle = Arc::new(middle.proto("middle", 0).with_upvalues(vec![local(1)]));
    let mut outer = Asm::new("nest.kp");
    outer.closure(middle).ret();

    let mut vm = VM::new();
    let mid = vm
        .call(&closure_value(outer.func("outer", 1)), vec![Value::Int(9)])
        .unwrap();
    let innermost = vm.call(&mid, vec![]).unwrap();
    assert_eq!(vm.call(&innermost, vec![]).unwrap(), Value::Int(9));
}

fn add3() -> Value {
    // a * 100 + b * 10 + c
    let mut a = Asm::new("add3.kp");
    a.get_local(1)
        .int(100)
        .op(OpCode::Mul)
        .get_local(2)
        .int(10)
        .op(OpCode::Mul)
        .op(OpCode::Add)
        .get_local(3)
        .op(OpCode::Add)
        .ret();
    closure_value(a.func("add3", 3))
}

#[test]
fn test_partial_application_for_every_split() {
    let mut vm = VM::new();
    let f = add3();
    let args = [Value::Int(1), Value::Int(2), Value::Int(3)];

    assert_eq!(vm.call(&f, args.to_vec()).unwrap(), Value::Int(123));
    for split in 0..3 {
        let partial = vm.call(&f, args[..split].to_vec()).unwrap();
        let result = vm.call(&partial, args[split..].to_vec()).unwrap();
        assert_eq!(result, Value::Int(123), "split at {}", split);
    }

    let one = vm.call(&f, vec![Value::Int(1)]).unwrap();
    let two = vm.call(&one, vec![Value::Int(2)]).unwrap();
    assert_eq!(vm.call(&two, vec![Value::Int(3)]).unwrap(), Value::Int(123));
}

#[test]
fn test_over_application_is_argument_error() {
    let mut vm = VM::new();
    let f = add3();
    let err = vm.call(&f, vec![Value::Int(1); 4]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArgumentError);

    let partial = vm.call(&f, vec![Value::Int(1)]).unwrap();
    let err = vm.call(&partial, vec![Value::Int(1); 3]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArgumentError);
    assert!(vm.stack_contents().is_empty());
}

#[test]
fn test_defaults_and_variadics() {
    let mut a = Asm::new("defaults.kp");
    let seven = a.add(Constant::Int(7));
    a.get_local(1).get_local(2).op(OpCode::Add).ret();
    let with_default = a
        .proto("plus", 2)
        .with_defaults(vec![None, Some(DefaultArg::Constant(seven))]);
    let plus = closure_value(Arc::new(with_default));

    let mut vm = VM::new();
    assert_eq!(vm.call(&plus, vec![Value::Int(1)]).unwrap(), Value::Int(8));
    assert_eq!(
        vm.call(&plus, vec![Value::Int(1), Value::Int(2)]).unwrap(),
        Value::Int(3)
    );

    let mut r = Asm::new("rest.kp");
    r.get_local(2).ret();
    let rest = closure_value(Arc::new(r.proto("rest", 2).variadic()));
    let packed = vm
        .call(&rest, vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        .unwrap();
    assert_eq!(packed, Value::list(vec![Value::Int(2), Value::Int(3)]));
    let empty = vm.call(&rest, vec![Value::Int(1)]).unwrap();
    assert_eq!(empty, Value::list(vec![]));
}

#[test]
fn test_tail_recursion_runs_in_constant_frames() {
    let mut vm = VM::new();
    vm.register_global("count", closure_value(count_proto("count", true)));
    let count = vm.global("count").unwrap();

    let result = vm
        .call(&count, vec![Value::Int(1_000_000), Value::Int(0)])
        .unwrap();
    assert_eq!(result, Value::Int(1_000_000));
    assert!(vm.peak_frame_depth() <= 2, "peak {}", vm.peak_frame_depth());
}

#[test]
fn test_deep_recursion_is_frame_overflow() {
    let mut vm = VM::with_config(VmConfig {
        max_frames: 64,
        ..VmConfig::default()
    });
    vm.register_global("deep", closure_value(count_proto("deep", false)));
    let deep = vm.global("deep").unwrap();

    let err = vm
        .call(&deep, vec![Value::Int(1_000), Value::Int(0)])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::FrameOverflow);
    assert!(err.stack_trace.len() <= 16);
    assert_eq!(vm.frame_depth(), 0);
    assert!(vm.stack_contents().is_empty());

    // The VM stays usable after unwinding
    let ok = vm.call(&deep, vec![Value::Int(10), Value::Int(0)]).unwrap();
    assert_eq!(ok, Value::Int(10));
}

#[test]
fn test_module_bindings_are_shared_by_sibling_closures() {
    let mut getter = Asm::new("app.kp");
    getter.get_module("x").ret();

    let mut a = Asm::new("app.kp");
    a.int(1)
        .define_module("x")
        .function(getter.func("get_x", 0))
        .define_global("get_x")
        .int(5)
        .set_module("x")
        .op(OpCode::Pop)
        .get_global("get_x")
        .call(0)
        .ret();

    let mut vm = VM::new();
    assert_eq!(vm.run_blocking(a.script()).unwrap(), Value::Int(5));
    assert!(vm.global("x").is_none());

    // The getter still sees the module after the run finished
    let get_x = vm.global("get_x").unwrap();
    assert_eq!(vm.call(&get_x, vec![]).unwrap(), Value::Int(5));
}

#[test]
fn test_module_lookup_falls_back_to_globals() {
    let mut a = Asm::new("app.kp");
    a.get_module("answer").ret();
    let mut vm = VM::new();
    vm.register_global("answer", Value::Int(42));
    assert_eq!(vm.run_blocking(a.script()).unwrap(), Value::Int(42));

    let mut b = Asm::new("app.kp");
    b.int(1).set_module("never_defined").ret();
    let err = vm.run_blocking(b.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameError);
}

#[test]
fn test_unwrap_continues_or_returns_early() {
    let mut a = Asm::new("opt.kp");
    a.get_local(1).op(OpCode::Unwrap).int(1).op(OpCode::Add).ret();
    let bump = closure_value(a.func("bump", 1));

    let mut vm = VM::new();
    let some = Value::data("Option", "Some", vec![Value::Int(41)]);
    assert_eq!(vm.call(&bump, vec![some]).unwrap(), Value::Int(42));

    let none = Value::data("Option", "None", vec![]);
    assert_eq!(vm.call(&bump, vec![none.clone()]).unwrap(), none);

    let err = vm.call(&bump, vec![Value::Int(3)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
}

#[test]
fn test_constructors_and_matching() {
    let mut a = Asm::new("ctor.kp");
    a.constant(Constant::Constructor(CtorDecl {
        type_name: "Option".into(),
        name: "Some".into(),
        arity: 1,
        type_params: 0,
    }))
    .int(3)
    .call(1)
    .match_ctor("Some")
    .op(OpCode::Swap)
    .op(OpCode::Pop)
    .ret();

    assert_eq!(VM::new().run_blocking(a.script()).unwrap(), Value::Bool(true));
}

#[test]
fn test_records_maps_and_indexing() {
    let mut a = Asm::new("data.kp");
    let shape = a.add(Constant::Shape(RecordShape {
        type_name: Some("Point".into()),
        fields: vec!["x".into(), "y".into()],
    }));
    a.int(1)
        .int(2)
        .op_u16(OpCode::BuildRecord, shape)
        .get_field("y")
        .str("k")
        .int(9)
        .op_u16(OpCode::BuildMap, 1)
        .str("k")
        .op(OpCode::GetIndex)
        .op(OpCode::Add)
        .ret();
    assert_eq!(VM::new().run_blocking(a.script()).unwrap(), Value::Int(11));

    let mut b = Asm::new("data.kp");
    b.str("k")
        .int(9)
        .op_u16(OpCode::BuildMap, 1)
        .str("missing")
        .op(OpCode::GetIndex)
        .ret();
    let err = VM::new().run_blocking(b.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IndexError);

    let mut c = Asm::new("data.kp");
    c.int(1)
        .op_u16(OpCode::BuildList, 1)
        .int(5)
        .op(OpCode::GetIndex)
        .ret();
    let err = VM::new().run_blocking(c.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IndexError);
}

#[test]
fn test_composition_applies_inner_first() {
    let mut vm = VM::new();
    vm.register_native("double", 1, |_, args| match args[0] {
        Value::Int(n) => Ok(Value::Int(n * 2)),
        _ => Err("expected Int".into()),
    });
    vm.register_native("succ", 1, |_, args| match args[0] {
        Value::Int(n) => Ok(Value::Int(n + 1)),
        _ => Err("expected Int".into()),
    });

    let mut a = Asm::new("compose.kp");
    a.get_global("double")
        .get_global("succ")
        .op(OpCode::Compose)
        .int(4)
        .call(1)
        .ret();
    assert_eq!(vm.run_blocking(a.script()).unwrap(), Value::Int(10));
}

#[test]
fn test_loop_sums_with_locals() {
    // i = 0; total = 0; while i < 5 { total = total + i; i = i + 1 }; total
    let mut a = Asm::new("loop.kp");
    a.int(0).int(0);
    let start = a.here();
    a.get_local(1).int(5).op(OpCode::Less);
    let exit = a.jump(OpCode::JumpIfFalse);
    a.get_local(2)
        .get_local(1)
        .op(OpCode::Add)
        .set_local(2)
        .op(OpCode::Pop)
        .get_local(1)
        .int(1)
        .op(OpCode::Add)
        .set_local(1)
        .op(OpCode::Pop)
        .loop_to(start);
    a.patch(exit);
    a.get_local(2).ret();
    assert_eq!(VM::new().run_blocking(a.script()).unwrap(), Value::Int(10));
}

#[test]
fn test_malformed_jump_is_internal_error() {
    let mut a = Asm::new("bad.kp");
    a.op_u16(OpCode::Jump, 500);
    let err = VM::new().run_blocking(a.script()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InternalError);
}

#[test]
fn test_fixed_stack_effects_match_execution() {
    let steps: Vec<(OpCode, Vec<u16>)> = vec![
        (OpCode::Nil, vec![]),
        (OpCode::Dup, vec![]),
        (OpCode::Swap, vec![]),
        (OpCode::Pop, vec![]),
        (OpCode::True, vec![]),
        (OpCode::Not, vec![]),
        (OpCode::False, vec![]),
        (OpCode::Equal, vec![]),
        (OpCode::BuildTuple, vec![2]),
        (OpCode::Dup, vec![]),
        (OpCode::GetItem, vec![0]),
        (OpCode::BuildList, vec![2]),
    ];

    let mut a = Asm::new("effects.kp");
    a.op(OpCode::Break);
    for (op, operands) in &steps {
        match operands.first() {
            Some(operand) => a.op_u16(*op, *operand),
            None => a.op(*op),
        };
        a.op(OpCode::Break);
    }
    a.ret();

    let heights = Arc::new(Mutex::new(Vec::new()));
    let seen = heights.clone();
    let mut vm = VM::new();
    vm.set_debug_hook(move |vm, _| {
        seen.lock().push(vm.stack_contents().len() as isize);
        DebugAction::Continue
    });
    vm.run_blocking(a.script()).unwrap();

    let heights = heights.lock();
    assert_eq!(heights.len(), steps.len() + 1);
    for (i, (op, operands)) in steps.iter().enumerate() {
        let expected = op.stack_effect(operands).unwrap();
        assert_eq!(heights[i + 1] - heights[i], expected, "{:?}", op);
    }
}

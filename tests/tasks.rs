mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{closure_value, fib_proto, local, Asm};
use kelp_core::bytecode::OpCode;
use kelp_core::vm::{Value, VM};
use kelp_core::ErrorKind;

fn vm_with_fib() -> VM {
    let mut vm = VM::new();
    vm.register_global("fib", closure_value(fib_proto()));
    vm
}

#[test]
fn test_fork_isolates_writes() {
    let mut parent = VM::new();
    parent.register_global("x", Value::Int(1));

    let mut child = parent.fork();
    assert!(child.globals().ptr_eq(parent.globals()));

    child.register_global("x", Value::Int(2));
    child.register_global("y", Value::Int(3));
    child.register_alias("Age", "Int");

    assert_eq!(parent.global("x"), Some(Value::Int(1)));
    assert_eq!(parent.global("y"), None);
    assert_eq!(&*parent.normalize_type("Age"), "Age");
    assert_eq!(child.global("x"), Some(Value::Int(2)));

    // And the other way round
    parent.register_global("z", Value::Int(4));
    assert_eq!(child.global("z"), None);
}

#[test]
fn test_fork_shares_config_and_cancellation() {
    let parent = VM::new();
    let child = parent.fork();
    assert_eq!(child.config(), parent.config());
    parent.cancel_token().store(true, Ordering::Relaxed);
    assert!(child.cancel_token().load(Ordering::Relaxed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_and_await() {
    let mut a = Asm::new("tasks.kp");
    a.get_global("fib").int(20).op_u16(OpCode::Spawn, 1).op(OpCode::Await).ret();
    let mut vm = vm_with_fib();
    assert_eq!(vm.run(a.script()).await.unwrap(), Value::Int(6765));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_tasks_in_flight() {
    let mut a = Asm::new("tasks.kp");
    a.get_global("fib")
        .int(10)
        .op_u16(OpCode::Spawn, 1)
        .get_global("fib")
        .int(12)
        .op_u16(OpCode::Spawn, 1)
        .op(OpCode::Await)
        .op(OpCode::Swap)
        .op(OpCode::Await)
        .op(OpCode::Add)
        .ret();
    let mut vm = vm_with_fib();
    assert_eq!(vm.run(a.script()).await.unwrap(), Value::Int(55 + 144));
}

#[test]
fn test_spawn_without_runtime() {
    let mut a = Asm::new("tasks.kp");
    a.get_global("fib").int(12).op_u16(OpCode::Spawn, 1).op(OpCode::Await).ret();
    let mut vm = vm_with_fib();
    assert_eq!(vm.run_blocking(a.script()).unwrap(), Value::Int(144));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_task_error_surfaces_at_await() {
    let mut body = Asm::new("boom.kp");
    body.line(4).int(1).int(0).op(OpCode::Div).ret();

    let mut a = Asm::new("tasks.kp");
    a.function(body.func("boom", 0))
        .op_u16(OpCode::Spawn, 0)
        .op(OpCode::Await)
        .ret();
    let err = VM::new().run(a.script()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.file, "boom.kp");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_await_twice_is_runtime_error() {
    let mut a = Asm::new("tasks.kp");
    a.get_global("fib")
        .int(3)
        .op_u16(OpCode::Spawn, 1)
        .op(OpCode::Dup)
        .op(OpCode::Await)
        .op(OpCode::Pop)
        .op(OpCode::Await)
        .ret();
    let err = vm_with_fib().run(a.script()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeError);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawned_closure_gets_a_detached_copy() {
    let mut inc = Asm::new("tasks.kp");
    inc.op_u16(OpCode::GetUpvalue, 0)
        .int(1)
        .op(OpCode::Add)
        .op_u16(OpCode::SetUpvalue, 0)
        .ret();
    let inc = Arc::new(inc.proto("inc", 0).with_upvalues(vec![local(1)]));

    // x = 5; t = spawn inc(); await t; (x, result)
    let mut a = Asm::new("tasks.kp");
    a.int(5)
        .closure(inc)
        .op_u16(OpCode::Spawn, 0)
        .op(OpCode::Await)
        .get_local(1)
        .op(OpCode::Swap)
        .op_u16(OpCode::BuildTuple, 2)
        .ret();
    let result = VM::new().run(a.script()).await.unwrap();
    assert_eq!(result, Value::tuple(vec![Value::Int(5), Value::Int(6)]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_stops_a_running_task() {
    let mut spin = Asm::new("spin.kp");
    let start = spin.here();
    spin.op(OpCode::Nil).op(OpCode::Pop).loop_to(start);
    let spin = closure_value(spin.func("spin", 0));

    let vm = VM::new();
    let handle = vm.spawn(&spin, &[]);
    vm.cancel_token().store(true, Ordering::Relaxed);

    let receiver = handle.take_receiver().unwrap();
    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
}

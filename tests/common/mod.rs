// Hand assembler for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use kelp_core::bytecode::{Chunk, Constant, FunctionProto, OpCode, UpvalueInfo};
use kelp_core::vm::{Closure, Value};

pub struct Asm {
    chunk: Chunk,
    line: u32,
}

impl Asm {
    pub fn new(file: &str) -> Self {
        Self {
            chunk: Chunk::new(file),
            line: 1,
        }
    }

    /// Source line recorded for the following instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.chunk.write_op(op, self.line);
        self
    }

    pub fn op_u16(&mut self, op: OpCode, operand: u16) -> &mut Self {
        self.chunk.write_op(op, self.line);
        self.chunk.write_u16(operand, self.line);
        self
    }

    pub fn constant(&mut self, constant: Constant) -> &mut Self {
        self.chunk.write_constant(constant, self.line);
        self
    }

    pub fn int(&mut self, n: i64) -> &mut Self {
        self.constant(Constant::Int(n))
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.constant(Constant::Str(s.to_string()))
    }

    pub fn function(&mut self, proto: Arc<FunctionProto>) -> &mut Self {
        self.constant(Constant::Function(proto))
    }

    /// Add a constant without emitting a load
    pub fn add(&mut self, constant: Constant) -> u16 {
        self.chunk.add_constant(constant)
    }

    fn named(&mut self, op: OpCode, name: &str) -> &mut Self {
        let idx = self.add(Constant::Str(name.to_string()));
        self.op_u16(op, idx)
    }

    pub fn get_global(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::GetGlobal, name)
    }

    pub fn define_global(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::DefineGlobal, name)
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::SetGlobal, name)
    }

    pub fn define_module(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::DefineModule, name)
    }

    pub fn get_module(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::GetModule, name)
    }

    pub fn set_module(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::SetModule, name)
    }

    pub fn get_field(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::GetField, name)
    }

    pub fn match_ctor(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::MatchCtor, name)
    }

    pub fn push_type_context(&mut self, name: &str) -> &mut Self {
        self.named(OpCode::PushTypeContext, name)
    }

    pub fn invoke(&mut self, name: &str, argc: u16) -> &mut Self {
        let idx = self.add(Constant::Str(name.to_string()));
        self.op_u16(OpCode::Invoke, idx);
        self.chunk.write_u16(argc, self.line);
        self
    }

    pub fn get_local(&mut self, slot: u16) -> &mut Self {
        self.op_u16(OpCode::GetLocal, slot)
    }

    pub fn set_local(&mut self, slot: u16) -> &mut Self {
        self.op_u16(OpCode::SetLocal, slot)
    }

    pub fn call(&mut self, argc: u16) -> &mut Self {
        self.op_u16(OpCode::Call, argc)
    }

    pub fn tail_call(&mut self, argc: u16) -> &mut Self {
        self.op_u16(OpCode::TailCall, argc)
    }

    pub fn closure(&mut self, proto: Arc<FunctionProto>) -> &mut Self {
        let idx = self.add(Constant::Function(proto));
        self.op_u16(OpCode::Closure, idx)
    }

    /// Emit a forward jump and return the operand offset to patch
    pub fn jump(&mut self, op: OpCode) -> usize {
        self.op_u16(op, 0xFFFF);
        self.chunk.current_offset() - 2
    }

    pub fn patch(&mut self, operand: usize) -> &mut Self {
        self.chunk.patch_jump(operand);
        self
    }

    /// Emit a backward jump to `start`
    pub fn loop_to(&mut self, start: usize) -> &mut Self {
        let offset = self.chunk.current_offset() + 3 - start;
        self.op_u16(OpCode::Loop, offset as u16)
    }

    pub fn here(&self) -> usize {
        self.chunk.current_offset()
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(OpCode::Return)
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }

    pub fn proto(self, name: &str, arity: usize) -> FunctionProto {
        FunctionProto::new(name, arity, self.chunk)
    }

    pub fn func(self, name: &str, arity: usize) -> Arc<FunctionProto> {
        Arc::new(self.proto(name, arity))
    }

    pub fn script(self) -> Arc<FunctionProto> {
        self.func("<script>", 0)
    }
}

pub fn local(index: u16) -> UpvalueInfo {
    UpvalueInfo {
        index,
        is_local: true,
    }
}

pub fn captured(index: u16) -> UpvalueInfo {
    UpvalueInfo {
        index,
        is_local: false,
    }
}

/// A top-level closure value for a function with no captures
pub fn closure_value(proto: Arc<FunctionProto>) -> Value {
    Value::closure(Closure::new(proto, None))
}

/// `fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)`, recursing through the global `fib`
pub fn fib_proto() -> Arc<FunctionProto> {
    let mut a = Asm::new("fib.kp");
    a.line(1).get_local(1).int(2).op(OpCode::Less);
    let recurse = a.jump(OpCode::JumpIfFalse);
    a.line(2).get_local(1).ret();
    a.patch(recurse);
    a.line(3)
        .get_global("fib")
        .get_local(1)
        .int(1)
        .op(OpCode::Sub)
        .call(1)
        .get_global("fib")
        .get_local(1)
        .int(2)
        .op(OpCode::Sub)
        .call(1)
        .op(OpCode::Add)
        .ret();
    a.func("fib", 1)
}

/// `name(n, acc) = n == 0 ? acc : name(n - 1, acc + 1)` as a tail or plain call
pub fn count_proto(name: &str, tail: bool) -> Arc<FunctionProto> {
    let mut a = Asm::new("count.kp");
    a.get_local(1).int(0).op(OpCode::Equal);
    let recurse = a.jump(OpCode::JumpIfFalse);
    a.get_local(2).ret();
    a.patch(recurse);
    a.line(2)
        .get_global(name)
        .get_local(1)
        .int(1)
        .op(OpCode::Sub)
        .get_local(2)
        .int(1)
        .op(OpCode::Add);
    if tail {
        a.tail_call(2);
    } else {
        a.call(2);
    }
    a.ret();
    a.func(name, 2)
}

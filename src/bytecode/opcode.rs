// Kelp Bytecode Instructions
// Opcodes with their operand widths and stack effects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytecode operation codes
///
/// Operands are big-endian u16 values following the opcode byte. The comment
/// on each variant gives the operands and the stack shape before -> after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // Constants and stack operations
    Constant, // (idx)          -> value
    Nil,      //                -> nil
    True,     //                -> true
    False,    //                -> false
    Pop,      // a              ->
    Dup,      // a              -> a a
    Swap,     // a b            -> b a

    // Variables
    GetLocal,     // (slot)     -> value
    SetLocal,     // (slot) a   -> a
    GetUpvalue,   // (idx)      -> value
    SetUpvalue,   // (idx) a    -> a
    CloseUpvalue, // a          ->            closes upvalues at the popped slot
    CloseScope,   // (slot) locals.. r -> r   closes and drops locals from slot
    DefineGlobal, // (name) a   ->
    GetGlobal,    // (name)     -> value
    SetGlobal,    // (name) a   -> a
    DefineModule, // (name) a   ->
    GetModule,    // (name)     -> value
    SetModule,    // (name) a   -> a

    // Arithmetic and comparison
    Add,          // a b -> a+b
    Sub,          // a b -> a-b
    Mul,          // a b -> a*b
    Div,          // a b -> a/b
    Mod,          // a b -> a%b
    Concat,       // a b -> a++b
    Negate,       // a   -> -a
    Not,          // a   -> !a
    Equal,        // a b -> a==b
    NotEqual,     // a b -> a!=b
    Less,         // a b -> a<b
    LessEqual,    // a b -> a<=b
    Greater,      // a b -> a>b
    GreaterEqual, // a b -> a>=b

    // Control flow
    Jump,        // (offset)                  forward
    JumpIfFalse, // (offset) cond ->          pops the condition
    JumpIfTrue,  // (offset) cond ->          pops the condition
    Loop,        // (offset)                  backward

    // Calls
    Call,     // (argc) f args.. -> result
    TailCall, // (argc) f args..              reuses the current frame
    Invoke,   // (name, argc) recv args.. -> result
    Closure,  // (idx) -> closure
    Return,   // result ->                    leaves result in the caller
    Halt,     // result ->                    stops the program

    // Data
    BuildList,   // (n) a1..an -> list
    BuildTuple,  // (n) a1..an -> tuple
    BuildRecord, // (shape) f1..fn -> record
    BuildMap,    // (n) k1 v1..kn vn -> map
    GetIndex,    // container index -> element
    GetField,    // (name) obj -> field
    GetItem,     // (i) obj -> element i
    MatchCtor,   // (name) v -> v bool
    Unwrap,      // v -> inner                or early return with v
    Compose,     // f g -> f.g

    // Type context
    PushTypeContext,    // (name)
    PopTypeContext,     //
    SetImplicitContext, // (name)

    // Declarations
    DefineTrait,     // (idx)
    DefineInstance,  // (idx) m1..mn ->
    DefineExtension, // (type, method) f ->
    DefineAlias,     // (alias, target)

    // Tasks and debugging
    Spawn, // (argc) f args.. -> task
    Await, // task -> result
    Break, //                                  debugger pause
}

const ALL_OPCODES: [OpCode; OpCode::Break as usize + 1] = [
    OpCode::Constant,
    OpCode::Nil,
    OpCode::True,
    OpCode::False,
    OpCode::Pop,
    OpCode::Dup,
    OpCode::Swap,
    OpCode::GetLocal,
    OpCode::SetLocal,
    OpCode::GetUpvalue,
    OpCode::SetUpvalue,
    OpCode::CloseUpvalue,
    OpCode::CloseScope,
    OpCode::DefineGlobal,
    OpCode::GetGlobal,
    OpCode::SetGlobal,
    OpCode::DefineModule,
    OpCode::GetModule,
    OpCode::SetModule,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Concat,
    OpCode::Negate,
    OpCode::Not,
    OpCode::Equal,
    OpCode::NotEqual,
    OpCode::Less,
    OpCode::LessEqual,
    OpCode::Greater,
    OpCode::GreaterEqual,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::JumpIfTrue,
    OpCode::Loop,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::Invoke,
    OpCode::Closure,
    OpCode::Return,
    OpCode::Halt,
    OpCode::BuildList,
    OpCode::BuildTuple,
    OpCode::BuildRecord,
    OpCode::BuildMap,
    OpCode::GetIndex,
    OpCode::GetField,
    OpCode::GetItem,
    OpCode::MatchCtor,
    OpCode::Unwrap,
    OpCode::Compose,
    OpCode::PushTypeContext,
    OpCode::PopTypeContext,
    OpCode::SetImplicitContext,
    OpCode::DefineTrait,
    OpCode::DefineInstance,
    OpCode::DefineExtension,
    OpCode::DefineAlias,
    OpCode::Spawn,
    OpCode::Await,
    OpCode::Break,
];

impl OpCode {
    /// Number of u16 operands following the opcode byte
    pub fn operand_count(&self) -> usize {
        match self {
            OpCode::Invoke | OpCode::DefineExtension | OpCode::DefineAlias => 2,

            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::CloseScope
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineModule
            | OpCode::GetModule
            | OpCode::SetModule
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::Loop
            | OpCode::Call
            | OpCode::TailCall
            | OpCode::Closure
            | OpCode::BuildList
            | OpCode::BuildTuple
            | OpCode::BuildRecord
            | OpCode::BuildMap
            | OpCode::GetField
            | OpCode::GetItem
            | OpCode::MatchCtor
            | OpCode::PushTypeContext
            | OpCode::SetImplicitContext
            | OpCode::DefineTrait
            | OpCode::DefineInstance
            | OpCode::Spawn => 1,

            _ => 0,
        }
    }

    /// Encoded size in bytes, opcode included
    pub fn width(&self) -> usize {
        1 + 2 * self.operand_count()
    }

    /// Net change in operand stack depth, when it depends only on the operands.
    ///
    /// Returns `None` for instructions whose effect depends on constants,
    /// on the callee, or that transfer control out of the frame.
    pub fn stack_effect(&self, operands: &[u16]) -> Option<isize> {
        let first = operands.first().copied().unwrap_or(0) as isize;
        let effect = match self {
            OpCode::Constant
            | OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Dup
            | OpCode::GetLocal
            | OpCode::GetUpvalue
            | OpCode::GetGlobal
            | OpCode::GetModule
            | OpCode::Closure
            | OpCode::MatchCtor => 1,

            OpCode::Swap
            | OpCode::SetLocal
            | OpCode::SetUpvalue
            | OpCode::SetGlobal
            | OpCode::SetModule
            | OpCode::Negate
            | OpCode::Not
            | OpCode::Jump
            | OpCode::Loop
            | OpCode::GetField
            | OpCode::GetItem
            | OpCode::PushTypeContext
            | OpCode::PopTypeContext
            | OpCode::SetImplicitContext
            | OpCode::DefineTrait
            | OpCode::DefineAlias
            | OpCode::Break => 0,

            OpCode::Pop
            | OpCode::CloseUpvalue
            | OpCode::DefineGlobal
            | OpCode::DefineModule
            | OpCode::DefineExtension
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::GetIndex
            | OpCode::Compose
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Concat
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Greater
            | OpCode::GreaterEqual => -1,

            OpCode::BuildList | OpCode::BuildTuple => 1 - first,
            OpCode::BuildMap => 1 - 2 * first,
            OpCode::Call | OpCode::Spawn => -first,
            OpCode::Invoke => -(operands.get(1).copied().unwrap_or(0) as isize),

            OpCode::CloseScope
            | OpCode::TailCall
            | OpCode::Return
            | OpCode::Halt
            | OpCode::BuildRecord
            | OpCode::Unwrap
            | OpCode::DefineInstance
            | OpCode::Await => return None,
        };
        Some(effect)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Constant => "const",
            OpCode::Nil => "nil",
            OpCode::True => "true",
            OpCode::False => "false",
            OpCode::Pop => "pop",
            OpCode::Dup => "dup",
            OpCode::Swap => "swap",
            OpCode::GetLocal => "get_local",
            OpCode::SetLocal => "set_local",
            OpCode::GetUpvalue => "get_upvalue",
            OpCode::SetUpvalue => "set_upvalue",
            OpCode::CloseUpvalue => "close_upvalue",
            OpCode::CloseScope => "close_scope",
            OpCode::DefineGlobal => "def_global",
            OpCode::GetGlobal => "get_global",
            OpCode::SetGlobal => "set_global",
            OpCode::DefineModule => "def_module",
            OpCode::GetModule => "get_module",
            OpCode::SetModule => "set_module",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Mod => "mod",
            OpCode::Concat => "concat",
            OpCode::Negate => "neg",
            OpCode::Not => "not",
            OpCode::Equal => "eq",
            OpCode::NotEqual => "ne",
            OpCode::Less => "lt",
            OpCode::LessEqual => "le",
            OpCode::Greater => "gt",
            OpCode::GreaterEqual => "ge",
            OpCode::Jump => "jump",
            OpCode::JumpIfFalse => "jump_if_false",
            OpCode::JumpIfTrue => "jump_if_true",
            OpCode::Loop => "loop",
            OpCode::Call => "call",
            OpCode::TailCall => "tail_call",
            OpCode::Invoke => "invoke",
            OpCode::Closure => "closure",
            OpCode::Return => "return",
            OpCode::Halt => "halt",
            OpCode::BuildList => "build_list",
            OpCode::BuildTuple => "build_tuple",
            OpCode::BuildRecord => "build_record",
            OpCode::BuildMap => "build_map",
            OpCode::GetIndex => "get_index",
            OpCode::GetField => "get_field",
            OpCode::GetItem => "get_item",
            OpCode::MatchCtor => "match_ctor",
            OpCode::Unwrap => "unwrap",
            OpCode::Compose => "compose",
            OpCode::PushTypeContext => "push_type_ctx",
            OpCode::PopTypeContext => "pop_type_ctx",
            OpCode::SetImplicitContext => "set_implicit_ctx",
            OpCode::DefineTrait => "def_trait",
            OpCode::DefineInstance => "def_instance",
            OpCode::DefineExtension => "def_extension",
            OpCode::DefineAlias => "def_alias",
            OpCode::Spawn => "spawn",
            OpCode::Await => "await",
            OpCode::Break => "break",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        if byte <= OpCode::Break as u8 {
            Ok(ALL_OPCODES[byte as usize])
        } else {
            Err(byte)
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Binary operators, usable as first-class values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Method name a trait instance registers to overload this operator
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Concat => "++",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }

    pub fn from_opcode(op: OpCode) -> Option<Self> {
        Some(match op {
            OpCode::Add => BinOp::Add,
            OpCode::Sub => BinOp::Sub,
            OpCode::Mul => BinOp::Mul,
            OpCode::Div => BinOp::Div,
            OpCode::Mod => BinOp::Mod,
            OpCode::Concat => BinOp::Concat,
            OpCode::Equal => BinOp::Eq,
            OpCode::NotEqual => BinOp::Ne,
            OpCode::Less => BinOp::Lt,
            OpCode::LessEqual => BinOp::Le,
            OpCode::Greater => BinOp::Gt,
            OpCode::GreaterEqual => BinOp::Ge,
            _ => return None,
        })
    }
}

// Kelp Bytecode
// Instruction encoding and the compiled-function contract consumed by the VM

pub mod chunk;
pub mod opcode;

pub use chunk::{
    Chunk, Constant, CtorDecl, DefaultArg, FunctionProto, InstanceDecl, MethodSig, RecordShape,
    TraitDecl, TypeDecl, TypeKind, UpvalueInfo,
};
pub use opcode::{BinOp, OpCode};

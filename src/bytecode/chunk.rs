// Kelp Bytecode Chunk
// Contains bytecode, constants, and debug information

use super::opcode::{BinOp, OpCode};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

/// Constant values stored in the constant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
    Function(Arc<FunctionProto>),
    Trait(TraitDecl),
    Instance(InstanceDecl),
    Constructor(CtorDecl),
    Type(TypeDecl),
    /// A trait method as a first-class value
    TraitMethod { trait_name: String, method: String },
    Operator(BinOp),
    /// Hidden type-witness argument appended for return-type polymorphism
    Witness(String),
    Shape(RecordShape),
}

/// Upvalue metadata - describes how to capture a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalueInfo {
    pub index: u16,     // Index in parent's locals or upvalues
    pub is_local: bool, // true = capture from parent's local, false = from parent's upvalue
}

/// How a missing trailing argument is filled in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultArg {
    /// Index into the function's own constant pool
    Constant(u16),
    /// Zero-arity function evaluated in a temporary frame
    Thunk(Arc<FunctionProto>),
}

/// Compiled function template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    pub name: String,
    /// Declared parameters, the variadic rest parameter included
    pub arity: usize,
    /// Arguments needed before the call runs instead of currying
    pub required_arity: usize,
    pub variadic: bool,
    /// One entry per parameter; `None` means no default
    pub defaults: Vec<Option<DefaultArg>>,
    pub local_count: usize,
    pub upvalues: Vec<UpvalueInfo>,
    pub declared_type: Option<String>,
    pub local_names: Vec<String>,
    pub chunk: Arc<Chunk>,
}

impl FunctionProto {
    pub fn new(name: impl Into<String>, arity: usize, chunk: Chunk) -> Self {
        Self {
            name: name.into(),
            arity,
            required_arity: arity,
            variadic: false,
            defaults: Vec::new(),
            local_count: arity,
            upvalues: Vec::new(),
            declared_type: None,
            local_names: Vec::new(),
            chunk: Arc::new(chunk),
        }
    }

    /// Mark the last parameter as a rest parameter
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self.required_arity = self.arity.saturating_sub(1).min(self.required_arity);
        self
    }

    /// Attach defaults for trailing parameters; required arity shrinks to match
    pub fn with_defaults(mut self, defaults: Vec<Option<DefaultArg>>) -> Self {
        let first_default = defaults
            .iter()
            .position(|d| d.is_some())
            .unwrap_or(self.arity);
        self.required_arity = self.required_arity.min(first_default);
        self.defaults = defaults;
        self
    }

    pub fn with_upvalues(mut self, upvalues: Vec<UpvalueInfo>) -> Self {
        self.upvalues = upvalues;
        self
    }

    pub fn with_locals(mut self, names: Vec<String>) -> Self {
        self.local_count = self.local_count.max(names.len());
        self.local_names = names;
        self
    }

    pub fn with_declared_type(mut self, ty: impl Into<String>) -> Self {
        self.declared_type = Some(ty.into());
        self
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }

    pub fn default_for(&self, param: usize) -> Option<&DefaultArg> {
        self.defaults.get(param).and_then(|d| d.as_ref())
    }
}

/// A trait method signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSig {
    pub name: String,
    pub arity: usize,
}

/// Trait (typeclass) declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitDecl {
    pub name: String,
    /// Number of type parameters; more than one makes a multi-parameter trait
    pub params: usize,
    pub methods: Vec<MethodSig>,
    /// (method, source text) of default bodies compiled on first use
    pub defaults: Vec<(String, String)>,
}

impl TraitDecl {
    pub fn method(&self, name: &str) -> Option<&MethodSig> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn default_source(&self, method: &str) -> Option<&str> {
        self.defaults
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, source)| source.as_str())
    }
}

/// Instance declaration: the method closures are on the stack in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDecl {
    pub trait_name: String,
    /// Type name, or type names joined with '_' for multi-parameter traits
    pub type_key: String,
    pub methods: Vec<String>,
}

/// Algebraic data constructor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtorDecl {
    pub type_name: String,
    pub name: String,
    pub arity: usize,
    /// Leading type arguments for reified generics
    pub type_params: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Record(Vec<String>),
    Adt(Vec<String>),
    Builtin,
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    pub kind: TypeKind,
}

/// Field layout for `BuildRecord`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShape {
    pub type_name: Option<String>,
    pub fields: Vec<String>,
}

/// A chunk of bytecode
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// Raw bytecode
    pub code: Vec<u8>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Source line for each byte
    pub lines: Vec<u32>,
    /// Source column for each byte
    pub columns: Vec<u32>,
    pub file: String,
}

impl Chunk {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    /// Write a single byte to the chunk with position info
    pub fn write(&mut self, byte: u8, line: u32, column: u32) {
        self.code.push(byte);
        self.lines.push(line);
        self.columns.push(column);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op.into(), line, 1);
    }

    /// Write a u16 operand (big-endian)
    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line, 1);
        self.write((value & 0xFF) as u8, line, 1);
    }

    /// Add a constant and return its index
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    /// Write a constant instruction
    pub fn write_constant(&mut self, constant: Constant, line: u32) -> u16 {
        let index = self.add_constant(constant);
        self.write_op(OpCode::Constant, line);
        self.write_u16(index, line);
        index
    }

    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Patch a forward jump operand at `offset` to land on the current end
    pub fn patch_jump(&mut self, offset: usize) {
        let jump = self.code.len() - offset - 2;
        self.code[offset] = (jump >> 8) as u8;
        self.code[offset + 1] = (jump & 0xFF) as u8;
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let high = *self.code.get(offset)? as u16;
        let low = *self.code.get(offset + 1)? as u16;
        Some((high << 8) | low)
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0) as usize
    }

    pub fn column_at(&self, offset: usize) -> usize {
        self.columns.get(offset).copied().unwrap_or(0) as usize
    }

    fn format_constant(&self, idx: usize) -> String {
        match self.constants.get(idx) {
            Some(Constant::Int(n)) => n.to_string(),
            Some(Constant::Float(n)) => n.to_string(),
            Some(Constant::Str(s)) => {
                if s.chars().count() > 32 {
                    let truncated: String = s.chars().take(29).collect();
                    format!("\"{}...\"", truncated)
                } else {
                    format!("\"{}\"", s)
                }
            }
            Some(Constant::Function(f)) => format!("<fn {}>", f.name),
            Some(Constant::Trait(t)) => format!("<trait {}>", t.name),
            Some(Constant::Instance(i)) => format!("<instance {} {}>", i.trait_name, i.type_key),
            Some(Constant::Constructor(c)) => format!("<ctor {}.{}>", c.type_name, c.name),
            Some(Constant::Type(t)) => format!("<type {}>", t.name),
            Some(Constant::TraitMethod { trait_name, method }) => {
                format!("<method {}.{}>", trait_name, method)
            }
            Some(Constant::Operator(op)) => format!("({})", op.symbol()),
            Some(Constant::Witness(ty)) => format!("<witness {}>", ty),
            Some(Constant::Shape(shape)) => format!("{{{}}}", shape.fields.join(", ")),
            None => format!("???[{}]", idx),
        }
    }

    /// Render the chunk and its nested functions as text
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, name, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, name: &str, indent: usize) {
        let prefix = "  ".repeat(indent);
        let _ = writeln!(
            out,
            "{}--- {} ({} bytes, {} constants) ---",
            prefix,
            name,
            self.code.len(),
            self.constants.len()
        );

        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(out, offset, &prefix);
        }

        for constant in &self.constants {
            if let Constant::Function(f) = constant {
                f.chunk
                    .disassemble_into(out, &format!("<fn {}>", f.name), indent + 1);
            }
        }
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize, prefix: &str) -> usize {
        let line = self.line_at(offset);
        if offset > 0 && line == self.line_at(offset - 1) {
            let _ = write!(out, "{}{:04}    | ", prefix, offset);
        } else {
            let _ = write!(out, "{}{:04} {:4} ", prefix, offset, line);
        }

        let op = match OpCode::try_from(self.code[offset]) {
            Ok(op) => op,
            Err(byte) => {
                let _ = writeln!(out, "<bad opcode 0x{:02x}>", byte);
                return offset + 1;
            }
        };

        let operands: Vec<u16> = (0..op.operand_count())
            .filter_map(|i| self.read_u16(offset + 1 + 2 * i))
            .collect();

        let detail = match (op, operands.as_slice()) {
            (
                OpCode::Constant
                | OpCode::DefineGlobal
                | OpCode::GetGlobal
                | OpCode::SetGlobal
                | OpCode::DefineModule
                | OpCode::GetModule
                | OpCode::SetModule
                | OpCode::Closure
                | OpCode::BuildRecord
                | OpCode::GetField
                | OpCode::MatchCtor
                | OpCode::PushTypeContext
                | OpCode::SetImplicitContext
                | OpCode::DefineTrait
                | OpCode::DefineInstance,
                [idx],
            ) => self.format_constant(*idx as usize),
            (OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue, [jump]) => {
                format!("-> {:04}", offset + op.width() + *jump as usize)
            }
            (OpCode::Loop, [jump]) => {
                format!("-> {:04}", (offset + op.width()).saturating_sub(*jump as usize))
            }
            (OpCode::Invoke, [name, argc]) => {
                format!("{} ({} args)", self.format_constant(*name as usize), argc)
            }
            (OpCode::DefineExtension | OpCode::DefineAlias, [a, b]) => format!(
                "{} {}",
                self.format_constant(*a as usize),
                self.format_constant(*b as usize)
            ),
            (_, [n]) => format!("[{}]", n),
            _ => String::new(),
        };

        let _ = writeln!(out, "{:<18} {}", op.mnemonic(), detail);
        offset + op.width()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_operands() {
        let mut chunk = Chunk::new("t.kp");
        let idx = chunk.write_constant(Constant::Int(42), 3);
        assert_eq!(idx, 0);
        assert_eq!(chunk.code.len(), 3);
        assert_eq!(chunk.read_u16(1), Some(0));
        assert_eq!(chunk.line_at(2), 3);
        assert_eq!(chunk.read_u16(2), None);
    }

    #[test]
    fn test_patch_jump() {
        let mut chunk = Chunk::new("t.kp");
        chunk.write_op(OpCode::Jump, 1);
        let operand = chunk.current_offset();
        chunk.write_u16(0xFFFF, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.patch_jump(operand);
        assert_eq!(chunk.read_u16(operand), Some(2));
    }

    #[test]
    fn test_defaults_lower_required_arity() {
        let proto = FunctionProto::new("f", 3, Chunk::new("t.kp"))
            .with_defaults(vec![None, Some(DefaultArg::Constant(0)), Some(DefaultArg::Constant(1))]);
        assert_eq!(proto.required_arity, 1);
        let rest = FunctionProto::new("g", 2, Chunk::new("t.kp")).variadic();
        assert_eq!(rest.required_arity, 1);
    }

    #[test]
    fn test_disassemble_lists_nested_functions() {
        let mut inner = Chunk::new("t.kp");
        inner.write_op(OpCode::Nil, 1);
        inner.write_op(OpCode::Return, 1);
        let mut chunk = Chunk::new("t.kp");
        let f = chunk.add_constant(Constant::Function(Arc::new(FunctionProto::new("inner", 0, inner))));
        chunk.write_op(OpCode::Closure, 1);
        chunk.write_u16(f, 1);
        chunk.write_op(OpCode::Return, 2);
        let text = chunk.disassemble("<script>");
        assert!(text.contains("closure"));
        assert!(text.contains("<fn inner>"));
        assert!(text.contains("return"));
    }
}

// Kelp Runtime Values
// Scalars live inline in the tagged union; everything else is a shared heap object
// Uses Arc for shared ownership so values can cross into forked VMs

use crate::bytecode::{BinOp, TypeKind};
use crate::trie::Trie;
use crate::vm::caller::ValueCaller;
use crate::vm::closure::Closure;
use crate::vm::fork::TaskHandle;
use std::fmt;
use std::sync::Arc;

/// Native function body
/// Receives a caller that can invoke closures, and the argument slice
pub type NativeFn = Arc<dyn Fn(&mut dyn ValueCaller, &[Value]) -> Result<Value, String> + Send + Sync>;

/// Runtime value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Obj(Arc<Object>),
}

/// Heap-allocated objects
pub enum Object {
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Record(Record),
    Map(Trie<Value>),
    /// Instance of an algebraic data constructor
    Data(DataInstance),
    Bytes(Arc<[u8]>),

    // Callables
    Closure(Arc<Closure>),
    Native(NativeFunction),
    Constructor(Constructor),
    Type(TypeObject),
    Operator(BinOp),
    /// `outer . inner`
    Composed { outer: Value, inner: Value },
    /// Method with its receiver pre-applied as first argument
    Bound { receiver: Value, method: Value },
    Partial { callee: Value, args: Vec<Value> },
    /// `hint` is a return-type witness captured when the method was partially applied
    TraitMethod {
        trait_name: Arc<str>,
        method: Arc<str>,
        hint: Option<Arc<str>>,
    },

    /// Hidden type argument for return-type polymorphic trait methods
    Witness(Arc<str>),
    Task(TaskHandle),
}

pub struct Record {
    pub type_name: Option<Arc<str>>,
    pub fields: Vec<(Arc<str>, Value)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| &**field == name)
            .map(|(_, v)| v)
    }
}

pub struct DataInstance {
    pub type_name: Arc<str>,
    pub ctor: Arc<str>,
    /// Reified type arguments supplied before the fields
    pub type_args: Vec<Value>,
    pub fields: Vec<Value>,
}

#[derive(Clone)]
pub struct NativeFunction {
    pub name: Arc<str>,
    pub arity: usize,
    /// Arguments needed before the native runs; fewer produce a partial
    pub required: usize,
    pub variadic: bool,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn new<F>(name: &str, arity: usize, func: F) -> Self
    where
        F: Fn(&mut dyn ValueCaller, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            arity,
            required: arity,
            variadic: false,
            func: Arc::new(func),
        }
    }

    /// Trailing parameters past `required` may be omitted
    pub fn with_required(mut self, required: usize) -> Self {
        self.required = required.min(self.arity);
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

#[derive(Clone)]
pub struct Constructor {
    pub type_name: Arc<str>,
    pub name: Arc<str>,
    pub arity: usize,
    pub type_params: usize,
}

#[derive(Clone)]
pub struct TypeObject {
    pub name: Arc<str>,
    pub kind: TypeKind,
    /// Type arguments from type application, e.g. `Option(Int)`
    pub args: Vec<Value>,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Obj(Arc::new(Object::Str(s.into())))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::Obj(Arc::new(Object::List(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Obj(Arc::new(Object::Tuple(items)))
    }

    pub fn map(entries: Trie<Value>) -> Self {
        Value::Obj(Arc::new(Object::Map(entries)))
    }

    pub fn bytes(data: impl Into<Arc<[u8]>>) -> Self {
        Value::Obj(Arc::new(Object::Bytes(data.into())))
    }

    pub fn record(type_name: Option<Arc<str>>, fields: Vec<(Arc<str>, Value)>) -> Self {
        Value::Obj(Arc::new(Object::Record(Record { type_name, fields })))
    }

    pub fn data(type_name: &str, ctor: &str, fields: Vec<Value>) -> Self {
        Value::Obj(Arc::new(Object::Data(DataInstance {
            type_name: Arc::from(type_name),
            ctor: Arc::from(ctor),
            type_args: Vec::new(),
            fields,
        })))
    }

    pub fn native(function: NativeFunction) -> Self {
        Value::Obj(Arc::new(Object::Native(function)))
    }

    pub fn closure(closure: Closure) -> Self {
        Value::Obj(Arc::new(Object::Closure(Arc::new(closure))))
    }

    pub fn partial(callee: Value, args: Vec<Value>) -> Self {
        Value::Obj(Arc::new(Object::Partial { callee, args }))
    }

    pub fn bound(receiver: Value, method: Value) -> Self {
        Value::Obj(Arc::new(Object::Bound { receiver, method }))
    }

    pub fn trait_method(trait_name: &str, method: &str) -> Self {
        Value::Obj(Arc::new(Object::TraitMethod {
            trait_name: Arc::from(trait_name),
            method: Arc::from(method),
            hint: None,
        }))
    }

    pub fn witness(type_name: &str) -> Self {
        Value::Obj(Arc::new(Object::Witness(Arc::from(type_name))))
    }

    /// Runtime type name used for trait dispatch and error messages
    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "Nil",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Obj(obj) => match &**obj {
                Object::Str(_) => "String",
                Object::List(_) => "List",
                Object::Tuple(_) => "Tuple",
                Object::Record(r) => r.type_name.as_deref().unwrap_or("Record"),
                Object::Map(_) => "Map",
                Object::Data(d) => &*d.type_name,
                Object::Bytes(_) => "Bytes",
                Object::Type(_) => "Type",
                Object::Task(_) => "Task",
                Object::Witness(_) => "Witness",
                Object::Closure(_)
                | Object::Native(_)
                | Object::Constructor(_)
                | Object::Operator(_)
                | Object::Composed { .. }
                | Object::Bound { .. }
                | Object::Partial { .. }
                | Object::TraitMethod { .. } => "Function",
            },
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_callable(&self) -> bool {
        self.type_name() == "Function" || matches!(self.as_object(), Some(Object::Type(_)))
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.as_object() {
            Some(Object::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self.as_object() {
            Some(Object::List(items)) => Some(items),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataInstance> {
        match self.as_object() {
            Some(Object::Data(d)) => Some(d),
            _ => None,
        }
    }

    /// Same heap object, or equal scalars
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Obj(a), Value::Obj(b)) => Arc::ptr_eq(a, b),
            _ => self == other,
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "{:?}", s),
            None => write!(f, "{}", self),
        }
    }
}

fn map_eq(a: &Trie<Value>, b: &Trie<Value>) -> bool {
    if a.ptr_eq(b) {
        return true;
    }
    if a.len() != b.len() {
        return false;
    }
    let mut equal = true;
    a.range(|k, v| {
        equal = b.get(k).is_some_and(|other| other == v);
        equal
    });
    equal
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Obj(a), Value::Obj(b)) => Arc::ptr_eq(a, b) || **a == **b,
            _ => false,
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Str(a), Object::Str(b)) => a == b,
            (Object::List(a), Object::List(b)) => a == b,
            (Object::Tuple(a), Object::Tuple(b)) => a == b,
            (Object::Record(a), Object::Record(b)) => {
                a.type_name == b.type_name && a.fields == b.fields
            }
            (Object::Map(a), Object::Map(b)) => map_eq(a, b),
            (Object::Data(a), Object::Data(b)) => {
                a.type_name == b.type_name && a.ctor == b.ctor && a.fields == b.fields
            }
            (Object::Bytes(a), Object::Bytes(b)) => a == b,
            (Object::Witness(a), Object::Witness(b)) => a == b,
            (Object::Operator(a), Object::Operator(b)) => a == b,
            (Object::Type(a), Object::Type(b)) => a.name == b.name && a.args == b.args,
            (Object::Constructor(a), Object::Constructor(b)) => {
                a.type_name == b.type_name && a.name == b.name
            }
            (
                Object::TraitMethod { trait_name: t1, method: m1, hint: h1 },
                Object::TraitMethod { trait_name: t2, method: m2, hint: h2 },
            ) => t1 == t2 && m1 == m2 && h1 == h2,
            // Remaining callables compare by identity, handled by the Arc check
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Obj(obj) => write!(f, "{}", obj),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        item.fmt_nested(f)?;
    }
    write!(f, "{}", close)
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Str(s) => write!(f, "{}", s),
            Object::List(items) => write_seq(f, "[", items, "]"),
            Object::Tuple(items) => write_seq(f, "(", items, ")"),
            Object::Record(r) => {
                if let Some(name) = &r.type_name {
                    write!(f, "{} ", name)?;
                }
                write!(f, "{{")?;
                for (i, (name, value)) in r.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", name)?;
                    value.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
            Object::Map(entries) => {
                let mut items = entries.entries();
                items.sort_by(|a, b| a.0.cmp(&b.0));
                write!(f, "%{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: ", &**key)?;
                    value.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
            Object::Data(d) => {
                if d.fields.is_empty() {
                    write!(f, "{}", d.ctor)
                } else {
                    write_seq(f, &format!("{}(", d.ctor), &d.fields, ")")
                }
            }
            Object::Bytes(b) => write!(f, "<bytes {}>", b.len()),
            Object::Closure(c) => write!(f, "<fn {}>", c.proto.name),
            Object::Native(n) => write!(f, "<native fn {}>", n.name),
            Object::Constructor(c) => write!(f, "<ctor {}>", c.name),
            Object::Type(t) => write!(f, "<type {}>", t.name),
            Object::Operator(op) => write!(f, "({})", op.symbol()),
            Object::Composed { .. } => write!(f, "<composed fn>"),
            Object::Bound { method, .. } => write!(f, "<bound {}>", method),
            Object::Partial { callee, args } => write!(f, "<partial {} /{}>", callee, args.len()),
            Object::TraitMethod { trait_name, method, .. } => {
                write!(f, "<method {}.{}>", trait_name, method)
            }
            Object::Witness(t) => write!(f, "<witness {}>", t),
            Object::Task(t) => write!(f, "<task {}>", t.id()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_widens() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_eq!(Value::Float(2.0), Value::Int(2));
        assert_ne!(Value::Int(2), Value::Float(2.5));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_structural_equality_for_data() {
        let a = Value::list(vec![Value::Int(1), Value::string("x")]);
        let b = Value::list(vec![Value::Int(1), Value::string("x")]);
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        let some1 = Value::data("Option", "Some", vec![Value::Int(1)]);
        let some2 = Value::data("Option", "Some", vec![Value::Int(1)]);
        assert_eq!(some1, some2);
        assert_eq!(some1.type_name(), "Option");
    }

    #[test]
    fn test_maps_compare_by_content() {
        let a = Trie::new().put("k", Value::Int(1)).put("j", Value::Int(2));
        let b = Trie::new().put("j", Value::Int(2)).put("k", Value::Int(1));
        assert_eq!(Value::map(a), Value::map(b));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Int(55).to_string(), "55");
        let v = Value::list(vec![Value::string("a"), Value::Nil]);
        assert_eq!(v.to_string(), "[\"a\", nil]");
        assert_eq!(Value::data("Option", "None", vec![]).to_string(), "None");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
    }
}

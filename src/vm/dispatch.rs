// Kelp Call Dispatch
// Resolves a callee against an argument count for every callable kind
//
// Stack on entry: [.. callee a1 .. an]. On success either a new frame has been
// pushed whose slot 0 is the callee, or callee and arguments have been replaced
// by exactly one result value.

use crate::bytecode::{BinOp, DefaultArg, FunctionProto, TypeKind};
use crate::error::{ErrorKind, KelpResult};
use crate::vm::closure::Closure;
use crate::vm::frame::CallFrame;
use crate::vm::value::{Constructor, DataInstance, NativeFunction, Object, TypeObject, Value};
use crate::vm::VM;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

pub(crate) type Args = SmallVec<[Value; 8]>;

/// -2^63, exactly representable as f64
const INT_FLOAT_MIN: f64 = i64::MIN as f64;
/// 2^63, the first float past i64::MAX
const INT_FLOAT_END: f64 = 9_223_372_036_854_775_808.0;

impl VM {
    fn callee_index(&self, argc: usize) -> KelpResult<usize> {
        self.stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| self.error(ErrorKind::InternalError, "Stack underflow in call"))
    }

    /// Pop the top `argc` values, preserving their order
    pub(crate) fn take_args(&mut self, argc: usize) -> KelpResult<Args> {
        let start = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| self.error(ErrorKind::InternalError, "Stack underflow"))?;
        Ok(self.stack.split_off(start).into_iter().collect())
    }

    /// Replace callee and arguments with a partial application of them
    fn make_partial(&mut self, argc: usize) -> KelpResult<()> {
        let args = self.take_args(argc)?;
        let callee = self.pop()?;
        if args.is_empty() {
            return self.push(callee);
        }
        self.push(Value::partial(callee, args.into_vec()))
    }

    fn arity_error(&self, name: &str, expected: usize, got: usize) -> crate::error::KelpError {
        self.error(
            ErrorKind::ArgumentError,
            &format!(
                "wrong argument count: '{}' expects {} arguments but got {}",
                name, expected, got
            ),
        )
    }

    pub(crate) fn call_value(&mut self, argc: usize) -> KelpResult<()> {
        let callee_idx = self.callee_index(argc)?;
        let callee = self.stack.get(callee_idx).cloned().unwrap_or_default();

        let Value::Obj(obj) = &callee else {
            return Err(self.error(
                ErrorKind::TypeError,
                &format!("'{}' is not callable", callee.type_name()),
            ));
        };

        match &**obj {
            Object::Closure(closure) => self.call_closure(closure.clone(), argc),
            Object::Native(native) => self.call_native(native, argc),
            Object::Constructor(ctor) => self.call_constructor(ctor, argc),
            Object::Type(ty) => self.call_type(ty, argc),
            Object::Operator(op) => {
                if argc < 2 {
                    return self.make_partial(argc);
                }
                if argc > 2 {
                    return Err(self.arity_error(op.symbol(), 2, argc));
                }
                self.stack.remove(callee_idx);
                self.binary_op(*op)
            }
            Object::Composed { outer, inner } => {
                let args = self.take_args(argc)?;
                self.pop()?;
                let intermediate = self.call(inner, args.into_vec())?;
                self.push(outer.clone())?;
                self.push(intermediate)?;
                self.call_value(1)
            }
            Object::Bound { receiver, method } => {
                if let Some(slot) = self.stack.get_mut(callee_idx) {
                    *slot = method.clone();
                }
                self.insert_at(callee_idx + 1, receiver.clone())?;
                self.call_value(argc + 1)
            }
            Object::Partial { callee: inner, args: stored } => {
                let fresh = self.take_args(argc)?;
                if let Some(slot) = self.stack.get_mut(callee_idx) {
                    *slot = inner.clone();
                }
                for value in stored.iter().cloned().chain(fresh) {
                    self.push(value)?;
                }
                self.call_value(stored.len() + argc)
            }
            Object::TraitMethod { trait_name, method, hint } => {
                self.call_trait_method(trait_name, method, hint.clone(), argc)
            }
            _ => Err(self.error(
                ErrorKind::TypeError,
                &format!("'{}' is not callable", callee.type_name()),
            )),
        }
    }

    fn insert_at(&mut self, index: usize, value: Value) -> KelpResult<()> {
        self.stack
            .insert(index, value)
            .map_err(|_| self.error(ErrorKind::StackOverflow, "Stack overflow"))
    }

    fn call_closure(&mut self, closure: Arc<Closure>, argc: usize) -> KelpResult<()> {
        if argc < closure.proto.required_arity {
            return self.make_partial(argc);
        }
        let arity = self.prepare_args(&closure, argc)?;
        self.push_frame(closure, arity)
    }

    /// Bring the arguments on the stack to exactly the declared parameter count.
    ///
    /// Packs variadic rest arguments into a list and fills omitted trailing
    /// parameters from their defaults.
    fn prepare_args(&mut self, closure: &Arc<Closure>, argc: usize) -> KelpResult<usize> {
        let proto = &closure.proto;
        let fixed = if proto.variadic {
            proto.arity.saturating_sub(1)
        } else {
            proto.arity
        };

        if !proto.variadic && argc > proto.arity {
            return Err(self.arity_error(&proto.name, proto.arity, argc));
        }

        if proto.variadic && argc > fixed {
            let rest = self.take_args(argc - fixed)?;
            self.push(Value::list(rest.into_vec()))?;
            return Ok(proto.arity);
        }

        for param in argc..fixed {
            let value = self.default_value(closure, param)?;
            self.push(value)?;
        }
        if proto.variadic {
            self.push(Value::list(Vec::new()))?;
        }
        Ok(proto.arity)
    }

    /// Evaluate the default of `param`; thunks run in a temporary frame
    fn default_value(&mut self, closure: &Arc<Closure>, param: usize) -> KelpResult<Value> {
        match closure.proto.default_for(param) {
            None => Ok(Value::Nil),
            Some(DefaultArg::Constant(idx)) => {
                let chunk = closure.proto.chunk.clone();
                let constant = chunk.constants.get(*idx as usize).ok_or_else(|| {
                    self.error(
                        ErrorKind::InternalError,
                        &format!("Default constant {} out of range", idx),
                    )
                })?;
                self.constant_value(constant)
            }
            Some(DefaultArg::Thunk(proto)) => {
                let thunk = Value::closure(Closure::new(proto.clone(), closure.module.clone()));
                self.call(&thunk, Vec::new())
            }
        }
    }

    pub(crate) fn push_frame(&mut self, closure: Arc<Closure>, arity: usize) -> KelpResult<()> {
        if self.frames.len() >= self.config.max_frames {
            return Err(self.error(
                ErrorKind::FrameOverflow,
                &format!("Maximum call depth of {} frames exceeded", self.config.max_frames),
            ));
        }
        let base = self.callee_index(arity)?;
        let implicit = self.frames.last().and_then(|f| f.implicit_context.clone());
        self.frames.push(CallFrame::new(
            closure,
            base,
            implicit,
            self.type_context.len(),
        ));
        self.peak_frames = self.peak_frames.max(self.frames.len());
        Ok(())
    }

    /// Call in tail position: reuse the current frame when the callee is a closure
    /// that will actually run
    pub(crate) fn tail_call(&mut self, argc: usize) -> KelpResult<()> {
        let callee_idx = self.callee_index(argc)?;
        let closure = match self.stack.get(callee_idx).and_then(Value::as_object) {
            Some(Object::Closure(c)) if argc >= c.proto.required_arity => c.clone(),
            _ => return self.call_value(argc),
        };
        let Some(frame_base) = self.frames.last().map(|f| f.base) else {
            return self.call_value(argc);
        };

        let arity = self.prepare_args(&closure, argc)?;
        let new_base = self.callee_index(arity)?;
        self.open_upvalues.close(frame_base, self.stack.as_slice());
        self.stack.shift_down(new_base, frame_base);

        let Some(frame) = self.frames.last_mut() else {
            return Err(self.error(ErrorKind::InternalError, "No active frame"));
        };
        let context_depth = frame.context_depth;
        frame.chunk = closure.proto.chunk.clone();
        frame.closure = closure;
        frame.ip = 0;
        self.type_context.truncate(context_depth);
        trace!(depth = self.frames.len(), "tail call reused frame");
        Ok(())
    }

    fn call_native(&mut self, native: &NativeFunction, argc: usize) -> KelpResult<()> {
        if argc < native.required {
            return self.make_partial(argc);
        }
        if !native.variadic && argc > native.arity {
            return Err(self.arity_error(&native.name, native.arity, argc));
        }
        let args = self.take_args(argc)?;
        self.pop()?;

        let func = native.func.clone();
        let result = func(self, &args).map_err(|e| self.error(ErrorKind::RuntimeError, &e))?;
        self.push(result)
    }

    fn call_constructor(&mut self, ctor: &Constructor, argc: usize) -> KelpResult<()> {
        let total = ctor.type_params + ctor.arity;
        if argc < total {
            return self.make_partial(argc);
        }
        if argc > total {
            return Err(self.arity_error(&ctor.name, total, argc));
        }
        let mut args = self.take_args(argc)?.into_vec();
        self.pop()?;
        let fields = args.split_off(ctor.type_params);
        self.push(Value::Obj(Arc::new(Object::Data(DataInstance {
            type_name: ctor.type_name.clone(),
            ctor: ctor.name.clone(),
            type_args: args,
            fields,
        }))))
    }

    fn call_type(&mut self, ty: &TypeObject, argc: usize) -> KelpResult<()> {
        match &ty.kind {
            TypeKind::Record(fields) => {
                if argc < fields.len() {
                    return self.make_partial(argc);
                }
                if argc > fields.len() {
                    return Err(self.arity_error(&ty.name, fields.len(), argc));
                }
                let values = self.take_args(argc)?;
                self.pop()?;
                let fields = fields
                    .iter()
                    .map(|f| Arc::from(f.as_str()))
                    .zip(values)
                    .collect();
                self.push(Value::record(Some(ty.name.clone()), fields))
            }
            TypeKind::Adt(_) => {
                // Type application: remember the arguments on a new type value
                let args = self.take_args(argc)?;
                self.pop()?;
                let mut applied = ty.clone();
                applied.args.extend(args);
                self.push(Value::Obj(Arc::new(Object::Type(applied))))
            }
            TypeKind::Builtin => {
                if argc == 0 {
                    return self.make_partial(argc);
                }
                if argc > 1 {
                    return Err(self.arity_error(&ty.name, 1, argc));
                }
                let value = self.pop()?;
                self.pop()?;
                let converted = self.convert(&ty.name, value)?;
                self.push(converted)
            }
            TypeKind::Alias(target) => {
                let callee_idx = self.callee_index(argc)?;
                let resolved = match self.globals.get(target) {
                    Some(found @ Value::Obj(obj)) if matches!(&**obj, Object::Type(_)) => {
                        found.clone()
                    }
                    _ => Value::Obj(Arc::new(Object::Type(TypeObject {
                        name: self.normalize_type(target),
                        kind: TypeKind::Builtin,
                        args: Vec::new(),
                    }))),
                };
                if let Some(slot) = self.stack.get_mut(callee_idx) {
                    *slot = resolved;
                }
                self.call_value(argc)
            }
        }
    }

    /// Conversion performed by calling a builtin type
    ///
    /// Floats outside the i64 range (and NaN or infinities) fail instead of saturating.
    fn convert(&self, type_name: &str, value: Value) -> KelpResult<Value> {
        let fail = || {
            self.error(
                ErrorKind::TypeError,
                &format!("Cannot convert '{}' to {}", value.type_name(), type_name),
            )
        };
        let converted = match (type_name, &value) {
            ("Int", Value::Int(_)) => value.clone(),
            ("Int", Value::Float(f)) if (INT_FLOAT_MIN..INT_FLOAT_END).contains(&f.trunc()) => {
                Value::Int(f.trunc() as i64)
            }
            ("Int", Value::Bool(b)) => Value::Int(*b as i64),
            ("Int", _) => match value.as_str().map(|s| s.trim().parse::<i64>()) {
                Some(Ok(n)) => Value::Int(n),
                _ => return Err(fail()),
            },
            ("Float", Value::Float(_)) => value.clone(),
            ("Float", Value::Int(n)) => Value::Float(*n as f64),
            ("Float", _) => match value.as_str().map(|s| s.trim().parse::<f64>()) {
                Some(Ok(n)) => Value::Float(n),
                _ => return Err(fail()),
            },
            ("String", _) => match value.as_str() {
                Some(_) => value.clone(),
                None => Value::string(value.to_string()),
            },
            ("Bool", _) => Value::Bool(value.is_truthy()),
            ("List", _) => match value.as_object() {
                Some(Object::List(_)) => value.clone(),
                Some(Object::Tuple(items)) => Value::list(items.clone()),
                Some(Object::Str(s)) => {
                    Value::list(s.chars().map(|c| Value::string(c.to_string())).collect())
                }
                Some(Object::Map(entries)) => {
                    let mut pairs = entries.entries();
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    Value::list(
                        pairs
                            .into_iter()
                            .map(|(k, v)| Value::tuple(vec![Value::string(&*k), v]))
                            .collect(),
                    )
                }
                _ => return Err(fail()),
            },
            ("Tuple", _) => match value.as_object() {
                Some(Object::Tuple(_)) => value.clone(),
                Some(Object::List(items)) => Value::tuple(items.clone()),
                _ => return Err(fail()),
            },
            _ => return Err(fail()),
        };
        Ok(converted)
    }

    /// Strip a trailing type witness, returning the remaining argument count
    fn take_witness(&mut self, argc: usize) -> KelpResult<(usize, Option<Arc<str>>)> {
        if argc == 0 {
            return Ok((0, None));
        }
        let hint = match self.stack.peek(0).and_then(Value::as_object) {
            Some(Object::Witness(ty)) => ty.clone(),
            _ => return Ok((argc, None)),
        };
        self.pop()?;
        Ok((argc - 1, Some(hint)))
    }

    fn call_trait_method(
        &mut self,
        trait_name: &str,
        method: &str,
        carried: Option<Arc<str>>,
        argc: usize,
    ) -> KelpResult<()> {
        let (argc, witness) = self.take_witness(argc)?;
        let hint = witness.or(carried);
        let decl = self.traits.get(trait_name).cloned().ok_or_else(|| {
            self.error(
                ErrorKind::TraitError,
                &format!("Unknown trait '{}'", trait_name),
            )
        })?;
        let arity = decl.method(method).map(|m| m.arity).ok_or_else(|| {
            self.error(
                ErrorKind::TraitError,
                &format!("Trait '{}' has no method '{}'", trait_name, method),
            )
        })?;
        if argc < arity {
            // The partial keeps the witness so completing it resolves the same instance
            if hint.is_some() {
                let callee_idx = self.callee_index(argc)?;
                let hinted = Value::Obj(Arc::new(Object::TraitMethod {
                    trait_name: Arc::from(trait_name),
                    method: Arc::from(method),
                    hint,
                }));
                if let Some(slot) = self.stack.get_mut(callee_idx) {
                    *slot = hinted;
                }
            }
            return self.make_partial(argc);
        }

        let callee_idx = self.callee_index(argc)?;
        let args: Args = self.stack.as_slice()[callee_idx + 1..].iter().cloned().collect();
        let implementation = self.resolve_trait_method(&decl, method, hint.as_deref(), &args)?;
        if matches!(implementation.as_object(), Some(Object::TraitMethod { .. })) {
            return Err(self.error(
                ErrorKind::TraitError,
                &format!("'{}.{}' resolves to another trait method", trait_name, method),
            ));
        }
        if let Some(slot) = self.stack.get_mut(callee_idx) {
            *slot = implementation;
        }
        self.call_value(argc)
    }

    /// Method call on a receiver: `recv.name(args)`
    pub(crate) fn invoke(&mut self, name: &str, argc: usize) -> KelpResult<()> {
        let recv_idx = self.callee_index(argc)?;
        let receiver = self.stack.get(recv_idx).cloned().unwrap_or_default();

        // A callable stored in a field is called without the receiver
        let field = match receiver.as_object() {
            Some(Object::Record(record)) => record.get(name).cloned(),
            Some(Object::Map(entries)) => entries.get(name).cloned(),
            _ => None,
        };
        if let Some(field) = field.filter(Value::is_callable) {
            if let Some(slot) = self.stack.get_mut(recv_idx) {
                *slot = field;
            }
            return self.call_value(argc);
        }

        let ty = self.normalize_type(receiver.type_name());
        let method = if let Some(ext) = self.extensions.get(&format!("{}.{}", ty, name)) {
            ext.clone()
        } else {
            let providers = self.traits.providers(name);
            let chosen = providers
                .iter()
                .find(|t| self.traits.has_instance(t, &ty))
                .or_else(|| providers.first());
            match chosen {
                Some(trait_name) => Value::trait_method(trait_name, name),
                None => {
                    return Err(self.error(
                        ErrorKind::NameError,
                        &format!("Undefined method '{}' for '{}'", name, ty),
                    ))
                }
            }
        };
        self.insert_at(recv_idx, method)?;
        self.call_value(argc + 1)
    }

    /// Apply an operator to the top two stack values, falling back to a trait
    /// method named by the operator symbol
    pub(crate) fn binary_op(&mut self, op: BinOp) -> KelpResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        if let Some(result) = self.primitive_binary(op, &a, &b)? {
            return self.push(result);
        }

        let ty = self.normalize_type(a.type_name());
        match self.operator_impl(op.symbol(), &ty) {
            Some(method) => {
                self.push(method)?;
                self.push(a)?;
                self.push(b)?;
                self.call_value(2)
            }
            None => Err(self.error(
                ErrorKind::TypeError,
                &format!(
                    "Unsupported operand types for '{}': '{}' and '{}'",
                    op.symbol(),
                    a.type_name(),
                    b.type_name()
                ),
            )),
        }
    }

    /// Built-in operator semantics; `None` when the operands need a trait method
    fn primitive_binary(&self, op: BinOp, a: &Value, b: &Value) -> KelpResult<Option<Value>> {
        use Value::{Float, Int};

        let overflow = || self.error(ErrorKind::RuntimeError, "Integer overflow");
        let result = match (op, a, b) {
            (BinOp::Add, Int(x), Int(y)) => Int(x.checked_add(*y).ok_or_else(overflow)?),
            (BinOp::Sub, Int(x), Int(y)) => Int(x.checked_sub(*y).ok_or_else(overflow)?),
            (BinOp::Mul, Int(x), Int(y)) => Int(x.checked_mul(*y).ok_or_else(overflow)?),
            (BinOp::Div, Int(_), Int(0)) => {
                return Err(self.error(ErrorKind::DivisionByZero, "Division by zero"))
            }
            (BinOp::Mod, Int(_), Int(0)) => {
                return Err(self.error(ErrorKind::DivisionByZero, "Modulo by zero"))
            }
            (BinOp::Div, Int(x), Int(y)) => Int(x.checked_div(*y).ok_or_else(overflow)?),
            (BinOp::Mod, Int(x), Int(y)) => Int(x.checked_rem(*y).ok_or_else(overflow)?),

            (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod, _, _)
                if is_number(a) && is_number(b) =>
            {
                let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
                Float(match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    _ => x % y,
                })
            }

            (BinOp::Add | BinOp::Concat, _, _) => match (a.as_object(), b.as_object()) {
                (Some(Object::Str(x)), Some(Object::Str(y))) => {
                    let mut s = String::with_capacity(x.len() + y.len());
                    s.push_str(x);
                    s.push_str(y);
                    Value::string(s)
                }
                (Some(Object::List(x)), Some(Object::List(y))) if op == BinOp::Concat => {
                    Value::list(x.iter().chain(y.iter()).cloned().collect())
                }
                (Some(Object::Bytes(x)), Some(Object::Bytes(y))) if op == BinOp::Concat => {
                    Value::bytes(x.iter().chain(y.iter()).copied().collect::<Vec<u8>>())
                }
                _ => return Ok(None),
            },

            (BinOp::Eq | BinOp::Ne, _, _) => {
                let user_type = matches!(
                    a.as_object(),
                    Some(Object::Record(_)) | Some(Object::Data(_))
                );
                if user_type
                    && self
                        .operator_impl(op.symbol(), &self.normalize_type(a.type_name()))
                        .is_some()
                {
                    return Ok(None);
                }
                Value::Bool((a == b) == (op == BinOp::Eq))
            }

            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, _, _) => {
                let ordering = match (a, b) {
                    (Int(x), Int(y)) => x.partial_cmp(y),
                    _ if is_number(a) && is_number(b) => {
                        a.as_float().partial_cmp(&b.as_float())
                    }
                    _ => match (a.as_str(), b.as_str()) {
                        (Some(x), Some(y)) => x.partial_cmp(y),
                        _ => return Ok(None),
                    },
                };
                let Some(ordering) = ordering else {
                    // NaN compares false with everything
                    return Ok(Some(Value::Bool(false)));
                };
                Value::Bool(match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }

            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    /// Closure for a function constant that captures nothing
    pub(crate) fn plain_closure(&self, proto: &Arc<FunctionProto>) -> Value {
        let module = self.frames.last().and_then(|f| f.closure.module.clone());
        Value::closure(Closure::new(proto.clone(), module))
    }
}

fn is_number(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

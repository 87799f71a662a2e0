// Kelp Virtual Machine
// Stack-based VM for executing bytecode
// Implements suspend/resume so awaiting a task never blocks the async entry point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, warn};

use crate::bytecode::{Chunk, Constant, FunctionProto, OpCode, TypeKind};
use crate::config::VmConfig;
use crate::error::{ErrorKind, KelpError, KelpResult, Span, StackFrame};
use crate::trie::Trie;
use crate::vm::caller::ValueCaller;
use crate::vm::closure::{read_upvalue, Closure, OpenUpvalues, Upvalue};
use crate::vm::debug::{DebugState, StopReason};
use crate::vm::fork::{dropped_task, TaskReceiver};
use crate::vm::frame::{CallFrame, Stack};
use crate::vm::traits::{MethodCompiler, TraitRegistry};
use crate::vm::value::{Constructor, NativeFunction, Object, TypeObject, Value};

/// Frames kept in the trace of a resource-exhaustion error
const EXHAUSTED_TRACE_FRAMES: usize = 16;
/// Alias chains longer than this are treated as cycles
const MAX_ALIAS_HOPS: usize = 16;

/// Result of executing one instruction
pub enum Step {
    Continue,
    /// The frame at the run's floor returned this value
    Returned(Value),
    Suspend(Suspension),
    Halted(Value),
    Fail(KelpError),
}

/// Why execution paused without finishing
pub enum Suspension {
    Breakpoint(StopReason),
    Await(TaskReceiver),
}

/// Outcome of running until the next await
enum Outcome {
    Finished(Value),
    Awaiting(TaskReceiver),
}

/// Stack, frame, and context heights to restore when a run fails
#[derive(Clone, Copy)]
struct RunMark {
    frames: usize,
    stack: usize,
    contexts: usize,
    /// Offset of the caller's instruction; a nested run overwrites it
    instr_start: usize,
}

/// The Kelp Virtual Machine
///
/// Single-threaded; concurrency comes from `fork`, which hands the persistent
/// tables to a sibling instance by root.
pub struct VM {
    pub(crate) stack: Stack,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) open_upvalues: OpenUpvalues,
    pub(crate) globals: Trie<Value>,
    /// module name -> module bindings
    pub(crate) modules: Trie<Trie<Value>>,
    pub(crate) traits: TraitRegistry,
    /// "Type.method" -> function
    pub(crate) extensions: Trie<Value>,
    pub(crate) aliases: Trie<Arc<str>>,
    /// Explicit expected-type stack
    pub(crate) type_context: Vec<Arc<str>>,
    pub(crate) resources: Arc<FxHashMap<String, Arc<[u8]>>>,
    pub(crate) compiler: Option<Arc<dyn MethodCompiler>>,
    pub(crate) config: VmConfig,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) debug: DebugState,
    /// Frame count at which the active run returns to its caller
    pub(crate) floor: usize,
    /// ip of the instruction being executed, for error positions
    pub(crate) instr_start: usize,
    /// Instructions left before the next cancellation check
    pub(crate) budget: u32,
    pub(crate) peak_frames: usize,
}

// Implement ValueCaller trait to allow native functions to call closures
impl ValueCaller for VM {
    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, String> {
        VM::call(self, callee, args).map_err(|e| e.message)
    }

    fn global(&self, name: &str) -> Option<Value> {
        VM::global(self, name)
    }

    fn resource(&self, path: &str) -> Option<Arc<[u8]>> {
        VM::resource(self, path)
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            stack: Stack::new(&config),
            frames: Vec::with_capacity(64),
            open_upvalues: OpenUpvalues::new(),
            globals: Trie::new(),
            modules: Trie::new(),
            traits: TraitRegistry::new(),
            extensions: Trie::new(),
            aliases: Trie::new(),
            type_context: Vec::new(),
            resources: Arc::new(FxHashMap::default()),
            compiler: None,
            budget: config.cancel_check_interval,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            debug: DebugState::default(),
            floor: 0,
            instr_start: 0,
            peak_frames: 0,
        };
        vm.install_builtin_types();
        vm
    }

    /// Type values for the primitive types, callable as conversions
    fn install_builtin_types(&mut self) {
        for name in ["Int", "Float", "String", "Bool", "List", "Tuple"] {
            let ty = TypeObject {
                name: Arc::from(name),
                kind: TypeKind::Builtin,
                args: Vec::new(),
            };
            self.globals = self
                .globals
                .put(name, Value::Obj(Arc::new(Object::Type(ty))));
        }
    }

    // ==================== Host API ====================

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn register_global(&mut self, name: &str, value: Value) {
        self.globals = self.globals.put(name, value);
    }

    pub fn register_native<F>(&mut self, name: &str, arity: usize, func: F)
    where
        F: Fn(&mut dyn ValueCaller, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register_global(name, Value::native(NativeFunction::new(name, arity, func)));
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Current globals root; cheap to clone and never changes underneath the caller
    pub fn globals(&self) -> &Trie<Value> {
        &self.globals
    }

    pub fn traits(&self) -> &TraitRegistry {
        &self.traits
    }

    pub fn traits_mut(&mut self) -> &mut TraitRegistry {
        &mut self.traits
    }

    pub fn register_extension(&mut self, type_name: &str, method: &str, value: Value) {
        self.extensions = self
            .extensions
            .put(&format!("{}.{}", type_name, method), value);
    }

    pub fn register_alias(&mut self, alias: &str, target: &str) {
        self.aliases = self.aliases.put(alias, Arc::from(target));
    }

    pub fn resource(&self, path: &str) -> Option<Arc<[u8]>> {
        self.resources.get(path).cloned()
    }

    pub fn set_resources(&mut self, resources: FxHashMap<String, Arc<[u8]>>) {
        self.resources = Arc::new(resources);
    }

    pub fn set_method_compiler(&mut self, compiler: Arc<dyn MethodCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Setting the flag makes every VM sharing it stop with `Cancelled`
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Deepest frame stack seen so far
    pub fn peak_frame_depth(&self) -> usize {
        self.peak_frames
    }

    /// Push an expected type for trait dispatch from host code
    pub fn push_type_context(&mut self, type_name: &str) {
        self.type_context.push(Arc::from(type_name));
    }

    pub fn pop_type_context(&mut self) -> Option<Arc<str>> {
        self.type_context.pop()
    }

    /// Follow type aliases to the canonical runtime type name
    pub fn normalize_type(&self, name: &str) -> Arc<str> {
        let mut current: Arc<str> = Arc::from(name);
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(&current) {
                Some(target) if **target != *current => current = target.clone(),
                _ => break,
            }
        }
        current
    }

    /// Normalize every '_'-separated segment of a composite instance key
    pub fn normalize_composite(&self, key: &str) -> Arc<str> {
        let segments: Vec<Arc<str>> = key.split('_').map(|seg| self.normalize_type(seg)).collect();
        Arc::from(segments.join("_"))
    }

    // ==================== Running ====================

    fn mark(&self) -> RunMark {
        RunMark {
            frames: self.frames.len(),
            stack: self.stack.len(),
            contexts: self.type_context.len(),
            instr_start: self.instr_start,
        }
    }

    /// Drop everything a failed run left behind
    fn unwind(&mut self, mark: RunMark) {
        self.open_upvalues.close(mark.stack, self.stack.as_slice());
        self.frames.truncate(mark.frames);
        self.stack.truncate(mark.stack);
        self.type_context.truncate(mark.contexts);
    }

    fn entry_closure(&self, entry: Arc<FunctionProto>) -> Value {
        let module: Arc<str> = Arc::from(entry.chunk.file.as_str());
        Value::closure(Closure::new(entry, Some(module)))
    }

    /// Push callee and args and dispatch; `Some` when no frame was needed
    fn begin_call(&mut self, callee: &Value, args: Vec<Value>) -> KelpResult<Option<Value>> {
        let frames_before = self.frames.len();
        let argc = args.len();
        self.push(callee.clone())?;
        for arg in args {
            self.push(arg)?;
        }
        self.call_value(argc)?;
        if self.frames.len() > frames_before {
            Ok(None)
        } else {
            self.pop().map(Some)
        }
    }

    /// Call a value synchronously and return its result.
    ///
    /// Used by host code and by natives calling back into the VM. Awaits inside
    /// the callee block the current thread until the task finishes.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> KelpResult<Value> {
        let mark = self.mark();
        let result = match self.begin_call(callee, args) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.drive_blocking(mark.frames),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.unwind(mark);
        }
        self.instr_start = mark.instr_start;
        result
    }

    /// Run a compiled entry function to completion
    #[instrument(skip(self, entry), fields(entry = %entry.name, file = %entry.chunk.file))]
    pub async fn run(&mut self, entry: Arc<FunctionProto>) -> KelpResult<Value> {
        info!("run started");
        let mark = self.mark();
        let callee = self.entry_closure(entry);
        let result = match self.begin_call(&callee, Vec::new()) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.drive_async(mark.frames).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => info!(peak_frames = self.peak_frames, "run finished"),
            Err(e) => {
                info!(kind = %e.kind, "run failed");
                self.unwind(mark);
            }
        }
        result
    }

    /// Same as `run`, for callers without an async context
    #[instrument(skip(self, entry), fields(entry = %entry.name, file = %entry.chunk.file))]
    pub fn run_blocking(&mut self, entry: Arc<FunctionProto>) -> KelpResult<Value> {
        info!("run started");
        let callee = self.entry_closure(entry);
        let result = self.call(&callee, Vec::new());
        match &result {
            Ok(_) => info!(peak_frames = self.peak_frames, "run finished"),
            Err(e) => info!(kind = %e.kind, "run failed"),
        }
        result
    }

    /// Event loop - handles suspend/resume for awaited tasks
    async fn drive_async(&mut self, floor: usize) -> KelpResult<Value> {
        let saved = std::mem::replace(&mut self.floor, floor);
        let result = loop {
            match self.run_until_suspend() {
                Ok(Outcome::Finished(value)) => break Ok(value),
                Ok(Outcome::Awaiting(receiver)) => {
                    let resolved = receiver.await;
                    if let Err(e) = self.resume_await(resolved) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.floor = saved;
        result
    }

    /// Nested event loop that blocks on awaited tasks
    fn drive_blocking(&mut self, floor: usize) -> KelpResult<Value> {
        let saved = std::mem::replace(&mut self.floor, floor);
        let result = loop {
            match self.run_until_suspend() {
                Ok(Outcome::Finished(value)) => break Ok(value),
                Ok(Outcome::Awaiting(receiver)) => {
                    let resolved = futures::executor::block_on(receiver);
                    if let Err(e) = self.resume_await(resolved) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.floor = saved;
        result
    }

    fn resume_await(
        &mut self,
        resolved: Result<KelpResult<Value>, tokio::sync::oneshot::error::RecvError>,
    ) -> KelpResult<()> {
        match resolved {
            Ok(Ok(value)) => self.push(value),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let mut e = dropped_task();
                e.span = self.current_span();
                Err(e)
            }
        }
    }

    /// Execute until the floor frame returns, the program halts, or a task is awaited
    fn run_until_suspend(&mut self) -> KelpResult<Outcome> {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Returned(value) | Step::Halted(value) => return Ok(Outcome::Finished(value)),
                Step::Suspend(Suspension::Await(receiver)) => {
                    return Ok(Outcome::Awaiting(receiver))
                }
                Step::Suspend(Suspension::Breakpoint(reason)) => {
                    if !self.pause(reason) {
                        return Err(self.error(ErrorKind::Cancelled, "Execution stopped by debugger"));
                    }
                }
                Step::Fail(e) => return Err(e),
            }
        }
    }

    /// Execute a single instruction
    pub fn step(&mut self) -> Step {
        if self.frames.len() <= self.floor {
            return Step::Fail(KelpError::internal_error("No frame to execute"));
        }

        self.budget = self.budget.saturating_sub(1);
        if self.budget == 0 {
            self.budget = self.config.cancel_check_interval.max(1);
            if self.cancel.load(Ordering::Relaxed) {
                return Step::Fail(self.error(ErrorKind::Cancelled, "Execution cancelled"));
            }
        }

        if self.debug.is_active() {
            if let Some(reason) = self.should_break() {
                return Step::Suspend(Suspension::Breakpoint(reason));
            }
        }

        match self.execute_instruction() {
            Ok(step) => step,
            Err(e) => Step::Fail(e),
        }
    }

    // ==================== Helper Methods ====================

    pub(crate) fn push(&mut self, value: Value) -> KelpResult<()> {
        self.stack.push(value).map_err(|_| {
            self.error(
                ErrorKind::StackOverflow,
                &format!("Stack overflow ({} slots)", self.config.max_stack),
            )
        })
    }

    pub(crate) fn pop(&mut self) -> KelpResult<Value> {
        let floor = self.frames.last().map(|f| f.base).unwrap_or(0);
        if self.stack.len() <= floor && !self.frames.is_empty() {
            return Err(self.error(ErrorKind::InternalError, "Stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| self.error(ErrorKind::InternalError, "Stack underflow"))
    }

    fn peek(&self, distance: usize) -> KelpResult<&Value> {
        self.stack
            .peek(distance)
            .ok_or_else(|| self.error(ErrorKind::InternalError, "Stack underflow"))
    }

    fn frame(&self) -> KelpResult<&CallFrame> {
        self.frames
            .last()
            .ok_or_else(|| KelpError::internal_error("No active frame"))
    }

    fn read_byte(&mut self) -> KelpResult<u8> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| KelpError::internal_error("No active frame"))?;
        match frame.chunk.code.get(frame.ip) {
            Some(&byte) => {
                frame.ip += 1;
                Ok(byte)
            }
            None => Err(self.error(ErrorKind::InternalError, "Instruction pointer out of range")),
        }
    }

    fn read_u16(&mut self) -> KelpResult<u16> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| KelpError::internal_error("No active frame"))?;
        match frame.chunk.read_u16(frame.ip) {
            Some(value) => {
                frame.ip += 2;
                Ok(value)
            }
            None => Err(self.error(ErrorKind::InternalError, "Truncated operand")),
        }
    }

    fn current_chunk(&self) -> KelpResult<Arc<Chunk>> {
        Ok(self.frame()?.chunk.clone())
    }

    fn bad_constant(&self, idx: u16, expected: &str) -> KelpError {
        self.error(
            ErrorKind::InternalError,
            &format!("Constant {} is not a valid {}", idx, expected),
        )
    }

    fn str_constant<'c>(&self, chunk: &'c Chunk, idx: u16) -> KelpResult<&'c str> {
        match chunk.constants.get(idx as usize) {
            Some(Constant::Str(s)) => Ok(s.as_str()),
            _ => Err(self.bad_constant(idx, "name")),
        }
    }

    /// Materialize a constant as a runtime value
    pub(crate) fn constant_value(&self, constant: &Constant) -> KelpResult<Value> {
        let value = match constant {
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::Str(s) => Value::string(s.as_str()),
            Constant::Function(proto) => {
                if !proto.upvalues.is_empty() {
                    return Err(self.error(
                        ErrorKind::InternalError,
                        &format!("Function '{}' captures variables; use a closure instruction", proto.name),
                    ));
                }
                self.plain_closure(proto)
            }
            Constant::Constructor(c) => {
                if c.arity == 0 && c.type_params == 0 {
                    Value::data(&c.type_name, &c.name, Vec::new())
                } else {
                    Value::Obj(Arc::new(Object::Constructor(Constructor {
                        type_name: Arc::from(c.type_name.as_str()),
                        name: Arc::from(c.name.as_str()),
                        arity: c.arity,
                        type_params: c.type_params,
                    })))
                }
            }
            Constant::Type(t) => Value::Obj(Arc::new(Object::Type(TypeObject {
                name: Arc::from(t.name.as_str()),
                kind: t.kind.clone(),
                args: Vec::new(),
            }))),
            Constant::TraitMethod { trait_name, method } => Value::trait_method(trait_name, method),
            Constant::Operator(op) => Value::Obj(Arc::new(Object::Operator(*op))),
            Constant::Witness(ty) => Value::witness(ty),
            Constant::Trait(_) | Constant::Instance(_) | Constant::Shape(_) => {
                return Err(self.error(
                    ErrorKind::InternalError,
                    "Declaration constant used as a value",
                ))
            }
        };
        Ok(value)
    }

    fn current_span(&self) -> Span {
        match self.frames.last() {
            Some(frame) => Span::single(
                frame.chunk.line_at(self.instr_start),
                frame.chunk.column_at(self.instr_start),
            ),
            None => Span::default(),
        }
    }

    /// Build an error at the current instruction with a trace of the live frames
    pub(crate) fn error(&self, kind: ErrorKind, message: &str) -> KelpError {
        let Some(frame) = self.frames.last() else {
            return KelpError::new(kind, message, Span::default(), "<host>");
        };

        let limit = if kind.is_resource_exhaustion() {
            EXHAUSTED_TRACE_FRAMES
        } else {
            usize::MAX
        };
        let trace = self
            .frames
            .iter()
            .rev()
            .take(limit)
            .enumerate()
            .map(|(depth, f)| {
                // Callers sit just past their call instruction
                let at = if depth == 0 {
                    self.instr_start
                } else {
                    f.ip.saturating_sub(1)
                };
                StackFrame::new(
                    f.function_name(),
                    &f.chunk.file,
                    f.chunk.line_at(at),
                    f.chunk.column_at(at),
                )
            })
            .collect();

        KelpError::new(kind, message, self.current_span(), frame.chunk.file.as_str())
            .with_stack_trace(trace)
    }

    /// Pop the current frame, leaving `result` for the caller
    fn return_from_frame(&mut self, result: Value) -> KelpResult<Step> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| KelpError::internal_error("Return without a frame"))?;
        self.open_upvalues.close(frame.base, self.stack.as_slice());
        self.stack.truncate(frame.base);
        self.type_context.truncate(frame.context_depth);

        if self.frames.len() <= self.floor {
            return Ok(Step::Returned(result));
        }
        self.push(result)?;
        Ok(Step::Continue)
    }

    /// Stop the program: every frame above the floor is discarded
    fn halt(&mut self, result: Value) -> Step {
        if let Some(base) = self.frames.get(self.floor).map(|f| f.base) {
            self.open_upvalues.close(base, self.stack.as_slice());
            self.stack.truncate(base);
        }
        if let Some(depth) = self.frames.get(self.floor).map(|f| f.context_depth) {
            self.type_context.truncate(depth);
        }
        self.frames.truncate(self.floor);
        Step::Halted(result)
    }

    fn jump_forward(&mut self, offset: u16) -> KelpResult<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| KelpError::internal_error("No active frame"))?;
        let target = frame.ip + offset as usize;
        if target > frame.chunk.code.len() {
            return Err(self.error(ErrorKind::InternalError, "Jump target out of range"));
        }
        frame.ip = target;
        Ok(())
    }

    fn slot_index(&self, slot: u16) -> KelpResult<usize> {
        let index = self.frame()?.base + slot as usize;
        if index >= self.stack.len() {
            return Err(self.error(
                ErrorKind::InternalError,
                &format!("Local slot {} out of range", slot),
            ));
        }
        Ok(index)
    }

    fn upvalue_cell(&self, idx: u16) -> KelpResult<crate::vm::closure::UpvalueCell> {
        self.frame()?
            .closure
            .upvalues
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| {
                self.error(
                    ErrorKind::InternalError,
                    &format!("Upvalue {} out of range", idx),
                )
            })
    }

    fn current_module(&self) -> Option<Arc<str>> {
        self.frames.last().and_then(|f| f.closure.module.clone())
    }

    fn undefined(&self, name: &str) -> KelpError {
        self.error(
            ErrorKind::NameError,
            &format!("Undefined variable '{}'", name),
        )
    }

    /// Pop `n` values, preserving their order
    fn pop_n(&mut self, n: usize) -> KelpResult<Vec<Value>> {
        Ok(self.take_args(n)?.into_vec())
    }

    fn key_string(&self, key: &Value) -> KelpResult<String> {
        match key {
            Value::Int(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => key.as_str().map(str::to_string).ok_or_else(|| {
                self.error(
                    ErrorKind::TypeError,
                    &format!("Map keys must be strings or integers, got '{}'", key.type_name()),
                )
            }),
        }
    }

    fn index_error(&self, index: i64, len: usize) -> KelpError {
        self.error(
            ErrorKind::IndexError,
            &format!("Index {} out of bounds for length {}", index, len),
        )
    }

    fn index_value(&self, container: &Value, index: &Value) -> KelpResult<Value> {
        let position = |items_len: usize| -> KelpResult<usize> {
            match index {
                Value::Int(i) if *i >= 0 && (*i as usize) < items_len => Ok(*i as usize),
                Value::Int(i) => Err(self.index_error(*i, items_len)),
                _ => Err(self.error(
                    ErrorKind::TypeError,
                    &format!("Index must be an Int, got '{}'", index.type_name()),
                )),
            }
        };

        match container.as_object() {
            Some(Object::List(items)) | Some(Object::Tuple(items)) => {
                Ok(items[position(items.len())?].clone())
            }
            Some(Object::Str(s)) => {
                let count = s.chars().count();
                let at = position(count)?;
                Ok(s.chars().nth(at).map(|c| Value::string(c.to_string())).unwrap_or_default())
            }
            Some(Object::Bytes(bytes)) => Ok(Value::Int(bytes[position(bytes.len())?] as i64)),
            Some(Object::Map(entries)) => {
                let key = self.key_string(index)?;
                entries.get(&key).cloned().ok_or_else(|| {
                    self.error(ErrorKind::IndexError, &format!("Key '{}' not found", key))
                })
            }
            Some(Object::Record(record)) if index.as_str().is_some() => {
                let name = index.as_str().unwrap_or("");
                record.get(name).cloned().ok_or_else(|| {
                    self.error(
                        ErrorKind::NameError,
                        &format!("'{}' has no field '{}'", container.type_name(), name),
                    )
                })
            }
            _ => Err(self.error(
                ErrorKind::TypeError,
                &format!(
                    "Cannot index '{}' with '{}'",
                    container.type_name(),
                    index.type_name()
                ),
            )),
        }
    }

    fn get_field(&self, object: Value, name: &str) -> KelpResult<Value> {
        let direct = match object.as_object() {
            Some(Object::Record(record)) => record.get(name).cloned(),
            Some(Object::Map(entries)) => entries.get(name).cloned(),
            _ => None,
        };
        if let Some(value) = direct {
            return Ok(value);
        }

        // Static members of a type value are extensions keyed by the type's own name
        if let Some(Object::Type(ty)) = object.as_object() {
            let key = format!("{}.{}", self.normalize_type(&ty.name), name);
            if let Some(member) = self.extensions.get(&key) {
                return Ok(member.clone());
            }
        }

        let ty = self.normalize_type(object.type_name());
        match self.extensions.get(&format!("{}.{}", ty, name)) {
            Some(method) => Ok(Value::bound(object, method.clone())),
            None => Err(self.error(
                ErrorKind::NameError,
                &format!("'{}' has no field '{}'", ty, name),
            )),
        }
    }

    fn get_item(&self, object: &Value, i: u16) -> KelpResult<Value> {
        let i = i as usize;
        let found = match object.as_object() {
            Some(Object::Tuple(items)) | Some(Object::List(items)) => {
                items.get(i).cloned().ok_or(items.len())
            }
            Some(Object::Data(data)) => data.fields.get(i).cloned().ok_or(data.fields.len()),
            Some(Object::Record(record)) => record
                .fields
                .get(i)
                .map(|(_, v)| v.clone())
                .ok_or(record.fields.len()),
            _ => {
                return Err(self.error(
                    ErrorKind::TypeError,
                    &format!("'{}' has no positional items", object.type_name()),
                ))
            }
        };
        found.map_err(|len| self.index_error(i as i64, len))
    }

    // ==================== Instruction Execution ====================

    fn execute_instruction(&mut self) -> KelpResult<Step> {
        self.instr_start = self.frame()?.ip;
        let byte = self.read_byte()?;
        let op = OpCode::try_from(byte).map_err(|b| {
            self.error(
                ErrorKind::InternalError,
                &format!("Unknown opcode 0x{:02x}", b),
            )
        })?;

        match op {
            OpCode::Constant => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let constant = chunk
                    .constants
                    .get(idx as usize)
                    .ok_or_else(|| self.bad_constant(idx, "constant"))?;
                let value = self.constant_value(constant)?;
                self.push(value)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let value = self.peek(0)?.clone();
                self.push(value)?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }

            OpCode::GetLocal => {
                let slot = self.read_u16()?;
                let index = self.slot_index(slot)?;
                let value = self.stack.get(index).cloned().unwrap_or_default();
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_u16()?;
                let index = self.slot_index(slot)?;
                let value = self.peek(0)?.clone();
                if let Some(target) = self.stack.get_mut(index) {
                    *target = value;
                }
            }
            OpCode::GetUpvalue => {
                let idx = self.read_u16()?;
                let cell = self.upvalue_cell(idx)?;
                let value = read_upvalue(&cell, self.stack.as_slice());
                self.push(value)?;
            }
            OpCode::SetUpvalue => {
                let idx = self.read_u16()?;
                let cell = self.upvalue_cell(idx)?;
                let value = self.peek(0)?.clone();
                let mut guard = cell.lock();
                match &mut *guard {
                    Upvalue::Open(location) => {
                        if let Some(target) = self.stack.get_mut(*location) {
                            *target = value;
                        }
                    }
                    Upvalue::Closed(held) => *held = value,
                }
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len().saturating_sub(1);
                self.open_upvalues.close(top, self.stack.as_slice());
                self.pop()?;
            }
            OpCode::CloseScope => {
                let slot = self.read_u16()?;
                let result = self.pop()?;
                let from = self.frame()?.base + slot as usize;
                self.open_upvalues.close(from, self.stack.as_slice());
                self.stack.truncate(from);
                self.push(result)?;
            }

            OpCode::DefineGlobal => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let value = self.pop()?;
                self.globals = self.globals.put(name, value);
            }
            OpCode::GetGlobal => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let value = self.globals.get(name).cloned().ok_or_else(|| self.undefined(name))?;
                self.push(value)?;
            }
            OpCode::SetGlobal => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                if !self.globals.contains_key(name) {
                    return Err(self.undefined(name));
                }
                let value = self.peek(0)?.clone();
                self.globals = self.globals.put(name, value);
            }
            OpCode::DefineModule | OpCode::SetModule => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let value = if op == OpCode::DefineModule {
                    self.pop()?
                } else {
                    self.peek(0)?.clone()
                };
                match self.current_module() {
                    Some(module) => {
                        let bindings = self.modules.get(&module).cloned().unwrap_or_default();
                        if op == OpCode::SetModule && !bindings.contains_key(name) {
                            return Err(self.undefined(name));
                        }
                        self.modules = self.modules.put(&module, bindings.put(name, value));
                    }
                    None => {
                        if op == OpCode::SetModule && !self.globals.contains_key(name) {
                            return Err(self.undefined(name));
                        }
                        self.globals = self.globals.put(name, value);
                    }
                }
            }
            OpCode::GetModule => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let value = self
                    .current_module()
                    .and_then(|m| self.modules.get(&m).and_then(|b| b.get(name)).cloned())
                    .or_else(|| self.globals.get(name).cloned())
                    .ok_or_else(|| self.undefined(name))?;
                self.push(value)?;
            }

            OpCode::Add
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
            | OpCode::GreaterEqual => {
                let Some(bin) = crate::bytecode::BinOp::from_opcode(op) else {
                    return Err(self.error(ErrorKind::InternalError, "Not a binary operator"));
                };
                self.binary_op(bin)?;
            }
            OpCode::Negate => {
                let value = self.pop()?;
                let negated = match value {
                    Value::Int(n) => Value::Int(n.checked_neg().ok_or_else(|| {
                        self.error(ErrorKind::RuntimeError, "Integer overflow")
                    })?),
                    Value::Float(n) => Value::Float(-n),
                    other => {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            &format!("Cannot negate '{}'", other.type_name()),
                        ))
                    }
                };
                self.push(negated)?;
            }
            OpCode::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }

            OpCode::Jump => {
                let offset = self.read_u16()?;
                self.jump_forward(offset)?;
            }
            OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                let offset = self.read_u16()?;
                let condition = self.pop()?.is_truthy();
                if condition == (op == OpCode::JumpIfTrue) {
                    self.jump_forward(offset)?;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16()? as usize;
                let frame = self
                    .frames
                    .last_mut()
                    .ok_or_else(|| KelpError::internal_error("No active frame"))?;
                match frame.ip.checked_sub(offset) {
                    Some(target) => frame.ip = target,
                    None => {
                        return Err(self.error(ErrorKind::InternalError, "Loop target out of range"))
                    }
                }
            }

            OpCode::Call => {
                let argc = self.read_u16()? as usize;
                self.call_value(argc)?;
            }
            OpCode::TailCall => {
                let argc = self.read_u16()? as usize;
                self.tail_call(argc)?;
            }
            OpCode::Invoke => {
                let idx = self.read_u16()?;
                let argc = self.read_u16()? as usize;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                self.invoke(name, argc)?;
            }
            OpCode::Closure => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let Some(Constant::Function(proto)) = chunk.constants.get(idx as usize) else {
                    return Err(self.bad_constant(idx, "function"));
                };
                let (base, enclosing) = {
                    let frame = self.frame()?;
                    (frame.base, frame.closure.clone())
                };

                let mut closure = Closure::new(proto.clone(), enclosing.module.clone());
                for info in &proto.upvalues {
                    let cell = if info.is_local {
                        let location = base + info.index as usize;
                        if location >= self.stack.len() {
                            return Err(self.error(
                                ErrorKind::InternalError,
                                &format!("Captured slot {} out of range", info.index),
                            ));
                        }
                        self.open_upvalues.capture(location)
                    } else {
                        enclosing
                            .upvalues
                            .get(info.index as usize)
                            .cloned()
                            .ok_or_else(|| {
                                self.error(
                                    ErrorKind::InternalError,
                                    &format!("Upvalue {} out of range", info.index),
                                )
                            })?
                    };
                    closure.upvalues.push(cell);
                }
                self.push(Value::closure(closure))?;
            }
            OpCode::Return => {
                let result = self.pop()?;
                return self.return_from_frame(result);
            }
            OpCode::Halt => {
                let result = self.pop()?;
                return Ok(self.halt(result));
            }

            OpCode::BuildList => {
                let n = self.read_u16()? as usize;
                let items = self.pop_n(n)?;
                self.push(Value::list(items))?;
            }
            OpCode::BuildTuple => {
                let n = self.read_u16()? as usize;
                let items = self.pop_n(n)?;
                self.push(Value::tuple(items))?;
            }
            OpCode::BuildRecord => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let Some(Constant::Shape(shape)) = chunk.constants.get(idx as usize) else {
                    return Err(self.bad_constant(idx, "record shape"));
                };
                let values = self.pop_n(shape.fields.len())?;
                let fields = shape
                    .fields
                    .iter()
                    .map(|f| Arc::from(f.as_str()))
                    .zip(values)
                    .collect();
                let type_name = shape.type_name.as_deref().map(Arc::from);
                self.push(Value::record(type_name, fields))?;
            }
            OpCode::BuildMap => {
                let n = self.read_u16()? as usize;
                let items = self.pop_n(n * 2)?;
                let mut entries = Trie::new();
                for pair in items.chunks(2) {
                    let key = self.key_string(&pair[0])?;
                    entries = entries.put(&key, pair[1].clone());
                }
                self.push(Value::map(entries))?;
            }
            OpCode::GetIndex => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.index_value(&container, &index)?;
                self.push(value)?;
            }
            OpCode::GetField => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let object = self.pop()?;
                let value = self.get_field(object, name)?;
                self.push(value)?;
            }
            OpCode::GetItem => {
                let i = self.read_u16()?;
                let object = self.pop()?;
                let value = self.get_item(&object, i)?;
                self.push(value)?;
            }
            OpCode::MatchCtor => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let matched = self
                    .peek(0)?
                    .as_data()
                    .is_some_and(|data| &*data.ctor == name);
                self.push(Value::Bool(matched))?;
            }
            OpCode::Unwrap => {
                let value = self.pop()?;
                let (ctor, inner) = match value.as_data() {
                    Some(data) => (data.ctor.clone(), data.fields.first().cloned()),
                    None => {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            &format!("Cannot unwrap '{}'", value.type_name()),
                        ))
                    }
                };
                match (&*ctor, inner) {
                    ("Some" | "Ok", Some(inner)) => self.push(inner)?,
                    ("None" | "Fail" | "Err", _) => return self.return_from_frame(value),
                    _ => {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            &format!("Cannot unwrap constructor '{}'", ctor),
                        ))
                    }
                }
            }
            OpCode::Compose => {
                let inner = self.pop()?;
                let outer = self.pop()?;
                self.push(Value::Obj(Arc::new(Object::Composed { outer, inner })))?;
            }

            OpCode::PushTypeContext => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                self.type_context.push(Arc::from(name));
            }
            OpCode::PopTypeContext => {
                if self.type_context.len() <= self.frame()?.context_depth {
                    return Err(self.error(ErrorKind::InternalError, "Type context underflow"));
                }
                self.type_context.pop();
            }
            OpCode::SetImplicitContext => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let name = self.str_constant(&chunk, idx)?;
                let context = (!name.is_empty()).then(|| Arc::from(name));
                if let Some(frame) = self.frames.last_mut() {
                    frame.implicit_context = context;
                }
            }

            OpCode::DefineTrait => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let Some(Constant::Trait(decl)) = chunk.constants.get(idx as usize) else {
                    return Err(self.bad_constant(idx, "trait"));
                };
                debug!(trait_name = %decl.name, methods = decl.methods.len(), "defining trait");
                for sig in &decl.methods {
                    if !self.globals.contains_key(&sig.name) {
                        self.globals = self
                            .globals
                            .put(&sig.name, Value::trait_method(&decl.name, &sig.name));
                    }
                }
                self.traits.define_trait(decl.clone());
            }
            OpCode::DefineInstance => {
                let idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let Some(Constant::Instance(decl)) = chunk.constants.get(idx as usize) else {
                    return Err(self.bad_constant(idx, "instance"));
                };
                let values = self.pop_n(decl.methods.len())?;
                let Some(trait_decl) = self.traits.get(&decl.trait_name).cloned() else {
                    return Err(self.error(
                        ErrorKind::TraitError,
                        &format!("Instance for unknown trait '{}'", decl.trait_name),
                    ));
                };
                let type_key = if trait_decl.params > 1 {
                    self.normalize_composite(&decl.type_key)
                } else {
                    self.normalize_type(&decl.type_key)
                };
                debug!(trait_name = %decl.trait_name, type_key = %type_key, "registering instance");
                let methods = decl.methods.iter().cloned().zip(values).collect();
                self.traits.add_instance(&decl.trait_name, &type_key, methods);
            }
            OpCode::DefineExtension => {
                let type_idx = self.read_u16()?;
                let method_idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let type_name = self.normalize_type(self.str_constant(&chunk, type_idx)?);
                let method = self.str_constant(&chunk, method_idx)?;
                let value = self.pop()?;
                self.register_extension(&type_name, method, value);
            }
            OpCode::DefineAlias => {
                let alias_idx = self.read_u16()?;
                let target_idx = self.read_u16()?;
                let chunk = self.current_chunk()?;
                let alias = self.str_constant(&chunk, alias_idx)?;
                let target = self.str_constant(&chunk, target_idx)?;
                self.register_alias(alias, target);
            }

            OpCode::Spawn => {
                let argc = self.read_u16()? as usize;
                let args = self.pop_n(argc)?;
                let callee = self.pop()?;
                if !callee.is_callable() {
                    return Err(self.error(
                        ErrorKind::TypeError,
                        &format!("Cannot spawn '{}'", callee.type_name()),
                    ));
                }
                let handle = self.spawn(&callee, &args);
                self.push(Value::Obj(Arc::new(Object::Task(handle))))?;
            }
            OpCode::Await => {
                let value = self.pop()?;
                let Some(Object::Task(handle)) = value.as_object() else {
                    // Awaiting a plain value yields it unchanged
                    self.push(value)?;
                    return Ok(Step::Continue);
                };
                match handle.take_receiver() {
                    Some(receiver) => return Ok(Step::Suspend(Suspension::Await(receiver))),
                    None => {
                        warn!(task_id = handle.id(), "task awaited twice");
                        return Err(self.error(
                            ErrorKind::RuntimeError,
                            &format!("Task {} was already awaited", handle.id()),
                        ));
                    }
                }
            }
            OpCode::Break => {
                return Ok(Step::Suspend(Suspension::Breakpoint(StopReason::Explicit)));
            }
        }

        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, FunctionProto};

    fn script(build: impl FnOnce(&mut Chunk)) -> Arc<FunctionProto> {
        let mut chunk = Chunk::new("test.kp");
        build(&mut chunk);
        Arc::new(FunctionProto::new("<script>", 0, chunk))
    }

    #[test]
    fn test_arithmetic_and_widening() {
        let entry = script(|c| {
            c.write_constant(Constant::Int(7), 1);
            c.write_constant(Constant::Float(0.5), 1);
            c.write_op(OpCode::Add, 1);
            c.write_op(OpCode::Return, 1);
        });
        let mut vm = VM::new();
        assert_eq!(vm.run_blocking(entry).unwrap(), Value::Float(7.5));
    }

    #[test]
    fn test_unknown_opcode_is_internal_error() {
        let entry = script(|c| c.write(0xEE, 3, 1));
        let mut vm = VM::new();
        let err = vm.run_blocking(entry).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert_eq!(err.line(), 3);
        assert_eq!(vm.frame_depth(), 0);
        assert!(vm.stack_contents().is_empty());
    }

    #[test]
    fn test_truncated_operand() {
        let entry = script(|c| {
            c.write_op(OpCode::Constant, 1);
            c.write(0, 1, 1);
        });
        let err = VM::new().run_blocking(entry).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }

    #[test]
    fn test_undefined_global_is_name_error() {
        let entry = script(|c| {
            let name = c.add_constant(Constant::Str("missing".into()));
            c.write_op(OpCode::GetGlobal, 4);
            c.write_u16(name, 4);
            c.write_op(OpCode::Return, 4);
        });
        let err = VM::new().run_blocking(entry).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameError);
        assert!(err.message.contains("missing"));
        assert_eq!(err.stack_trace.len(), 1);
    }

    #[test]
    fn test_cancellation() {
        let entry = script(|c| {
            // loop forever
            c.write_op(OpCode::Loop, 1);
            c.write_u16(3, 1);
        });
        let mut vm = VM::with_config(VmConfig {
            cancel_check_interval: 8,
            ..VmConfig::default()
        });
        vm.cancel_token().store(true, Ordering::Relaxed);
        let err = vm.run_blocking(entry).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_alias_normalization() {
        let mut vm = VM::new();
        vm.register_alias("Number", "Int");
        vm.register_alias("Count", "Number");
        assert_eq!(&*vm.normalize_type("Count"), "Int");
        vm.register_alias("Loop", "Loop");
        assert_eq!(&*vm.normalize_type("Loop"), "Loop");
        assert_eq!(&*vm.normalize_composite("Count_String_Number"), "Int_String_Int");
    }

    #[test]
    fn test_native_callback_into_vm() {
        let mut vm = VM::new();
        vm.register_native("twice", 2, |caller, args| {
            let once = caller.call(&args[0], vec![args[1].clone()])?;
            caller.call(&args[0], vec![once])
        });
        vm.register_native("inc", 1, |_, args| match args[0] {
            Value::Int(n) => Ok(Value::Int(n + 1)),
            _ => Err("expected Int".into()),
        });
        let twice = vm.global("twice").unwrap();
        let inc = vm.global("inc").unwrap();
        let result = vm.call(&twice, vec![inc, Value::Int(5)]).unwrap();
        assert_eq!(result, Value::Int(7));
    }

    #[test]
    fn test_native_error_becomes_runtime_error() {
        let mut vm = VM::new();
        vm.register_native("fail", 0, |_, _| Err("boom".into()));
        let fail = vm.global("fail").unwrap();
        let err = vm.call(&fail, vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeError);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_builtin_type_conversion() {
        let mut vm = VM::new();
        let int = vm.global("Int").unwrap();
        assert_eq!(vm.call(&int, vec![Value::string("42")]).unwrap(), Value::Int(42));
        let string = vm.global("String").unwrap();
        assert_eq!(
            vm.call(&string, vec![Value::Float(1.5)]).unwrap(),
            Value::string("1.5")
        );
        assert_eq!(vm.call(&int, vec![Value::Float(-2.7)]).unwrap(), Value::Int(-2));
        assert_eq!(
            vm.call(&int, vec![Value::Float(-9.223_372_036_854_775_808e18)]).unwrap(),
            Value::Int(i64::MIN)
        );
        for out_of_range in [1e19, -1e19, 9.223_372_036_854_775_808e18, f64::NAN, f64::INFINITY] {
            let err = vm.call(&int, vec![Value::Float(out_of_range)]).unwrap_err();
            assert_eq!(err.kind, ErrorKind::TypeError);
        }
    }
}

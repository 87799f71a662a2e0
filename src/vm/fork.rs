// Kelp Fork / Async Tasks
// Spawned calls run on a sibling VM that shares the persistent tables by root

use crate::error::{KelpError, KelpResult};
use crate::vm::closure::{Closure, Upvalue, UpvalueCell};
use crate::vm::frame::Stack;
use crate::vm::value::{Object, Value};
use crate::vm::VM;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

pub type TaskReceiver = oneshot::Receiver<KelpResult<Value>>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a spawned task; awaiting it takes the result receiver
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    receiver: Arc<Mutex<Option<TaskReceiver>>>,
}

impl TaskHandle {
    pub fn new(receiver: TaskReceiver) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// None once the task has already been awaited
    pub fn take_receiver(&self) -> Option<TaskReceiver> {
        self.receiver.lock().take()
    }
}

/// Copies values so they no longer reference the spawning VM's stack.
///
/// Every reachable upvalue cell, open or closed, is replaced by a fresh closed
/// cell; cells shared by several closures stay shared in the copy.
pub struct Detacher<'a> {
    stack: &'a [Value],
    cells: FxHashMap<usize, UpvalueCell>,
}

impl<'a> Detacher<'a> {
    pub fn new(stack: &'a [Value]) -> Self {
        Self {
            stack,
            cells: FxHashMap::default(),
        }
    }

    fn detach_cell(&mut self, cell: &UpvalueCell) -> UpvalueCell {
        let key = Arc::as_ptr(cell) as usize;
        if let Some(copy) = self.cells.get(&key) {
            return copy.clone();
        }
        // Register before walking the value so self-referencing closures terminate
        let copy: UpvalueCell = Arc::new(Mutex::new(Upvalue::Closed(Value::Nil)));
        self.cells.insert(key, copy.clone());

        let current = match &*cell.lock() {
            Upvalue::Open(location) => self.stack.get(*location).cloned().unwrap_or_default(),
            Upvalue::Closed(value) => value.clone(),
        };
        let detached = self.detach(&current);
        *copy.lock() = Upvalue::Closed(detached);
        copy
    }

    fn detach_all(&mut self, items: &[Value]) -> Vec<Value> {
        items.iter().map(|v| self.detach(v)).collect()
    }

    pub fn detach(&mut self, value: &Value) -> Value {
        let Value::Obj(obj) = value else {
            return value.clone();
        };
        let copied = match &**obj {
            Object::Closure(closure) => {
                if closure.upvalues.is_empty() {
                    return value.clone();
                }
                let upvalues = closure
                    .upvalues
                    .iter()
                    .map(|cell| self.detach_cell(cell))
                    .collect();
                Object::Closure(Arc::new(Closure {
                    proto: closure.proto.clone(),
                    upvalues,
                    module: closure.module.clone(),
                }))
            }
            Object::List(items) => Object::List(self.detach_all(items)),
            Object::Tuple(items) => Object::Tuple(self.detach_all(items)),
            Object::Record(record) => Object::Record(crate::vm::value::Record {
                type_name: record.type_name.clone(),
                fields: record
                    .fields
                    .iter()
                    .map(|(name, v)| (name.clone(), self.detach(v)))
                    .collect(),
            }),
            Object::Data(data) => Object::Data(crate::vm::value::DataInstance {
                type_name: data.type_name.clone(),
                ctor: data.ctor.clone(),
                type_args: self.detach_all(&data.type_args),
                fields: self.detach_all(&data.fields),
            }),
            Object::Map(entries) => {
                let mut copy = entries.clone();
                for (key, v) in entries.entries() {
                    copy = copy.put(&key, self.detach(&v));
                }
                Object::Map(copy)
            }
            Object::Composed { outer, inner } => Object::Composed {
                outer: self.detach(outer),
                inner: self.detach(inner),
            },
            Object::Bound { receiver, method } => Object::Bound {
                receiver: self.detach(receiver),
                method: self.detach(method),
            },
            Object::Partial { callee, args } => Object::Partial {
                callee: self.detach(callee),
                args: self.detach_all(args),
            },
            Object::Type(ty) if !ty.args.is_empty() => {
                let mut ty = ty.clone();
                ty.args = self.detach_all(&ty.args);
                Object::Type(ty)
            }
            // Nothing reachable from these can alias the stack
            _ => return value.clone(),
        };
        Value::Obj(Arc::new(copied))
    }
}

impl VM {
    /// Sibling VM sharing this VM's table roots, config, hooks and cancellation token.
    ///
    /// The child owns a fresh stack and frame array; writes on either side
    /// produce new roots that the other never sees.
    pub fn fork(&self) -> VM {
        VM {
            stack: Stack::new(&self.config),
            frames: Vec::new(),
            open_upvalues: Default::default(),
            globals: self.globals.clone(),
            modules: self.modules.clone(),
            traits: self.traits.clone(),
            extensions: self.extensions.clone(),
            aliases: self.aliases.clone(),
            type_context: Vec::new(),
            resources: self.resources.clone(),
            compiler: self.compiler.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            debug: Default::default(),
            floor: 0,
            instr_start: 0,
            budget: self.config.cancel_check_interval,
            peak_frames: 0,
        }
    }

    /// Run `callee(args)` on a forked VM; the returned handle yields its result
    pub fn spawn(&self, callee: &Value, args: &[Value]) -> TaskHandle {
        let (callee, args) = {
            let mut detacher = Detacher::new(self.stack.as_slice());
            let callee = detacher.detach(callee);
            let args: Vec<Value> = args.iter().map(|a| detacher.detach(a)).collect();
            (callee, args)
        };

        let mut child = self.fork();
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(rx);
        let task_id = handle.id();
        debug!(task_id, callee = %callee, "spawning task");

        let job = move || {
            let result = child.call(&callee, args);
            if let Err(e) = &result {
                debug!(task_id, error = %e.message, "task failed");
            }
            // The receiver may have been dropped; the result is then discarded
            let _ = tx.send(result);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
        handle
    }
}

/// Map a closed channel to an error
pub(crate) fn dropped_task() -> KelpError {
    KelpError::runtime_error("Task ended without producing a result")
}

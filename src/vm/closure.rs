// Kelp Closures and Upvalues
// Captured variables stay open while their stack slot is live and are closed
// (copied out) when the owning scope exits

use crate::bytecode::FunctionProto;
use crate::vm::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// Captured variable cell
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Aliases a live operand stack slot
    Open(usize),
    Closed(Value),
}

pub type UpvalueCell = Arc<Mutex<Upvalue>>;

/// Function template plus its resolved captures
#[derive(Clone)]
pub struct Closure {
    pub proto: Arc<FunctionProto>,
    pub upvalues: Vec<UpvalueCell>,
    /// Module whose bindings `GetModule`/`SetModule` address
    pub module: Option<Arc<str>>,
}

impl Closure {
    pub fn new(proto: Arc<FunctionProto>, module: Option<Arc<str>>) -> Self {
        Self {
            upvalues: Vec::with_capacity(proto.upvalues.len()),
            proto,
            module,
        }
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }
}

/// Read the current value of an upvalue against the live stack
pub fn read_upvalue(cell: &UpvalueCell, stack: &[Value]) -> Value {
    match &*cell.lock() {
        Upvalue::Open(location) => stack.get(*location).cloned().unwrap_or_default(),
        Upvalue::Closed(value) => value.clone(),
    }
}

/// Open upvalues of every active frame, sorted by stack location descending.
///
/// At most one open cell exists per location; capturing the same slot twice
/// hands back the existing cell.
#[derive(Default)]
pub struct OpenUpvalues {
    entries: Vec<(usize, UpvalueCell)>,
}

impl OpenUpvalues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, location: usize) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|(probe, _)| location.cmp(probe))
    }

    /// Return the open cell for `location`, creating it if needed
    pub fn capture(&mut self, location: usize) -> UpvalueCell {
        match self.search(location) {
            Ok(index) => self.entries[index].1.clone(),
            Err(index) => {
                let cell = Arc::new(Mutex::new(Upvalue::Open(location)));
                self.entries.insert(index, (location, cell.clone()));
                cell
            }
        }
    }

    /// Close every open upvalue at or above `from`, copying the slot value out
    pub fn close(&mut self, from: usize, stack: &[Value]) {
        let count = self.entries.partition_point(|(location, _)| *location >= from);
        for (location, cell) in self.entries.drain(..count) {
            let value = stack.get(location).cloned().unwrap_or_default();
            *cell.lock() = Upvalue::Closed(value);
        }
    }

    /// Locations currently open, highest first
    pub fn locations(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|(location, _)| *location)
    }
}

// Kelp Call Frames and Operand Stack

use crate::bytecode::Chunk;
use crate::config::VmConfig;
use crate::vm::closure::Closure;
use crate::vm::value::Value;
use std::sync::Arc;

/// Call frame for function execution
#[derive(Clone)]
pub struct CallFrame {
    pub closure: Arc<Closure>,
    /// Same chunk as `closure.proto.chunk`, kept here for the fetch loop
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    /// Stack index of slot 0 (the callee); parameters follow
    pub base: usize,
    /// Ambient type inherited by callees unless overridden
    pub implicit_context: Option<Arc<str>>,
    /// Type-context stack depth at frame entry, restored on return
    pub context_depth: usize,
}

impl CallFrame {
    pub fn new(
        closure: Arc<Closure>,
        base: usize,
        implicit_context: Option<Arc<str>>,
        context_depth: usize,
    ) -> Self {
        Self {
            chunk: closure.proto.chunk.clone(),
            closure,
            ip: 0,
            base,
            implicit_context,
            context_depth,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.closure.proto.name
    }
}

/// Raised when the stack cannot grow past its configured maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFull;

/// Growable operand stack with a hard ceiling
pub struct Stack {
    values: Vec<Value>,
    max: usize,
    increment: usize,
}

impl Stack {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            values: Vec::with_capacity(config.initial_stack.min(config.max_stack)),
            max: config.max_stack,
            increment: config.stack_increment.max(1),
        }
    }

    /// Grow by the fixed increment or by doubling, whichever is larger
    fn grow(&mut self, needed: usize) -> Result<(), StackFull> {
        if needed > self.max {
            return Err(StackFull);
        }
        let capacity = self.values.capacity();
        if needed <= capacity {
            return Ok(());
        }
        let target = (capacity + self.increment)
            .max(capacity * 2)
            .max(needed)
            .min(self.max);
        self.values.reserve_exact(target - self.values.len());
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<(), StackFull> {
        if self.values.len() >= self.max {
            return Err(StackFull);
        }
        if self.values.len() == self.values.capacity() {
            self.grow(self.values.len() + 1)?;
        }
        self.values.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.values.pop()
    }

    /// Value `distance` slots below the top
    pub fn peek(&self, distance: usize) -> Option<&Value> {
        let index = self.values.len().checked_sub(1 + distance)?;
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.values.get_mut(index)
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Remove and return everything from `start` to the top
    pub fn split_off(&mut self, start: usize) -> Vec<Value> {
        let start = start.min(self.values.len());
        self.values.split_off(start)
    }

    pub fn insert(&mut self, index: usize, value: Value) -> Result<(), StackFull> {
        if self.values.len() >= self.max {
            return Err(StackFull);
        }
        if self.values.len() == self.values.capacity() {
            self.grow(self.values.len() + 1)?;
        }
        self.values.insert(index, value);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<Value> {
        (index < self.values.len()).then(|| self.values.remove(index))
    }

    pub fn extend<I: IntoIterator<Item = Value>>(&mut self, items: I) -> Result<(), StackFull> {
        for item in items {
            self.push(item)?;
        }
        Ok(())
    }

    /// Slide everything from `from` to the top down to `to`, dropping what was between
    pub fn shift_down(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        self.values.drain(to..from);
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> VmConfig {
        VmConfig {
            max_stack: 64,
            initial_stack: 4,
            stack_increment: 8,
            ..VmConfig::default()
        }
    }

    #[test]
    fn test_push_pop_peek() {
        let mut stack = Stack::new(&small_config());
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        assert_eq!(stack.peek(0), Some(&Value::Int(2)));
        assert_eq!(stack.peek(1), Some(&Value::Int(1)));
        assert_eq!(stack.peek(2), None);
        assert_eq!(stack.pop(), Some(Value::Int(2)));
        assert_eq!(stack.pop(), Some(Value::Int(1)));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_growth_uses_larger_of_increment_and_doubling() {
        let mut stack = Stack::new(&small_config());
        for i in 0..5 {
            stack.push(Value::Int(i)).unwrap();
        }
        // 4 + 8 beats 4 * 2
        assert!(stack.capacity() >= 12);
        for i in 5..13 {
            stack.push(Value::Int(i)).unwrap();
        }
        assert!(stack.capacity() >= 24);
    }

    #[test]
    fn test_overflow_at_max() {
        let mut stack = Stack::new(&small_config());
        for i in 0..64 {
            stack.push(Value::Int(i)).unwrap();
        }
        assert_eq!(stack.push(Value::Nil), Err(StackFull));
        assert_eq!(stack.len(), 64);
    }

    #[test]
    fn test_shift_down() {
        let mut stack = Stack::new(&small_config());
        stack.extend((0..6).map(Value::Int)).unwrap();
        stack.shift_down(4, 1);
        let values: Vec<i64> = stack.as_slice().iter().filter_map(Value::as_int).collect();
        assert_eq!(values, vec![0, 4, 5]);
    }
}

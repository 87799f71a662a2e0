// Kelp Debugger Support
// Breakpoints, a stop/resume hook, and read-only views of the running VM

use crate::error::StackFrame;
use crate::vm::closure::read_upvalue;
use crate::vm::value::Value;
use crate::vm::VM;
use rustc_hash::FxHashSet;
use tracing::trace;

/// Where execution currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub function: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    /// `Break` instruction in the bytecode
    Explicit,
    /// Single-step after the previous stop
    Step,
}

/// What the hook wants the VM to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    Continue,
    /// Stop again at the next line
    StepLine,
    /// Abandon the run with a cancellation error
    Abort,
}

pub type DebugHook = Box<dyn FnMut(&VM, StopReason) -> DebugAction + Send>;

#[derive(Default)]
pub struct DebugState {
    breakpoints: FxHashSet<(String, usize)>,
    hook: Option<DebugHook>,
    /// Frame depth and ip of the last stop, so resuming does not stop again
    paused_at: Option<(usize, usize)>,
    /// Line we stepped from, while single-stepping
    step_from: Option<usize>,
}

impl DebugState {
    pub fn is_active(&self) -> bool {
        !self.breakpoints.is_empty() || self.step_from.is_some()
    }
}

impl VM {
    pub fn set_breakpoint(&mut self, file: &str, line: usize) {
        self.debug.breakpoints.insert((file.to_string(), line));
    }

    pub fn clear_breakpoint(&mut self, file: &str, line: usize) -> bool {
        self.debug.breakpoints.remove(&(file.to_string(), line))
    }

    pub fn set_debug_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&VM, StopReason) -> DebugAction + Send + 'static,
    {
        self.debug.hook = Some(Box::new(hook));
    }

    /// Check whether the instruction at the current ip should stop first
    pub(crate) fn should_break(&mut self) -> Option<StopReason> {
        let frame = self.frames.last()?;
        let here = (self.frames.len(), frame.ip);
        if self.debug.paused_at == Some(here) {
            self.debug.paused_at = None;
            return None;
        }

        let line = frame.chunk.line_at(frame.ip);
        let line_start = frame.ip == 0 || frame.chunk.line_at(frame.ip - 1) != line;

        let reason = if self.debug.step_from.is_some_and(|from| from != line) {
            Some(StopReason::Step)
        } else if line_start && self.debug.breakpoints.contains(&(frame.chunk.file.clone(), line)) {
            Some(StopReason::Breakpoint)
        } else {
            None
        };

        if reason.is_some() {
            self.debug.paused_at = Some(here);
        }
        reason
    }

    /// Hand control to the hook; returns false when the run must stop
    pub(crate) fn pause(&mut self, reason: StopReason) -> bool {
        if let Some(loc) = self.current_location() {
            trace!(file = %loc.file, line = loc.line, ?reason, "debugger stop");
        }
        let Some(mut hook) = self.debug.hook.take() else {
            return true;
        };
        let action = hook(self, reason);
        self.debug.hook = Some(hook);

        match action {
            DebugAction::Continue => {
                self.debug.step_from = None;
                true
            }
            DebugAction::StepLine => {
                self.debug.step_from = self.current_location().map(|loc| loc.line);
                true
            }
            DebugAction::Abort => false,
        }
    }

    pub fn current_location(&self) -> Option<SourceLocation> {
        let frame = self.frames.last()?;
        Some(SourceLocation {
            file: frame.chunk.file.clone(),
            line: frame.chunk.line_at(frame.ip),
            column: frame.chunk.column_at(frame.ip),
            function: frame.function_name().to_string(),
        })
    }

    /// Active frames, innermost first
    pub fn call_stack(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                StackFrame::new(
                    frame.function_name(),
                    &frame.chunk.file,
                    frame.chunk.line_at(frame.ip.saturating_sub(1)),
                    frame.chunk.column_at(frame.ip.saturating_sub(1)),
                )
            })
            .collect()
    }

    /// Named locals and captured variables of the innermost frame
    pub fn locals(&self) -> Vec<(String, Value)> {
        let Some(frame) = self.frames.last() else {
            return Vec::new();
        };
        let stack = self.stack.as_slice();
        let mut out: Vec<(String, Value)> = frame
            .closure
            .proto
            .local_names
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .filter_map(|(slot, name)| {
                stack
                    .get(frame.base + slot)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        for (i, cell) in frame.closure.upvalues.iter().enumerate() {
            out.push((format!("^{}", i), read_upvalue(cell, stack)));
        }
        out
    }

    /// Globals sorted by name
    pub fn globals_snapshot(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .globals
            .entries()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Raw operand stack, bottom first
    pub fn stack_contents(&self) -> &[Value] {
        self.stack.as_slice()
    }
}

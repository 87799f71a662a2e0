// Kelp VM Configuration
// Limits and tuning knobs for a VM instance

use serde::{Deserialize, Serialize};

/// Hard limits and tuning knobs for one VM instance.
///
/// Forked instances inherit the configuration of their parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum number of live call frames (recursion guard)
    pub max_frames: usize,
    /// Maximum number of operand stack slots
    pub max_stack: usize,
    /// Slots reserved up front
    pub initial_stack: usize,
    /// Minimum growth step when the stack is full
    pub stack_increment: usize,
    /// Instructions executed between cancellation checks
    pub cancel_check_interval: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: 4096,
            max_stack: 1 << 20,
            initial_stack: 256,
            stack_increment: 256,
            cancel_check_interval: 1024,
        }
    }
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

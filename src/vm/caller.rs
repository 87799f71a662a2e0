// Kelp Value Caller
// Allows native functions to call back into the VM

use crate::vm::value::Value;
use std::sync::Arc;

/// Trait for calling Values (functions/closures) from native functions
pub trait ValueCaller {
    /// Call a callable value with given arguments
    /// Returns the result or an error message
    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, String>;

    /// Look up a global binding in the calling VM
    fn global(&self, name: &str) -> Option<Value>;

    /// Embedded resource shipped with the running bundle
    fn resource(&self, path: &str) -> Option<Arc<[u8]>>;
}

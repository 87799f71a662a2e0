// Kelp VM Module
// Bytecode interpreter, values, and the trait/task machinery around it

pub mod caller;
pub mod closure;
pub mod debug;
mod dispatch;
pub mod fork;
pub mod frame;
pub mod traits;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use caller::ValueCaller;
pub use closure::{Closure, Upvalue, UpvalueCell};
pub use debug::{DebugAction, SourceLocation, StopReason};
pub use fork::TaskHandle;
pub use traits::{MethodCompiler, TraitRegistry};
pub use value::{NativeFn, NativeFunction, Object, Value};
pub use vm::{Step, Suspension, VM};

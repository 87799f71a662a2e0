// Kelp Programming Language
// Bytecode execution core: values, dispatch, traits, and tasks

pub mod bundle;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod trie;
pub mod vm;

pub use bundle::{Bundle, BundleError};
pub use config::VmConfig;
pub use error::{ErrorKind, KelpError, KelpResult};
pub use trie::Trie;
pub use vm::{Value, VM};

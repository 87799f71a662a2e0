// Kelp Bundle Loading
// A precompiled program: entry function, trait defaults, embedded resources

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytecode::FunctionProto;
use crate::vm::{Closure, Value, VM};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("cannot read bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed bundle: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bundle has no entry function")]
    MissingEntry,
}

/// Default trait method compiled ahead of time for one type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecompiledDefault {
    pub trait_name: String,
    pub type_name: String,
    pub method: String,
    pub function: Arc<FunctionProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bundle {
    pub entry: Option<Arc<FunctionProto>>,
    pub trait_defaults: Vec<PrecompiledDefault>,
    /// Relative path -> raw bytes
    pub resources: FxHashMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn new(entry: Arc<FunctionProto>) -> Self {
        Self {
            entry: Some(entry),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, BundleError> {
        let bundle: Bundle = serde_json::from_str(text)?;
        if bundle.entry.is_none() {
            return Err(BundleError::MissingEntry);
        }
        Ok(bundle)
    }

    pub fn from_path(path: &Path) -> Result<Self, BundleError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl VM {
    /// Install the bundle's defaults and resources; returns the entry function to run
    pub fn load_bundle(&mut self, bundle: Bundle) -> Result<Arc<FunctionProto>, BundleError> {
        let entry = bundle.entry.ok_or(BundleError::MissingEntry)?;
        debug!(
            entry = %entry.name,
            defaults = bundle.trait_defaults.len(),
            resources = bundle.resources.len(),
            "loading bundle"
        );

        for default in bundle.trait_defaults {
            let value = Value::closure(Closure::new(default.function, None));
            self.traits_mut()
                .register_impl(&default.trait_name, &default.type_name, &default.method, value);
        }

        let resources = bundle
            .resources
            .into_iter()
            .map(|(path, bytes)| (path, Arc::from(bytes)))
            .collect();
        self.set_resources(resources);
        Ok(entry)
    }
}

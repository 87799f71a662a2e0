// Kelp Trait Registry
// Typeclass declarations, instances, and method resolution
//
// All tables are persistent tries so a forked VM shares them by cloning roots.

use crate::bytecode::{FunctionProto, TraitDecl};
use crate::error::{ErrorKind, KelpResult};
use crate::trie::Trie;
use crate::vm::closure::Closure;
use crate::vm::value::Value;
use crate::vm::VM;
use std::sync::Arc;
use tracing::debug;

/// Compiles the textual default body of a trait method for one concrete type
pub trait MethodCompiler: Send + Sync {
    fn compile_default(
        &self,
        trait_name: &str,
        method: &str,
        type_name: &str,
        source: &str,
    ) -> Result<Arc<FunctionProto>, String>;
}

const KEY_SEP: char = '\u{1f}';

fn impl_key(trait_name: &str, type_name: &str, method: &str) -> String {
    let mut key = String::with_capacity(trait_name.len() + type_name.len() + method.len() + 2);
    key.push_str(trait_name);
    key.push(KEY_SEP);
    key.push_str(type_name);
    key.push(KEY_SEP);
    key.push_str(method);
    key
}

#[derive(Clone, Default)]
pub struct TraitRegistry {
    traits: Trie<Arc<TraitDecl>>,
    /// (trait, type, method) -> implementation
    impls: Trie<Value>,
    /// trait -> type keys in registration order
    instances: Trie<Arc<Vec<Arc<str>>>>,
    /// method -> traits declaring it
    providers: Trie<Arc<Vec<Arc<str>>>>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_trait(&mut self, decl: TraitDecl) {
        let name: Arc<str> = Arc::from(decl.name.as_str());
        for sig in &decl.methods {
            let mut traits = self
                .providers
                .get(&sig.name)
                .map(|t| t.as_ref().clone())
                .unwrap_or_default();
            if !traits.contains(&name) {
                traits.push(name.clone());
                self.providers = self.providers.put(&sig.name, Arc::new(traits));
            }
        }
        self.traits = self.traits.put(&name, Arc::new(decl));
    }

    pub fn get(&self, trait_name: &str) -> Option<&Arc<TraitDecl>> {
        self.traits.get(trait_name)
    }

    pub fn trait_count(&self) -> usize {
        self.traits.len()
    }

    fn note_instance(&mut self, trait_name: &str, type_key: &str) {
        if self.has_instance(trait_name, type_key) {
            return;
        }
        let mut types = self
            .instances
            .get(trait_name)
            .map(|t| t.as_ref().clone())
            .unwrap_or_default();
        types.push(Arc::from(type_key));
        self.instances = self.instances.put(trait_name, Arc::new(types));
    }

    /// Record one method implementation; the type becomes an instance of the trait
    pub fn register_impl(&mut self, trait_name: &str, type_key: &str, method: &str, value: Value) {
        self.note_instance(trait_name, type_key);
        self.impls = self
            .impls
            .put(&impl_key(trait_name, type_key, method), value);
    }

    pub fn add_instance(&mut self, trait_name: &str, type_key: &str, methods: Vec<(String, Value)>) {
        self.note_instance(trait_name, type_key);
        for (method, value) in methods {
            self.register_impl(trait_name, type_key, &method, value);
        }
    }

    pub fn lookup(&self, trait_name: &str, type_key: &str, method: &str) -> Option<&Value> {
        self.impls.get(&impl_key(trait_name, type_key, method))
    }

    pub fn has_instance(&self, trait_name: &str, type_key: &str) -> bool {
        self.instances(trait_name).iter().any(|t| &**t == type_key)
    }

    pub fn instances(&self, trait_name: &str) -> &[Arc<str>] {
        self.instances
            .get(trait_name)
            .map(|t| t.as_slice())
            .unwrap_or(&[])
    }

    pub fn providers(&self, method: &str) -> &[Arc<str>] {
        self.providers
            .get(method)
            .map(|t| t.as_slice())
            .unwrap_or(&[])
    }
}

/// Pick the registered composite key that best matches the argument types.
///
/// Keys are type names joined with '_'. A candidate scores the number of
/// leading segments equal to the argument types; ties go to a trailing segment
/// equal to the ambient type, then to an exact segment count, then to the
/// lexicographically smaller key.
pub fn best_composite_match<'a>(
    candidates: &'a [Arc<str>],
    arg_types: &[&str],
    ambient: Option<&str>,
) -> Option<&'a Arc<str>> {
    let rank = |key: &Arc<str>| {
        let segments: Vec<&str> = key.split('_').collect();
        let score = segments
            .iter()
            .zip(arg_types)
            .take_while(|(seg, ty)| *seg == *ty)
            .count();
        let ambient_tail = match (ambient, segments.last()) {
            (Some(amb), Some(last)) => *last == amb,
            _ => false,
        };
        let exact = segments.len() == arg_types.len();
        (score, ambient_tail, exact)
    };

    candidates
        .iter()
        .map(|key| (rank(key), key))
        .filter(|((score, _, _), _)| *score > 0)
        .max_by(|(a, ka), (b, kb)| a.cmp(b).then_with(|| kb.cmp(ka)))
        .map(|(_, key)| key)
}

impl VM {
    /// Innermost expected type: the explicit context stack, then the frame's implicit context
    pub(crate) fn ambient_type(&self) -> Option<Arc<str>> {
        self.type_context
            .last()
            .cloned()
            .or_else(|| self.frames.last().and_then(|f| f.implicit_context.clone()))
    }

    /// Choose the type whose instance should serve `method` of `decl`
    fn select_instance_type(
        &self,
        decl: &TraitDecl,
        method: &str,
        hint: Option<&str>,
        args: &[Value],
    ) -> Option<Arc<str>> {
        if let Some(hint) = hint {
            return Some(self.normalize_type(hint));
        }

        let arg_types: Vec<Arc<str>> = args
            .iter()
            .map(|arg| self.normalize_type(arg.type_name()))
            .collect();

        if decl.params > 1 {
            let ambient = self.ambient_type().map(|ty| self.normalize_type(&ty));
            let types: Vec<&str> = arg_types.iter().map(|t| &**t).collect();
            if let Some(key) =
                best_composite_match(self.traits.instances(&decl.name), &types, ambient.as_deref())
            {
                return Some(key.clone());
            }
        } else if let Some(ty) = arg_types
            .iter()
            .find(|ty| self.traits.has_instance(&decl.name, ty))
        {
            return Some(ty.clone());
        }

        let has_default = decl.default_source(method).is_some();
        let ambient = self
            .type_context
            .last()
            .cloned()
            .into_iter()
            .chain(self.frames.last().and_then(|f| f.implicit_context.clone()));
        for ty in ambient {
            let ty = self.normalize_type(&ty);
            if self.traits.has_instance(&decl.name, &ty) || has_default {
                return Some(ty);
            }
        }

        if has_default {
            return arg_types.into_iter().next();
        }
        None
    }

    /// Resolve a trait method call with `args` to a concrete callable
    pub(crate) fn resolve_trait_method(
        &mut self,
        decl: &TraitDecl,
        method: &str,
        hint: Option<&str>,
        args: &[Value],
    ) -> KelpResult<Value> {
        let selected = self.select_instance_type(decl, method, hint, args);

        if let Some(ty) = &selected {
            if let Some(found) = self.traits.lookup(&decl.name, ty, method) {
                return Ok(found.clone());
            }
            if let Some(source) = decl.default_source(method) {
                if let Some(compiled) = self.compile_default(decl, method, ty, source)? {
                    return Ok(compiled);
                }
            }
        }

        // Slow path: extension methods, then any other trait offering the method
        let first_type = args.first().map(|arg| self.normalize_type(arg.type_name()));
        let lookup_type = selected.clone().or_else(|| first_type.clone());
        if let Some(ty) = &lookup_type {
            if let Some(ext) = self.extensions.get(&format!("{}.{}", ty, method)) {
                return Ok(ext.clone());
            }
            for provider in self.traits.providers(method) {
                if **provider == *decl.name {
                    continue;
                }
                if let Some(found) = self.traits.lookup(provider, ty, method) {
                    return Ok(found.clone());
                }
            }
        }

        Err(self.error(
            ErrorKind::TraitError,
            &format!(
                "No instance of '{}' provides '{}' for type '{}'",
                decl.name,
                method,
                lookup_type.as_deref().unwrap_or("<unknown>")
            ),
        ))
    }

    /// Compile and permanently register a default method body for `type_name`
    fn compile_default(
        &mut self,
        decl: &TraitDecl,
        method: &str,
        type_name: &str,
        source: &str,
    ) -> KelpResult<Option<Value>> {
        let Some(compiler) = self.compiler.clone() else {
            return Ok(None);
        };

        debug!(trait_name = %decl.name, method, type_name, "compiling default method");
        let proto = compiler
            .compile_default(&decl.name, method, type_name, source)
            .map_err(|e| {
                self.error(
                    ErrorKind::TraitError,
                    &format!(
                        "Failed to compile default '{}.{}' for '{}': {}",
                        decl.name, method, type_name, e
                    ),
                )
            })?;
        if !proto.upvalues.is_empty() {
            return Err(self.error(
                ErrorKind::InternalError,
                &format!("Default method '{}.{}' captures upvalues", decl.name, method),
            ));
        }

        let value = Value::closure(Closure::new(proto, None));
        self.traits
            .register_impl(&decl.name, type_name, method, value.clone());
        Ok(Some(value))
    }

    /// Implementation of an operator symbol for the left operand's type
    pub(crate) fn operator_impl(&self, symbol: &str, type_name: &str) -> Option<Value> {
        if let Some(ext) = self.extensions.get(&format!("{}.{}", type_name, symbol)) {
            return Some(ext.clone());
        }
        self.traits
            .providers(symbol)
            .iter()
            .find_map(|t| self.traits.lookup(t, type_name, symbol).cloned())
    }
}

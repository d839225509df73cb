//! Post-commit hooks.
//!
//! Hooks registered on a master session run once, in registration order, right
//! after the transaction commits. A rollback or close without commit drops them.
//!
//! Besides plain closures, hooks can be registered by name against a
//! [`HookRegistry`] and invoked with JSON positional and keyword arguments,
//! which lets configuration or queued work refer to hooks without holding them.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Arguments handed to a named hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookArgs {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub keyword: Map<String, Value>,
}

impl HookArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }
}

/// A callable registered under a name.
pub type NamedHook = Arc<dyn Fn(&HookArgs) + Send + Sync>;

/// Process-wide table of named hooks.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<HashMap<String, NamedHook>>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a hook.
    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&HookArgs) + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(hook = %name, "Registered post-commit hook");
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(hook));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Resolve a hook, failing with `InvalidHook` when nothing is registered.
    pub fn resolve(&self, name: &str) -> DbResult<NamedHook> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DbError::invalid_hook(name, "no callable is registered under this name")
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// One pending hook on a master session.
pub(crate) struct PostCommitHook {
    label: String,
    action: Box<dyn FnOnce()>,
}

impl PostCommitHook {
    pub(crate) fn new(label: impl Into<String>, action: impl FnOnce() + 'static) -> Self {
        Self {
            label: label.into(),
            action: Box::new(action),
        }
    }

    pub(crate) fn named(name: &str, hook: NamedHook, args: HookArgs) -> Self {
        Self::new(name, move || hook(&args))
    }
}

/// FIFO list of hooks waiting for the next commit.
#[derive(Default)]
pub(crate) struct PendingHooks {
    hooks: Vec<PostCommitHook>,
}

impl PendingHooks {
    pub(crate) fn push(&mut self, hook: PostCommitHook) {
        self.hooks.push(hook);
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Take every pending hook, leaving the list empty for hooks registered
    /// while these run.
    pub(crate) fn take(&mut self) -> Vec<PostCommitHook> {
        std::mem::take(&mut self.hooks)
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.hooks.len();
        self.hooks.clear();
        dropped
    }
}

/// Run hooks in order.
pub(crate) fn run_hooks(hooks: Vec<PostCommitHook>) {
    for hook in hooks {
        debug!(hook = %hook.label, "Running post-commit hook");
        (hook.action)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Mutex;

    #[test]
    fn test_resolve_unknown_hook_fails() {
        let registry = HookRegistry::new();
        let err = registry.resolve("notify").err().unwrap();
        assert!(matches!(err, DbError::InvalidHook { ref hook, .. } if hook == "notify"));
    }

    #[test]
    fn test_named_hook_receives_arguments() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        registry.register("notify", move |args: &HookArgs| {
            *sink.lock().unwrap() = Some(args.clone());
        });

        let args = HookArgs::new().arg(42).kwarg("channel", "orders");
        let resolved = registry.resolve("notify").unwrap();
        let hook = PostCommitHook::named("notify", resolved, args.clone());
        run_hooks(vec![hook]);

        assert_eq!(seen.lock().unwrap().as_ref(), Some(&args));
    }

    #[test]
    fn test_pending_hooks_run_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut pending = PendingHooks::default();
        for i in 0..3 {
            let order = Rc::clone(&order);
            pending.push(PostCommitHook::new(format!("h{}", i), move || {
                order.borrow_mut().push(i)
            }));
        }
        assert_eq!(pending.len(), 3);

        run_hooks(pending.take());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_unregister_and_names() {
        let registry = HookRegistry::new();
        registry.register("b", |_: &HookArgs| {});
        registry.register("a", |_: &HookArgs| {});
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
    }
}

//! Session bags: concurrency-safe, namespaced object stores scoped to an
//! invocation and shared with its subtree.
//!
//! Every invocation owns one bag and sees three scope aliases: its own bag,
//! its parent's, and the top-level bag of its tree. At the root the own and
//! top-level aliases are the same bag object; one level down the parent and
//! top-level aliases coincide.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Scope alias under which a bag is addressed from a [`crate::RunContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    /// The invocation's own bag.
    Own,
    /// The immediate parent's bag; absent for top-level invocations.
    Parent,
    /// The bag of the tree's root invocation.
    TopLevel,
}

/// Session-bag access errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("top-level invocations have no parent session scope")]
    NoParent,

    #[error("session bags are not initialized on this context")]
    Uninitialized,

    #[error("session entry ('{namespace}', '{key}') holds a different type")]
    TypeMismatch { namespace: String, key: String },
}

/// A mutex-guarded `(namespace, key) → object` map.
///
/// The factory passed to [`SessionBag::get_or_put`] runs under the bag's
/// lock, so it executes at most once per key across concurrent callers and
/// every caller observes the same object. Callers are expected to keep
/// factories cheap; bag traffic is low-frequency by assumption.
#[derive(Default)]
pub struct SessionBag {
    entries: Mutex<HashMap<(String, String), Arc<dyn Any + Send + Sync>>>,
}

impl SessionBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically fetch or create the entry at `(namespace, key)`.
    pub fn get_or_put<T, F>(
        &self,
        namespace: &str,
        key: &str,
        factory: F,
    ) -> Result<Arc<T>, SessionError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.lock().unwrap();
        let slot = entries
            .entry((namespace.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(factory()) as Arc<dyn Any + Send + Sync>);
        slot.clone()
            .downcast::<T>()
            .map_err(|_| SessionError::TypeMismatch {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    /// Number of stored entries. Diagnostic only.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBag")
            .field("entries", &self.len())
            .finish()
    }
}

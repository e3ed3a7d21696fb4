//! Run contexts: the caller-bound facade handed to every invocation body.
//!
//! A context is the only channel through which one invocation creates
//! another via the scheduler. It also carries the invocation's three
//! session-bag scope aliases and the tree's model-api lease.

use crate::func::Function;
use crate::node::{Node, NodeCell};
use crate::runtime::{InvokeError, RuntimeInner};
use crate::session::{SessionBag, SessionError, SessionScope};
use arbor_contract::args::ArgMap;
use arbor_contract::fault::Fault;
use arbor_contract::provider::Provider;
use arbor_contract::view::NodeState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

/// Errors from context operations that require a bound, live node.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("context is not bound to a node")]
    Unbound,

    #[error("the runtime backing this context has been dropped")]
    RuntimeGone,
}

/// The three bag references set up by the scheduler at context creation.
#[derive(Clone)]
pub(crate) struct ScopeBags {
    pub(crate) own: Arc<SessionBag>,
    pub(crate) parent: Option<Arc<SessionBag>>,
    pub(crate) top: Arc<SessionBag>,
}

/// Per-tree holder of model-api semaphore permits.
///
/// The lease is created at the top-level invocation and shared by every
/// descendant, so an agent deep in the tree inherits whether its tree
/// already holds a permit. The default policy is to keep the permit
/// between an agent's requests; a long-blocking non-agent tool may release
/// it courteously and must not re-acquire it itself. The owning agent
/// re-acquires before its next request.
#[derive(Default)]
pub(crate) struct ModelLease {
    held: Mutex<HashMap<Provider, OwnedSemaphorePermit>>,
}

impl ModelLease {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn holds(&self, provider: Provider) -> bool {
        self.held.lock().unwrap().contains_key(&provider)
    }

    pub(crate) fn store(&self, provider: Provider, permit: OwnedSemaphorePermit) {
        // A permit may already be present if two agents of one tree raced;
        // the incoming permit is simply dropped back to the semaphore.
        self.held.lock().unwrap().entry(provider).or_insert(permit);
    }

    pub(crate) fn release_all(&self) {
        self.held.lock().unwrap().clear();
    }
}

/// Caller-bound facade over the runtime.
///
/// Cloning is cheap; code callables receive a clone as their first
/// parameter and may pass it along to direct (out-of-tree) helper calls.
#[derive(Clone)]
pub struct RunContext {
    pub(crate) runtime: Weak<RuntimeInner>,
    pub(crate) node: Option<Weak<NodeCell>>,
    pub(crate) bags: Option<ScopeBags>,
    pub(crate) lease: Option<Arc<ModelLease>>,
}

impl RunContext {
    /// A neutral context, not tied to any node. Suitable for top-level
    /// invocations by consumers.
    pub(crate) fn neutral(runtime: Weak<RuntimeInner>) -> Self {
        Self {
            runtime,
            node: None,
            bags: None,
            lease: None,
        }
    }

    /// Id of the bound node, if any.
    pub fn node_id(&self) -> Option<u64> {
        self.node
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|cell| cell.id)
    }

    /// Create and start an invocation of `func` as a child of this
    /// context's node (or a new top-level invocation when unbound).
    ///
    /// Code bodies start immediately; agent loops are enqueued subject to
    /// the model-api semaphore. The returned [`Node`] can be joined at the
    /// caller's discretion, permitting fan-out with deferred joins.
    pub fn invoke(
        &self,
        func: &Arc<Function>,
        inputs: ArgMap,
        provider: Option<Provider>,
    ) -> Result<Node, InvokeError> {
        let inner = self.runtime.upgrade().ok_or(InvokeError::RuntimeGone)?;
        let caller = self.node.as_ref().and_then(Weak::upgrade);
        RuntimeInner::invoke(&inner, caller, func, inputs, provider, self.lease.clone())
    }

    /// Report a non-terminal state change for the bound node.
    pub fn post_status_update(&self, state: NodeState) -> Result<(), ContextError> {
        let (inner, cell) = self.bound()?;
        inner.post_status_update(&cell, state);
        Ok(())
    }

    /// Report successful completion of the bound node.
    pub fn post_success(&self, outputs: Value) -> Result<(), ContextError> {
        let (inner, cell) = self.bound()?;
        inner.post_success(&cell, outputs);
        Ok(())
    }

    /// Report failure of the bound node.
    pub fn post_exception(&self, fault: Fault) -> Result<(), ContextError> {
        let (inner, cell) = self.bound()?;
        inner.post_exception(&cell, fault);
        Ok(())
    }

    /// Atomically read-or-create an object in the bag at the named scope.
    /// The factory runs under the bag's lock.
    pub fn get_or_put<T, F>(
        &self,
        scope: SessionScope,
        namespace: &str,
        key: &str,
        factory: F,
    ) -> Result<Arc<T>, SessionError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let bags = self.bags.as_ref().ok_or(SessionError::Uninitialized)?;
        let bag = match scope {
            SessionScope::Own => &bags.own,
            SessionScope::TopLevel => &bags.top,
            SessionScope::Parent => bags.parent.as_ref().ok_or(SessionError::NoParent)?,
        };
        bag.get_or_put(namespace, key, factory)
    }

    /// Courteously release the tree's model-api lease during a long
    /// blocking operation. The owning agent re-acquires before its next
    /// model request; callees must not re-acquire themselves.
    pub fn yield_model_lease(&self) {
        if let Some(lease) = &self.lease {
            lease.release_all();
        }
    }

    pub(crate) fn lease(&self) -> Option<Arc<ModelLease>> {
        self.lease.clone()
    }

    fn bound(&self) -> Result<(Arc<RuntimeInner>, Arc<NodeCell>), ContextError> {
        let inner = self.runtime.upgrade().ok_or(ContextError::RuntimeGone)?;
        let cell = self
            .node
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ContextError::Unbound)?;
        Ok((inner, cell))
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("node", &self.node_id())
            .field("bound_bags", &self.bags.is_some())
            .finish()
    }
}

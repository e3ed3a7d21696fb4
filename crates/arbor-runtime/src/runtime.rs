//! The runtime: spec registry, invocation scheduling, the node arena, and
//! the versioned view/watch layer.
//!
//! The runtime exclusively owns the node registry and the global version
//! counter. Every observable event bumps the version once and republishes
//! the touched node's view plus the views of all its ancestors; sibling
//! subtrees keep their previous views untouched.

use crate::agent_loop;
use crate::context::{ModelLease, RunContext, ScopeBags};
use crate::func::{CodeCallable, Function};
use crate::node::{Node, NodeCell};
use arbor_contract::args::{ArgError, ArgMap};
use arbor_contract::provider::{Provider, SessionFactory};
use arbor_contract::view::{NodeState, NodeView};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

/// Registration failures during runtime construction.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("duplicate function name '{0}' found during registration")]
    DuplicateName(String),
}

/// Immediate invocation failures (before a node exists).
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("function '{0}' is not registered with this runtime")]
    NotRegistered(String),

    #[error(
        "invoked function '{0}' is not registered with this runtime even though it \
         shares a name with a registered function"
    )]
    NameCollision(String),

    #[error("provider override is only valid for agent functions; '{0}' is a code function")]
    ProviderOverrideOnCode(String),

    #[error("no session factory registered for provider {0}")]
    UnknownProvider(Provider),

    #[error(transparent)]
    Args(#[from] ArgError),

    #[error("the runtime has been dropped")]
    RuntimeGone,
}

/// Node/tree lookup failures on the observation surface.
#[derive(Debug, Clone, Error)]
pub enum NodeLookupError {
    #[error("no node with id {0}")]
    UnknownNode(u64),

    #[error("node {0} is not a top-level invocation")]
    NotRoot(u64),
}

/// Tunables for one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default model-api semaphore permits per provider.
    pub model_concurrency: usize,
    /// Per-provider permit overrides.
    pub provider_concurrency: HashMap<Provider, usize>,
    /// Agent-loop request-cycle cap.
    pub max_steps: usize,
    /// Backoff schedule for transient provider errors; one retry per entry.
    pub retry_backoff: Vec<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_concurrency: 4,
            provider_concurrency: HashMap::new(),
            max_steps: 64,
            retry_backoff: [5, 10, 15, 20]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

/// Completion record of one agent invocation, kept per spec name for the
/// cache-watermark history rule.
#[derive(Debug, Clone)]
pub(crate) struct RunRecord {
    pub(crate) tool_calls: u32,
    pub(crate) mean_interval: Option<Duration>,
}

const HISTORY_WINDOW: usize = 5;

pub(crate) struct RuntimeState {
    next_node_id: u64,
    seqno: u64,
    roots: Vec<u64>,
    nodes: HashMap<u64, Arc<NodeCell>>,
    observables: HashMap<u64, watch::Sender<Arc<NodeView>>>,
    history: HashMap<String, VecDeque<RunRecord>>,
}

pub(crate) struct RuntimeInner {
    functions: HashMap<String, Arc<Function>>,
    factories: HashMap<Provider, Arc<dyn SessionFactory>>,
    pub(crate) config: RuntimeConfig,
    semaphores: Mutex<HashMap<Provider, Arc<Semaphore>>>,
    state: Mutex<RuntimeState>,
}

enum Dispatch {
    Code(CodeCallable),
    Agent {
        provider: Provider,
        factory: Arc<dyn SessionFactory>,
    },
}

impl RuntimeInner {
    /// Create and start a node for `func`, recording ancestry. The single
    /// registration critical section allocates the id, wires the parent's
    /// child list, sets up session-bag scopes, and publishes the creation
    /// event before the body starts.
    pub(crate) fn invoke(
        inner: &Arc<RuntimeInner>,
        caller: Option<Arc<NodeCell>>,
        func: &Arc<Function>,
        inputs: ArgMap,
        provider: Option<Provider>,
        caller_lease: Option<Arc<ModelLease>>,
    ) -> Result<Node, InvokeError> {
        let registered = inner
            .functions
            .get(func.name())
            .ok_or_else(|| InvokeError::NotRegistered(func.name().to_string()))?;
        if !Arc::ptr_eq(registered, func) {
            return Err(InvokeError::NameCollision(func.name().to_string()));
        }

        let dispatch = match func.as_ref() {
            Function::Code(code) => {
                if provider.is_some() {
                    return Err(InvokeError::ProviderOverrideOnCode(func.name().to_string()));
                }
                Dispatch::Code(code.callable.clone())
            }
            Function::Agent(agent) => {
                let chosen = provider.unwrap_or(agent.default_provider);
                let factory = inner
                    .factories
                    .get(&chosen)
                    .cloned()
                    .ok_or(InvokeError::UnknownProvider(chosen))?;
                Dispatch::Agent {
                    provider: chosen,
                    factory,
                }
            }
        };

        let inputs = func.validate_coerce_args(inputs)?;

        let (cell, ctx) = {
            let mut state = inner.state.lock().unwrap();
            let id = state.next_node_id;
            state.next_node_id += 1;

            let cell = NodeCell::new(
                id,
                func.clone(),
                inputs.clone(),
                caller.as_ref().map(|c| c.id),
            );

            let own = cell.bag.clone();
            let parent_bag = caller.as_ref().map(|c| c.bag.clone());
            let top = match caller.as_ref() {
                None => own.clone(),
                Some(c) => {
                    let mut cur = c.clone();
                    while let Some(pid) = cur.parent {
                        match state.nodes.get(&pid) {
                            Some(p) => cur = p.clone(),
                            None => break,
                        }
                    }
                    cur.bag.clone()
                }
            };

            state.nodes.insert(id, cell.clone());
            match caller.as_ref() {
                None => state.roots.push(id),
                Some(c) => c.mu.lock().unwrap().children.push(id),
            }
            state.seqno += 1;
            Self::publish_tree_update(&mut state, id);

            let lease = caller_lease.unwrap_or_else(ModelLease::new);
            let ctx = RunContext {
                runtime: Arc::downgrade(inner),
                node: Some(Arc::downgrade(&cell)),
                bags: Some(ScopeBags {
                    own,
                    parent: parent_bag,
                    top,
                }),
                lease: Some(lease),
            };
            (cell, ctx)
        };

        match dispatch {
            Dispatch::Code(callable) => {
                tokio::spawn(run_code(inner.clone(), cell.clone(), ctx, callable, inputs));
            }
            Dispatch::Agent { provider, factory } => {
                tokio::spawn(agent_loop::run(
                    inner.clone(),
                    cell.clone(),
                    ctx,
                    provider,
                    factory,
                ));
            }
        }

        Ok(Node {
            cell,
            runtime: Arc::downgrade(inner),
        })
    }

    // =========================================================================
    // State reporting
    // =========================================================================

    pub(crate) fn post_status_update(&self, cell: &Arc<NodeCell>, new_state: NodeState) {
        let mut state = self.state.lock().unwrap();
        {
            let mut mu = cell.mu.lock().unwrap();
            if mu.state.is_terminal() {
                tracing::warn!(node = cell.id, "ignoring status update on terminal node");
                return;
            }
            mu.state = new_state;
        }
        state.seqno += 1;
        Self::publish_tree_update(&mut state, cell.id);
    }

    pub(crate) fn post_success(&self, cell: &Arc<NodeCell>, outputs: Value) {
        {
            let mut state = self.state.lock().unwrap();
            {
                let mut mu = cell.mu.lock().unwrap();
                if mu.state.is_terminal() {
                    tracing::warn!(node = cell.id, "ignoring success on terminal node");
                    return;
                }
                mu.outputs = Some(outputs);
                mu.state = NodeState::Success;
            }
            state.seqno += 1;
            Self::publish_tree_update(&mut state, cell.id);
        }
        cell.done.send_replace(true);
    }

    pub(crate) fn post_exception(&self, cell: &Arc<NodeCell>, fault: arbor_contract::Fault) {
        {
            let mut state = self.state.lock().unwrap();
            {
                let mut mu = cell.mu.lock().unwrap();
                if mu.state.is_terminal() {
                    tracing::warn!(node = cell.id, "ignoring exception on terminal node");
                    return;
                }
                mu.fault = Some(fault.clone());
                mu.state = NodeState::Error;
            }
            state.seqno += 1;
            Self::publish_tree_update(&mut state, cell.id);
        }
        cell.done.send_replace(true);

        // Logged immediately so there is a trace even if no consumer ever
        // collects result().
        tracing::error!(
            node = cell.id,
            func = cell.func.name(),
            fault = %fault,
            "node faulted"
        );
    }

    // =========================================================================
    // View publication
    // =========================================================================

    /// Republish the touched node and every ancestor at the current global
    /// version. Caller holds the snapshot lock and has already bumped the
    /// version.
    fn publish_tree_update(state: &mut RuntimeState, node_id: u64) {
        let seq = state.seqno;
        let mut current = Some(node_id);
        while let Some(id) = current {
            let cell = match state.nodes.get(&id) {
                Some(c) => c.clone(),
                None => break,
            };
            let stale = match state.observables.get(&id) {
                Some(tx) => tx.borrow().update_seqnum < seq,
                None => true,
            };
            if stale {
                let view = Self::build_view(state, &cell, seq);
                match state.observables.get(&id) {
                    Some(tx) => {
                        tx.send_replace(view);
                    }
                    None => {
                        let (tx, _rx) = watch::channel(view);
                        state.observables.insert(id, tx);
                    }
                }
            }
            current = cell.parent;
        }
    }

    fn build_view(state: &mut RuntimeState, cell: &Arc<NodeCell>, seq: u64) -> Arc<NodeView> {
        let child_ids = cell.mu.lock().unwrap().children.clone();
        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            if let Some(view) = Self::latest_or_build(state, child_id, seq) {
                children.push(view);
            }
        }
        cell.project(children, seq)
    }

    fn latest_or_build(state: &mut RuntimeState, id: u64, seq: u64) -> Option<Arc<NodeView>> {
        if let Some(tx) = state.observables.get(&id) {
            return Some(tx.borrow().clone());
        }
        let cell = state.nodes.get(&id).cloned()?;
        let view = Self::build_view(state, &cell, seq);
        let (tx, _rx) = watch::channel(view.clone());
        state.observables.insert(id, tx);
        Some(view)
    }

    // =========================================================================
    // Observation surface
    // =========================================================================

    pub(crate) fn get_view(&self, node_id: u64) -> Result<Arc<NodeView>, NodeLookupError> {
        let state = self.state.lock().unwrap();
        state
            .observables
            .get(&node_id)
            .map(|tx| tx.borrow().clone())
            .ok_or(NodeLookupError::UnknownNode(node_id))
    }

    pub(crate) fn list_toplevel_views(&self) -> Vec<Arc<NodeView>> {
        let state = self.state.lock().unwrap();
        state
            .roots
            .iter()
            .filter_map(|id| state.observables.get(id).map(|tx| tx.borrow().clone()))
            .collect()
    }

    pub(crate) async fn watch(
        &self,
        node_id: u64,
        as_of_seq: u64,
    ) -> Result<Arc<NodeView>, NodeLookupError> {
        let mut rx = {
            let state = self.state.lock().unwrap();
            state
                .observables
                .get(&node_id)
                .ok_or(NodeLookupError::UnknownNode(node_id))?
                .subscribe()
        };
        let view = rx
            .wait_for(|view| view.update_seqnum > as_of_seq)
            .await
            .map_err(|_| NodeLookupError::UnknownNode(node_id))?
            .clone();
        Ok(view)
    }

    pub(crate) fn remove_tree(&self, root_id: u64) -> Result<(), NodeLookupError> {
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(&root_id) {
            return Err(NodeLookupError::UnknownNode(root_id));
        }
        let Some(pos) = state.roots.iter().position(|id| *id == root_id) else {
            return Err(NodeLookupError::NotRoot(root_id));
        };
        state.roots.remove(pos);

        let mut queue = vec![root_id];
        while let Some(id) = queue.pop() {
            if let Some(cell) = state.nodes.remove(&id) {
                queue.extend(cell.mu.lock().unwrap().children.iter().copied());
            }
            state.observables.remove(&id);
        }
        Ok(())
    }

    // =========================================================================
    // Shared resources
    // =========================================================================

    pub(crate) fn semaphore_for(&self, provider: Provider) -> Arc<Semaphore> {
        let mut sems = self.semaphores.lock().unwrap();
        sems.entry(provider)
            .or_insert_with(|| {
                let permits = self
                    .config
                    .provider_concurrency
                    .get(&provider)
                    .copied()
                    .unwrap_or(self.config.model_concurrency);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }

    pub(crate) fn agent_history(&self, name: &str) -> Vec<RunRecord> {
        let state = self.state.lock().unwrap();
        state
            .history
            .get(name)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn record_agent_run(&self, name: &str, record: RunRecord) {
        let mut state = self.state.lock().unwrap();
        let records = state.history.entry(name.to_string()).or_default();
        if records.len() == HISTORY_WINDOW {
            records.pop_front();
        }
        records.push_back(record);
    }
}

async fn run_code(
    inner: Arc<RuntimeInner>,
    cell: Arc<NodeCell>,
    ctx: RunContext,
    callable: CodeCallable,
    inputs: ArgMap,
) {
    cell.set_running_silently();
    let outcome = callable(ctx.clone(), inputs).await;
    match outcome {
        Ok(outputs) => inner.post_success(&cell, outputs),
        Err(err) => {
            let fault = err.into_fault(cell.func.name(), cell.id);
            inner.post_exception(&cell, fault);
        }
    }
    // A completed top-level invocation promptly returns its tree's
    // model-api permits.
    if cell.parent.is_none() {
        ctx.yield_model_lease();
    }
}

/// Builder for a [`Runtime`]: seed specs, provider session factories, and
/// tunables.
pub struct RuntimeBuilder {
    specs: Vec<Arc<Function>>,
    factories: HashMap<Provider, Arc<dyn SessionFactory>>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn with_spec(mut self, spec: Arc<Function>) -> Self {
        self.specs.push(spec);
        self
    }

    #[must_use]
    pub fn with_specs(mut self, specs: impl IntoIterator<Item = Arc<Function>>) -> Self {
        self.specs.extend(specs);
        self
    }

    #[must_use]
    pub fn with_session_factory(
        mut self,
        provider: Provider,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        self.factories.insert(provider, factory);
        self
    }

    /// Default model-api permits per provider.
    #[must_use]
    pub fn with_model_concurrency(mut self, permits: usize) -> Self {
        self.config.model_concurrency = permits;
        self
    }

    #[must_use]
    pub fn with_provider_concurrency(mut self, provider: Provider, permits: usize) -> Self {
        self.config.provider_concurrency.insert(provider, permits);
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, schedule: Vec<Duration>) -> Self {
        self.config.retry_backoff = schedule;
        self
    }

    /// Register the seed specs plus the breadth-first closure of their
    /// `uses` lists. Two distinct instances sharing a name are rejected;
    /// re-encountering the same instance is a no-op.
    pub fn build(self) -> Result<Runtime, RegistryError> {
        let mut functions: HashMap<String, Arc<Function>> = HashMap::new();
        let mut queue: VecDeque<Arc<Function>> = self.specs.into();
        while let Some(func) = queue.pop_front() {
            match functions.get(func.name()) {
                Some(existing) if Arc::ptr_eq(existing, &func) => continue,
                Some(_) => return Err(RegistryError::DuplicateName(func.name().to_string())),
                None => {}
            }
            tracing::debug!(func = func.name(), kind = ?func.kind(), "registered function");
            functions.insert(func.name().to_string(), func.clone());
            for dep in func.uses() {
                queue.push_back(dep.clone());
            }
        }

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                functions,
                factories: self.factories,
                config: self.config,
                semaphores: Mutex::new(HashMap::new()),
                state: Mutex::new(RuntimeState {
                    next_node_id: 0,
                    seqno: 0,
                    roots: Vec::new(),
                    nodes: HashMap::new(),
                    observables: HashMap::new(),
                    history: HashMap::new(),
                }),
            }),
        })
    }
}

/// The invocation runtime. Cheap to clone; all clones share one registry,
/// arena, and version counter.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            specs: Vec::new(),
            factories: HashMap::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Construct a runtime from seed specs with default tunables and no
    /// provider factories (sufficient for code-only trees).
    pub fn new(specs: impl IntoIterator<Item = Arc<Function>>) -> Result<Self, RegistryError> {
        Self::builder().with_specs(specs).build()
    }

    /// A context not tied to any node, suitable for top-level invocations.
    pub fn get_ctx(&self) -> RunContext {
        RunContext::neutral(Arc::downgrade(&self.inner))
    }

    /// Look up a registered spec by name.
    pub fn function(&self, name: &str) -> Option<Arc<Function>> {
        self.inner.functions.get(name).cloned()
    }

    /// Snapshot of the latest views of all top-level invocations, captured
    /// atomically at a single version.
    pub fn list_toplevel_views(&self) -> Vec<Arc<NodeView>> {
        self.inner.list_toplevel_views()
    }

    /// Latest view of the given node. Never blocks.
    pub fn get_view(&self, node_id: u64) -> Result<Arc<NodeView>, NodeLookupError> {
        self.inner.get_view(node_id)
    }

    /// Block until the node's view advances past `as_of_seq`, then return
    /// it. Start with `as_of_seq = 0` and feed back each returned view's
    /// sequence number to observe every rebuild of that node.
    pub async fn watch(
        &self,
        node_id: u64,
        as_of_seq: u64,
    ) -> Result<Arc<NodeView>, NodeLookupError> {
        self.inner.watch(node_id, as_of_seq).await
    }

    /// Free a completed tree: nodes, views, and session-bag contents are
    /// dropped in one sweep. Removed trees no longer appear in
    /// [`Runtime::list_toplevel_views`].
    pub fn remove_tree(&self, root_id: u64) -> Result<(), NodeLookupError> {
        self.inner.remove_tree(root_id)
    }
}

#[cfg(test)]
impl Runtime {
    pub(crate) fn inner_for_tests(&self) -> Arc<RuntimeInner> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Runtime")
            .field("functions", &self.inner.functions.len())
            .field("nodes", &state.nodes.len())
            .field("roots", &state.roots.len())
            .field("version", &state.seqno)
            .finish()
    }
}

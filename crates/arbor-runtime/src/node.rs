//! Invocation nodes.
//!
//! The runtime's arena exclusively owns every [`NodeCell`]; parents and
//! children reference each other by id, never by owning pointer, so the
//! cyclic node↔parent graph never forms an ownership cycle. The public
//! [`Node`] handle is a cheap clone that joins on completion and serves
//! snapshots.

use crate::runtime::{NodeLookupError, RuntimeInner};
use crate::session::SessionBag;
use arbor_contract::args::ArgMap;
use arbor_contract::fault::Fault;
use arbor_contract::provider::CachePolicy;
use arbor_contract::transcript::TranscriptPart;
use arbor_contract::usage::TokenUsage;
use arbor_contract::view::{FunctionKind, NodeState, NodeView};
use crate::func::Function;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Mutable node state, written only by the node's own execution path (or
/// by the scheduler before start) and read under the snapshot lock when
/// views are rebuilt.
pub(crate) struct NodeMut {
    pub(crate) state: NodeState,
    pub(crate) outputs: Option<Value>,
    pub(crate) fault: Option<Fault>,
    /// Child node ids in creation order.
    pub(crate) children: Vec<u64>,
    /// Cumulative token usage; agent nodes only.
    pub(crate) usage: Option<TokenUsage>,
    /// Provider-neutral transcript; agent nodes only.
    pub(crate) transcript: Option<Vec<TranscriptPart>>,
    /// Frozen cache-watermark tag; agent nodes only, set before the first
    /// model request and never changed.
    pub(crate) cache_policy: Option<CachePolicy>,
}

/// Arena-owned state of one invocation.
pub(crate) struct NodeCell {
    pub(crate) id: u64,
    pub(crate) func: Arc<Function>,
    pub(crate) inputs: ArgMap,
    pub(crate) parent: Option<u64>,
    pub(crate) bag: Arc<SessionBag>,
    pub(crate) mu: Mutex<NodeMut>,
    /// One-shot completion signal; flips to `true` exactly once, together
    /// with the terminal state.
    pub(crate) done: watch::Sender<bool>,
}

impl NodeCell {
    pub(crate) fn new(
        id: u64,
        func: Arc<Function>,
        inputs: ArgMap,
        parent: Option<u64>,
    ) -> Arc<Self> {
        let is_agent = func.kind() == FunctionKind::Agent;
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id,
            func,
            inputs,
            parent,
            bag: Arc::new(SessionBag::new()),
            mu: Mutex::new(NodeMut {
                state: NodeState::Waiting,
                outputs: None,
                fault: None,
                children: Vec::new(),
                usage: is_agent.then(TokenUsage::default),
                transcript: is_agent.then(Vec::new),
                cache_policy: None,
            }),
            done,
        })
    }

    /// Code bodies start immediately on their worker; the Waiting→Running
    /// hop is internal and not separately published.
    pub(crate) fn set_running_silently(&self) {
        let mut mu = self.mu.lock().unwrap();
        if mu.state == NodeState::Waiting {
            mu.state = NodeState::Running;
        }
    }

    pub(crate) fn push_transcript(&self, part: TranscriptPart) {
        let mut mu = self.mu.lock().unwrap();
        if let Some(transcript) = mu.transcript.as_mut() {
            transcript.push(part);
        }
    }

    pub(crate) fn extend_transcript(&self, parts: Vec<TranscriptPart>) {
        let mut mu = self.mu.lock().unwrap();
        if let Some(transcript) = mu.transcript.as_mut() {
            transcript.extend(parts);
        }
    }

    pub(crate) fn accumulate_usage(&self, delta: &TokenUsage) {
        let mut mu = self.mu.lock().unwrap();
        if let Some(usage) = mu.usage.as_mut() {
            usage.accumulate(delta);
        }
    }

    pub(crate) fn set_cache_policy(&self, policy: CachePolicy) {
        let mut mu = self.mu.lock().unwrap();
        debug_assert!(mu.cache_policy.is_none(), "cache policy is frozen once set");
        mu.cache_policy = Some(policy);
    }

    /// Build the immutable projection of this node with the given child
    /// views and sequence number. Called under the runtime snapshot lock.
    pub(crate) fn project(&self, children: Vec<Arc<NodeView>>, seqnum: u64) -> Arc<NodeView> {
        let mu = self.mu.lock().unwrap();
        Arc::new(NodeView {
            id: self.id,
            func: self.func.name().to_string(),
            kind: self.func.kind(),
            state: mu.state,
            inputs: self.inputs.clone(),
            outputs: mu.outputs.clone(),
            exception: mu.fault.as_ref().map(Fault::concise),
            children,
            update_seqnum: seqnum,
            usage: mu.usage.clone(),
            transcript: mu.transcript.clone(),
        })
    }
}

/// Public handle to one invocation.
#[derive(Clone)]
pub struct Node {
    pub(crate) cell: Arc<NodeCell>,
    pub(crate) runtime: Weak<RuntimeInner>,
}

impl Node {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// Name of the invoked function spec.
    pub fn func_name(&self) -> &str {
        self.cell.func.name()
    }

    pub fn state(&self) -> NodeState {
        self.cell.mu.lock().unwrap().state
    }

    pub fn is_done(&self) -> bool {
        *self.cell.done.subscribe().borrow()
    }

    /// The frozen cache-watermark tag; `None` until the agent loop has
    /// decided it (and always `None` for code nodes).
    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.cell.mu.lock().unwrap().cache_policy
    }

    /// Block until the node reaches a terminal state.
    pub async fn wait(&self) {
        let mut rx = self.cell.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Join on completion: returns the outputs on Success, rethrows the
    /// stored fault on Error.
    pub async fn result(&self) -> Result<Value, Fault> {
        self.wait().await;
        let mu = self.cell.mu.lock().unwrap();
        match mu.state {
            NodeState::Success => Ok(mu.outputs.clone().unwrap_or(Value::Null)),
            _ => Err(mu.fault.clone().unwrap_or(Fault::Code {
                kind: "Internal".to_string(),
                message: "node terminated without a stored outcome".to_string(),
            })),
        }
    }

    /// Latest published snapshot of this node.
    pub fn view(&self) -> Result<Arc<NodeView>, NodeLookupError> {
        let inner = self
            .runtime
            .upgrade()
            .ok_or(NodeLookupError::UnknownNode(self.cell.id))?;
        inner.get_view(self.cell.id)
    }

    /// Block until this node's snapshot advances past `as_of_seq`.
    pub async fn watch(&self, as_of_seq: u64) -> Result<Arc<NodeView>, NodeLookupError> {
        let inner = self
            .runtime
            .upgrade()
            .ok_or(NodeLookupError::UnknownNode(self.cell.id))?;
        inner.watch(self.cell.id, as_of_seq).await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.cell.id)
            .field("func", &self.cell.func.name())
            .field("state", &self.state())
            .finish()
    }
}

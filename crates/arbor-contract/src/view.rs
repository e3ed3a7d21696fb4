//! Immutable snapshots of invocation nodes.
//!
//! A [`NodeView`] is frozen at publication: child views are included by
//! `Arc` reference, so republishing an ancestor reuses untouched subtree
//! views bit-for-bit.

use crate::args::ArgMap;
use crate::transcript::TranscriptPart;
use crate::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Lifecycle state of an invocation. Transitions are monotonic:
/// Waiting → Running → {Success | Error}; terminal states are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Waiting,
    Running,
    Success,
    Error,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Success | NodeState::Error)
    }
}

/// Which kind of function an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Code,
    Agent,
}

/// Frozen projection of one node and (transitively) its subtree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: u64,
    /// Spec name of the invoked function.
    pub func: String,
    pub kind: FunctionKind,
    pub state: NodeState,
    pub inputs: ArgMap,
    pub outputs: Option<Value>,
    /// Concise fault description, present in the Error state.
    pub exception: Option<String>,
    pub children: Vec<Arc<NodeView>>,
    /// Global version at which this view was published.
    pub update_seqnum: u64,
    /// Cumulative token usage; agents only.
    pub usage: Option<TokenUsage>,
    /// Neutral transcript; agents only.
    pub transcript: Option<Vec<TranscriptPart>>,
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use taskweave_core::types::NodeStatus;

/// Per-node execution record within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Attempts consumed by the retry wrapper.
    pub attempts: u32,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
        }
    }
}

/// Run-scoped mapping from node id to its state.
///
/// Owned exclusively by one run's scheduler task; mutation happens only
/// at node completion boundaries, which keeps status writes atomic with
/// the ready-set recomputation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    nodes: HashMap<String, NodeState>,
}

impl ExecutionContext {
    /// Initialize with every node `Pending`.
    pub fn new(node_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            nodes: node_ids
                .into_iter()
                .map(|id| (id, NodeState::pending()))
                .collect(),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(node_id)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn is_success(&self, node_id: &str) -> bool {
        self.status(node_id) == Some(NodeStatus::Success)
    }

    /// Successful output of a node, if any.
    pub fn output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.nodes
            .get(node_id)
            .filter(|n| n.status == NodeStatus::Success)
            .and_then(|n| n.output.as_ref())
    }

    pub fn set_running(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status = NodeStatus::Running;
        }
    }

    pub fn record_success(&mut self, node_id: &str, output: serde_json::Value, attempts: u32) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status = NodeStatus::Success;
            node.output = Some(output);
            node.error = None;
            node.attempts = attempts;
        }
    }

    pub fn record_failure(&mut self, node_id: &str, error: String, attempts: u32) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status = NodeStatus::Failed;
            node.error = Some(error);
            node.attempts = attempts;
        }
    }

    pub fn mark_skipped(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status = NodeStatus::Skipped;
        }
    }

    /// Node ids whose state is non-terminal.
    pub fn unfinished(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.status.is_terminal())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn any_failed(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.status == NodeStatus::Failed)
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    pub fn nodes(&self) -> &HashMap<String, NodeState> {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(["a".to_string(), "b".to_string()])
    }

    #[test]
    fn test_initializes_pending() {
        let ctx = ctx();
        assert_eq!(ctx.status("a"), Some(NodeStatus::Pending));
        assert_eq!(ctx.status("b"), Some(NodeStatus::Pending));
        assert_eq!(ctx.status("missing"), None);
        assert!(!ctx.all_terminal());
    }

    #[test]
    fn test_output_only_after_success() {
        let mut ctx = ctx();
        assert!(ctx.output("a").is_none());

        ctx.record_success("a", serde_json::json!({"value": 1}), 1);
        assert_eq!(ctx.output("a"), Some(&serde_json::json!({"value": 1})));
        assert!(ctx.is_success("a"));

        ctx.record_failure("b", "boom".into(), 3);
        assert!(ctx.output("b").is_none());
        assert_eq!(ctx.get("b").unwrap().attempts, 3);
        assert!(ctx.any_failed());
    }

    #[test]
    fn test_skip_and_terminal() {
        let mut ctx = ctx();
        ctx.record_failure("a", "boom".into(), 1);
        ctx.mark_skipped("b");
        assert!(ctx.all_terminal());
        assert_eq!(ctx.status("b"), Some(NodeStatus::Skipped));
        assert!(ctx.unfinished().is_empty());
    }
}

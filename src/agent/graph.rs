//! Walks over the handoff graph reachable from an agent.
//!
//! Graphs built with [`AgentRegistry`](crate::handoff::AgentRegistry) may be
//! cyclic; the walk keeps an explicit visited set keyed by agent name.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::Agent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandoffEdge {
    pub from: String,
    pub to: String,
    pub tool_name: String,
}

/// Every handoff edge reachable from `root`, breadth first. Each agent is
/// expanded once. Targets that cannot be resolved still appear as edges but
/// are not expanded.
pub fn handoff_edges(root: &Arc<Agent>) -> Vec<HandoffEdge> {
    let mut edges = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([Arc::clone(root)]);

    while let Some(agent) = queue.pop_front() {
        if !visited.insert(agent.name().to_string()) {
            continue;
        }
        for handoff in agent.handoffs() {
            edges.push(HandoffEdge {
                from: agent.name().to_string(),
                to: handoff.agent_name().to_string(),
                tool_name: handoff.tool_name().to_string(),
            });
            if let Ok(target) = handoff.target() {
                if !visited.contains(target.name()) {
                    queue.push_back(target);
                }
            }
        }
    }

    edges
}

/// Names of all agents reachable from `root`, including `root`, in visit
/// order.
pub fn reachable_agents(root: &Arc<Agent>) -> Vec<String> {
    let mut names = vec![root.name().to_string()];
    for edge in handoff_edges(root) {
        if !names.contains(&edge.to) {
            names.push(edge.to);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::AgentRegistry;

    #[test]
    fn cyclic_graph_terminates() {
        let registry = AgentRegistry::new();
        registry.register(
            Agent::builder("triage")
                .handoff(registry.handoff("billing"))
                .build()
                .expect("agent"),
        );
        registry.register(
            Agent::builder("billing")
                .handoff(registry.handoff("triage"))
                .handoff(registry.handoff("refunds"))
                .build()
                .expect("agent"),
        );
        let triage = registry.get("triage").expect("registered");

        let edges = handoff_edges(&triage);
        assert_eq!(
            edges,
            vec![
                HandoffEdge {
                    from: "triage".to_string(),
                    to: "billing".to_string(),
                    tool_name: "transfer_to_billing".to_string(),
                },
                HandoffEdge {
                    from: "billing".to_string(),
                    to: "triage".to_string(),
                    tool_name: "transfer_to_triage".to_string(),
                },
                HandoffEdge {
                    from: "billing".to_string(),
                    to: "refunds".to_string(),
                    tool_name: "transfer_to_refunds".to_string(),
                },
            ]
        );
        assert_eq!(reachable_agents(&triage), vec!["triage", "billing", "refunds"]);
    }
}

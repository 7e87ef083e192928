//! Topology Validator (C1, `spec.md` §4.1).
//!
//! Accepts a [`TopologyConfig`] and reports every defect found — unlike a
//! short-circuiting parser, `validate` always walks every rule so the caller
//! sees the complete list of problems in one round trip.

use crate::orchestrator::error::ValidationIssue;
use crate::orchestrator::registry::{ModelRegistry, ToolRegistry};
use crate::orchestrator::team::{NodeKind, TopologyConfig};
use std::collections::{HashMap, HashSet};

const MAX_NODES: usize = 100;
const MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Validate `topology` against every rule in `spec.md` §4.1. Returns `Ok(())`
/// or every violated rule as a [`ValidationIssue`] list — never a subset.
pub async fn validate(
    topology: &TopologyConfig,
    models: &dyn ModelRegistry,
    tools: &dyn ToolRegistry,
) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    // Rule 1: bounded size, ids consistent with the map key. An empty node
    // set falls out of Rule 3 below as NO_ENTRY_POINT (no in-degree-0 node).
    if topology.nodes.len() > MAX_NODES {
        issues.push(issue(
            "TOO_DEEP",
            "nodes",
            format!("topology has {} nodes, exceeding the {} limit", topology.nodes.len(), MAX_NODES),
        ));
    }
    for (key, node) in &topology.nodes {
        if key != &node.id {
            issues.push(issue(
                "DUPLICATE_ID",
                &node.id,
                format!("node stored under key '{}' but declares id '{}'", key, node.id),
            ));
        }
    }

    // Rule 2: every edge endpoint references a defined node.
    for edge in &topology.edges {
        if !topology.nodes.contains_key(&edge.source_id) {
            issues.push(issue(
                "DANGLING_EDGE",
                &format!("{}->{}", edge.source_id, edge.target_id),
                format!("edge source '{}' is not a defined node", edge.source_id),
            ));
        }
        if !topology.nodes.contains_key(&edge.target_id) {
            issues.push(issue(
                "DANGLING_EDGE",
                &format!("{}->{}", edge.source_id, edge.target_id),
                format!("edge target '{}' is not a defined node", edge.target_id),
            ));
        }
    }

    // Rule 3: exactly one in-degree-0 node, matching entry_point, kind GLOBAL_SUPERVISOR.
    let mut in_degree: HashMap<&str, usize> = topology.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for edge in &topology.edges {
        if let Some(count) = in_degree.get_mut(edge.target_id.as_str()) {
            *count += 1;
        }
    }
    let roots: Vec<&str> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    if roots.is_empty() {
        issues.push(issue("NO_ENTRY_POINT", "entry_point", "no node has in-degree 0"));
    } else if roots.len() > 1 {
        issues.push(issue(
            "MULTIPLE_ENTRY_POINTS",
            "entry_point",
            format!("multiple in-degree-0 nodes: {}", roots.join(", ")),
        ));
    } else if roots[0] != topology.entry_point {
        issues.push(issue(
            "NO_ENTRY_POINT",
            "entry_point",
            format!(
                "declared entry_point '{}' does not match the sole root '{}'",
                topology.entry_point, roots[0]
            ),
        ));
    }
    if let Some(entry_node) = topology.nodes.get(&topology.entry_point) {
        if entry_node.kind != NodeKind::GlobalSupervisor {
            issues.push(issue(
                "NO_ENTRY_POINT",
                &topology.entry_point,
                "entry point must be a GLOBAL_SUPERVISOR",
            ));
        }
    }

    // Rule 4: cycle detection via three-color DFS.
    let mut colors: HashMap<&str, Color> = topology.nodes.keys().map(|id| (id.as_str(), Color::White)).collect();
    let mut path = Vec::new();
    for start in topology.nodes.keys() {
        if colors.get(start.as_str()) == Some(&Color::White) {
            if let Some(cycle) = dfs_find_cycle(topology, start, &mut colors, &mut path) {
                issues.push(issue("CYCLE", &cycle, format!("cycle detected: {}", cycle)));
            }
        }
    }

    // Rule 5: unreachable nodes via BFS from the entry point.
    if topology.nodes.contains_key(&topology.entry_point) {
        let mut seen = HashSet::new();
        seen.insert(topology.entry_point.as_str());
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(topology.entry_point.as_str());
        while let Some(current) = queue.pop_front() {
            for edge in topology.edges.iter().filter(|e| e.source_id == current) {
                if seen.insert(edge.target_id.as_str()) {
                    queue.push_back(edge.target_id.as_str());
                }
            }
        }
        for id in topology.nodes.keys() {
            if !seen.contains(id.as_str()) {
                issues.push(issue("UNREACHABLE", id, format!("node '{}' is not reachable from the entry point", id)));
            }
        }

        // Rule 7: depth from entry point <= MAX_DEPTH.
        let mut depth: HashMap<&str, usize> = HashMap::new();
        depth.insert(topology.entry_point.as_str(), 0);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(topology.entry_point.as_str());
        while let Some(current) = queue.pop_front() {
            let d = depth[current];
            for edge in topology.edges.iter().filter(|e| e.source_id == current) {
                let next_depth = d + 1;
                let should_visit = match depth.get(edge.target_id.as_str()) {
                    Some(existing) => next_depth < *existing,
                    None => true,
                };
                if should_visit {
                    depth.insert(edge.target_id.as_str(), next_depth);
                    queue.push_back(edge.target_id.as_str());
                }
            }
        }
        for (id, d) in &depth {
            if *d > MAX_DEPTH {
                issues.push(issue("TOO_DEEP", id, format!("node '{}' is at depth {}, exceeding {}", id, d, MAX_DEPTH)));
            }
        }
    }

    // Rule 6: AGENT model_ref and tools resolve via the external registries.
    for node in topology.nodes.values() {
        if node.kind == NodeKind::Agent {
            let resolved = models
                .resolve(&node.agent_config.model_ref.provider_tag, &node.agent_config.model_ref.model_id)
                .await;
            if resolved.is_none() {
                issues.push(issue(
                    "UNKNOWN_MODEL",
                    &node.id,
                    format!(
                        "model_ref ({}, {}) does not resolve",
                        node.agent_config.model_ref.provider_tag, node.agent_config.model_ref.model_id
                    ),
                ));
            }
            for tool_name in &node.agent_config.tools {
                if tools.lookup(tool_name).await.is_none() {
                    issues.push(issue(
                        "UNKNOWN_TOOL",
                        &node.id,
                        format!("tool '{}' does not resolve", tool_name),
                    ));
                }
            }
        }
    }

    // Rule 8: each NODE_SUPERVISOR has at least one AGENT descendant.
    for node in topology.nodes.values() {
        if node.kind == NodeKind::NodeSupervisor {
            let has_agent_descendant = topology
                .descendants_of(&node.id)
                .iter()
                .any(|id| topology.nodes.get(id).map(|n| n.kind == NodeKind::Agent).unwrap_or(false));
            if !has_agent_descendant {
                issues.push(issue(
                    "EMPTY_SUPERVISOR",
                    &node.id,
                    format!("NODE_SUPERVISOR '{}' has no AGENT descendant", node.id),
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn dfs_find_cycle<'a>(
    topology: &'a TopologyConfig,
    node: &'a str,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<String> {
    colors.insert(node, Color::Grey);
    path.push(node);
    for edge in topology.edges.iter().filter(|e| e.source_id == node) {
        let target = edge.target_id.as_str();
        if !topology.nodes.contains_key(target) {
            continue; // reported separately as DANGLING_EDGE
        }
        match colors.get(target) {
            Some(Color::Grey) => {
                let start = path.iter().position(|&id| id == target).unwrap_or(0);
                let mut cycle_path: Vec<&str> = path[start..].to_vec();
                cycle_path.push(target);
                return Some(cycle_path.join("->"));
            }
            Some(Color::White) | None => {
                if let Some(cycle) = dfs_find_cycle(topology, target, colors, path) {
                    return Some(cycle);
                }
            }
            Some(Color::Black) => {}
        }
    }
    path.pop();
    colors.insert(node, Color::Black);
    None
}

fn issue(code: &str, path: &str, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        path: path.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::registry::{InMemoryModelRegistry, InMemoryToolRegistry};
    use crate::orchestrator::team::{AgentConfig, CoordinationStrategy, ModelRef, Node};

    fn agent_node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            agent_config: AgentConfig {
                role: "worker".to_string(),
                instructions: "do work".to_string(),
                model_ref: ModelRef {
                    provider_tag: "openai".to_string(),
                    model_id: "gpt-4o".to_string(),
                },
                tools: vec![],
                temperature: 1.0,
                max_tokens: 1000,
            },
            coordination_strategy: if matches!(kind, NodeKind::GlobalSupervisor | NodeKind::NodeSupervisor) {
                Some(CoordinationStrategy::Sequential)
            } else {
                None
            },
        }
    }

    fn linear_topology() -> TopologyConfig {
        let mut nodes = HashMap::new();
        nodes.insert("g".to_string(), agent_node("g", NodeKind::GlobalSupervisor));
        nodes.insert("a1".to_string(), agent_node("a1", NodeKind::Agent));
        nodes.insert("a2".to_string(), agent_node("a2", NodeKind::Agent));
        TopologyConfig {
            nodes,
            edges: vec![
                crate::orchestrator::team::Edge { source_id: "g".to_string(), target_id: "a1".to_string(), condition_label: None },
                crate::orchestrator::team::Edge { source_id: "a1".to_string(), target_id: "a2".to_string(), condition_label: None },
            ],
            entry_point: "g".to_string(),
            output_schema: None,
        }
    }

    #[tokio::test]
    async fn accepts_valid_linear_topology() {
        let models = InMemoryModelRegistry::new().register("openai", "gpt-4o", std::sync::Arc::new(NoopClient));
        let tools = InMemoryToolRegistry::new();
        assert!(validate(&linear_topology(), &models, &tools).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_cycle() {
        let mut topology = linear_topology();
        topology.edges.push(crate::orchestrator::team::Edge {
            source_id: "a2".to_string(),
            target_id: "a1".to_string(),
            condition_label: None,
        });
        let models = InMemoryModelRegistry::new().register("openai", "gpt-4o", std::sync::Arc::new(NoopClient));
        let tools = InMemoryToolRegistry::new();
        let errors = validate(&topology, &models, &tools).await.unwrap_err();
        assert!(errors.iter().any(|e| e.code == "CYCLE"));
    }

    #[tokio::test]
    async fn rejects_unknown_model() {
        let topology = linear_topology();
        let models = InMemoryModelRegistry::new();
        let tools = InMemoryToolRegistry::new();
        let errors = validate(&topology, &models, &tools).await.unwrap_err();
        assert!(errors.iter().any(|e| e.code == "UNKNOWN_MODEL"));
    }

    struct NoopClient;
    #[async_trait::async_trait]
    impl crate::orchestrator::registry::LlmClient for NoopClient {
        async fn complete(
            &self,
            _messages: &[crate::orchestrator::registry::ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, crate::orchestrator::registry::LlmCallError> {
            Ok("ok".to_string())
        }
    }
}

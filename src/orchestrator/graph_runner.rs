//! Graph Runner (C3, `spec.md` §4.3).
//!
//! Drives one execution through its DAG: computes the ready set wave by
//! wave, dispatches agent/leaf nodes concurrently through the Agent Step
//! (C4), applies supervisor coordination strategies to gate their direct
//! children, propagates skip on failure, and aggregates the terminal
//! output. The wave-based scheduling loop is grounded on
//! `odgrim-abathur-swarm`'s `DagExecutor::execute_wave` (computed readiness,
//! concurrent dispatch, recompute, repeat) from the retrieved example pack.

use crate::orchestrator::agent_step;
use crate::orchestrator::event_bus::EventBus;
use crate::orchestrator::execution::{NodeResult, NodeStatus};
use crate::orchestrator::registry::{ModelRegistry, ToolRegistry};
use crate::orchestrator::team::{CoordinationStrategy, Edge, NodeKind, TopologyConfig};
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the Graph Runner decided once every node was terminal.
pub struct GraphRunOutcome {
    pub node_results: HashMap<String, NodeResult>,
    /// `true` iff the termination rule in `spec.md` §4.3 is satisfied.
    pub success: bool,
    pub output: String,
    /// `true` if the run ended because the cancellation token tripped.
    pub cancelled: bool,
}

fn is_terminal(status: NodeStatus) -> bool {
    matches!(status, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
}

/// Drive `topology` to completion for `execution_id`.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    execution_id: Uuid,
    topology: TopologyConfig,
    task: String,
    parameters: Value,
    models: Arc<dyn ModelRegistry>,
    tools: Arc<dyn ToolRegistry>,
    event_bus: Arc<EventBus>,
    cancellation: CancellationToken,
    max_iterations: u32,
) -> GraphRunOutcome {
    let topology = &topology;
    let task = task.as_str();
    let parameters = &parameters;
    let mut node_results: HashMap<String, NodeResult> = topology
        .nodes
        .keys()
        .map(|id| (id.clone(), NodeResult::pending()))
        .collect();

    let hierarchical_depths = precompute_hierarchical_depths(topology);

    let _ = event_bus
        .publish(execution_id, "execution_started", None, None, None, Some(task.to_string()), Value::Null)
        .await;

    let mut cancelled = false;

    loop {
        if cancellation.is_cancelled() {
            cancelled = true;
            for (id, result) in node_results.iter_mut() {
                if !is_terminal(result.status) {
                    result.status = NodeStatus::Skipped;
                    result.error = Some("cancelled".to_string());
                    result.completed_at = Some(Utc::now());
                    let _ = event_bus
                        .publish(
                            execution_id,
                            "node_skipped",
                            Some(id.clone()),
                            None,
                            None,
                            Some("cancelled".to_string()),
                            Value::Null,
                        )
                        .await;
                }
            }
            break;
        }

        let ready = compute_ready(topology, &node_results, &hierarchical_depths);
        if ready.is_empty() {
            break;
        }

        let (supervisor_ids, agent_ids): (Vec<String>, Vec<String>) = ready
            .into_iter()
            .partition(|id| is_coordinating_supervisor(topology, id));

        if !supervisor_ids.is_empty() {
            for id in supervisor_ids {
                let node = &topology.nodes[&id];
                let _ = event_bus
                    .publish(execution_id, "node_entered", Some(id.clone()), None, None, None, Value::Null)
                    .await;
                let children = dispatch_order(topology, &id, &hierarchical_depths);
                let _ = event_bus
                    .publish(
                        execution_id,
                        "supervisor_decision",
                        None,
                        None,
                        Some(id.clone()),
                        None,
                        json!({ "strategy": node.coordination_strategy, "order": children }),
                    )
                    .await;
                let now = Utc::now();
                node_results.insert(
                    id.clone(),
                    NodeResult {
                        status: NodeStatus::Success,
                        output: format!("dispatched {} child node(s)", children.len()),
                        error: None,
                        attempts: 0,
                        started_at: Some(now),
                        completed_at: Some(now),
                    },
                );
                let _ = event_bus
                    .publish(execution_id, "node_completed", Some(id), None, None, None, Value::Null)
                    .await;
            }
            continue;
        }

        for id in &agent_ids {
            let _ = event_bus
                .publish(execution_id, "node_entered", Some(id.clone()), None, None, None, Value::Null)
                .await;
        }

        let dispatched = agent_ids.iter().map(|id| {
            let node = topology.nodes[id].clone();
            let models = Arc::clone(&models);
            let tools = Arc::clone(&tools);
            let event_bus = Arc::clone(&event_bus);
            let cancellation = cancellation.clone();
            let upstream_summaries = upstream_summaries_for(topology, id, &node_results);
            let task = task.to_string();
            let parameters = parameters.clone();
            async move {
                let result = agent_step::run_node(
                    execution_id,
                    &node,
                    &task,
                    &parameters,
                    &upstream_summaries,
                    models.as_ref(),
                    tools.as_ref(),
                    &event_bus,
                    &cancellation,
                    max_iterations,
                )
                .await;
                (node.id.clone(), result)
            }
        });

        let completed = join_all(dispatched).await;
        let mut newly_failed = Vec::new();
        for (id, result) in completed {
            let event_type = match result.status {
                NodeStatus::Success => "node_completed",
                NodeStatus::Failed => "node_failed",
                _ => "node_completed",
            };
            if result.status == NodeStatus::Failed {
                newly_failed.push(id.clone());
            }
            let _ = event_bus
                .publish(
                    execution_id,
                    event_type,
                    Some(id.clone()),
                    None,
                    None,
                    result.error.clone(),
                    Value::Null,
                )
                .await;
            node_results.insert(id, result);
        }

        for failed_id in newly_failed {
            for descendant in topology.descendants_of(&failed_id) {
                let should_skip = node_results
                    .get(&descendant)
                    .map(|r| !is_terminal(r.status))
                    .unwrap_or(false);
                if should_skip {
                    let now = Utc::now();
                    node_results.insert(
                        descendant.clone(),
                        NodeResult {
                            status: NodeStatus::Skipped,
                            output: String::new(),
                            error: Some(format!("upstream failed: {}", failed_id)),
                            attempts: 0,
                            started_at: Some(now),
                            completed_at: Some(now),
                        },
                    );
                    let _ = event_bus
                        .publish(
                            execution_id,
                            "node_skipped",
                            Some(descendant),
                            None,
                            None,
                            Some(format!("upstream failed: {}", failed_id)),
                            Value::Null,
                        )
                        .await;
                }
            }
        }
    }

    if cancelled {
        return GraphRunOutcome { node_results, success: false, output: String::new(), cancelled: true };
    }

    let terminal_nodes = topology_terminal_nodes(topology);
    let successful_terminals: Vec<&str> = terminal_nodes
        .iter()
        .filter(|id| node_results.get(*id).map(|r| r.status == NodeStatus::Success).unwrap_or(false))
        .map(|s| s.as_str())
        .collect();

    let success = node_results.values().all(|r| matches!(r.status, NodeStatus::Success | NodeStatus::Skipped))
        && !successful_terminals.is_empty();

    let output = aggregate_output(
        execution_id,
        topology,
        task,
        &node_results,
        &successful_terminals,
        models,
        tools,
        event_bus,
        max_iterations,
    )
    .await;

    GraphRunOutcome { node_results, success, output, cancelled: false }
}

#[allow(clippy::too_many_arguments)]
async fn aggregate_output(
    execution_id: Uuid,
    topology: &TopologyConfig,
    task: &str,
    node_results: &HashMap<String, NodeResult>,
    successful_terminals: &[&str],
    models: Arc<dyn ModelRegistry>,
    tools: Arc<dyn ToolRegistry>,
    event_bus: Arc<EventBus>,
    max_iterations: u32,
) -> String {
    let in_topological_order = topological_order(topology);
    let mut ordered_terminals: Vec<&str> = in_topological_order
        .iter()
        .map(|s| s.as_str())
        .filter(|id| successful_terminals.contains(id))
        .collect();
    ordered_terminals.dedup();

    let concatenated = ordered_terminals
        .iter()
        .filter_map(|id| node_results.get(*id))
        .map(|r| r.output.clone())
        .collect::<Vec<_>>()
        .join("\n");

    if ordered_terminals.len() < 2 {
        return concatenated;
    }

    let entry = match topology.nodes.get(&topology.entry_point) {
        Some(n) if n.kind == NodeKind::GlobalSupervisor => n,
        _ => return concatenated,
    };

    let summaries: Vec<(String, String)> = ordered_terminals
        .iter()
        .filter_map(|id| node_results.get(*id).map(|r| (id.to_string(), r.output.clone())))
        .collect();

    let synthesis = agent_step::run_node(
        execution_id,
        entry,
        &format!("Synthesize the final answer for task: {}", task),
        &Value::Null,
        &summaries,
        models.as_ref(),
        tools.as_ref(),
        &event_bus,
        &CancellationToken::new(),
        max_iterations,
    )
    .await;

    if synthesis.status == NodeStatus::Success {
        synthesis.output
    } else {
        concatenated
    }
}

fn topology_terminal_nodes(topology: &TopologyConfig) -> Vec<String> {
    topology
        .nodes
        .keys()
        .filter(|id| topology.children_of(id.as_str()).is_empty())
        .cloned()
        .collect()
}

fn topological_order(topology: &TopologyConfig) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = topology.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for edge in &topology.edges {
        if let Some(count) = in_degree.get_mut(edge.target_id.as_str()) {
            *count += 1;
        }
    }
    let mut queue: VecDeque<&str> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        for edge in topology.edges.iter().filter(|e| e.source_id == current) {
            if let Some(count) = in_degree.get_mut(edge.target_id.as_str()) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(edge.target_id.as_str());
                }
            }
        }
    }
    order
}

fn compute_ready(
    topology: &TopologyConfig,
    node_results: &HashMap<String, NodeResult>,
    hierarchical_depths: &HashMap<String, HashMap<String, usize>>,
) -> Vec<String> {
    topology
        .nodes
        .keys()
        .filter(|id| node_results.get(id.as_str()).map(|r| r.status == NodeStatus::Pending).unwrap_or(false))
        .filter(|id| {
            topology
                .parents_of(id.as_str())
                .iter()
                .all(|p| node_results.get(*p).map(|r| r.status == NodeStatus::Success).unwrap_or(false))
        })
        .filter(|id| strategy_gate_satisfied(topology, id.as_str(), node_results, hierarchical_depths))
        .cloned()
        .collect()
}

/// A supervisor "coordinates" (rather than executing like an agent) iff it
/// has at least one outgoing edge; a supervisor with none is a leaf and runs
/// through the Agent Step like any other node (`spec.md` §4.3 "AGENT or leaf").
fn is_coordinating_supervisor(topology: &TopologyConfig, id: &str) -> bool {
    let node = &topology.nodes[id];
    matches!(node.kind, NodeKind::GlobalSupervisor | NodeKind::NodeSupervisor) && !topology.children_of(id).is_empty()
}

fn ordered_children<'a>(topology: &'a TopologyConfig, supervisor_id: &str, priority: bool) -> Vec<&'a Edge> {
    let mut children = topology.children_of(supervisor_id);
    if priority {
        children.sort_by(|a, b| priority_weight(b).partial_cmp(&priority_weight(a)).unwrap());
    }
    children
}

fn priority_weight(edge: &Edge) -> f64 {
    edge.condition_label.as_ref().and_then(|l| l.parse().ok()).unwrap_or(0.0)
}

fn dispatch_order(
    topology: &TopologyConfig,
    supervisor_id: &str,
    hierarchical_depths: &HashMap<String, HashMap<String, usize>>,
) -> Vec<String> {
    let node = &topology.nodes[supervisor_id];
    match node.coordination_strategy.unwrap_or(CoordinationStrategy::Parallel) {
        CoordinationStrategy::Priority => {
            ordered_children(topology, supervisor_id, true).into_iter().map(|e| e.target_id.clone()).collect()
        }
        CoordinationStrategy::Hierarchical => {
            let depths = hierarchical_depths.get(supervisor_id).cloned().unwrap_or_default();
            let mut entries: Vec<(String, usize)> = depths.into_iter().collect();
            entries.sort_by_key(|(_, d)| *d);
            entries.into_iter().map(|(id, _)| id).collect()
        }
        _ => ordered_children(topology, supervisor_id, false).into_iter().map(|e| e.target_id.clone()).collect(),
    }
}

/// Gate readiness for nodes with a single governing supervisor parent,
/// per its `coordination_strategy` (`spec.md` §4.3 step 2). Nodes with zero
/// or more than one parent are ungated beyond the plain predecessor check —
/// an explicit simplification for DAGs where a node has multiple supervisor
/// parents with conflicting strategies (documented in `DESIGN.md`).
fn strategy_gate_satisfied(
    topology: &TopologyConfig,
    node_id: &str,
    node_results: &HashMap<String, NodeResult>,
    hierarchical_depths: &HashMap<String, HashMap<String, usize>>,
) -> bool {
    let parents = topology.parents_of(node_id);
    if parents.len() != 1 {
        return true;
    }
    let parent_id = parents[0];
    let parent = match topology.nodes.get(parent_id) {
        Some(n) => n,
        None => return true,
    };
    if !matches!(parent.kind, NodeKind::GlobalSupervisor | NodeKind::NodeSupervisor) {
        return true;
    }
    match parent.coordination_strategy.unwrap_or(CoordinationStrategy::Parallel) {
        CoordinationStrategy::Parallel | CoordinationStrategy::Adaptive => true,
        CoordinationStrategy::Sequential | CoordinationStrategy::RoundRobin => {
            let siblings = ordered_children(topology, parent_id, false);
            let pos = siblings.iter().position(|e| e.target_id == node_id).unwrap_or(0);
            siblings[..pos]
                .iter()
                .all(|e| node_results.get(&e.target_id).map(|r| is_terminal(r.status)).unwrap_or(false))
        }
        CoordinationStrategy::Priority => {
            let siblings = ordered_children(topology, parent_id, true);
            let pos = siblings.iter().position(|e| e.target_id == node_id).unwrap_or(0);
            siblings[..pos]
                .iter()
                .all(|e| node_results.get(&e.target_id).map(|r| is_terminal(r.status)).unwrap_or(false))
        }
        CoordinationStrategy::Hierarchical => {
            let depths = match hierarchical_depths.get(parent_id) {
                Some(d) => d,
                None => return true,
            };
            let my_depth = depths.get(node_id).copied().unwrap_or(1);
            depths
                .iter()
                .filter(|(_, d)| **d < my_depth)
                .all(|(id, _)| node_results.get(id).map(|r| is_terminal(r.status)).unwrap_or(true))
        }
    }
}

/// BFS distance from every `HIERARCHICAL` supervisor to each reachable
/// descendant, computed once per run since the topology snapshot never mutates.
fn precompute_hierarchical_depths(topology: &TopologyConfig) -> HashMap<String, HashMap<String, usize>> {
    let mut result = HashMap::new();
    for node in topology.nodes.values() {
        if node.coordination_strategy != Some(CoordinationStrategy::Hierarchical) {
            continue;
        }
        let mut depths = HashMap::new();
        let mut queue = VecDeque::new();
        for edge in topology.children_of(&node.id) {
            if depths.insert(edge.target_id.clone(), 1).is_none() {
                queue.push_back(edge.target_id.clone());
            }
        }
        while let Some(current) = queue.pop_front() {
            let d = depths[&current];
            for edge in topology.children_of(&current) {
                if !depths.contains_key(&edge.target_id) {
                    depths.insert(edge.target_id.clone(), d + 1);
                    queue.push_back(edge.target_id.clone());
                }
            }
        }
        result.insert(node.id.clone(), depths);
    }
    result
}

fn upstream_summaries_for(
    topology: &TopologyConfig,
    node_id: &str,
    node_results: &HashMap<String, NodeResult>,
) -> Vec<(String, String)> {
    topology
        .parents_of(node_id)
        .into_iter()
        .filter_map(|p| node_results.get(p).map(|r| (p.to_string(), r.output.clone())))
        .collect()
}

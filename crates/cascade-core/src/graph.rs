//! Graph utilities: cycle-checked topological ordering and the edge
//! indexes the executor walks.
//!
//! Loops are expressed as `loop` nodes whose `"body"`-labeled outgoing
//! edges name the iteration body, never as graph back-edges, so the whole
//! node set must be acyclic. Body nodes are excluded from the top-level
//! traversal; their owning composite executes them itself.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::definition::{NodeKind, WorkflowDefinition, WorkflowEdge, WorkflowNode};
use crate::{EngineError, Result};

/// Compute a deterministic topological ordering of the given nodes.
///
/// Ties between simultaneously-ready nodes break by definition order, so
/// the same definition always schedules identically. Fails with a
/// `Validation` error if the graph contains a cycle.
pub fn topological_order(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> Result<Vec<String>> {
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        in_degree.insert(node.id.as_str(), 0);
        successors.insert(node.id.as_str(), Vec::new());
    }

    for edge in edges {
        // Endpoint existence is checked by definition validation; ignore
        // dangling edges here so the function is total over raw inputs.
        if !position.contains_key(edge.source.as_str())
            || !position.contains_key(edge.target.as_str())
        {
            continue;
        }
        *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
        successors
            .get_mut(edge.source.as_str())
            .unwrap()
            .push(edge.target.as_str());
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort_by_key(|id| position[id]);

    let mut queue: VecDeque<&str> = ready.into();
    let mut order: Vec<String> = Vec::with_capacity(nodes.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());

        let mut newly_ready: Vec<&str> = Vec::new();
        if let Some(succ) = successors.get(id) {
            for &next in succ {
                let deg = in_degree.get_mut(next).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(next);
                }
            }
        }
        newly_ready.sort_by_key(|id| position[id]);
        for id in newly_ready {
            queue.push_back(id);
        }
    }

    if order.len() != nodes.len() {
        return Err(EngineError::Validation(
            "workflow graph contains a cycle".to_string(),
        ));
    }

    Ok(order)
}

/// Pre-computed traversal indexes for one definition.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    /// Topological order over the full node set.
    pub order: Vec<String>,
    /// `order` filtered to nodes not owned by a composite.
    pub top_level: Vec<String>,
    /// Inbound edges per node id.
    pub inbound: HashMap<String, Vec<WorkflowEdge>>,
    /// Outbound edges per node id.
    pub outbound: HashMap<String, Vec<WorkflowEdge>>,
    /// Composite node id → its body node ids in topological order, derived
    /// from the node's `"body"`-labeled edges.
    pub bodies: HashMap<String, Vec<String>>,
    /// Body node id → owning composite node id.
    pub body_owner: HashMap<String, String>,
}

impl GraphIndex {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let order = topological_order(&definition.nodes, &definition.edges)?;

        let mut bodies: HashMap<String, Vec<String>> = HashMap::new();
        let mut body_owner: HashMap<String, String> = HashMap::new();
        for node in &definition.nodes {
            if !matches!(node.kind, NodeKind::Loop | NodeKind::Parallel) {
                continue;
            }
            let members = definition.body_nodes_of(&node.id);
            let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
            let ordered: Vec<String> = order
                .iter()
                .filter(|id| member_set.contains(id.as_str()))
                .cloned()
                .collect();
            for body_id in &ordered {
                body_owner.insert(body_id.clone(), node.id.clone());
            }
            bodies.insert(node.id.clone(), ordered);
        }

        let mut inbound: HashMap<String, Vec<WorkflowEdge>> = HashMap::new();
        let mut outbound: HashMap<String, Vec<WorkflowEdge>> = HashMap::new();
        for node in &definition.nodes {
            inbound.insert(node.id.clone(), Vec::new());
            outbound.insert(node.id.clone(), Vec::new());
        }
        for edge in &definition.edges {
            outbound
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            inbound
                .entry(edge.target.clone())
                .or_default()
                .push(edge.clone());
        }

        let top_level = order
            .iter()
            .filter(|id| !body_owner.contains_key(*id))
            .cloned()
            .collect();

        Ok(Self {
            order,
            top_level,
            inbound,
            outbound,
            bodies,
            body_owner,
        })
    }
}

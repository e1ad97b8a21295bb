//! Applying a solved layout assignment to its graph and recording the plan.

use crate::common::{unix_timestamp, CostSecs, Layout};
use crate::graph::{Graph, GraphError};
use crate::layout_opt::{Solution, SolveMode};
use crate::records::{AppendLog, LogError};
use crate::space::ConfigIdx;
use crate::task::TaskSignature;

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// A graph with one implementation chosen per node and a conversion on every edge whose chosen
/// layouts cost something to convert between.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TunedGraph {
    pub graph: String,
    pub nodes: Vec<TunedNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversions: Vec<LayoutConversion>,
    pub total_cost: CostSecs,
    pub mode: SolveMode,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TunedNode {
    pub node: String,
    pub implementation: String,
    pub layout: Layout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigIdx>,
    pub cost: CostSecs,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LayoutConversion {
    pub from_node: String,
    pub to_node: String,
    pub from: Layout,
    pub to: Layout,
    pub cost: CostSecs,
}

/// One entry of the graph-level log.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GraphRecord {
    #[serde(flatten)]
    pub plan: TunedGraph,
    pub timestamp: f64,
}

pub type GraphLog = AppendLog<GraphRecord>;

pub struct TunedGraphEmitter<'a> {
    log: &'a GraphLog,
}

#[derive(thiserror::Error, Debug)]
pub enum EmitError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Apply `solution` to `graph`. Touches nothing but its arguments.
pub fn apply(graph: &Graph, solution: &Solution) -> Result<TunedGraph, GraphError> {
    let choices = solution.assignment.choices();
    // Recomputing the cost also checks the assignment covers every node.
    let total_cost = graph.assignment_cost(choices)?;

    let nodes = graph
        .nodes()
        .iter()
        .zip(choices)
        .map(|(node, &c)| {
            let candidate = &node.candidates[c];
            let (task, config) = match &candidate.task {
                Some((task, config)) => (Some(task.clone()), Some(*config)),
                None => (None, None),
            };
            TunedNode {
                node: node.name.clone(),
                implementation: candidate.implementation.clone(),
                layout: candidate.layout.clone(),
                task,
                config,
                cost: candidate.cost,
            }
        })
        .collect::<Vec<_>>();

    let conversions = graph
        .edges()
        .iter()
        .filter_map(|edge| {
            let cost = graph.edge_cost(edge, choices[edge.from], choices[edge.to]);
            if cost <= 0.0 {
                return None;
            }
            let (from, to) = (&nodes[edge.from], &nodes[edge.to]);
            Some(LayoutConversion {
                from_node: from.node.clone(),
                to_node: to.node.clone(),
                from: from.layout.clone(),
                to: to.layout.clone(),
                cost,
            })
        })
        .collect();

    Ok(TunedGraph {
        graph: graph.name().to_string(),
        nodes,
        conversions,
        total_cost,
        mode: solution.mode,
    })
}

impl GraphRecord {
    pub fn new(plan: TunedGraph) -> Self {
        GraphRecord {
            plan,
            timestamp: unix_timestamp(),
        }
    }
}

impl GraphLog {
    /// The most recently appended plan for `graph`.
    pub fn latest(&self, graph: &str) -> Result<Option<GraphRecord>, LogError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.plan.graph == graph)
            .last())
    }
}

impl<'a> TunedGraphEmitter<'a> {
    pub fn new(log: &'a GraphLog) -> Self {
        TunedGraphEmitter { log }
    }

    /// Apply `solution` and append the resulting plan to the graph log.
    pub fn emit(&self, graph: &Graph, solution: &Solution) -> Result<TunedGraph, EmitError> {
        let plan = apply(graph, solution)?;
        if let Some(previous) = self.log.latest(&plan.graph)? {
            if plan.total_cost > previous.plan.total_cost {
                warn!(
                    "Plan for {} costs {:.3}us, worse than the previous {:.3}us",
                    plan.graph,
                    plan.total_cost * 1e6,
                    previous.plan.total_cost * 1e6
                );
            }
        }
        self.log.append(&GraphRecord::new(plan.clone()))?;
        info!(
            "Recorded plan for {} with {} layout conversions",
            plan.graph,
            plan.conversions.len()
        );
        Ok(plan)
    }
}

//! Graph topology for layout selection.
//!
//! A [GraphDef] is what the caller supplies: named nodes, each with candidate
//! (implementation, layout) pairs whose costs are either given or looked up in the kernel log, and
//! edges between nodes with a conversion cost for mismatched layouts. [Graph::resolve] turns it
//! into a validated [Graph] in which every candidate has a cost and every edge refers to nodes by
//! index.

use crate::common::{CostSecs, Layout};
use crate::records::{KernelLog, LogError};
use crate::space::ConfigIdx;
use crate::task::TaskSignature;

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GraphDef {
    pub name: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
    /// Conversion cost for edges that don't set their own.
    pub conversion: ConversionCost,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NodeDef {
    pub name: String,
    pub candidates: Vec<CandidateDef>,
}

/// One way to implement a node. The cost is `cost` if given, otherwise the best logged cost of
/// the named task.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CandidateDef {
    pub implementation: String,
    pub layout: Layout,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub cost: Option<CostSecs>,
}

/// A data dependency. Data flows from `from` to `to`, so a conversion turns the producer's layout
/// into the consumer's.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub conversion: Option<ConversionCost>,
}

/// The cost of converting between two layouts. Equal layouts never cost anything.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConversionCost {
    Fixed(CostSecs),
    /// Per (from, to) pair, with `default` for pairs not listed.
    Table {
        default: CostSecs,
        pairs: Vec<(Layout, Layout, CostSecs)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    name: String,
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub implementation: String,
    pub layout: Layout,
    /// The tuned kernel behind this candidate, if its cost came from the log.
    pub task: Option<(TaskSignature, ConfigIdx)>,
    pub cost: CostSecs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub conversion: ConversionCost,
}

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("Edge {from} -> {to} refers to a node that does not exist")]
    DanglingEdge { from: String, to: String },
    #[error("Edge from {0} to itself")]
    SelfLoop(String),
    #[error("Node {0} appears more than once")]
    DuplicateNode(String),
    #[error("Node {0} has no usable candidates")]
    NoCandidates(String),
    #[error("Candidate {implementation} of {node} refers to unknown task {task}")]
    UnknownTask {
        node: String,
        implementation: String,
        task: String,
    },
    #[error("Candidate {implementation} of {node} has neither a cost nor a task")]
    MissingCost { node: String, implementation: String },
    #[error("Invalid cost {cost} in {context}")]
    InvalidCost { context: String, cost: CostSecs },
    #[error("Assignment is invalid: {0}")]
    InvalidAssignment(String),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl ConversionCost {
    pub fn cost(&self, from: &Layout, to: &Layout) -> CostSecs {
        if from == to {
            return 0.0;
        }
        match self {
            ConversionCost::Fixed(c) => *c,
            ConversionCost::Table { default, pairs } => pairs
                .iter()
                .find(|(f, t, _)| f == from && t == to)
                .map_or(*default, |(_, _, c)| *c),
        }
    }

    fn costs(&self) -> Box<dyn Iterator<Item = CostSecs> + '_> {
        match self {
            ConversionCost::Fixed(c) => Box::new(std::iter::once(*c)),
            ConversionCost::Table { default, pairs } => {
                Box::new(std::iter::once(*default).chain(pairs.iter().map(|p| p.2)))
            }
        }
    }
}

impl Graph {
    pub fn new(name: String, nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Result<Self, GraphError> {
        for node in &nodes {
            if node.candidates.is_empty() {
                return Err(GraphError::NoCandidates(node.name.clone()));
            }
            for c in &node.candidates {
                check_cost(c.cost, || format!("{} of {}", c.implementation, node.name))?;
            }
        }
        for edge in &edges {
            let (Some(from), Some(to)) = (nodes.get(edge.from), nodes.get(edge.to)) else {
                return Err(GraphError::DanglingEdge {
                    from: edge.from.to_string(),
                    to: edge.to.to_string(),
                });
            };
            if edge.from == edge.to {
                return Err(GraphError::SelfLoop(from.name.clone()));
            }
            for c in edge.conversion.costs() {
                check_cost(c, || format!("edge {} -> {}", from.name, to.name))?;
            }
        }
        Ok(Graph { name, nodes, edges })
    }

    /// Resolve `def` against the kernel log. `tasks` maps task names to signatures.
    ///
    /// Candidates whose task has no successful record are dropped with a warning; a node left
    /// with no candidates is an error.
    pub fn resolve(
        def: &GraphDef,
        tasks: &HashMap<String, TaskSignature>,
        log: &KernelLog,
    ) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if index.insert(node.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        let mut best_cache: HashMap<&TaskSignature, Option<(ConfigIdx, CostSecs)>> = HashMap::new();
        let mut nodes = Vec::with_capacity(def.nodes.len());
        for node in &def.nodes {
            let mut candidates = Vec::with_capacity(node.candidates.len());
            for c in &node.candidates {
                let (cost, task) = match (&c.cost, &c.task) {
                    (Some(cost), _) => (*cost, None),
                    (None, Some(task_name)) => {
                        let signature =
                            tasks.get(task_name).ok_or_else(|| GraphError::UnknownTask {
                                node: node.name.clone(),
                                implementation: c.implementation.clone(),
                                task: task_name.clone(),
                            })?;
                        let best = match best_cache.get(signature) {
                            Some(best) => *best,
                            None => {
                                let best = log
                                    .best(signature)?
                                    .and_then(|r| r.cost().map(|cost| (r.config, cost)));
                                best_cache.insert(signature, best);
                                best
                            }
                        };
                        let Some((config, cost)) = best else {
                            warn!(
                                "Dropping candidate {} of {}: task {task_name} has no viable configuration",
                                c.implementation, node.name
                            );
                            continue;
                        };
                        (cost, Some((signature.clone(), config)))
                    }
                    (None, None) => {
                        return Err(GraphError::MissingCost {
                            node: node.name.clone(),
                            implementation: c.implementation.clone(),
                        })
                    }
                };
                candidates.push(Candidate {
                    implementation: c.implementation.clone(),
                    layout: c.layout.clone(),
                    task,
                    cost,
                });
            }
            nodes.push(GraphNode {
                name: node.name.clone(),
                candidates,
            });
        }

        let edges = def
            .edges
            .iter()
            .map(|e| match (index.get(e.from.as_str()), index.get(e.to.as_str())) {
                (Some(&from), Some(&to)) => Ok(Edge {
                    from,
                    to,
                    conversion: e.conversion.clone().unwrap_or_else(|| def.conversion.clone()),
                }),
                _ => Err(GraphError::DanglingEdge {
                    from: e.from.clone(),
                    to: e.to.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Graph::new(def.name.clone(), nodes, edges)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The conversion cost `edge` incurs when its endpoints choose candidates `a` and `b`.
    pub fn edge_cost(&self, edge: &Edge, a: usize, b: usize) -> CostSecs {
        edge.conversion.cost(
            &self.nodes[edge.from].candidates[a].layout,
            &self.nodes[edge.to].candidates[b].layout,
        )
    }

    /// Node costs plus the conversion costs actually incurred by `choices`.
    pub fn assignment_cost(&self, choices: &[usize]) -> Result<CostSecs, GraphError> {
        if choices.len() != self.nodes.len() {
            return Err(GraphError::InvalidAssignment(format!(
                "{} choices for {} nodes",
                choices.len(),
                self.nodes.len()
            )));
        }
        let mut total = 0.0;
        for (node, &c) in self.nodes.iter().zip(choices) {
            let candidate = node.candidates.get(c).ok_or_else(|| {
                GraphError::InvalidAssignment(format!(
                    "{} has no candidate {c}",
                    node.name
                ))
            })?;
            total += candidate.cost;
        }
        for edge in &self.edges {
            total += self.edge_cost(edge, choices[edge.from], choices[edge.to]);
        }
        Ok(total)
    }
}

fn check_cost(cost: CostSecs, context: impl FnOnce() -> String) -> Result<(), GraphError> {
    if cost.is_finite() && cost >= 0.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidCost {
            context: context(),
            cost,
        })
    }
}

#[cfg(test)]
pub(crate) fn chain(costs: &[&[(&str, CostSecs)]], conversion: CostSecs) -> Graph {
    let nodes = costs
        .iter()
        .enumerate()
        .map(|(i, cs)| GraphNode {
            name: format!("n{i}"),
            candidates: cs
                .iter()
                .map(|&(layout, cost)| Candidate {
                    implementation: format!("impl_{layout}"),
                    layout: Layout::from(layout),
                    task: None,
                    cost,
                })
                .collect(),
        })
        .collect::<Vec<_>>();
    let edges = (1..nodes.len())
        .map(|i| Edge {
            from: i - 1,
            to: i,
            conversion: ConversionCost::Fixed(conversion),
        })
        .collect();
    Graph::new("chain".to_string(), nodes, edges).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{FailureKind, MeasureResult};
    use crate::records::TuningRecord;

    fn def() -> GraphDef {
        serde_json::from_str(
            r#"{
                "name": "net",
                "conversion": 10.0,
                "nodes": [
                    {"name": "conv0", "candidates": [
                        {"implementation": "direct", "layout": "NCHW", "task": "conv0"},
                        {"implementation": "winograd", "layout": "NHWC", "task": "conv0_wino"}
                    ]},
                    {"name": "relu0", "candidates": [
                        {"implementation": "relu", "layout": "NCHW", "cost": 0.5}
                    ]}
                ],
                "edges": [{"from": "conv0", "to": "relu0"}]
            }"#,
        )
        .unwrap()
    }

    fn tasks() -> HashMap<String, TaskSignature> {
        [("conv0", "conv2d-1"), ("conv0_wino", "conv2d-2")]
            .into_iter()
            .map(|(n, s)| (n.to_string(), TaskSignature::new(s)))
            .collect()
    }

    #[test]
    fn test_conversion_table_lookup() {
        let table = ConversionCost::Table {
            default: 3.0,
            pairs: vec![(Layout::from("NCHW"), Layout::from("NHWC"), 1.0)],
        };
        let (nchw, nhwc) = (Layout::from("NCHW"), Layout::from("NHWC"));
        assert_eq!(table.cost(&nchw, &nhwc), 1.0);
        assert_eq!(table.cost(&nhwc, &nchw), 3.0);
        assert_eq!(table.cost(&nhwc, &nhwc), 0.0);
    }

    #[test]
    fn test_conversion_cost_json_forms() {
        let fixed: ConversionCost = serde_json::from_str("2.5").unwrap();
        assert_eq!(fixed, ConversionCost::Fixed(2.5));
        let table: ConversionCost =
            serde_json::from_str(r#"{"default": 1.0, "pairs": [["NCHW", "NHWC", 0.5]]}"#).unwrap();
        assert!(matches!(table, ConversionCost::Table { default, .. } if default == 1.0));
    }

    #[test]
    fn test_resolve_takes_costs_from_the_log() {
        let log = KernelLog::open(None).unwrap();
        let sig = TaskSignature::new("conv2d-1");
        log.append(&TuningRecord::new(sig.clone(), 3, MeasureResult::success(2.0)))
            .unwrap();
        log.append(&TuningRecord::new(sig.clone(), 5, MeasureResult::success(1.5)))
            .unwrap();
        log.append(&TuningRecord::new(
            TaskSignature::new("conv2d-2"),
            0,
            MeasureResult::success(1.0),
        ))
        .unwrap();

        let graph = Graph::resolve(&def(), &tasks(), &log).unwrap();
        let conv = &graph.nodes()[0];
        assert_eq!(conv.candidates[0].cost, 1.5);
        assert_eq!(conv.candidates[0].task, Some((sig, 5)));
        assert_eq!(conv.candidates[1].cost, 1.0);
        assert_eq!(graph.edges()[0].conversion, ConversionCost::Fixed(10.0));
        assert_eq!(graph.assignment_cost(&[0, 0]).unwrap(), 2.0);
        assert_eq!(graph.assignment_cost(&[1, 0]).unwrap(), 11.5);
    }

    #[test]
    fn test_resolve_drops_unviable_candidates() {
        let log = KernelLog::open(None).unwrap();
        log.append(&TuningRecord::new(
            TaskSignature::new("conv2d-1"),
            0,
            MeasureResult::success(1.0),
        ))
        .unwrap();
        log.append(&TuningRecord::new(
            TaskSignature::new("conv2d-2"),
            0,
            MeasureResult::failed(FailureKind::RunFailed, "crash"),
        ))
        .unwrap();
        let graph = Graph::resolve(&def(), &tasks(), &log).unwrap();
        assert_eq!(graph.nodes()[0].candidates.len(), 1);
    }

    #[test]
    fn test_node_with_nothing_viable_is_an_error() {
        let log = KernelLog::open(None).unwrap();
        assert!(matches!(
            Graph::resolve(&def(), &tasks(), &log),
            Err(GraphError::NoCandidates(n)) if n == "conv0"
        ));
    }

    #[test]
    fn test_dangling_edge_is_an_error() {
        let log = KernelLog::open(None).unwrap();
        let mut d = def();
        d.nodes[0].candidates.iter_mut().for_each(|c| c.cost = Some(1.0));
        d.edges.push(EdgeDef {
            from: "relu0".to_string(),
            to: "softmax".to_string(),
            conversion: None,
        });
        assert!(matches!(
            Graph::resolve(&d, &tasks(), &log),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn test_unknown_task_is_an_error() {
        let log = KernelLog::open(None).unwrap();
        assert!(matches!(
            Graph::resolve(&def(), &HashMap::new(), &log),
            Err(GraphError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_new_rejects_bad_topology() {
        let g = chain(&[&[("NCHW", 1.0)], &[("NCHW", 1.0)]], 1.0);
        let mut edges = g.edges().to_vec();
        edges.push(Edge {
            from: 1,
            to: 1,
            conversion: ConversionCost::Fixed(0.0),
        });
        assert!(matches!(
            Graph::new("g".to_string(), g.nodes().to_vec(), edges),
            Err(GraphError::SelfLoop(_))
        ));
        assert!(matches!(
            Graph::new(
                "g".to_string(),
                g.nodes().to_vec(),
                vec![Edge {
                    from: 0,
                    to: 1,
                    conversion: ConversionCost::Fixed(f64::NAN),
                }]
            ),
            Err(GraphError::InvalidCost { .. })
        ));
        assert!(matches!(
            g.assignment_cost(&[0, 1]),
            Err(GraphError::InvalidAssignment(_))
        ));
    }
}

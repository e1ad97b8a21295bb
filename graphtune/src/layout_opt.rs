//! Choosing one candidate per graph node.
//!
//! The objective is the sum of candidate costs plus the conversion cost of every edge whose
//! endpoints disagree on layout: a pairwise labeling problem. Each connected component is solved
//! exactly by variable elimination under a greedy min-size ordering, which is exact on trees and
//! cheap on graphs of low treewidth. A component whose elimination would need a table larger than
//! [GraphLayoutOptimizer::max_table_entries] falls back to iterated conditional modes (ICM): start
//! from each node's cheapest candidate, then repeatedly move single nodes to their best candidate
//! given their neighbours, for at most [GraphLayoutOptimizer::max_icm_passes] passes.
//!
//! Among the optimal assignments of a component, the exact solver returns the lexicographically
//! smallest in node order: the earliest node keeps the lowest candidate index it can. ICM breaks
//! ties toward the lower candidate index.

use crate::common::CostSecs;
use crate::graph::{Graph, GraphError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

const DEFAULT_MAX_TABLE_ENTRIES: usize = 1 << 22;
const DEFAULT_MAX_ICM_PASSES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    /// The assignment is a global minimum.
    Exact,
    /// At least one component was solved by local improvement and may not be optimal.
    Approximate,
}

/// One candidate index per node, and what that costs.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutAssignment {
    choices: Vec<usize>,
    total_cost: CostSecs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub assignment: LayoutAssignment,
    pub mode: SolveMode,
}

#[derive(Clone, Debug)]
pub struct GraphLayoutOptimizer {
    pub max_table_entries: usize,
    pub max_icm_passes: usize,
}

/// A cost table over the joint assignments of `scope`. The first variable varies fastest.
#[derive(Clone, Debug)]
struct Factor {
    scope: Vec<usize>,
    values: Vec<CostSecs>,
}

/// How to recover an eliminated variable's value once the rest of its table's scope is known.
struct Elimination {
    var: usize,
    scope: Vec<usize>,
    argmin: Vec<usize>,
}

/// Unary and merged pairwise costs, indexed by node.
struct Problem<'g> {
    graph: &'g Graph,
    domains: Vec<usize>,
    pairwise: BTreeMap<(usize, usize), Vec<CostSecs>>,
    neighbors: Vec<BTreeSet<usize>>,
}

impl LayoutAssignment {
    /// Validate `choices` against `graph` and compute their total cost.
    pub fn new(graph: &Graph, choices: Vec<usize>) -> Result<Self, GraphError> {
        let total_cost = graph.assignment_cost(&choices)?;
        Ok(LayoutAssignment {
            choices,
            total_cost,
        })
    }

    pub fn choices(&self) -> &[usize] {
        &self.choices
    }

    pub fn choice(&self, node: usize) -> usize {
        self.choices[node]
    }

    pub fn total_cost(&self) -> CostSecs {
        self.total_cost
    }
}

impl Display for SolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveMode::Exact => write!(f, "exact"),
            SolveMode::Approximate => write!(f, "approximate"),
        }
    }
}

impl Default for GraphLayoutOptimizer {
    fn default() -> Self {
        GraphLayoutOptimizer {
            max_table_entries: DEFAULT_MAX_TABLE_ENTRIES,
            max_icm_passes: DEFAULT_MAX_ICM_PASSES,
        }
    }
}

impl GraphLayoutOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solve(&self, graph: &Graph) -> Result<Solution, GraphError> {
        let problem = Problem::new(graph);
        let mut choices = vec![0; graph.nodes().len()];
        let mut mode = SolveMode::Exact;

        for component in problem.components() {
            match problem.elimination_order(&component, self.max_table_entries) {
                Some(order) => {
                    debug!(
                        "Solving {} nodes of {} exactly",
                        component.len(),
                        graph.name()
                    );
                    problem.solve_exact(&component, &order, &mut choices);
                }
                None => {
                    warn!(
                        "A component of {} with {} nodes is too wide to solve exactly; using ICM",
                        graph.name(),
                        component.len()
                    );
                    mode = SolveMode::Approximate;
                    problem.icm(&component, self.max_icm_passes, &mut choices);
                }
            }
        }

        let assignment = LayoutAssignment::new(graph, choices)?;
        info!(
            "Solved {} ({mode}): total cost {:.3}us",
            graph.name(),
            assignment.total_cost() * 1e6
        );
        Ok(Solution { assignment, mode })
    }
}

impl<'g> Problem<'g> {
    fn new(graph: &'g Graph) -> Self {
        let n = graph.nodes().len();
        let domains = graph
            .nodes()
            .iter()
            .map(|node| node.candidates.len())
            .collect::<Vec<_>>();
        let mut pairwise: BTreeMap<(usize, usize), Vec<CostSecs>> = BTreeMap::new();
        let mut neighbors = vec![BTreeSet::new(); n];
        for edge in graph.edges() {
            let (a, b) = (edge.from.min(edge.to), edge.from.max(edge.to));
            neighbors[a].insert(b);
            neighbors[b].insert(a);
            let table = pairwise
                .entry((a, b))
                .or_insert_with(|| vec![0.0; domains[a] * domains[b]]);
            // Table index: `a`'s candidate varies fastest.
            for cb in 0..domains[b] {
                for ca in 0..domains[a] {
                    let cost = if edge.from == a {
                        graph.edge_cost(edge, ca, cb)
                    } else {
                        graph.edge_cost(edge, cb, ca)
                    };
                    table[ca + cb * domains[a]] += cost;
                }
            }
        }
        Problem {
            graph,
            domains,
            pairwise,
            neighbors,
        }
    }

    fn unary(&self, node: usize, choice: usize) -> CostSecs {
        self.graph.nodes()[node].candidates[choice].cost
    }

    fn pair(&self, a: usize, ca: usize, b: usize, cb: usize) -> CostSecs {
        let ((a, ca), (b, cb)) = if a < b { ((a, ca), (b, cb)) } else { ((b, cb), (a, ca)) };
        self.pairwise
            .get(&(a, b))
            .map_or(0.0, |t| t[ca + cb * self.domains[a]])
    }

    /// Connected components, each sorted, in order of their lowest node.
    fn components(&self) -> Vec<Vec<usize>> {
        let n = self.domains.len();
        let mut seen = vec![false; n];
        let mut components = vec![];
        for start in 0..n {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut stack = vec![start];
            let mut component = vec![];
            while let Some(v) = stack.pop() {
                component.push(v);
                for &u in &self.neighbors[v] {
                    if !seen[u] {
                        seen[u] = true;
                        stack.push(u);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components
    }

    /// A greedy min-size elimination order for `component`, or `None` if some step would build
    /// a table with more than `max_entries` entries.
    fn elimination_order(&self, component: &[usize], max_entries: usize) -> Option<Vec<usize>> {
        let mut adjacency = component
            .iter()
            .map(|&v| (v, self.neighbors[v].clone()))
            .collect::<BTreeMap<_, _>>();
        let mut order = Vec::with_capacity(component.len());
        while !adjacency.is_empty() {
            // Entries in the table over v and its current neighbours. Ties go to the lowest node.
            let (v, size) = adjacency
                .iter()
                .map(|(&v, ns)| {
                    let size = ns
                        .iter()
                        .try_fold(self.domains[v], |acc, &u| acc.checked_mul(self.domains[u]));
                    (v, size.unwrap_or(usize::MAX))
                })
                .min_by_key(|&(v, size)| (size, v))?;
            if size > max_entries {
                return None;
            }
            let ns = adjacency.remove(&v)?;
            for &u in &ns {
                if let Some(un) = adjacency.get_mut(&u) {
                    un.remove(&v);
                    un.extend(ns.iter().copied().filter(|&w| w != u));
                }
            }
            order.push(v);
        }
        Some(order)
    }

    /// Solve `component` exactly, then settle ties node by node in ascending order.
    ///
    /// Restricting a node only raises the costs of excluded candidates to infinity, so every run
    /// evaluates an assignment with the same sequence of additions. A restricted optimum equal to
    /// the unrestricted one therefore means an optimal assignment survives the restriction.
    fn solve_exact(&self, component: &[usize], order: &[usize], choices: &mut [usize]) {
        let mut fixed = BTreeMap::new();
        let mut best = choices.to_vec();
        let optimum = self.eliminate(order, &fixed, &mut best);
        let mut trial = choices.to_vec();
        for &v in component {
            for c in 0..best[v] {
                fixed.insert(v, c);
                if self.eliminate(order, &fixed, &mut trial) == optimum {
                    best.copy_from_slice(&trial);
                    break;
                }
            }
            fixed.insert(v, best[v]);
        }
        for &v in component {
            choices[v] = best[v];
        }
    }

    /// Min-sum variable elimination over `order` with the nodes in `fixed` held to one candidate.
    /// Writes the minimizing choices into `choices` and returns the minimum.
    fn eliminate(
        &self,
        order: &[usize],
        fixed: &BTreeMap<usize, usize>,
        choices: &mut [usize],
    ) -> CostSecs {
        let members = order.iter().copied().collect::<BTreeSet<_>>();
        let mut factors = order
            .iter()
            .map(|&v| Factor {
                scope: vec![v],
                values: (0..self.domains[v])
                    .map(|c| match fixed.get(&v) {
                        Some(&f) if f != c => CostSecs::INFINITY,
                        _ => self.unary(v, c),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        for (&(a, b), table) in &self.pairwise {
            if members.contains(&a) {
                factors.push(Factor {
                    scope: vec![a, b],
                    values: table.clone(),
                });
            }
        }

        let mut eliminations = Vec::with_capacity(order.len());
        for &v in order {
            let (touching, rest): (Vec<_>, Vec<_>) =
                factors.into_iter().partition(|f| f.scope.contains(&v));
            factors = rest;
            let scope = touching
                .iter()
                .flat_map(|f| f.scope.iter().copied())
                .filter(|&u| u != v)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();
            let (reduced, argmin) = self.minimize_out(v, &scope, &touching);
            factors.push(reduced);
            eliminations.push(Elimination {
                var: v,
                scope,
                argmin,
            });
        }

        for e in eliminations.iter().rev() {
            let index = self.table_index(&e.scope, |u| choices[u]);
            choices[e.var] = e.argmin[index];
        }
        // Every remaining factor has an empty scope.
        factors.iter().map(|f| f.values[0]).sum()
    }

    /// Sum `factors` and minimize over `v`, giving a factor over `scope` and, for every entry,
    /// the lowest choice of `v` attaining it.
    fn minimize_out(&self, v: usize, scope: &[usize], factors: &[Factor]) -> (Factor, Vec<usize>) {
        let size = scope.iter().map(|&u| self.domains[u]).product::<usize>();
        let mut values = Vec::with_capacity(size);
        let mut argmin = Vec::with_capacity(size);
        let mut assignment = BTreeMap::new();
        for index in 0..size {
            let mut rest = index;
            for &u in scope {
                assignment.insert(u, rest % self.domains[u]);
                rest /= self.domains[u];
            }
            let mut best = (CostSecs::INFINITY, 0);
            for cv in 0..self.domains[v] {
                assignment.insert(v, cv);
                let total = factors
                    .iter()
                    .map(|f| f.values[self.table_index(&f.scope, |u| assignment[&u])])
                    .sum::<CostSecs>();
                if total < best.0 {
                    best = (total, cv);
                }
            }
            values.push(best.0);
            argmin.push(best.1);
        }
        (
            Factor {
                scope: scope.to_vec(),
                values,
            },
            argmin,
        )
    }

    fn table_index(&self, scope: &[usize], value: impl Fn(usize) -> usize) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for &u in scope {
            index += value(u) * stride;
            stride *= self.domains[u];
        }
        index
    }

    /// The cost of `node` choosing `choice` given its neighbours' current choices.
    fn local_cost(&self, node: usize, choice: usize, choices: &[usize]) -> CostSecs {
        self.unary(node, choice)
            + self.neighbors[node]
                .iter()
                .map(|&u| self.pair(node, choice, u, choices[u]))
                .sum::<CostSecs>()
    }

    fn icm(&self, component: &[usize], max_passes: usize, choices: &mut [usize]) {
        for &v in component {
            choices[v] = (0..self.domains[v])
                .min_by(|&a, &b| self.unary(v, a).total_cmp(&self.unary(v, b)))
                .unwrap_or(0);
        }
        for pass in 0..max_passes {
            let mut changed = false;
            for &v in component {
                let current = self.local_cost(v, choices[v], choices);
                let (best, cost) = (0..self.domains[v])
                    .map(|c| (c, self.local_cost(v, c, choices)))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .unwrap_or((choices[v], current));
                if cost < current {
                    choices[v] = best;
                    changed = true;
                }
            }
            if !changed {
                debug!("ICM converged after {} passes", pass + 1);
                return;
            }
        }
        debug!("ICM stopped after {max_passes} passes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Layout;
    use crate::graph::{chain, Candidate, ConversionCost, Edge, GraphNode};
    use itertools::Itertools;
    use proptest::prelude::*;

    fn brute_force(graph: &Graph) -> CostSecs {
        lexicographic_optimum(graph).1
    }

    /// The first optimal assignment in lexicographic order, and its cost.
    fn lexicographic_optimum(graph: &Graph) -> (Vec<usize>, CostSecs) {
        let mut best = (vec![], CostSecs::INFINITY);
        for choices in graph
            .nodes()
            .iter()
            .map(|n| 0..n.candidates.len())
            .multi_cartesian_product()
        {
            let cost = graph.assignment_cost(&choices).unwrap();
            if cost < best.1 {
                best = (choices, cost);
            }
        }
        best
    }

    prop_compose! {
        fn arb_graph()(
            node_costs in prop::collection::vec(
                prop::collection::vec((0..3usize, 0..20u32), 1..4), 1..7),
            edge_seeds in prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>(), 0..20u32), 0..10),
        ) -> Graph {
            let layouts = ["NCHW", "NHWC", "NCHW8c"];
            let nodes = node_costs
                .iter()
                .enumerate()
                .map(|(i, cs)| GraphNode {
                    name: format!("n{i}"),
                    candidates: cs
                        .iter()
                        .map(|&(l, c)| Candidate {
                            implementation: "impl".to_string(),
                            layout: Layout::from(layouts[l]),
                            task: None,
                            cost: f64::from(c),
                        })
                        .collect(),
                })
                .collect::<Vec<_>>();
            let edges = edge_seeds
                .iter()
                .filter_map(|(a, b, c)| {
                    let (from, to) = (a.index(nodes.len()), b.index(nodes.len()));
                    (from != to).then(|| Edge {
                        from,
                        to,
                        conversion: ConversionCost::Fixed(f64::from(*c)),
                    })
                })
                .collect();
            Graph::new("g".to_string(), nodes, edges).unwrap()
        }
    }

    #[test]
    fn test_two_node_chain_prefers_matching_layouts() {
        let g = chain(&[&[("NCHW", 1.0), ("NHWC", 5.0)], &[("NCHW", 1.0), ("NHWC", 5.0)]], 10.0);
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.mode, SolveMode::Exact);
        assert_eq!(solution.assignment.choices(), &[0, 0]);
        assert_eq!(solution.assignment.total_cost(), 2.0);
    }

    #[test]
    fn test_conversion_cost_can_outweigh_node_cost() {
        // The cheap candidates disagree on layout, and converting costs more than the detour.
        let g = chain(
            &[
                &[("NCHW", 1.0), ("NHWC", 2.0)],
                &[("NHWC", 1.0), ("NCHW", 4.0)],
                &[("NCHW", 1.0), ("NHWC", 9.0)],
            ],
            10.0,
        );
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.assignment.choices(), &[0, 1, 0]);
        assert_eq!(solution.assignment.total_cost(), 6.0);
    }

    #[test]
    fn test_ties_prefer_lower_candidate_index() {
        let g = chain(&[&[("NCHW", 1.0), ("NHWC", 1.0)], &[("NCHW", 1.0), ("NHWC", 1.0)]], 1.0);
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.assignment.choices(), &[0, 0]);
    }

    #[test]
    fn test_ties_prefer_lower_index_on_earlier_nodes() {
        // [0, 1] and [1, 0] both cost 2; the first node keeps its first candidate.
        let g = chain(
            &[
                &[("NCHW", 1.0), ("NHWC", 1.0)],
                &[("NHWC", 1.0), ("NCHW", 1.0)],
            ],
            10.0,
        );
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.mode, SolveMode::Exact);
        assert_eq!(solution.assignment.choices(), &[0, 1]);
        assert_eq!(solution.assignment.total_cost(), 2.0);
    }

    #[test]
    fn test_cycle_is_solved_exactly() {
        let mut g = chain(
            &[
                &[("NCHW", 1.0), ("NHWC", 3.0)],
                &[("NHWC", 1.0), ("NCHW", 3.0)],
                &[("NCHW", 1.0), ("NHWC", 3.0)],
            ],
            5.0,
        );
        let mut edges = g.edges().to_vec();
        edges.push(Edge {
            from: 2,
            to: 0,
            conversion: ConversionCost::Fixed(5.0),
        });
        g = Graph::new("cycle".to_string(), g.nodes().to_vec(), edges).unwrap();
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.mode, SolveMode::Exact);
        assert_eq!(solution.assignment.total_cost(), brute_force(&g));
    }

    #[test]
    fn test_small_table_bound_falls_back_to_icm() {
        let g = chain(&[&[("NCHW", 1.0), ("NHWC", 5.0)], &[("NCHW", 1.0), ("NHWC", 5.0)]], 10.0);
        let optimizer = GraphLayoutOptimizer {
            max_table_entries: 1,
            ..GraphLayoutOptimizer::default()
        };
        let solution = optimizer.solve(&g).unwrap();
        assert_eq!(solution.mode, SolveMode::Approximate);
        assert_eq!(solution.assignment.total_cost(), 2.0);
    }

    #[test]
    fn test_isolated_nodes_take_their_cheapest_candidate() {
        let g = chain(&[&[("NCHW", 3.0), ("NHWC", 2.0)]], 0.0);
        let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
        assert_eq!(solution.assignment.choices(), &[1]);
    }

    proptest! {
        #[test]
        fn test_exact_solutions_match_brute_force(g in arb_graph()) {
            let solution = GraphLayoutOptimizer::new().solve(&g).unwrap();
            let (choices, cost) = lexicographic_optimum(&g);
            prop_assert_eq!(solution.mode, SolveMode::Exact);
            prop_assert_eq!(solution.assignment.total_cost(), cost);
            prop_assert_eq!(solution.assignment.choices(), choices.as_slice());
        }

        #[test]
        fn test_icm_is_valid_and_no_better_than_optimal(g in arb_graph()) {
            let optimizer = GraphLayoutOptimizer { max_table_entries: 0, max_icm_passes: 8 };
            let solution = optimizer.solve(&g).unwrap();
            prop_assert_eq!(solution.mode, SolveMode::Approximate);
            prop_assert_eq!(
                solution.assignment.total_cost(),
                g.assignment_cost(solution.assignment.choices()).unwrap()
            );
            prop_assert!(solution.assignment.total_cost() >= brute_force(&g));
        }

        #[test]
        fn test_solving_is_deterministic(g in arb_graph()) {
            let optimizer = GraphLayoutOptimizer::new();
            prop_assert_eq!(optimizer.solve(&g).unwrap(), optimizer.solve(&g).unwrap());
        }
    }
}

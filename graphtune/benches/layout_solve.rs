use iai_callgrind::main;

use std::hint::black_box;

use graphtune::common::Layout;
use graphtune::graph::{Candidate, ConversionCost, Edge, Graph, GraphNode};
use graphtune::layout_opt::{GraphLayoutOptimizer, Solution};

const LAYOUTS: [&str; 4] = ["NCHW", "NHWC", "NCHW8c", "NCHW16c"];

/// A `width` x `height` grid of nodes with "random" candidate costs. Grids have treewidth
/// `min(width, height)`, so the width sets how large elimination tables get.
fn init_grid(width: usize, height: usize) -> Graph {
    let nodes = (0..width * height)
        .map(|i| GraphNode {
            name: format!("n{i}"),
            candidates: LAYOUTS
                .iter()
                .enumerate()
                .map(|(j, layout)| Candidate {
                    implementation: format!("impl{j}"),
                    layout: Layout::from(*layout),
                    task: None,
                    cost: ((i * 7 + j * 11) % 13) as f64,
                })
                .collect(),
        })
        .collect();
    let mut edges = vec![];
    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            let conversion = ConversionCost::Fixed((i % 5 + 1) as f64);
            if x + 1 < width {
                edges.push(Edge {
                    from: i,
                    to: i + 1,
                    conversion: conversion.clone(),
                });
            }
            if y + 1 < height {
                edges.push(Edge {
                    from: i,
                    to: i + width,
                    conversion,
                });
            }
        }
    }
    Graph::new("grid".to_string(), nodes, edges).unwrap()
}

#[export_name = "graphtune_bench_layout_solve::solve"]
fn solve(graph: &Graph) -> Solution {
    GraphLayoutOptimizer::new().solve(graph).unwrap()
}

fn solve_grid(width: usize, height: usize) {
    let graph = black_box(init_grid(width, height));
    black_box(solve(&graph));
}

#[inline(never)]
fn solve_chain_64() {
    solve_grid(1, 64);
}

#[inline(never)]
fn solve_grid_3x16() {
    solve_grid(3, 16);
}

#[inline(never)]
fn solve_grid_5x8() {
    solve_grid(5, 8);
}

main!(
    callgrind_args = "toggle-collect=graphtune_bench_layout_solve::solve",
        "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = solve_chain_64, solve_grid_3x16, solve_grid_5x8
);

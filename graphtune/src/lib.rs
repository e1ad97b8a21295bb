//! Autotuning for compiled tensor graphs.
//!
//! Kernel tuning ([engine]) searches each [task::Task]'s [space::ConfigurationSpace] with a
//! [strategy::Strategy], guided by a [cost_model::CostModelKind] and measured through a
//! [measure::MeasurementPipeline], appending every observation to a [records::KernelLog].
//! Graph tuning ([layout_opt]) then reads that log, picks one implementation and layout per node,
//! and [emit] records the resulting plan in a [records::AppendLog] of [emit::GraphRecord]s.

pub mod codegen;
pub mod common;
pub mod cost_model;
pub mod emit;
pub mod engine;
pub mod graph;
pub mod job;
pub mod layout_opt;
pub mod measure;
pub mod pprint;
pub mod records;
pub mod space;
pub mod strategy;
pub mod task;
pub mod utils;

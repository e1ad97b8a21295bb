use crate::emit::TunedGraph;
use crate::engine::SessionReport;
use crate::records::TuningRecord;
use crate::task::TaskSignature;

use prettytable::{format, row, Table};
use std::collections::BTreeMap;

/// Every record in `records`, in log order.
pub fn records_table(records: &[TuningRecord]) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Task", "Config", "Result"]);
    for r in records {
        table.add_row(row![r.task, r.config, r.result]);
    }
    table.set_format(compact_format());
    table
}

/// The best record of each task. Tasks where nothing succeeded are shown as such.
pub fn best_table(best: &BTreeMap<TaskSignature, Option<TuningRecord>>) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Task", "Best Config", "Cost"]);
    for (task, record) in best {
        match record {
            Some(r) => table.add_row(row![task, r.config, r.result]),
            None => table.add_row(row![task, "-", "no viable configuration"]),
        };
    }
    table.set_format(compact_format());
    table
}

pub fn sessions_table(reports: &[SessionReport]) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Task", "State", "Prior", "Measured", "Best Config", "Cost"]);
    for report in reports {
        let state = match &report.abort_cause {
            Some(cause) => format!("{} ({cause})", report.state),
            None => report.state.to_string(),
        };
        let (config, cost) = match report.best {
            Some((config, cost)) => (config.to_string(), format!("{:.3}us", cost * 1e6)),
            None => ("-".to_string(), "-".to_string()),
        };
        table.add_row(row![
            report.task_name,
            state,
            report.prior,
            report.measured,
            config,
            cost
        ]);
    }
    table.set_format(compact_format());
    table
}

pub fn tuned_graph_table(plan: &TunedGraph) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Node", "Implementation", "Layout", "Config", "Cost"]);
    for node in &plan.nodes {
        let config = match (&node.task, node.config) {
            (Some(task), Some(config)) => format!("{task} #{config}"),
            _ => "-".to_string(),
        };
        table.add_row(row![
            node.node,
            node.implementation,
            node.layout,
            config,
            format!("{:.3}us", node.cost * 1e6)
        ]);
    }
    for conv in &plan.conversions {
        table.add_row(row![
            format!("{} -> {}", conv.from_node, conv.to_node),
            "layout_transform",
            format!("{} -> {}", conv.from, conv.to),
            "-",
            format!("{:.3}us", conv.cost * 1e6)
        ]);
    }
    table.set_format(compact_format());
    table
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

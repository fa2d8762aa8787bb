//! `bflow jobs`: registered jobs and the shape of their graphs.

use anyhow::Result;
use batchflow_core::flow::{FlowGraph, NodeKind, Transition, TransitionAction};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

pub fn list_jobs(state: &AppState, json: bool) -> Result<()> {
    let jobs = state.runner.jobs();

    if json {
        let out: Vec<_> = jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "name": job.name(),
                    "description": job.description(),
                    "restartable": job.restartable(),
                    "graph": graph_json(job.graph()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for job in &jobs {
        println!();
        println!(
            "  {} {}",
            style(job.name()).cyan().bold(),
            style(job.description().unwrap_or_default()).dim()
        );

        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Node").fg(Color::Cyan),
                Cell::new("Kind"),
                Cell::new("Runs"),
                Cell::new("Transitions"),
            ]);
        add_rows(&mut table, job.graph(), "");
        println!("{table}");
    }
    println!();

    Ok(())
}

fn add_rows(table: &mut Table, graph: &FlowGraph, prefix: &str) {
    for node in graph.nodes() {
        let target = match &node.kind {
            NodeKind::Step { step } => step.clone(),
            NodeKind::Decision { decider } => decider.clone(),
            NodeKind::Split { branches } => branches
                .iter()
                .map(|b| b.name().to_string())
                .collect::<Vec<_>>()
                .join(" | "),
            NodeKind::SubJob { job, .. } => job.clone(),
        };
        let transitions = if node.is_leaf() {
            "(terminal)".to_string()
        } else {
            node.transitions
                .iter()
                .map(describe_transition)
                .collect::<Vec<_>>()
                .join("\n")
        };
        table.add_row(vec![
            Cell::new(format!("{prefix}{}", node.id)),
            Cell::new(node.kind.label()),
            Cell::new(target),
            Cell::new(transitions),
        ]);

        if let NodeKind::Split { branches } = &node.kind {
            for branch in branches {
                add_rows(table, branch, &format!("{prefix}{}/{}/", node.id, branch.name()));
            }
        }
    }
}

fn describe_transition(t: &Transition) -> String {
    let action = match &t.action {
        TransitionAction::Continue { target } => format!("-> {target}"),
        TransitionAction::End => "end".to_string(),
        TransitionAction::Fail => "fail".to_string(),
        TransitionAction::Stop { restart } => format!("stop, restart at {restart}"),
    };
    match &t.exit_code {
        Some(code) => format!("{} {action} ({code})", t.pattern),
        None => format!("{} {action}", t.pattern),
    }
}

fn graph_json(graph: &FlowGraph) -> serde_json::Value {
    let nodes: Vec<_> = graph
        .nodes()
        .map(|node| {
            let mut value = serde_json::json!({
                "id": node.id,
                "kind": node.kind.label(),
                "transitions": node.transitions,
            });
            match &node.kind {
                NodeKind::Step { step } => value["step"] = step.as_str().into(),
                NodeKind::Decision { decider } => value["decider"] = decider.as_str().into(),
                NodeKind::Split { branches } => {
                    value["branches"] = branches.iter().map(|b| graph_json(b)).collect();
                }
                NodeKind::SubJob { job, parameter_keys } => {
                    value["job"] = job.as_str().into();
                    value["parameter_keys"] = parameter_keys.clone().into();
                }
            }
            value
        })
        .collect();
    serde_json::json!({ "name": graph.name(), "entry": graph.entry(), "nodes": nodes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_read_naturally() {
        assert_eq!(describe_transition(&Transition::to("*", "load")), "* -> load");
        assert_eq!(
            describe_transition(&Transition::end("EMPTY").with_exit_code("NOTHING_TO_LOAD")),
            "EMPTY end (NOTHING_TO_LOAD)"
        );
        assert_eq!(
            describe_transition(&Transition::stop("PAUSE", "load")),
            "PAUSE stop, restart at load"
        );
    }

    #[test]
    fn split_branches_are_nested_in_json() {
        let graph = crate::demo::jobs().unwrap().remove(0);
        let json = graph_json(graph.graph());
        let enrich = json["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|n| n["id"] == "enrich")
            .unwrap();
        assert_eq!(enrich["branches"].as_array().unwrap().len(), 2);
        assert_eq!(enrich["branches"][0]["nodes"][0]["step"], "geocode");
    }
}

use crate::OutputFormat;
use crate::commands::{client, status};
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{GraphView, ServiceDetail};
use std::collections::BTreeMap;

pub async fn graph(port: u16, format: OutputFormat) -> Result<()> {
    let graph = match client::request(port, Request::GetGraph).await? {
        Response::Graph { graph } => graph,
        other => return Err(client::unexpected(other)),
    };

    if !client::print_json(&graph, format)? {
        println!("{}", graph_table(&graph));
    }
    Ok(())
}

fn graph_table(graph: &GraphView) -> Table {
    let mut depends_on: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for edge in &graph.edges {
        depends_on
            .entry(edge.to.as_str())
            .or_default()
            .push(format!("{} ({})", edge.from, edge.condition));
    }

    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "GROUP", "PROFILES", "DEPENDS ON"]);
    for node in &graph.nodes {
        let profiles = if node.profiles.is_empty() {
            "-".to_string()
        } else {
            node.profiles.join(", ")
        };
        let deps = depends_on
            .get(node.name.as_str())
            .map(|deps| deps.join(", "))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&node.name),
            Cell::new(&node.group),
            Cell::new(profiles),
            Cell::new(deps),
        ]);
    }
    table
}

pub async fn groups(port: u16, format: OutputFormat) -> Result<()> {
    let groups = match client::request(port, Request::GetGroups).await? {
        Response::Groups { groups } => groups,
        other => return Err(client::unexpected(other)),
    };

    if client::print_json(&groups, format)? {
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["GROUP", "RUNNING", "SERVICES"]);
    for group in &groups {
        let color = if group.running == group.total {
            Color::Green
        } else if group.running == 0 {
            Color::DarkGrey
        } else {
            Color::Yellow
        };
        table.add_row(vec![
            Cell::new(&group.name),
            Cell::new(format!("{}/{}", group.running, group.total)).fg(color),
            Cell::new(group.services.join(", ")),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub async fn service(port: u16, name: &str, format: OutputFormat) -> Result<()> {
    let request = Request::GetService {
        name: name.to_string(),
    };
    let detail = match client::request(port, request).await? {
        Response::Service { service } => service,
        other => return Err(client::unexpected(other)),
    };

    if !client::print_json(&detail, format)? {
        println!("{}", detail_table(&detail));
    }
    Ok(())
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

fn detail_table(detail: &ServiceDetail) -> Table {
    let dependencies: Vec<String> = detail
        .dependencies
        .iter()
        .map(|(name, condition)| format!("{} ({})", name, condition))
        .collect();

    let mut table = Table::new();
    table.add_row(vec![Cell::new("Service"), Cell::new(&detail.name)]);
    table.add_row(vec![Cell::new("Image"), Cell::new(&detail.image)]);
    table.add_row(vec![Cell::new("Group"), Cell::new(&detail.group)]);
    table.add_row(vec![Cell::new("Profiles"), Cell::new(list(&detail.profiles))]);
    table.add_row(vec![
        Cell::new("Required"),
        Cell::new(if detail.required { "yes" } else { "no" }),
    ]);
    table.add_row(vec![Cell::new("Depends on"), Cell::new(list(&dependencies))]);
    table.add_row(vec![
        Cell::new("All dependencies"),
        Cell::new(list(&detail.all_dependencies)),
    ]);
    table.add_row(vec![Cell::new("Dependents"), Cell::new(list(&detail.dependents))]);
    table.add_row(vec![
        Cell::new("All dependents"),
        Cell::new(list(&detail.all_dependents)),
    ]);
    match &detail.state {
        Some(state) => {
            table.add_row(vec![
                Cell::new("Status"),
                Cell::new(state.status.to_string()).fg(status::status_color(state.status)),
            ]);
            table.add_row(vec![Cell::new("Health"), Cell::new(state.health.to_string())]);
            if let Some(code) = state.exit_code {
                table.add_row(vec![Cell::new("Exit code"), Cell::new(code.to_string())]);
            }
        }
        None => {
            table.add_row(vec![Cell::new("Status"), Cell::new("not_created")]);
        }
    }
    table
}

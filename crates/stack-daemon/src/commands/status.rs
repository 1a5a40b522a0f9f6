use crate::OutputFormat;
use crate::commands::client;
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{HealthState, ServiceRuntimeState, ServiceStatus};
use std::collections::BTreeMap;

pub async fn run(port: u16, format: OutputFormat) -> Result<()> {
    let services = match client::request(port, Request::GetStatus).await? {
        Response::Status { services } => services,
        other => return Err(client::unexpected(other)),
    };

    if !client::print_json(&services, format)? {
        println!("{}", status_table(&services));
    }
    Ok(())
}

pub fn status_color(status: ServiceStatus) -> Color {
    match status {
        ServiceStatus::Running => Color::Green,
        ServiceStatus::Starting | ServiceStatus::Restarting | ServiceStatus::Stopping => {
            Color::Yellow
        }
        ServiceStatus::Error => Color::Red,
        ServiceStatus::Stopped | ServiceStatus::NotCreated => Color::DarkGrey,
    }
}

fn health_cell(health: HealthState) -> Cell {
    match health {
        HealthState::None => Cell::new("-"),
        HealthState::Starting => Cell::new("starting").fg(Color::Yellow),
        HealthState::Healthy => Cell::new("healthy").fg(Color::Green),
        HealthState::Unhealthy => Cell::new("unhealthy").fg(Color::Red),
    }
}

pub fn status_table(services: &BTreeMap<String, ServiceRuntimeState>) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "STATUS", "HEALTH", "EXIT", "OBSERVED"]);

    for (name, state) in services {
        let exit = state
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        let exit_cell = match state.exit_code {
            Some(code) if code != 0 => Cell::new(exit).fg(Color::Red),
            _ => Cell::new(exit),
        };

        table.add_row(vec![
            Cell::new(name),
            Cell::new(state.status.to_string()).fg(status_color(state.status)),
            health_cell(state.health),
            exit_cell,
            Cell::new(state.observed_at.format("%H:%M:%S").to_string()),
        ]);
    }
    table
}

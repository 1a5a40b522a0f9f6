use crate::OutputFormat;
use crate::commands::client;
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{DiagnosticReport, MetricsSample, Severity};

pub async fn show(
    port: u16,
    service: Option<String>,
    history: bool,
    format: OutputFormat,
) -> Result<()> {
    let request = match service {
        Some(service) if history => Request::GetMetricsHistory { service },
        service => Request::GetMetrics { service },
    };
    let samples = match client::request(port, request).await? {
        Response::Metrics { samples } => samples,
        other => return Err(client::unexpected(other)),
    };

    if !client::print_json(&samples, format)? {
        if samples.is_empty() {
            println!("No samples yet");
        } else {
            println!("{}", metrics_table(&samples));
        }
    }
    Ok(())
}

pub async fn diagnose(port: u16, service: String, format: OutputFormat) -> Result<()> {
    let report = match client::request(port, Request::Diagnose { service }).await? {
        Response::Diagnosis { report } => report,
        other => return Err(client::unexpected(other)),
    };

    if !client::print_json(&report, format)? {
        print_report(&report);
    }
    Ok(())
}

fn percent_cell(value: f64, warning: f64) -> Cell {
    let cell = Cell::new(format!("{:.1}%", value));
    if value >= warning {
        cell.fg(Color::Yellow)
    } else {
        cell
    }
}

fn metrics_table(samples: &[MetricsSample]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "TIME", "CPU", "MEMORY", "MEM %", "NET RX/s", "NET TX/s"]);
    for sample in samples {
        let stats = &sample.stats;
        table.add_row(vec![
            Cell::new(&stats.service),
            Cell::new(sample.timestamp.format("%H:%M:%S").to_string()),
            percent_cell(stats.cpu_percent, 80.0),
            Cell::new(format!(
                "{} / {}",
                human_bytes(stats.memory_usage),
                human_bytes(stats.memory_limit)
            )),
            percent_cell(stats.memory_percent, 85.0),
            Cell::new(human_bytes(sample.network_rx_rate as u64)),
            Cell::new(human_bytes(sample.network_tx_rate as u64)),
        ]);
    }
    table
}

fn print_report(report: &DiagnosticReport) {
    let status = report
        .state
        .as_ref()
        .map(|state| format!("{} ({})", state.status, state.health))
        .unwrap_or_else(|| "not created".to_string());
    println!("{}: {}", report.service, status);
    println!("Restarts in the last hour: {}", report.restarts_last_hour);

    if report.issues.is_empty() {
        println!("No issues found");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["SEVERITY", "ISSUE", "DETAIL", "RECOMMENDATION"]);
    for issue in &report.issues {
        let severity = match issue.severity {
            Severity::Critical => Cell::new("critical").fg(Color::Red),
            Severity::Warning => Cell::new("warning").fg(Color::Yellow),
        };
        table.add_row(vec![
            severity,
            Cell::new(&issue.issue),
            Cell::new(&issue.description),
            Cell::new(&issue.recommendation),
        ]);
    }
    println!("{}", table);
    if report.restart_recommended {
        println!("A restart is likely to help: stackctl restart {}", report.service);
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

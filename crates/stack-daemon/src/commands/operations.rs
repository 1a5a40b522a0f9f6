use crate::OutputFormat;
use crate::commands::client;
use anyhow::{Result, bail};
use comfy_table::{Cell, Color, Table};
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{
    OperationKind, OperationOptions, OperationRecord, OperationStatus, OperationTarget,
    SelectionReport, ServicePhase,
};
use std::time::Duration;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn start_request(
    target: OperationTarget,
    profile: Option<String>,
    options: OperationOptions,
) -> Request {
    Request::Start {
        target,
        profile,
        options,
    }
}

pub fn stop_request(target: OperationTarget, options: OperationOptions) -> Request {
    Request::Stop { target, options }
}

pub fn restart_request(
    target: OperationTarget,
    profile: Option<String>,
    options: OperationOptions,
) -> Request {
    Request::Restart {
        target,
        profile,
        options,
    }
}

/// Submit an operation and, unless detached, follow it until it finishes
pub async fn execute(port: u16, request: Request, detach: bool, format: OutputFormat) -> Result<()> {
    let mut daemon = client::connect_to_daemon(port).await?;

    let mut record = match daemon.send_request(request).await? {
        Response::Operation { operation } => operation,
        other => return Err(client::unexpected(other)),
    };

    if format == OutputFormat::Table {
        println!(
            "{} {} accepted as {} ({} services in {} batches)",
            record.kind,
            record.target,
            record.id,
            record.services.len(),
            record.batches.len()
        );
    }

    let mut reported = 0;
    while !detach && !record.status.is_terminal() {
        smol::Timer::after(POLL_INTERVAL).await;
        record = match daemon.send_request(Request::GetOperation { id: record.id }).await? {
            Response::Operation { operation } => operation,
            other => return Err(client::unexpected(other)),
        };
        if format == OutputFormat::Table {
            reported = report_progress(&record, reported);
        }
    }
    daemon.close().await.ok();

    if !client::print_json(&record, format)? {
        println!("{}", operation_table(&record));
        for failure in &record.failures {
            eprintln!("  {}", client::describe_failure(failure));
        }
    }

    match record.status {
        OperationStatus::Failed => bail!("Operation {} failed", record.id),
        OperationStatus::PartiallyFailed => bail!("Operation {} partially failed", record.id),
        OperationStatus::Cancelled => bail!("Operation {} was cancelled", record.id),
        _ => Ok(()),
    }
}

/// Print services that finished since the last call
fn report_progress(record: &OperationRecord, reported: usize) -> usize {
    let finished: Vec<_> = record
        .services
        .iter()
        .filter(|(_, progress)| progress.phase.is_terminal())
        .collect();
    if finished.len() > reported {
        let names: Vec<&str> = finished.iter().map(|(name, _)| name.as_str()).collect();
        println!("  {}/{} done: {}", finished.len(), record.services.len(), names.join(", "));
    }
    finished.len()
}

pub async fn plan(
    port: u16,
    kind: OperationKind,
    target: OperationTarget,
    profile: Option<String>,
    options: OperationOptions,
    format: OutputFormat,
) -> Result<()> {
    let request = Request::Plan {
        kind,
        target,
        profile,
        options,
    };
    let (operation, report) = match client::request(port, request).await? {
        Response::Plan { operation, report } => (operation, report),
        other => return Err(client::unexpected(other)),
    };

    if client::print_json(&serde_json::json!({ "operation": operation, "report": report }), format)? {
        return Ok(());
    }

    println!("Plan for {} {}:", operation.kind, operation.target);
    let mut table = Table::new();
    table.set_header(vec!["BATCH", "SERVICES"]);
    for (index, batch) in operation.batches.iter().enumerate() {
        table.add_row(vec![Cell::new(index + 1), Cell::new(batch.join(", "))]);
    }
    println!("{}", table);

    if let Some(report) = report {
        print_selection(&report);
    }
    Ok(())
}

fn print_selection(report: &SelectionReport) {
    println!(
        "{} selected, {} total",
        report.selected.len(),
        report.total
    );
    for (service, required_by) in &report.auto_enabled {
        println!("  + {} (needed by {})", service, required_by.join(", "));
    }
    for warning in &report.warnings {
        println!("  ! {}", warning);
    }
}

pub async fn list(port: u16, format: OutputFormat) -> Result<()> {
    let operations = match client::request(port, Request::ListOperations).await? {
        Response::Operations { operations } => operations,
        other => return Err(client::unexpected(other)),
    };

    if client::print_json(&operations, format)? {
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "KIND", "TARGET", "STATUS", "SERVICES", "CREATED"]);
    for record in &operations {
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(record.kind),
            Cell::new(&record.target),
            status_cell(record.status),
            Cell::new(record.services.len()),
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub async fn show(port: u16, id: Uuid, format: OutputFormat) -> Result<()> {
    let record = match client::request(port, Request::GetOperation { id }).await? {
        Response::Operation { operation } => operation,
        other => return Err(client::unexpected(other)),
    };
    if !client::print_json(&record, format)? {
        println!("{}", operation_table(&record));
    }
    Ok(())
}

pub async fn cancel(port: u16, id: Uuid) -> Result<()> {
    match client::request(port, Request::CancelOperation { id }).await? {
        Response::Success => {
            println!("Cancellation requested for {}", id);
            Ok(())
        }
        other => Err(client::unexpected(other)),
    }
}

pub async fn reload(port: u16) -> Result<()> {
    match client::request(port, Request::Reload).await? {
        Response::Success => {
            println!("Stack file reloaded");
            Ok(())
        }
        other => Err(client::unexpected(other)),
    }
}

fn status_cell(status: OperationStatus) -> Cell {
    let (text, color) = match status {
        OperationStatus::Pending => ("pending", Color::DarkGrey),
        OperationStatus::Running => ("running", Color::Yellow),
        OperationStatus::Completed => ("completed", Color::Green),
        OperationStatus::PartiallyFailed => ("partially_failed", Color::Yellow),
        OperationStatus::Failed => ("failed", Color::Red),
        OperationStatus::Cancelled => ("cancelled", Color::DarkGrey),
    };
    Cell::new(text).fg(color)
}

fn operation_table(record: &OperationRecord) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["BATCH", "SERVICE", "PHASE", "DETAIL"]);
    for (index, batch) in record.batches.iter().enumerate() {
        for name in batch {
            let Some(progress) = record.services.get(name) else {
                continue;
            };
            let (phase, color) = match progress.phase {
                ServicePhase::Queued => ("queued", Color::DarkGrey),
                ServicePhase::Issuing => ("issuing", Color::Yellow),
                ServicePhase::AwaitingCondition => ("waiting", Color::Yellow),
                ServicePhase::Done if progress.no_op => ("unchanged", Color::Green),
                ServicePhase::Done => ("done", Color::Green),
                ServicePhase::Skipped => ("skipped", Color::DarkGrey),
                ServicePhase::Error => ("error", Color::Red),
            };
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(name),
                Cell::new(phase).fg(color),
                Cell::new(progress.detail.as_deref().unwrap_or("-")),
            ]);
        }
    }
    table
}

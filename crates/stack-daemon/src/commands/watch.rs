use crate::OutputFormat;
use crate::commands::client;
use anyhow::Result;
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{EventKind, StreamEvent};

/// Print status changes until the daemon goes away
pub async fn status(port: u16, service: Option<String>, format: OutputFormat) -> Result<()> {
    follow(port, Request::Subscribe { service, tail: None }, format).await
}

/// Print log lines of one service until the daemon goes away
pub async fn logs(port: u16, service: String, tail: usize, format: OutputFormat) -> Result<()> {
    let request = Request::Subscribe {
        service: Some(service),
        tail: Some(tail),
    };
    follow(port, request, format).await
}

async fn follow(port: u16, request: Request, format: OutputFormat) -> Result<()> {
    let mut daemon = client::connect_to_daemon(port).await?;
    let logs_only = matches!(request, Request::Subscribe { tail: Some(_), .. });

    let subscription = match daemon.send_request(request).await? {
        Response::Subscribed { subscription } => subscription,
        other => return Err(client::unexpected(other)),
    };

    loop {
        let event = match daemon.next_event().await? {
            Response::Event {
                subscription: id,
                event,
            } if id == subscription => event,
            _ => continue,
        };
        let shown = match event.kind {
            EventKind::Log | EventKind::Overflow => true,
            EventKind::Status | EventKind::Alert => !logs_only,
            // Samples arrive every interval; `stackctl metrics` shows them
            EventKind::Metrics => false,
        };
        if !shown {
            continue;
        }
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Table => println!("{}", render(&event)),
        }
    }
}

fn render(event: &StreamEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S");
    let service = event.service.as_deref().unwrap_or("-");
    match event.kind {
        EventKind::Status => {
            let status = event.payload["status"].as_str().unwrap_or("unknown");
            let health = event.payload["health"].as_str().unwrap_or("none");
            match event.payload["exit_code"].as_i64() {
                Some(code) => format!("{} {} {} ({}, exit {})", time, service, status, health, code),
                None => format!("{} {} {} ({})", time, service, status, health),
            }
        }
        EventKind::Log => format!(
            "{} | {}",
            service,
            event.payload["line"].as_str().unwrap_or_default()
        ),
        EventKind::Metrics => format!(
            "{} {} cpu {:.1}% mem {:.1}%",
            time,
            service,
            event.payload["cpu_percent"].as_f64().unwrap_or(0.0),
            event.payload["memory_percent"].as_f64().unwrap_or(0.0)
        ),
        EventKind::Alert => format!(
            "{} {} [{}] {}: {}",
            time,
            service,
            event.payload["severity"].as_str().unwrap_or("warning"),
            event.payload["issue"].as_str().unwrap_or_default(),
            event.payload["description"].as_str().unwrap_or_default()
        ),
        EventKind::Overflow => format!(
            "{} ... {} events dropped",
            time,
            event.payload["dropped"].as_u64().unwrap_or(0)
        ),
    }
}

use crate::OutputFormat;
use anyhow::{Result, anyhow};
use serde::Serialize;
use stack_daemon::client::DaemonClient;
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::FailureReport;

/// Connect to the daemon
pub async fn connect_to_daemon(port: u16) -> Result<DaemonClient> {
    match DaemonClient::connect(port).await {
        Ok(client) => Ok(client),
        Err(e) => {
            let cause = format!("{:#}", e);
            if cause.contains("Connection refused") || cause.contains("Connection reset") {
                Err(anyhow!(
                    "Cannot connect to stack daemon on port {}.\n\n\
                    Start the daemon with:\n  \
                    stackd --config stack.yaml --port {}",
                    port,
                    port
                ))
            } else {
                Err(e)
            }
        }
    }
}

/// Connect, send one request and close
pub async fn request(port: u16, request: Request) -> Result<Response> {
    let mut daemon = connect_to_daemon(port).await?;
    let response = daemon.send_request(request).await?;
    daemon.close().await.ok();
    Ok(response)
}

/// Error for a response that is a failure or of the wrong kind
pub fn unexpected(response: Response) -> anyhow::Error {
    match response {
        Response::Error { error } => describe_failure(&error),
        Response::Rejected { message } => anyhow!("Daemon rejected the request: {}", message),
        other => anyhow!("Unexpected response from daemon: {:?}", other),
    }
}

/// Render a failure report as an error
pub fn describe_failure(error: &FailureReport) -> anyhow::Error {
    let mut message = error.message.clone();
    if !error.blocking.is_empty() {
        message.push_str(&format!(
            "\n  blocked by running dependents: {}\n  use --force to stop them too",
            error.blocking.join(", ")
        ));
    }
    anyhow!(message)
}

/// Print as pretty JSON when requested; returns whether it printed
pub fn print_json<T: Serialize>(value: &T, format: OutputFormat) -> Result<bool> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(value)?);
        return Ok(true);
    }
    Ok(false)
}

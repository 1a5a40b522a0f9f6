//! Docker Compose runtime adapter.

use super::{ContainerRuntime, ContainerSnapshot, ContainerStats, LogStream, RuntimeError};
use crate::state::{HealthState, ServiceStatus};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Runtime that drives `docker compose` for a single project
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    program: String,
    project: String,
    compose_files: Vec<PathBuf>,
    working_dir: Option<PathBuf>,
}

impl ComposeRuntime {
    /// Runtime for `project` using the default compose file lookup
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            program: "docker".to_string(),
            project: project.into(),
            compose_files: Vec::new(),
            working_dir: None,
        }
    }

    /// Add a compose file, passed with `-f` in order
    pub fn with_compose_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.compose_files.push(path.into());
        self
    }

    /// Run compose from this directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Use a different docker binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, profile: Option<&str>, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["compose".to_string(), "-p".to_string(), self.project.clone()];
        if let Some(profile) = profile {
            args.push("--profile".to_string());
            args.push(profile.to_string());
        }
        for file in &self.compose_files {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args.extend(rest.iter().map(|arg| arg.to_string()));
        args
    }

    fn command(&self, profile: Option<&str>, rest: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(profile, rest));
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, profile: Option<&str>, rest: &[&str]) -> Result<String, RuntimeError> {
        debug!("Running {} {}", self.program, self.args(profile, rest).join(" "));
        let output = self
            .command(profile, rest)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run {}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn list(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let stdout = self.run(None, &["ps", "--all", "--format", "json"]).await?;
        Ok(parse_ps_entries(&stdout)?
            .into_iter()
            .map(ContainerSnapshot::from)
            .collect())
    }

    async fn start(&self, service: &str, profile: Option<&str>) -> Result<(), RuntimeError> {
        self.run(profile, &["up", "-d", "--no-deps", service])
            .await
            .map(|_| ())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        self.run(None, &["stop", service]).await.map(|_| ())
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<LogStream, RuntimeError> {
        let tail = tail.to_string();
        let mut cmd = self.command(
            None,
            &["logs", "--follow", "--no-color", "--no-log-prefix", "--tail", &tail, service],
        );
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run {}: {}", self.program, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Failed("log process has no stdout".to_string()))?;

        let lines = BufReader::new(stdout).lines();
        let stream = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            match lines.next().await {
                Some(Ok(line)) => Some((line, (child, lines))),
                Some(Err(e)) => {
                    warn!("Log stream read failed: {}", e);
                    None
                }
                None => None,
            }
        });
        Ok(stream.boxed())
    }

    async fn stats(&self) -> Result<Vec<ContainerStats>, RuntimeError> {
        // Stats rows only carry container names
        let ps = self.run(None, &["ps", "--format", "json"]).await?;
        let services: HashMap<String, String> = parse_ps_entries(&ps)?
            .into_iter()
            .filter(|entry| !entry.name.is_empty())
            .map(|entry| (entry.name, entry.service))
            .collect();
        if services.is_empty() {
            return Ok(Vec::new());
        }
        let stdout = self
            .run(None, &["stats", "--no-stream", "--format", "json"])
            .await?;
        parse_stats_output(&stdout, &services)
    }
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i32>,
}

impl From<PsEntry> for ContainerSnapshot {
    fn from(entry: PsEntry) -> Self {
        let status = map_container_state(&entry.state);
        // Created containers report 0 without ever having run
        let exit_code = match entry.state.as_str() {
            "exited" | "dead" => entry.exit_code,
            _ => None,
        };
        ContainerSnapshot {
            service: entry.service,
            status,
            health: map_health(&entry.health),
            exit_code,
        }
    }
}

/// Parse compose JSON output, which is a JSON array on older compose
/// releases and one object per line on newer ones
fn parse_json_rows<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<Vec<T>, RuntimeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(unexpected_output)
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(unexpected_output))
            .collect()
    }
}

fn parse_ps_entries(stdout: &str) -> Result<Vec<PsEntry>, RuntimeError> {
    parse_json_rows(stdout)
}

fn unexpected_output(e: serde_json::Error) -> RuntimeError {
    RuntimeError::Failed(format!("unexpected compose output: {}", e))
}

#[derive(Debug, Deserialize)]
struct StatsEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    memory: String,
    #[serde(rename = "MemPerc", default)]
    memory_percent: String,
    #[serde(rename = "NetIO", default)]
    network: String,
}

/// Parse `docker stats --format json` rows, keeping containers of this project
fn parse_stats_output(
    stdout: &str,
    services: &HashMap<String, String>,
) -> Result<Vec<ContainerStats>, RuntimeError> {
    let entries: Vec<StatsEntry> = parse_json_rows(stdout)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let service = services.get(&entry.name)?.clone();
            let (memory_usage, memory_limit) = split_pair(&entry.memory);
            let (network_rx_bytes, network_tx_bytes) = split_pair(&entry.network);
            Some(ContainerStats {
                service,
                cpu_percent: parse_percent(&entry.cpu),
                memory_usage,
                memory_limit,
                memory_percent: parse_percent(&entry.memory_percent),
                network_rx_bytes,
                network_tx_bytes,
            })
        })
        .collect())
}

fn parse_percent(value: &str) -> f64 {
    value.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// `"20MiB / 7.6GiB"` into two byte counts
fn split_pair(value: &str) -> (u64, u64) {
    let mut parts = value.split('/').map(parse_size);
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// Docker size string such as `1.5GiB`, `512kB` or `0B` into bytes
fn parse_size(value: &str) -> u64 {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let Ok(number) = number.parse::<f64>() else {
        return 0;
    };
    let factor: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            debug!("Unknown size unit {}", other);
            1.0
        }
    };
    (number * factor) as u64
}

fn map_container_state(state: &str) -> ServiceStatus {
    match state {
        "running" => ServiceStatus::Running,
        "exited" | "dead" | "created" | "paused" => ServiceStatus::Stopped,
        "restarting" => ServiceStatus::Restarting,
        "removing" => ServiceStatus::Stopping,
        _ => ServiceStatus::Error,
    }
}

fn map_health(health: &str) -> HealthState {
    match health {
        "healthy" => HealthState::Healthy,
        "unhealthy" => HealthState::Unhealthy,
        "starting" => HealthState::Starting,
        _ => HealthState::None,
    }
}

fn classify_failure(stderr: &str) -> RuntimeError {
    let lowered = stderr.to_lowercase();
    let unreachable = [
        "cannot connect to the docker daemon",
        "is the docker daemon running",
        "error during connect",
        "connection refused",
    ];
    let message = stderr.trim().to_string();
    if unreachable.iter().any(|needle| lowered.contains(needle)) {
        RuntimeError::Unavailable(message)
    } else {
        RuntimeError::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_compose_arguments() {
        let runtime = ComposeRuntime::new("localai")
            .with_compose_file("docker-compose.yml")
            .with_compose_file("supabase/docker-compose.yml");
        assert_eq!(
            runtime.args(Some("cpu"), &["up", "-d", "--no-deps", "ollama"]),
            vec![
                "compose",
                "-p",
                "localai",
                "--profile",
                "cpu",
                "-f",
                "docker-compose.yml",
                "-f",
                "supabase/docker-compose.yml",
                "up",
                "-d",
                "--no-deps",
                "ollama"
            ]
        );
    }

    #[test]
    fn parses_line_delimited_ps_output() {
        let stdout = r#"{"Service":"db","State":"running","Health":"healthy","ExitCode":0}
{"Service":"migrate","State":"exited","Health":"","ExitCode":0}
{"Service":"worker","State":"created","Health":"","ExitCode":0}
"#;
        let snapshots: Vec<ContainerSnapshot> = parse_ps_entries(stdout)
            .unwrap()
            .into_iter()
            .map(ContainerSnapshot::from)
            .collect();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].status, ServiceStatus::Running);
        assert_eq!(snapshots[0].health, HealthState::Healthy);
        assert_eq!(snapshots[1].status, ServiceStatus::Stopped);
        assert_eq!(snapshots[1].exit_code, Some(0));
        assert_eq!(snapshots[2].exit_code, None);
    }

    #[test]
    fn parses_array_ps_output() {
        let stdout = r#"[{"Service":"redis","Name":"localai-redis-1","State":"restarting","ExitCode":1}]"#;
        let entries = parse_ps_entries(stdout).unwrap();
        assert_eq!(entries[0].name, "localai-redis-1");
        let snapshot = ContainerSnapshot::from(entries.into_iter().next().unwrap());
        assert_eq!(snapshot.status, ServiceStatus::Restarting);
        assert_eq!(snapshot.health, HealthState::None);
        assert!(parse_ps_entries("  \n").unwrap().is_empty());
        assert!(parse_ps_entries("not json").is_err());
    }

    #[test]
    fn parses_stats_rows_for_project_containers() {
        let stdout = r#"{"Name":"localai-ollama-1","CPUPerc":"12.50%","MemUsage":"1.5GiB / 8GiB","MemPerc":"18.75%","NetIO":"1.2kB / 648B"}
{"Name":"unrelated","CPUPerc":"1.00%","MemUsage":"1MiB / 1GiB","MemPerc":"0.10%","NetIO":"0B / 0B"}
"#;
        let services = HashMap::from([("localai-ollama-1".to_string(), "ollama".to_string())]);
        let stats = parse_stats_output(stdout, &services).unwrap();
        assert_eq!(stats.len(), 1);
        let ollama = &stats[0];
        assert_eq!(ollama.service, "ollama");
        assert_eq!(ollama.cpu_percent, 12.5);
        assert_eq!(ollama.memory_usage, 1_610_612_736);
        assert_eq!(ollama.memory_limit, 8 * 1024 * 1024 * 1024);
        assert_eq!(ollama.memory_percent, 18.75);
        assert_eq!(ollama.network_rx_bytes, 1200);
        assert_eq!(ollama.network_tx_bytes, 648);
    }

    #[test]
    fn unparsable_sizes_read_as_zero() {
        assert_eq!(parse_size("--"), 0);
        assert_eq!(parse_size("0B"), 0);
        assert_eq!(parse_percent("n/a"), 0.0);
        assert_eq!(split_pair(""), (0, 0));
    }

    #[test]
    fn maps_unknown_state_to_error() {
        assert_eq!(map_container_state("paused"), ServiceStatus::Stopped);
        assert_eq!(map_container_state("weird"), ServiceStatus::Error);
    }

    #[test]
    fn daemon_unreachable_is_transient() {
        let err = classify_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert!(err.is_transient());
        assert!(!classify_failure("no such service: nope").is_transient());
    }
}

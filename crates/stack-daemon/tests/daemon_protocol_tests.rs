//! Tests for the client-daemon protocol over a real WebSocket connection

use async_net::TcpListener;
use smol::Timer;
use stack_daemon::client::DaemonClient;
use stack_daemon::daemon::{DaemonState, serve};
use stack_daemon::protocol::{Request, Response};
use stack_orchestration::{
    ContainerStats, ErrorKind, EventKind, HealthState, InMemoryRuntime, OperationOptions,
    OperationRecord, OperationStatus, OperationTarget, ServiceStatus, StartBehavior,
};
use std::sync::Arc;
use std::time::Duration;

const STACK: &str = r#"
version: "1.0"
name: protocol-test
settings:
  poll_interval_ms: 10
  health_timeout_secs: 5
  retry_backoff_ms: 5
  metrics_interval_ms: 20
services:
  db:
    image: postgres
    group: storage
  api:
    image: api
    group: core
    depends_on:
      db:
        condition: service_healthy
  web:
    image: web
    group: core
    depends_on: [api]
"#;

struct TestDaemon {
    runtime: Arc<InMemoryRuntime>,
    port: u16,
    _server: smol::Task<anyhow::Result<()>>,
}

async fn daemon() -> TestDaemon {
    let config = stack_config::parse_str(STACK).unwrap();
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.set_behavior("db", StartBehavior::Healthy);
    let state = DaemonState::new(&config, runtime.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = smol::spawn(serve(listener, Arc::new(state)));

    TestDaemon {
        runtime,
        port,
        _server: server,
    }
}

fn service(name: &str) -> OperationTarget {
    OperationTarget::Service(name.to_string())
}

async fn wait_for_operation(
    client: &mut DaemonClient,
    mut record: OperationRecord,
) -> OperationRecord {
    for _ in 0..500 {
        if record.status.is_terminal() {
            return record;
        }
        Timer::after(Duration::from_millis(10)).await;
        record = match client
            .send_request(Request::GetOperation { id: record.id })
            .await
            .unwrap()
        {
            Response::Operation { operation } => operation,
            other => panic!("unexpected response: {:?}", other),
        };
    }
    panic!("operation {} did not finish", record.id);
}

#[smol_potat::test]
async fn test_start_runs_dependencies_first() {
    let daemon = daemon().await;
    let mut client = DaemonClient::connect(daemon.port).await.unwrap();

    let request = Request::Start {
        target: service("web"),
        profile: None,
        options: OperationOptions::default(),
    };
    let record = match client.send_request(request).await.unwrap() {
        Response::Operation { operation } => operation,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(
        record.batches,
        vec![vec!["db".to_string()], vec!["api".to_string()], vec!["web".to_string()]]
    );

    let record = wait_for_operation(&mut client, record).await;
    assert_eq!(record.status, OperationStatus::Completed);

    // The last batch is not awaited, so its state settles on the next poll
    let mut settled = false;
    for _ in 0..200 {
        let services = match client.send_request(Request::GetStatus).await.unwrap() {
            Response::Status { services } => services,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(services["db"].health, HealthState::Healthy);
        if ["db", "api", "web"]
            .iter()
            .all(|name| services[*name].status == ServiceStatus::Running)
        {
            settled = true;
            break;
        }
        Timer::after(Duration::from_millis(10)).await;
    }
    assert!(settled);

    match client.send_request(Request::ListOperations).await.unwrap() {
        Response::Operations { operations } => assert_eq!(operations.len(), 1),
        other => panic!("unexpected response: {:?}", other),
    }

    client.close().await.unwrap();
}

#[smol_potat::test]
async fn test_stop_with_running_dependents_is_refused() {
    let daemon = daemon().await;
    let mut client = DaemonClient::connect(daemon.port).await.unwrap();

    let start = Request::Start {
        target: service("web"),
        profile: None,
        options: OperationOptions::default(),
    };
    let record = match client.send_request(start).await.unwrap() {
        Response::Operation { operation } => operation,
        other => panic!("unexpected response: {:?}", other),
    };
    wait_for_operation(&mut client, record).await;

    let stop = Request::Stop {
        target: service("db"),
        options: OperationOptions::default(),
    };
    match client.send_request(stop).await.unwrap() {
        Response::Error { error } => {
            assert_eq!(error.kind, ErrorKind::DependencyNotSatisfied);
            assert_eq!(error.blocking, vec!["api", "web"]);
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert_eq!(daemon.runtime.start_count("db"), 1);
}

#[smol_potat::test]
async fn test_invalid_request_is_rejected() {
    use async_tungstenite::client_async;
    use async_tungstenite::tungstenite::Message;
    use futures::{SinkExt, StreamExt};

    let daemon = daemon().await;
    let stream = async_net::TcpStream::connect(("127.0.0.1", daemon.port))
        .await
        .unwrap();
    let url = format!("ws://127.0.0.1:{}/", daemon.port);
    let (mut ws, _) = client_async(url, stream).await.unwrap();

    ws.send(Message::Text(r#"{"type":"launch_rockets"}"#.into()))
        .await
        .unwrap();
    let reply = match ws.next().await {
        Some(Ok(Message::Text(text))) => text.to_string(),
        other => panic!("unexpected message: {:?}", other),
    };
    let response: Response = serde_json::from_str(&reply).unwrap();
    assert!(matches!(response, Response::Rejected { .. }));
}

#[smol_potat::test]
async fn test_subscription_streams_status_and_logs() {
    let daemon = daemon().await;
    daemon.runtime.push_log("db", "booting");

    let mut watcher = DaemonClient::connect(daemon.port).await.unwrap();
    let subscribe = Request::Subscribe {
        service: Some("db".to_string()),
        tail: Some(10),
    };
    let subscription = match watcher.send_request(subscribe).await.unwrap() {
        Response::Subscribed { subscription } => subscription,
        other => panic!("unexpected response: {:?}", other),
    };

    let mut controller = DaemonClient::connect(daemon.port).await.unwrap();
    let start = Request::Start {
        target: service("db"),
        profile: None,
        options: OperationOptions::default(),
    };
    assert!(matches!(
        controller.send_request(start).await.unwrap(),
        Response::Operation { .. }
    ));
    daemon.runtime.push_log("db", "ready to accept connections");

    let mut saw_replay = false;
    let mut saw_running = false;
    let mut saw_live_log = false;
    while !(saw_replay && saw_running && saw_live_log) {
        let event = smol::future::or(
            async { watcher.next_event().await.map(Some) },
            async {
                Timer::after(Duration::from_secs(5)).await;
                Ok(None)
            },
        )
        .await
        .unwrap();
        let Some(Response::Event {
            subscription: id,
            event,
        }) = event
        else {
            panic!(
                "expected events: replay={} running={} live={}",
                saw_replay, saw_running, saw_live_log
            );
        };
        assert_eq!(id, subscription);
        assert_eq!(event.service.as_deref(), Some("db"));
        match event.kind {
            EventKind::Log if event.payload["line"] == "booting" => saw_replay = true,
            EventKind::Log if event.payload["line"] == "ready to accept connections" => {
                saw_live_log = true
            }
            EventKind::Status if event.payload["status"] == "running" => saw_running = true,
            _ => {}
        }
    }

    match watcher
        .send_request(Request::Unsubscribe { subscription })
        .await
        .unwrap()
    {
        Response::Unsubscribed { subscription: id } => assert_eq!(id, subscription),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[smol_potat::test]
async fn test_subscribe_to_unknown_service_fails() {
    let daemon = daemon().await;
    let mut client = DaemonClient::connect(daemon.port).await.unwrap();
    let request = Request::Subscribe {
        service: Some("ghost".to_string()),
        tail: None,
    };
    match client.send_request(request).await.unwrap() {
        Response::Error { error } => assert_eq!(error.kind, ErrorKind::UnknownService),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[smol_potat::test]
async fn test_metrics_are_streamed_and_diagnosed() {
    let daemon = daemon().await;
    daemon
        .runtime
        .set_state("db", ServiceStatus::Running, HealthState::Healthy);
    daemon.runtime.set_stats(ContainerStats {
        service: "db".to_string(),
        cpu_percent: 12.0,
        memory_usage: 970,
        memory_limit: 1000,
        memory_percent: 97.0,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
    });
    daemon.runtime.push_log("db", "FATAL: out of memory");

    let mut watcher = DaemonClient::connect(daemon.port).await.unwrap();
    let subscribe = Request::Subscribe {
        service: Some("db".to_string()),
        tail: None,
    };
    assert!(matches!(
        watcher.send_request(subscribe).await.unwrap(),
        Response::Subscribed { .. }
    ));

    let mut saw_metrics = false;
    let mut saw_alert = false;
    while !(saw_metrics && saw_alert) {
        let event = smol::future::or(
            async { watcher.next_event().await.map(Some) },
            async {
                Timer::after(Duration::from_secs(5)).await;
                Ok(None)
            },
        )
        .await
        .unwrap();
        let Some(Response::Event { event, .. }) = event else {
            panic!("expected metrics={} alert={}", saw_metrics, saw_alert);
        };
        match event.kind {
            EventKind::Metrics => saw_metrics = true,
            EventKind::Alert => {
                assert_eq!(event.payload["issue"], "Critical memory usage");
                saw_alert = true;
            }
            _ => {}
        }
    }

    let mut client = DaemonClient::connect(daemon.port).await.unwrap();
    match client
        .send_request(Request::Diagnose {
            service: "db".to_string(),
        })
        .await
        .unwrap()
    {
        Response::Diagnosis { report } => {
            assert!(report.metrics.is_some());
            let issues: Vec<&str> = report.issues.iter().map(|i| i.issue.as_str()).collect();
            assert!(issues.contains(&"Critical memory usage"));
            assert!(issues.contains(&"Container ran out of memory"));
            assert!(report.restart_recommended);
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

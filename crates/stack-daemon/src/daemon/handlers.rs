//! Request handlers for the daemon

use crate::daemon::server::DaemonState;
use crate::protocol::{Request, Response};
use stack_config::ConfigError;
use stack_orchestration::{OperationKind, OperationTarget};
use tracing::{debug, info, warn};

/// Handle a request from a client. Subscriptions are handled by the
/// connection since they outlive a single request; diagnoses read logs and
/// go through [`diagnose`].
pub fn handle_request(request: Request, state: &DaemonState) -> Response {
    debug!("Handling request: {:?}", request);
    let controller = &state.controller;

    match request {
        Request::GetGraph => Response::Graph {
            graph: controller.resolver().graph().to_view(),
        },

        Request::GetStatus => Response::Status {
            services: controller.status(),
        },

        Request::GetGroups => Response::Groups {
            groups: controller.groups(),
        },

        Request::GetService { name } => match controller.service_detail(&name) {
            Ok(service) => Response::Service { service },
            Err(e) => e.into(),
        },

        Request::Start {
            target,
            profile,
            options,
        } => {
            info!("Starting {}", target);
            match controller.start(target, profile, options) {
                Ok(handle) => Response::Operation {
                    operation: handle.snapshot(),
                },
                Err(e) => {
                    warn!("Start rejected: {}", e);
                    e.into()
                }
            }
        }

        Request::Stop { target, options } => {
            info!("Stopping {}", target);
            match controller.stop(target, options) {
                Ok(handle) => Response::Operation {
                    operation: handle.snapshot(),
                },
                Err(e) => {
                    warn!("Stop rejected: {}", e);
                    e.into()
                }
            }
        }

        Request::Restart {
            target,
            profile,
            options,
        } => {
            info!("Restarting {}", target);
            match controller.restart(target, profile, options) {
                Ok(handle) => Response::Operation {
                    operation: handle.snapshot(),
                },
                Err(e) => {
                    warn!("Restart rejected: {}", e);
                    e.into()
                }
            }
        }

        Request::Plan {
            kind,
            target,
            profile,
            options,
        } => plan(state, kind, target, profile, &options),

        Request::GetOperation { id } => match controller.operation(id) {
            Ok(operation) => Response::Operation { operation },
            Err(e) => e.into(),
        },

        Request::CancelOperation { id } => match controller.cancel(id) {
            Ok(()) => {
                info!("Cancelled operation {}", id);
                Response::Success
            }
            Err(e) => e.into(),
        },

        Request::ListOperations => Response::Operations {
            operations: controller.operations(),
        },

        Request::GetMetrics { service: None } => Response::Metrics {
            samples: state.metrics.latest(),
        },

        Request::GetMetrics {
            service: Some(service),
        } => match controller.resolver().node(&service) {
            Ok(_) => Response::Metrics {
                samples: state.metrics.latest_for(&service).into_iter().collect(),
            },
            Err(e) => e.into(),
        },

        Request::GetMetricsHistory { service } => match controller.resolver().node(&service) {
            Ok(_) => Response::Metrics {
                samples: state.metrics.history(&service),
            },
            Err(e) => e.into(),
        },

        Request::Reload => match state.reload() {
            Ok(_) => Response::Success,
            Err(e) => match e.downcast_ref::<ConfigError>() {
                Some(ConfigError::Graph(err)) => err.clone().into(),
                _ => Response::Rejected {
                    message: format!("Reload failed: {:#}", e),
                },
            },
        },

        Request::Subscribe { .. } | Request::Unsubscribe { .. } => Response::Rejected {
            message: "Subscriptions are bound to a connection".to_string(),
        },

        Request::Diagnose { .. } => Response::Rejected {
            message: "Diagnoses are handled by the connection".to_string(),
        },
    }
}

/// Diagnose one service
pub async fn diagnose(state: &DaemonState, service: &str) -> Response {
    if let Err(e) = state.controller.resolver().node(service) {
        return e.into();
    }
    info!("Diagnosing {}", service);
    Response::Diagnosis {
        report: state.metrics.diagnose(service).await,
    }
}

fn plan(
    state: &DaemonState,
    kind: OperationKind,
    target: OperationTarget,
    profile: Option<String>,
    options: &stack_orchestration::OperationOptions,
) -> Response {
    let controller = &state.controller;
    let resolver = controller.resolver();

    let report = match kind {
        OperationKind::Stop => None,
        OperationKind::Start | OperationKind::Restart => {
            let selected = match resolver.resolve_target(&target) {
                Ok(selected) => selected,
                Err(e) => return e.into(),
            };
            match resolver.selection_report(&selected, profile.as_deref()) {
                Ok(report) => Some(report),
                Err(e) => return e.into(),
            }
        }
    };

    match controller.preview(kind, target, profile, options) {
        Ok(operation) => Response::Plan { operation, report },
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_orchestration::{
        ContainerStats, ErrorKind, HealthState, InMemoryRuntime, OperationOptions,
        OperationStatus, ServiceStatus,
    };
    use std::sync::Arc;

    const STACK: &str = r#"
version: "1.0"
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
  ollama:
    image: ollama
    group: llm
    profiles: [cpu]
"#;

    fn state() -> DaemonState {
        let config = stack_config::parse_str(STACK).unwrap();
        DaemonState::new(&config, Arc::new(InMemoryRuntime::new())).unwrap()
    }

    #[test]
    fn test_graph_and_groups() {
        smol::block_on(async {
            let state = state();
            match handle_request(Request::GetGraph, &state) {
                Response::Graph { graph } => {
                    assert_eq!(graph.nodes.len(), 3);
                    assert_eq!(graph.edges.len(), 1);
                    assert_eq!(graph.edges[0].from, "db");
                }
                other => panic!("unexpected response: {:?}", other),
            }
            match handle_request(Request::GetGroups, &state) {
                Response::Groups { groups } => {
                    let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
                    assert_eq!(names, vec!["core", "llm", "storage"]);
                    assert!(groups.iter().all(|g| g.running == 0));
                }
                other => panic!("unexpected response: {:?}", other),
            }
        });
    }

    #[test]
    fn test_unknown_service_is_structured() {
        smol::block_on(async {
            let state = state();
            let response = handle_request(
                Request::GetService {
                    name: "ghost".to_string(),
                },
                &state,
            );
            match response {
                Response::Error { error } => {
                    assert_eq!(error.kind, ErrorKind::UnknownService);
                    assert_eq!(error.services, vec!["ghost"]);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        });
    }

    #[test]
    fn test_plan_does_not_execute() {
        smol::block_on(async {
            let state = state();
            let response = handle_request(
                Request::Plan {
                    kind: OperationKind::Start,
                    target: OperationTarget::Service("api".to_string()),
                    profile: None,
                    options: OperationOptions::default(),
                },
                &state,
            );
            match response {
                Response::Plan { operation, report } => {
                    assert_eq!(operation.status, OperationStatus::Pending);
                    assert_eq!(
                        operation.batches,
                        vec![vec!["db".to_string()], vec!["api".to_string()]]
                    );
                    let report = report.unwrap();
                    assert!(report.auto_enabled.contains_key("db"));
                }
                other => panic!("unexpected response: {:?}", other),
            }
            assert!(state.controller.operations().is_empty());
        });
    }

    #[test]
    fn test_reload_swaps_graph() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("stack.yaml");
            std::fs::write(&path, STACK).unwrap();
            let state = state().with_config_path(&path);

            let extended = format!(
                "{}  worker:\n    image: worker\n    depends_on: [api]\n",
                STACK
            );
            std::fs::write(&path, extended).unwrap();
            assert_eq!(handle_request(Request::Reload, &state), Response::Success);

            match handle_request(Request::GetGraph, &state) {
                Response::Graph { graph } => assert_eq!(graph.nodes.len(), 4),
                other => panic!("unexpected response: {:?}", other),
            }

            let cyclic = STACK.replace(
                "    image: postgres\n",
                "    image: postgres\n    depends_on: [api]\n",
            );
            std::fs::write(&path, cyclic).unwrap();
            match handle_request(Request::Reload, &state) {
                Response::Error { error } => assert_eq!(error.kind, ErrorKind::CycleDetected),
                other => panic!("unexpected response: {:?}", other),
            }
        });
    }

    #[test]
    fn test_metrics_and_diagnosis() {
        smol::block_on(async {
            let config = stack_config::parse_str(STACK).unwrap();
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("db", ServiceStatus::Running, HealthState::Healthy);
            runtime.set_stats(ContainerStats {
                service: "db".to_string(),
                cpu_percent: 99.0,
                memory_usage: 100,
                memory_limit: 1000,
                memory_percent: 10.0,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
            });
            let state = DaemonState::new(&config, runtime.clone()).unwrap();
            state.metrics.collect().await.unwrap();

            match handle_request(Request::GetMetrics { service: None }, &state) {
                Response::Metrics { samples } => {
                    assert_eq!(samples.len(), 1);
                    assert_eq!(samples[0].stats.service, "db");
                }
                other => panic!("unexpected response: {:?}", other),
            }
            match handle_request(
                Request::GetMetricsHistory {
                    service: "api".to_string(),
                },
                &state,
            ) {
                Response::Metrics { samples } => assert!(samples.is_empty()),
                other => panic!("unexpected response: {:?}", other),
            }

            match diagnose(&state, "db").await {
                Response::Diagnosis { report } => {
                    assert_eq!(report.issues[0].issue, "Critical CPU usage");
                    assert!(!report.restart_recommended);
                }
                other => panic!("unexpected response: {:?}", other),
            }
            match diagnose(&state, "ghost").await {
                Response::Error { error } => assert_eq!(error.kind, ErrorKind::UnknownService),
                other => panic!("unexpected response: {:?}", other),
            }
        });
    }

    #[test]
    fn test_reload_without_file_is_rejected() {
        smol::block_on(async {
            let state = state();
            assert!(matches!(
                handle_request(Request::Reload, &state),
                Response::Rejected { .. }
            ));
        });
    }
}

//! Protocol types for daemon communication

use serde::{Deserialize, Serialize};
use stack_orchestration::{
    DiagnosticReport, FailureReport, GraphView, GroupSummary, MetricsSample, OperationKind,
    OperationOptions, OperationRecord, OperationTarget, SelectionReport, ServiceDetail,
    ServiceRuntimeState, StreamEvent,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Request from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Dependency graph
    GetGraph,

    /// State of every service
    GetStatus,

    /// Groups with running counts
    GetGroups,

    /// Graph and live information for one service
    GetService {
        /// Service name
        name: String,
    },

    /// Start a service or group
    Start {
        /// Target
        target: OperationTarget,
        /// Profile to start under
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        /// Options
        #[serde(default)]
        options: OperationOptions,
    },

    /// Stop a service or group
    Stop {
        /// Target
        target: OperationTarget,
        /// Options
        #[serde(default)]
        options: OperationOptions,
    },

    /// Stop then start a service or group
    Restart {
        /// Target
        target: OperationTarget,
        /// Profile to start under
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        /// Options
        #[serde(default)]
        options: OperationOptions,
    },

    /// Preview an operation without executing it
    Plan {
        /// Kind of operation to preview
        kind: OperationKind,
        /// Target
        target: OperationTarget,
        /// Profile
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        /// Options
        #[serde(default)]
        options: OperationOptions,
    },

    /// Current record of an operation
    GetOperation {
        /// Operation id
        id: Uuid,
    },

    /// Cancel an operation
    CancelOperation {
        /// Operation id
        id: Uuid,
    },

    /// Retained operations, newest first
    ListOperations,

    /// Stream status changes and log lines
    Subscribe {
        /// Only events for this service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        /// Log lines to replay before following, requires `service`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tail: Option<usize>,
    },

    /// Close a subscription
    Unsubscribe {
        /// Subscription id
        subscription: Uuid,
    },

    /// Latest resource usage sample per service
    GetMetrics {
        /// Only this service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },

    /// Retained samples of one service, oldest first
    GetMetricsHistory {
        /// Service name
        service: String,
    },

    /// Check a service's metrics, restarts and recent logs for known problems
    Diagnose {
        /// Service name
        service: String,
    },

    /// Re-read the stack file and swap in the new graph
    Reload,
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Dependency graph
    Graph {
        /// Nodes and edges
        graph: GraphView,
    },

    /// Service states
    Status {
        /// State per service
        services: BTreeMap<String, ServiceRuntimeState>,
    },

    /// Group summaries
    Groups {
        /// Groups sorted by name
        groups: Vec<GroupSummary>,
    },

    /// One service
    Service {
        /// Detail
        service: ServiceDetail,
    },

    /// An accepted or looked up operation
    Operation {
        /// Current record
        operation: OperationRecord,
    },

    /// Retained operations
    Operations {
        /// Records, newest first
        operations: Vec<OperationRecord>,
    },

    /// Preview of an operation
    Plan {
        /// Record that would be executed, nothing is started
        operation: OperationRecord,
        /// What a start selection pulls in
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report: Option<SelectionReport>,
    },

    /// Resource usage samples
    Metrics {
        /// Samples sorted by service
        samples: Vec<MetricsSample>,
    },

    /// Diagnosis of one service
    Diagnosis {
        /// Report
        report: DiagnosticReport,
    },

    /// Subscription opened
    Subscribed {
        /// Subscription id, carried by every event
        subscription: Uuid,
    },

    /// Subscription closed
    Unsubscribed {
        /// Subscription id
        subscription: Uuid,
    },

    /// Generic success
    Success,

    /// Request failed
    Error {
        /// Structured failure
        error: FailureReport,
    },

    /// Request could not be understood
    Rejected {
        /// Reason
        message: String,
    },

    /// Streamed event for a subscription
    Event {
        /// Subscription id
        subscription: Uuid,
        /// Event
        event: StreamEvent,
    },
}

impl From<stack_orchestration::Error> for Response {
    fn from(err: stack_orchestration::Error) -> Self {
        Response::Error {
            error: FailureReport::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_value(json!({
            "type": "start",
            "target": { "kind": "group", "name": "llm" },
            "profile": "cpu",
            "options": { "strict": true }
        }))
        .unwrap();

        match request {
            Request::Start {
                target,
                profile,
                options,
            } => {
                assert_eq!(target, OperationTarget::Group("llm".to_string()));
                assert_eq!(profile.as_deref(), Some("cpu"));
                assert!(options.strict);
                assert!(!options.force);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_options_default_when_omitted() {
        let request: Request = serde_json::from_value(json!({
            "type": "stop",
            "target": { "kind": "service", "name": "db" }
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::Stop {
                target: OperationTarget::Service("db".to_string()),
                options: OperationOptions::default(),
            }
        );
    }

    #[test]
    fn test_error_response_carries_kind() {
        let response = Response::from(stack_orchestration::Error::UnknownService(
            "ghost".to_string(),
        ));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["kind"], "unknown_service");
        assert_eq!(value["error"]["services"], json!(["ghost"]));
    }

    #[test]
    fn test_metrics_request_wire_format() {
        let request: Request = serde_json::from_value(json!({ "type": "get_metrics" })).unwrap();
        assert_eq!(request, Request::GetMetrics { service: None });

        let request: Request =
            serde_json::from_value(json!({ "type": "diagnose", "service": "ollama" })).unwrap();
        assert_eq!(
            request,
            Request::Diagnose {
                service: "ollama".to_string()
            }
        );
    }

    #[test]
    fn test_event_keeps_inner_type() {
        let response = Response::Event {
            subscription: Uuid::nil(),
            event: StreamEvent::log("db", "ready"),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["type"], "log");
        assert_eq!(value["event"]["payload"]["line"], "ready");
    }
}

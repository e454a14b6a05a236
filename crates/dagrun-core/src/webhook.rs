//! Fire-and-forget webhook notifications.
//!
//! Workers never wait on HTTP: `WebhookNotifier` pushes payloads onto a
//! bounded channel and a dispatcher (dagrun-infra) posts them. A full or
//! closed channel only costs the notification, never a state transition.

use dagrun_types::run::{RunId, TaskRunId, WebhookTarget};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Notification body, serialized as JSON with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookData {
    /// Task-run transition (started, success, failed, suspended, pending).
    #[serde(rename_all = "camelCase")]
    TaskRun {
        status: String,
        dag_run_id: RunId,
        task_name: String,
        task_id: TaskRunId,
    },
    /// Terminal unit-of-work event with its runtime in seconds.
    #[serde(rename_all = "camelCase")]
    Pod {
        status: String,
        dag_run_id: RunId,
        task_name: String,
        task_id: TaskRunId,
        duration: i64,
    },
}

/// A notification queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookPayload {
    pub url: String,
    pub verify_ssl: bool,
    pub data: WebhookData,
}

/// Handle used by workers to queue notifications. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    tx: mpsc::Sender<WebhookPayload>,
}

impl WebhookNotifier {
    /// Create a notifier and the receiver its dispatcher drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WebhookPayload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn notify_task_run(
        &self,
        task_name: &str,
        status: &str,
        run_id: RunId,
        task_run_id: TaskRunId,
        target: &WebhookTarget,
    ) {
        self.enqueue(
            target,
            WebhookData::TaskRun {
                status: status.to_string(),
                dag_run_id: run_id,
                task_name: task_name.to_string(),
                task_id: task_run_id,
            },
        );
    }

    pub fn notify_unit_event(
        &self,
        task_name: &str,
        phase: &str,
        run_id: RunId,
        task_run_id: TaskRunId,
        target: &WebhookTarget,
        duration_secs: i64,
    ) {
        self.enqueue(
            target,
            WebhookData::Pod {
                status: phase.to_string(),
                dag_run_id: run_id,
                task_name: task_name.to_string(),
                task_id: task_run_id,
                duration: duration_secs,
            },
        );
    }

    fn enqueue(&self, target: &WebhookTarget, data: WebhookData) {
        let payload = WebhookPayload {
            url: target.url.clone(),
            verify_ssl: target.verify_ssl,
            data,
        };

        match self.tx.try_send(payload) {
            Ok(()) => debug!(url = %target.url, "queued webhook"),
            Err(mpsc::error::TrySendError::Full(p)) => {
                warn!(url = %p.url, "webhook queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(p)) => {
                warn!(url = %p.url, "webhook dispatcher stopped, dropping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> WebhookTarget {
        WebhookTarget {
            url: "https://hooks.example.com/dagrun".into(),
            verify_ssl: true,
        }
    }

    #[test]
    fn test_task_run_payload_shape() {
        let data = WebhookData::TaskRun {
            status: "success".into(),
            dag_run_id: 3,
            task_name: "build".into(),
            task_id: 8,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "taskrun",
                "status": "success",
                "dagRunId": 3,
                "taskName": "build",
                "taskId": 8
            })
        );
    }

    #[test]
    fn test_pod_payload_has_duration() {
        let data = WebhookData::Pod {
            status: "Succeeded".into(),
            dag_run_id: 1,
            task_name: "a".into(),
            task_id: 2,
            duration: 42,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "pod");
        assert_eq!(json["duration"], 42);
    }

    #[tokio::test]
    async fn test_notify_queues_payload() {
        let (notifier, mut rx) = WebhookNotifier::channel(4);
        notifier.notify_task_run("build", "started", 1, 2, &target());

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.url, target().url);
        assert!(matches!(payload.data, WebhookData::TaskRun { ref status, .. } if status == "started"));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (notifier, _rx) = WebhookNotifier::channel(1);
        notifier.notify_task_run("a", "started", 1, 1, &target());
        notifier.notify_task_run("a", "success", 1, 1, &target());
    }

    #[test]
    fn test_closed_queue_is_not_an_error() {
        let (notifier, rx) = WebhookNotifier::channel(1);
        drop(rx);
        notifier.notify_unit_event("a", "Failed", 1, 1, &target(), 3);
    }
}

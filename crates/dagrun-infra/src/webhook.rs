//! HTTP delivery of queued webhook notifications.
//!
//! Drains the channel fed by `WebhookNotifier` and POSTs each payload as
//! JSON. Delivery is best effort: failures are logged and dropped.

use std::time::Duration;

use dagrun_core::webhook::WebhookPayload;
use dagrun_types::config::WebhookConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct WebhookDispatcher {
    client: reqwest::Client,
    /// Used for targets that opted out of certificate verification.
    insecure_client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let insecure_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            insecure_client,
        })
    }

    /// Deliver one payload. Returns whether the target answered 2xx.
    pub async fn deliver(&self, payload: &WebhookPayload) -> bool {
        let client = if payload.verify_ssl {
            &self.client
        } else {
            &self.insecure_client
        };

        match client.post(&payload.url).json(&payload.data).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %payload.url, status = %resp.status(), "webhook delivered");
                true
            }
            Ok(resp) => {
                warn!(url = %payload.url, status = %resp.status(), "webhook rejected");
                false
            }
            Err(e) => {
                warn!(url = %payload.url, error = %e, "webhook delivery failed");
                false
            }
        }
    }

    /// Deliver payloads until `cancel` fires or every notifier is dropped.
    pub async fn run(&self, mut rx: mpsc::Receiver<WebhookPayload>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(payload) => {
                        self.deliver(&payload).await;
                    }
                    None => break,
                },
            }
        }
        info!("webhook dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::webhook::WebhookData;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, answer with `status`, return the raw request.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = String::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if n == 0 || request.contains("\"taskName\"") && request.ends_with('}') {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (url, handle)
    }

    fn payload(url: String) -> WebhookPayload {
        WebhookPayload {
            url,
            verify_ssl: true,
            data: WebhookData::TaskRun {
                status: "success".into(),
                dag_run_id: 3,
                task_name: "a".into(),
                task_id: 7,
            },
        }
    }

    #[tokio::test]
    async fn test_deliver_posts_json() {
        let (url, server) = one_shot_server(200).await;
        let dispatcher = WebhookDispatcher::new(&WebhookConfig::default()).unwrap();

        assert!(dispatcher.deliver(&payload(url)).await);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains(r#""type":"taskrun""#));
        assert!(request.contains(r#""dagRunId":3"#));
    }

    #[tokio::test]
    async fn test_deliver_reports_rejection() {
        let (url, server) = one_shot_server(500).await;
        let dispatcher = WebhookDispatcher::new(&WebhookConfig::default()).unwrap();

        assert!(!dispatcher.deliver(&payload(url)).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target_is_not_fatal() {
        let dispatcher = WebhookDispatcher::new(&WebhookConfig {
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(!dispatcher.deliver(&payload("http://127.0.0.1:1/hook".into())).await);
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_drop() {
        let dispatcher = WebhookDispatcher::new(&WebhookConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        dispatcher.run(rx, CancellationToken::new()).await;
    }
}

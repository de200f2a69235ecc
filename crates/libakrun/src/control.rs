//! Control-plane channel between the front-end and the scheduling daemon.
//!
//! Requests travel over an mpsc queue together with a oneshot reply slot. The
//! client serializes callers so exactly one request is in flight, which keeps
//! responses in request order.

use std::sync::Arc;
use std::time::Duration;

use akrun_protocol::{ControlRequest, ControlResponse, ErrorKind, TaskId, functions};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

/// One queued request and the slot its answer goes to.
pub struct ControlEnvelope {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlResponse>,
}

#[derive(Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<ControlEnvelope>,
    in_flight: Arc<Mutex<()>>,
    timeout: Duration,
}

/// Create a connected client and the receiver the daemon drains.
pub fn channel(capacity: usize, timeout: Duration) -> (ControlClient, mpsc::Receiver<ControlEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let client = ControlClient {
        tx,
        in_flight: Arc::new(Mutex::new(())),
        timeout,
    };
    (client, rx)
}

impl ControlClient {
    /// Send `request` and wait for its answer, at most the configured timeout.
    ///
    /// A request that timed out may still be executed by the daemon later.
    pub async fn call(&self, request: ControlRequest) -> ControlResponse {
        let _turn = self.in_flight.lock().await;
        let fun = request.fun.clone();
        let (reply, answer) = oneshot::channel();
        if self.tx.send(ControlEnvelope { request, reply }).await.is_err() {
            return ControlResponse::failure(
                ErrorKind::ServerError,
                "scheduling daemon is not running",
            );
        }
        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ControlResponse::failure(
                ErrorKind::ServerError,
                format!("scheduling daemon dropped the {fun} request"),
            ),
            Err(_) => {
                warn!(function = %fun, timeout = ?self.timeout, "control request timed out");
                ControlResponse::failure(
                    ErrorKind::ServerError,
                    format!("scheduling daemon did not answer {fun} within {:?}", self.timeout),
                )
            }
        }
    }

    pub async fn update_task_parameters(
        &self,
        task_id: TaskId,
        values: Map<String, Value>,
        update_derived_task: bool,
    ) -> ControlResponse {
        self.call(
            ControlRequest::new(functions::UPDATE_TASK_PARAMETERS)
                .arg(task_id)
                .arg(Value::Object(values))
                .karg("update_derived_task", update_derived_task),
        )
        .await
    }

    pub async fn delete_task(
        &self,
        task_id: TaskId,
        scheduled: bool,
        active: bool,
        derived: bool,
    ) -> ControlResponse {
        self.call(
            ControlRequest::new(functions::DELETE_TASK)
                .arg(task_id)
                .karg("remove_from_scheduled_queue", scheduled)
                .karg("remove_from_active_queue", active)
                .karg("remove_derived_task", derived),
        )
        .await
    }

    /// Invoke one of the argument-less daemon functions.
    pub async fn daemon(&self, fun: &str) -> ControlResponse {
        self.call(ControlRequest::new(fun)).await
    }
}

/// Argument at position `idx`, or the keyword `name`.
pub fn argument<'a>(request: &'a ControlRequest, idx: usize, name: &str) -> Option<&'a Value> {
    request.args.get(idx).or_else(|| request.kargs.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_follow_request_order() {
        let (client, mut rx) = channel(8, Duration::from_secs(5));
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(envelope) = rx.recv().await {
                seen.push(envelope.request.fun.clone());
                let _ = envelope
                    .reply
                    .send(ControlResponse::ok(envelope.request.fun.clone()));
            }
            seen
        });

        for fun in ["a", "b", "c"] {
            let response = client.call(ControlRequest::new(fun)).await;
            assert_eq!(response.message.as_deref(), Some(fun));
        }
        drop(client);
        assert_eq!(server.await.unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let (client, mut rx) = channel(8, Duration::from_secs(5));
        let server = tokio::spawn(async move {
            let mut max_pending = 0;
            while let Some(envelope) = rx.recv().await {
                max_pending = max_pending.max(rx.len() + 1);
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = envelope.reply.send(ControlResponse::ok("done"));
            }
            max_pending
        });

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.call(ControlRequest::new(format!("f{i}"))).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().success);
        }
        drop(client);
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, _rx) = channel(1, Duration::from_secs(30));
        let response = client.daemon(functions::DAEMON_STATUS).await;
        assert!(!response.success);
        assert_eq!(response.kind, Some(ErrorKind::ServerError));
    }

    #[tokio::test]
    async fn stopped_daemon_is_reported() {
        let (client, rx) = channel(1, Duration::from_secs(30));
        drop(rx);
        let response = client.daemon(functions::DAEMON_STATUS).await;
        assert!(response.message.unwrap().contains("not running"));
    }

    #[test]
    fn arguments_by_position_or_keyword() {
        let request = ControlRequest::new(functions::DELETE_TASK)
            .arg(5)
            .karg("remove_derived_task", false);
        assert_eq!(argument(&request, 0, "task_id"), Some(&Value::from(5)));
        assert_eq!(
            argument(&request, 3, "remove_derived_task"),
            Some(&Value::Bool(false))
        );
        assert_eq!(argument(&request, 1, "remove_from_scheduled_queue"), None);
    }
}

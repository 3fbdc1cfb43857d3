//! Command dispatch: send a request to an eligible instance and wait
//! for the correlated response.
//!
//! One waiter per command id, completed at most once. A waiter reaches
//! exactly one of four outcomes: the response arrives, the deadline
//! elapses, the instance leaves Active, or the caller's cancel signal
//! fires. Every exit path removes the waiter entry, including the
//! dispatch future being dropped outright (via the drop guard).
//! Dispatch never retries; retry policy belongs to the task manager.

use crate::error::DispatchError;
use crate::protocol::{CommandRequest, CommandResponse, CommandStatus, Envelope, Payload};
use crate::registry::{CommandReply, InstanceHandle, InstanceRegistry};
use crate::telemetry::Metrics;
use crate::{CommandId, TraceId};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Routes `CommandRequest`s and correlates their responses.
pub struct Dispatcher {
    registry: Arc<InstanceRegistry>,
}

/// Removes the waiter entry on every exit path, including the dispatch
/// future being dropped mid-await (e.g. the REST caller went away).
/// Removal after a completed waiter is a no-op.
struct WaiterGuard {
    handle: Arc<InstanceHandle>,
    command_id: CommandId,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.handle.remove_waiter(self.command_id);
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    /// Dispatch without an external cancel signal. Suspends until the
    /// response arrives, the deadline elapses, or the instance leaves
    /// Active.
    pub async fn dispatch(
        &self,
        bot_id: &str,
        capability: &str,
        command_name: &str,
        arguments: &serde_json::Value,
        trace_id: TraceId,
        deadline: Duration,
    ) -> Result<CommandResponse, DispatchError> {
        self.dispatch_cancellable(
            bot_id,
            capability,
            command_name,
            arguments,
            trace_id,
            deadline,
            CancellationToken::new(),
        )
        .await
    }

    /// Select an instance, enqueue the command, and suspend until one
    /// of: the response arrives, the deadline elapses, the instance
    /// leaves Active, or `cancel` fires (`Cancelled`).
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch_cancellable(
        &self,
        bot_id: &str,
        capability: &str,
        command_name: &str,
        arguments: &serde_json::Value,
        trace_id: TraceId,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<CommandResponse, DispatchError> {
        let handle = self
            .registry
            .select_by_capability(bot_id, capability)
            .ok_or(DispatchError::NoCapableInstance)?;

        let command_id = uuid::Uuid::new_v4();
        let waiter_rx = handle.register_waiter(command_id, command_name)?;
        let _guard = WaiterGuard {
            handle: handle.clone(),
            command_id,
        };

        let arguments = serde_json::to_vec(arguments).unwrap_or_default();
        let envelope = Envelope::derived(
            trace_id,
            Payload::CommandRequest(CommandRequest {
                command_id,
                command_name: command_name.to_string(),
                arguments,
            }),
        );

        tracing::debug!(
            trace_id = %trace_id,
            bot_id = %bot_id,
            instance_id = %handle.instance_id,
            command_id = %command_id,
            command_name = %command_name,
            "dispatching command"
        );

        // The guard removes the waiter on this early return.
        handle.enqueue(envelope).await?;

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            waited = tokio::time::timeout(deadline, waiter_rx) => match waited {
                Ok(Ok(CommandReply::Response(response))) => match response.status {
                    CommandStatus::Success => Ok(response),
                    CommandStatus::ExecutionError => Err(DispatchError::ExecutionError(
                        response.error.unwrap_or_else(|| "execution error".into()),
                    )),
                    CommandStatus::InvalidArguments => Err(DispatchError::InvalidArguments(
                        response.error.unwrap_or_else(|| "invalid arguments".into()),
                    )),
                },
                Ok(Ok(CommandReply::Gone(_reason))) => Err(DispatchError::InstanceGone),
                // Sender dropped without a reply: the session died without
                // a proper drain. Same contract as InstanceGone.
                Ok(Err(_)) => Err(DispatchError::InstanceGone),
                Err(_elapsed) => Err(DispatchError::Timeout),
            },
        };
        let elapsed = started.elapsed();
        Metrics::global()
            .command_latency_seconds
            .with_label_values(&[command_name])
            .observe(elapsed.as_secs_f64());

        match &outcome {
            Ok(_) => tracing::debug!(
                trace_id = %trace_id,
                command_id = %command_id,
                duration_ms = elapsed.as_millis() as u64,
                "command completed"
            ),
            Err(error) => tracing::debug!(
                trace_id = %trace_id,
                command_id = %command_id,
                %error,
                duration_ms = elapsed.as_millis() as u64,
                "command failed"
            ),
        }
        outcome
    }

    /// Hand an inbound response to its waiter. Late or duplicate
    /// correlations are dropped with a warning.
    pub fn deliver_response(
        &self,
        handle: &InstanceHandle,
        response: CommandResponse,
        trace_id: TraceId,
    ) {
        let command_id = response.command_id;
        if !handle.complete_waiter(response) {
            tracing::warn!(
                trace_id = %trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                command_id = %command_id,
                "dropping response with no pending waiter"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CloseReason, InstanceSpec};
    use tokio::sync::mpsc;

    fn registered_instance(
        registry: &InstanceRegistry,
        bot_id: &str,
        instance_id: &str,
    ) -> (Arc<InstanceHandle>, mpsc::Receiver<Envelope>) {
        let (outbound, outbound_rx) = mpsc::channel(8);
        let (handle, _) = registry
            .insert(InstanceSpec {
                bot_id: bot_id.into(),
                instance_id: instance_id.into(),
                capabilities: vec!["t.exec".into()],
                heartbeat_interval: Duration::from_secs(30),
                outbound,
            })
            .expect("insert");
        (handle, outbound_rx)
    }

    fn success_response(command_id: CommandId) -> CommandResponse {
        CommandResponse {
            command_id,
            status: CommandStatus::Success,
            result: Some(br#"{"y":2}"#.to_vec()),
            error: None,
        }
    }

    #[tokio::test]
    async fn dispatch_correlates_response_to_waiter() {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (handle, mut outbound_rx) = registered_instance(&registry, "b1", "i1");

        let agent = tokio::spawn(async move {
            let envelope = outbound_rx.recv().await.expect("command on the lane");
            let Payload::CommandRequest(request) = envelope.payload else {
                panic!("expected a command request");
            };
            (envelope.trace_id, request)
        });

        let trace_id = uuid::Uuid::new_v4();
        let payload = serde_json::json!({"x": 1});
        let dispatch = dispatcher.dispatch(
            "b1",
            "t.exec",
            "t.exec",
            &payload,
            trace_id,
            Duration::from_secs(5),
        );

        let deliver = async {
            let (wire_trace, request) = agent.await.expect("agent task");
            assert_eq!(wire_trace, trace_id, "trace id must ride the wire");
            dispatcher.deliver_response(&handle, success_response(request.command_id), trace_id);
        };

        let (result, ()) = tokio::join!(dispatch, deliver);
        let response = result.expect("dispatch should succeed");
        assert_eq!(response.result.as_deref(), Some(br#"{"y":2}"#.as_ref()));
    }

    #[tokio::test]
    async fn dispatch_without_instances_fails_fast() {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(registry);

        let result = dispatcher
            .dispatch(
                "b1",
                "t.exec",
                "t.exec",
                &serde_json::json!({}),
                uuid::Uuid::new_v4(),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result.unwrap_err(), DispatchError::NoCapableInstance);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out_and_drops_late_response() {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (handle, mut outbound_rx) = registered_instance(&registry, "b1", "i1");

        let result = dispatcher
            .dispatch(
                "b1",
                "t.exec",
                "t.exec",
                &serde_json::json!({}),
                uuid::Uuid::new_v4(),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(result.unwrap_err(), DispatchError::Timeout);

        // The waiter is gone, so the late response has nowhere to land.
        let envelope = outbound_rx.recv().await.expect("command was enqueued");
        let Payload::CommandRequest(request) = envelope.payload else {
            panic!("expected a command request");
        };
        assert!(!handle.complete_waiter(success_response(request.command_id)));
    }

    #[tokio::test]
    async fn cancel_signal_fails_dispatch_and_frees_the_waiter() {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (handle, mut outbound_rx) = registered_instance(&registry, "b1", "i1");

        let cancel = CancellationToken::new();
        let payload = serde_json::json!({});
        let dispatch = dispatcher.dispatch_cancellable(
            "b1",
            "t.exec",
            "t.exec",
            &payload,
            uuid::Uuid::new_v4(),
            Duration::from_secs(30),
            cancel.clone(),
        );
        let trigger = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(dispatch, trigger);
        assert_eq!(result.unwrap_err(), DispatchError::Cancelled);

        // The waiter entry is gone, so a response that arrives after the
        // cancellation has nowhere to land.
        let envelope = outbound_rx.recv().await.expect("command was enqueued");
        let Payload::CommandRequest(request) = envelope.payload else {
            panic!("expected a command request");
        };
        assert!(!handle.complete_waiter(success_response(request.command_id)));
    }

    #[tokio::test]
    async fn drain_fails_inflight_dispatch_with_instance_gone() {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (handle, _outbound_rx) = registered_instance(&registry, "b1", "i1");

        let payload = serde_json::json!({});
        let dispatch = dispatcher.dispatch(
            "b1",
            "t.exec",
            "t.exec",
            &payload,
            uuid::Uuid::new_v4(),
            Duration::from_secs(30),
        );
        let drain = async {
            tokio::task::yield_now().await;
            handle.begin_drain(CloseReason::HeartbeatMiss);
        };

        let (result, ()) = tokio::join!(dispatch, drain);
        assert_eq!(result.unwrap_err(), DispatchError::InstanceGone);
    }
}

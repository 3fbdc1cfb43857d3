//! Data-plane sessions: accept loop, handshake, reader/writer task
//! pair, heartbeat watchdog, and teardown.
//!
//! Each connection gets exactly one reader and one writer task joined
//! by the instance's outbound lane. The reader is the only caller of
//! the inbound transition function; the writer is the only consumer of
//! the lane, so the transport never needs a write lock. A session
//! leaving Active fails every waiter it owns before it is removed from
//! the registry.

use crate::core::Core;
use crate::credentials::AuthGrant;
use crate::error::DecodeError;
use crate::protocol::{
    Envelope, EnvelopeCodec, HandshakeRequest, HandshakeResponse, HandshakeStatus, Payload,
    ProtocolError,
};
use crate::registry::{CloseReason, InsertError, InstanceHandle, InstanceSpec};
use crate::telemetry::Metrics;
use crate::TraceId;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

/// Outbound lane capacity per session. Dispatch backpressures here if
/// an agent stops draining its socket.
const OUTBOUND_LANE_CAPACITY: usize = 256;

type WireSink = SplitSink<Framed<TcpStream, EnvelopeCodec>, Envelope>;
type WireStream = SplitStream<Framed<TcpStream, EnvelopeCodec>>;

/// Bind the data-plane listener and serve connections until shutdown.
pub async fn run_listener(
    core: Arc<Core>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(core.config.listen_address).await?;
    tracing::info!(address = %core.config.listen_address, "data-plane listener started");
    serve_connections(core, listener, shutdown_rx).await;
    Ok(())
}

/// Accept loop over an already-bound listener.
pub async fn serve_connections(
    core: Arc<Core>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let conn_shutdown_rx = shutdown_rx.clone();
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let core = core.clone();
                    tokio::spawn(async move {
                        handle_connection(core, stream, peer, conn_shutdown_rx).await;
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to accept data-plane connection");
                }
            },
            _ = wait_for_stop(&mut shutdown_rx) => {
                tracing::info!("data-plane listener stopping");
                return;
            }
        }
    }
}

/// Awaits shutdown without holding the watch guard across the
/// `select!`, which would otherwise make the enclosing future non-`Send`.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Awaits the close signal without holding the watch guard across the
/// `select!`, which would otherwise make the enclosing future non-`Send`.
async fn wait_for_close(rx: &mut watch::Receiver<Option<CloseReason>>) -> Option<CloseReason> {
    match rx.wait_for(|reason| reason.is_some()).await {
        Ok(guard) => *guard,
        Err(_) => None,
    }
}

async fn handle_connection(
    core: Arc<Core>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    let handshake_started = tokio::time::Instant::now();

    // HandshakePending: exactly one HandshakeRequest is accepted, and
    // nothing else.
    let Some((request, trace_id)) = await_handshake(&core, &mut framed, peer).await else {
        return;
    };

    let grant = match core
        .credentials
        .authenticate(&request.bot_id, &request.auth_token)
        .await
    {
        Ok(grant) => grant,
        Err(error) => {
            Metrics::global()
                .handshakes_total
                .with_label_values(&["auth_failed"])
                .inc();
            tracing::warn!(
                trace_id = %trace_id,
                bot_id = %request.bot_id,
                instance_id = %request.instance_id,
                %error,
                "handshake rejected"
            );
            let response = Envelope::derived(
                trace_id,
                Payload::HandshakeResponse(HandshakeResponse {
                    status: HandshakeStatus::AuthFailed,
                    heartbeat_interval_secs: 0,
                    issued_api_key: None,
                    message: Some(error.to_string()),
                }),
            );
            let _ = framed.send(response).await;
            return;
        }
    };

    let issued_api_key = match grant {
        AuthGrant::LongLived => None,
        AuthGrant::Minted { issued_api_key } => Some(issued_api_key),
    };

    // The success response goes onto the lane before the instance is
    // visible to the dispatcher, so it is always the first frame out.
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_LANE_CAPACITY);
    let response = Envelope::derived(
        trace_id,
        Payload::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Success,
            heartbeat_interval_secs: core.config.heartbeat_interval.as_secs(),
            issued_api_key,
            message: None,
        }),
    );
    let _ = outbound_tx.send(response).await;

    let insert = core.registry.insert(InstanceSpec {
        bot_id: request.bot_id.as_str().into(),
        instance_id: request.instance_id.as_str().into(),
        capabilities: request.capabilities.clone(),
        heartbeat_interval: core.config.heartbeat_interval,
        outbound: outbound_tx,
    });
    let (handle, displaced) = match insert {
        Ok(registered) => registered,
        Err(InsertError::InstanceIdInUse) => {
            Metrics::global()
                .handshakes_total
                .with_label_values(&["conflict"])
                .inc();
            let error = Envelope::derived(
                trace_id,
                Payload::Error(ProtocolError {
                    code: "instance_conflict".into(),
                    message: "instance id is claimed by a different bot".into(),
                }),
            );
            let _ = framed.send(error).await;
            return;
        }
    };

    if let Some(previous) = displaced {
        tracing::info!(
            trace_id = %trace_id,
            bot_id = %handle.bot_id,
            instance_id = %handle.instance_id,
            "reconnect displaces previous session"
        );
        previous.begin_drain(CloseReason::Superseded);
    }

    Metrics::global()
        .handshakes_total
        .with_label_values(&["success"])
        .inc();
    Metrics::global()
        .handshake_duration_seconds
        .observe(handshake_started.elapsed().as_secs_f64());
    tracing::info!(
        trace_id = %trace_id,
        bot_id = %handle.bot_id,
        instance_id = %handle.instance_id,
        capabilities = ?handle.capabilities,
        "instance active"
    );

    let (sink, stream) = framed.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, handle.close_signal()));

    let reason = read_loop(&core, &handle, stream, shutdown_rx).await;
    handle.begin_drain(reason);

    // Draining: give the writer the drain window to flush the lane.
    if tokio::time::timeout(core.config.drain_timeout, &mut writer)
        .await
        .is_err()
    {
        tracing::warn!(
            bot_id = %handle.bot_id,
            instance_id = %handle.instance_id,
            "write lane failed to flush within the drain window"
        );
        writer.abort();
    }

    core.registry.remove(&handle);
    handle.mark_closed();
    tracing::info!(
        bot_id = %handle.bot_id,
        instance_id = %handle.instance_id,
        reason = reason.as_str(),
        "session closed"
    );
}

/// Wait for the first frame and require it to be a handshake request.
async fn await_handshake(
    core: &Core,
    framed: &mut Framed<TcpStream, EnvelopeCodec>,
    peer: SocketAddr,
) -> Option<(HandshakeRequest, TraceId)> {
    let envelope = match tokio::time::timeout(core.config.handshake_timeout, framed.next()).await {
        Err(_elapsed) => {
            Metrics::global()
                .handshakes_total
                .with_label_values(&["timeout"])
                .inc();
            tracing::info!(%peer, "handshake timeout, closing without response");
            return None;
        }
        Ok(None) => return None,
        Ok(Some(Err(DecodeError::UnsupportedVersion(version)))) => {
            tracing::warn!(%peer, version, "unsupported schema version");
            let error = Envelope::new(Payload::Error(ProtocolError {
                code: "unsupported_version".into(),
                message: format!("schema version {version} is not supported"),
            }));
            let _ = framed.send(error).await;
            return None;
        }
        Ok(Some(Err(error))) => {
            tracing::warn!(%peer, %error, "undecodable first frame");
            return None;
        }
        Ok(Some(Ok(envelope))) => envelope,
    };

    Metrics::global()
        .envelopes_total
        .with_label_values(&[envelope.kind(), "received"])
        .inc();

    match envelope.payload {
        Payload::HandshakeRequest(request) => Some((request, envelope.trace_id)),
        other => {
            Metrics::global()
                .handshakes_total
                .with_label_values(&["bad_handshake"])
                .inc();
            tracing::warn!(%peer, kind = other.kind(), "non-handshake frame before authentication");
            let error = Envelope::derived(
                envelope.trace_id,
                Payload::Error(ProtocolError {
                    code: "bad_handshake".into(),
                    message: "first frame must be a handshake request".into(),
                }),
            );
            let _ = framed.send(error).await;
            None
        }
    }
}

/// Sole consumer of the outbound lane. Exits on transport failure or
/// once the close signal is raised and the buffered frames are flushed.
async fn write_loop(
    mut sink: WireSink,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    mut close_rx: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => match maybe {
                Some(envelope) => {
                    Metrics::global()
                        .envelopes_total
                        .with_label_values(&[envelope.kind(), "sent"])
                        .inc();
                    if sink.send(envelope).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = wait_for_close(&mut close_rx) => break,
        }
    }

    // Drain what was already enqueued, then flush.
    while let Ok(envelope) = outbound_rx.try_recv() {
        Metrics::global()
            .envelopes_total
            .with_label_values(&[envelope.kind(), "sent"])
            .inc();
        if sink.send(envelope).await.is_err() {
            return;
        }
    }
    let _ = sink.flush().await;
    let _ = sink.close().await;
}

/// Sole caller of the inbound transition function. Returns the reason
/// the session leaves Active.
async fn read_loop(
    core: &Core,
    handle: &Arc<InstanceHandle>,
    mut stream: WireStream,
    mut shutdown_rx: watch::Receiver<bool>,
) -> CloseReason {
    let mut close_rx = handle.close_signal();
    let mut watchdog = tokio::time::interval(handle.heartbeat_interval);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let miss_window = core.config.heartbeat_miss_window();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                None => return CloseReason::Transport,
                Some(Err(error)) => {
                    tracing::warn!(
                        bot_id = %handle.bot_id,
                        instance_id = %handle.instance_id,
                        %error,
                        "closing session on decode failure"
                    );
                    return CloseReason::Protocol;
                }
                Some(Ok(envelope)) => {
                    if let Some(reason) = handle_inbound(core, handle, envelope).await {
                        return reason;
                    }
                }
            },
            _ = watchdog.tick() => {
                if handle.heartbeat_expired(miss_window) {
                    Metrics::global().heartbeat_miss_total.inc();
                    tracing::warn!(
                        bot_id = %handle.bot_id,
                        instance_id = %handle.instance_id,
                        last_heartbeat_at = %handle.last_heartbeat_at(),
                        "heartbeat window elapsed"
                    );
                    return CloseReason::HeartbeatMiss;
                }
            },
            reason = wait_for_close(&mut close_rx) => {
                return reason.unwrap_or(CloseReason::AdminClose);
            },
            _ = wait_for_stop(&mut shutdown_rx) => return CloseReason::Shutdown,
        }
    }
}

/// Inbound transitions for an Active session. `Some(reason)` closes the
/// session.
async fn handle_inbound(
    core: &Core,
    handle: &Arc<InstanceHandle>,
    envelope: Envelope,
) -> Option<CloseReason> {
    let trace_id = envelope.trace_id;
    let kind = envelope.kind();
    Metrics::global()
        .envelopes_total
        .with_label_values(&[kind, "received"])
        .inc();

    match envelope.payload {
        Payload::Heartbeat => {
            handle.touch_heartbeat();
            tracing::trace!(
                trace_id = %trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                "heartbeat"
            );
            None
        }
        Payload::CommandResponse(response) => {
            core.dispatcher.deliver_response(handle, response, trace_id);
            None
        }
        Payload::Event(event) => {
            tracing::info!(
                trace_id = %trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                event_name = %event.event_name,
                payload_len = event.payload.len(),
                "agent event"
            );
            None
        }
        Payload::Error(error) => {
            tracing::warn!(
                trace_id = %trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                code = %error.code,
                message = %error.message,
                "error frame from agent"
            );
            None
        }
        Payload::HandshakeRequest(_) => {
            let error = Envelope::derived(
                trace_id,
                Payload::Error(ProtocolError {
                    code: "bad_handshake".into(),
                    message: "handshake already completed".into(),
                }),
            );
            let _ = handle.enqueue(error).await;
            Some(CloseReason::Protocol)
        }
        Payload::HandshakeResponse(_) | Payload::CommandRequest(_) => {
            tracing::warn!(
                trace_id = %trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                kind,
                "dropping unexpected frame kind"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::DefinitionSpec;
    use crate::protocol::{CommandResponse, CommandStatus};
    use std::time::Duration;

    fn test_config(heartbeat_interval: Duration) -> Config {
        Config {
            listen_address: "127.0.0.1:0".parse().expect("addr"),
            admin_address: "127.0.0.1:0".parse().expect("addr"),
            metrics_address: None,
            admin_token: "test-admin-token".into(),
            heartbeat_interval,
            heartbeat_grace_factor: 3,
            handshake_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
            dispatch_default_deadline: Duration::from_secs(5),
            task_max_retries: 3,
            state_store_url: None,
        }
    }

    async fn start_core(heartbeat_interval: Duration) -> (Arc<Core>, SocketAddr, watch::Sender<bool>) {
        let core = Core::new(test_config(heartbeat_interval))
            .await
            .expect("core should build");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve_connections(core.clone(), listener, shutdown_rx));
        (core, address, shutdown_tx)
    }

    async fn register_bot(core: &Core) -> (String, String) {
        let minted = core
            .credentials
            .create_definition(DefinitionSpec {
                name: "b1".into(),
                description: String::new(),
                adapter_type: "demo".into(),
                capabilities: vec!["t.exec".into()],
                configuration: serde_json::json!({}),
            })
            .await
            .expect("definition");
        (minted.definition.bot_id, minted.one_time_token)
    }

    async fn connect(address: SocketAddr) -> Framed<TcpStream, EnvelopeCodec> {
        let stream = TcpStream::connect(address).await.expect("connect");
        Framed::new(stream, EnvelopeCodec::new())
    }

    fn handshake(bot_id: &str, instance_id: &str, token: &str) -> Envelope {
        Envelope::new(Payload::HandshakeRequest(HandshakeRequest {
            bot_id: bot_id.into(),
            instance_id: instance_id.into(),
            auth_token: token.into(),
            capabilities: vec!["t.exec".into()],
        }))
    }

    async fn expect_handshake_response(
        framed: &mut Framed<TcpStream, EnvelopeCodec>,
    ) -> HandshakeResponse {
        let envelope = framed
            .next()
            .await
            .expect("a frame")
            .expect("frame decodes");
        match envelope.payload {
            Payload::HandshakeResponse(response) => response,
            other => panic!("expected handshake response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn onboarding_mints_key_once_and_rejects_replay() {
        let (core, address, _shutdown) = start_core(Duration::from_secs(30)).await;
        let (bot_id, token) = register_bot(&core).await;

        // First connect consumes the one-time token and carries the key.
        let mut first = connect(address).await;
        first
            .send(handshake(&bot_id, "i1", &token))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut first).await;
        assert_eq!(response.status, HandshakeStatus::Success);
        assert_eq!(response.heartbeat_interval_secs, 30);
        let issued_api_key = response.issued_api_key.expect("key is issued exactly once");

        // Replaying the consumed token fails.
        let mut replay = connect(address).await;
        replay
            .send(handshake(&bot_id, "i2", &token))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut replay).await;
        assert_eq!(response.status, HandshakeStatus::AuthFailed);

        // The minted key authenticates, and no new key is issued.
        let mut second = connect(address).await;
        second
            .send(handshake(&bot_id, "i2", &issued_api_key))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut second).await;
        assert_eq!(response.status, HandshakeStatus::Success);
        assert!(response.issued_api_key.is_none());

        assert_eq!(core.registry.len(), 2);
    }

    #[tokio::test]
    async fn non_handshake_first_frame_is_rejected() {
        let (_core, address, _shutdown) = start_core(Duration::from_secs(30)).await;

        let mut framed = connect(address).await;
        framed
            .send(Envelope::new(Payload::Heartbeat))
            .await
            .expect("send heartbeat");

        let envelope = framed
            .next()
            .await
            .expect("a frame")
            .expect("frame decodes");
        match envelope.payload {
            Payload::Error(error) => assert_eq!(error.code, "bad_handshake"),
            other => panic!("expected error frame, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn dispatch_round_trips_through_a_live_session() {
        let (core, address, _shutdown) = start_core(Duration::from_secs(30)).await;
        let (bot_id, token) = register_bot(&core).await;

        let mut agent = connect(address).await;
        agent
            .send(handshake(&bot_id, "i1", &token))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut agent).await;
        assert_eq!(response.status, HandshakeStatus::Success);

        let trace_id = uuid::Uuid::new_v4();
        let payload = serde_json::json!({"x": 1});
        let dispatch = core.dispatcher.dispatch(
            &bot_id,
            "t.exec",
            "t.exec",
            &payload,
            trace_id,
            Duration::from_secs(5),
        );

        let serve_agent = async {
            let envelope = agent
                .next()
                .await
                .expect("command frame")
                .expect("frame decodes");
            assert_eq!(envelope.trace_id, trace_id);
            let Payload::CommandRequest(request) = envelope.payload else {
                panic!("expected command request");
            };
            assert_eq!(request.command_name, "t.exec");

            let reply = Envelope::derived(
                envelope.trace_id,
                Payload::CommandResponse(CommandResponse {
                    command_id: request.command_id,
                    status: CommandStatus::Success,
                    result: Some(br#"{"y":2}"#.to_vec()),
                    error: None,
                }),
            );
            agent.send(reply).await.expect("send response");
        };

        let (dispatched, ()) = tokio::join!(dispatch, serve_agent);
        let response = dispatched.expect("dispatch succeeds");
        assert_eq!(response.result.as_deref(), Some(br#"{"y":2}"#.as_ref()));
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_session() {
        let (core, address, _shutdown) = start_core(Duration::from_secs(30)).await;
        let (bot_id, token) = register_bot(&core).await;

        let mut first = connect(address).await;
        first
            .send(handshake(&bot_id, "i1", &token))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut first).await;
        let issued_api_key = response.issued_api_key.expect("minted key");

        let mut second = connect(address).await;
        second
            .send(handshake(&bot_id, "i1", &issued_api_key))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut second).await;
        assert_eq!(response.status, HandshakeStatus::Success);

        // The first connection is closed out from under the agent.
        let closed = tokio::time::timeout(Duration::from_secs(5), first.next())
            .await
            .expect("first session should close");
        assert!(closed.is_none(), "expected EOF on the displaced session");

        // Exactly one registry entry survives the displacement.
        assert_eq!(core.registry.len(), 1);
        let survivor = core.registry.get("i1").expect("replacement registered");
        assert_eq!(survivor.bot_id.as_ref(), bot_id.as_str());
    }

    #[tokio::test]
    async fn heartbeat_miss_drains_the_session() {
        let (core, address, _shutdown) = start_core(Duration::from_millis(100)).await;
        let (bot_id, token) = register_bot(&core).await;

        let mut agent = connect(address).await;
        agent
            .send(handshake(&bot_id, "i1", &token))
            .await
            .expect("send handshake");
        let response = expect_handshake_response(&mut agent).await;
        assert_eq!(response.status, HandshakeStatus::Success);
        assert_eq!(core.registry.len(), 1);

        // No heartbeats: the watchdog fires once 3 intervals elapse.
        let closed = tokio::time::timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("session should close on heartbeat miss");
        assert!(closed.is_none(), "expected EOF after heartbeat miss");

        // The instance disappears from the registry.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !core.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("instance should be removed");
    }
}

//! Per-connection protocol dispatcher.
//!
//! A connection moves `Connecting → Active → Closing → Closed`. While
//! active, inbound frames are handled one at a time in arrival order:
//!
//! - `init` replies with the source's tables and the offered intervals
//! - `run_query` replaces the session's query set
//! - unknown actions are logged and ignored
//! - malformed frames get an `error` reply; the connection stays open
//!
//! Any exit from the active state (peer close, read error, failed write,
//! server shutdown) runs the same teardown: close the session, remove it
//! from the registry, then let the relay drain and close the transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use logzy_core::{DataSource, InboundAction, OutboundMessage, SessionId};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionReader, ConnectionWriter, Frame};
use crate::errors::ConnectionError;
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_REJECTED_TOTAL};
use crate::registry::SessionRegistry;
use crate::relay::{Outbound, OutboundSender, RelayExit, run_relay};
use crate::session::ClientSession;

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, session not yet registered.
    Connecting,
    /// Session registered, frames being handled.
    Active,
    /// Tearing down.
    Closing,
    /// Done.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading from the transport failed.
    ReadFailed(ConnectionError),
    /// Writing to the transport failed.
    WriteFailed(ConnectionError),
    /// The server is shutting down.
    Shutdown,
    /// The registry refused the session.
    Rejected,
}

/// Result of [`run_connection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// The session that served the connection, if one was created.
    pub session_id: Option<SessionId>,
    /// Why the connection ended.
    pub reason: CloseReason,
}

/// Shared state every connection needs.
#[derive(Clone)]
pub struct DispatchContext {
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Data source, for `init`.
    pub source: Arc<dyn DataSource>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

struct StateTracker {
    state: ConnectionState,
}

impl StateTracker {
    fn advance(&mut self, next: ConnectionState) {
        debug!(from = %self.state, to = %next, "connection state");
        self.state = next;
    }
}

/// Serve one connection until it closes.
#[instrument(skip_all, fields(session_id))]
pub async fn run_connection<R, W>(mut reader: R, mut writer: W, ctx: DispatchContext) -> ConnectionSummary
where
    R: ConnectionReader,
    W: ConnectionWriter + 'static,
{
    let mut state = StateTracker {
        state: ConnectionState::Connecting,
    };

    let (emit, queue) = mpsc::channel(ctx.config.outbound_queue);
    let session = match ctx.registry.create_session(emit.clone()) {
        Ok(session) => session,
        Err(e) => {
            counter!(WS_REJECTED_TOTAL).increment(1);
            warn!(error = %e, "rejecting connection");
            if let Ok(text) = OutboundMessage::error(e.to_string()).to_json() {
                let _ = writer.send_text(text).await;
            }
            writer.close().await;
            state.advance(ConnectionState::Closed);
            return ConnectionSummary {
                session_id: None,
                reason: CloseReason::Rejected,
            };
        }
    };
    let session_id = session.id();
    let _ = Span::current().record("session_id", tracing::field::display(session_id));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!("client connected");

    let stop = CancellationToken::new();
    let mut relay: JoinHandle<RelayExit> = tokio::spawn(run_relay(
        writer,
        queue,
        session.clone(),
        stop.clone(),
        ctx.config.heartbeat_interval,
    ));
    let mut relay_done = false;
    state.advance(ConnectionState::Active);

    let reason = loop {
        tokio::select! {
            frame = reader.receive() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    session.touch();
                    handle_text(&text, &session, &emit, &ctx).await;
                }
                Some(Ok(Frame::Keepalive)) => session.touch(),
                Some(Err(e)) => break CloseReason::ReadFailed(e),
                None => break CloseReason::PeerClosed,
            },
            exit = &mut relay => {
                relay_done = true;
                match exit {
                    Ok(RelayExit::WriteFailed(e)) => break CloseReason::WriteFailed(e),
                    Ok(RelayExit::QueueClosed) => break CloseReason::WriteFailed(ConnectionError::Closed),
                    Ok(RelayExit::Stopped) => break CloseReason::PeerClosed,
                    Err(e) => {
                        warn!(error = %e, "relay task failed");
                        break CloseReason::WriteFailed(ConnectionError::Transport(format!(
                            "relay task failed: {e}"
                        )));
                    }
                }
            }
            () = ctx.shutdown.cancelled() => break CloseReason::Shutdown,
        }
    };

    state.advance(ConnectionState::Closing);
    let _ = session.close().await;
    let _ = ctx.registry.remove(session_id);
    drop(emit);
    stop.cancel();
    if !relay_done && tokio::time::timeout(ctx.config.drain_timeout, &mut relay).await.is_err() {
        warn!("outbound queue did not drain in time");
        relay.abort();
    }
    state.advance(ConnectionState::Closed);

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    info!(reason = ?reason, "client disconnected");
    ConnectionSummary {
        session_id: Some(session_id),
        reason,
    }
}

async fn handle_text(text: &str, session: &ClientSession, emit: &OutboundSender, ctx: &DispatchContext) {
    let action = match InboundAction::parse(text, ctx.config.default_fetch_interval_secs) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "malformed frame");
            reply(emit, OutboundMessage::error(e.to_string())).await;
            return;
        }
    };
    debug!(action = action.name(), "dispatching");

    match action {
        InboundAction::Init => match ctx.source.list_tables().await {
            Ok(tables) => {
                reply(
                    emit,
                    OutboundMessage::init_reply(tables, ctx.config.fetch_intervals.clone()),
                )
                .await;
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "listing tables failed");
                reply(emit, OutboundMessage::error(e.to_string())).await;
            }
        },
        InboundAction::RunQuery { queries } => {
            match session.start_query_runners(queries).await {
                Ok(started) => debug!(started, "query set started"),
                Err(e) => {
                    warn!(error = %e, "run_query rejected");
                    reply(emit, OutboundMessage::error(e.to_string())).await;
                }
            }
        }
        InboundAction::Unknown(name) => warn!(action = %name, "ignoring unknown action"),
    }
}

async fn reply(emit: &OutboundSender, message: OutboundMessage) {
    if emit.send(Outbound::Reply(message)).await.is_err() {
        debug!("outbound queue closed, reply dropped");
    }
}

/// Give connections up to `grace` to tear down on their own, then close
/// whatever sessions remain.
pub async fn drain_connections(registry: &SessionRegistry, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    while registry.count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    registry.close_all().await
}

#[cfg(test)]
mod tests {
    use logzy_core::{Row, SourceError};
    use logzy_source::MemorySource;
    use serde_json::{Value, json};

    use super::*;
    use crate::connection::testing::{self, TestClient};
    use crate::session::SessionConfig;

    const WAIT: Duration = Duration::from_secs(1);

    fn source() -> Arc<MemorySource> {
        let mut row = Row::new();
        let _ = row.insert("level".into(), json!("warn"));
        let _ = row.insert("log".into(), json!("disk almost full"));
        Arc::new(
            MemorySource::new()
                .with_table("logs", vec![row.clone()])
                .with_table("events", vec![row]),
        )
    }

    fn context(source: Arc<MemorySource>, max_sessions: usize) -> DispatchContext {
        let config = ServerConfig {
            max_connections: max_sessions,
            ..ServerConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(
            source.clone(),
            SessionConfig {
                cancel_ack_timeout: config.cancel_ack_timeout,
            },
            max_sessions,
        ));
        DispatchContext {
            registry,
            source,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    fn run_query(table: &str, interval: u16) -> String {
        json!({
            "action": "run_query",
            "payload": {"queries": [{"table": table, "fetch_interval": interval}]}
        })
        .to_string()
    }

    async fn recv_action(client: &mut TestClient, action: &str) -> Value {
        loop {
            let frame = client.recv_within(WAIT).await.expect("no frame");
            if frame["action"] == action {
                return frame;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streams_results_until_disconnect() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        tokio::time::sleep(Duration::from_secs(12)).await;

        let session = registry.get(SessionId::from_raw(1)).unwrap();
        let tokens = session.task_tokens().await;
        assert_eq!(tokens.len(), 1);

        client.disconnect();
        assert!(tokio::time::timeout(WAIT, tokens[0].cancelled()).await.is_ok());

        let summary = conn.await.unwrap();
        assert_eq!(summary.session_id, Some(SessionId::from_raw(1)));
        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert_eq!(registry.count(), 0);
        assert!(session.is_closed());
        assert!(client.is_closed());

        let results: Vec<_> = client
            .drain()
            .into_iter()
            .filter(|f| f["action"] == "query_result")
            .collect();
        assert!((2..=3).contains(&results.len()), "got {}", results.len());
        assert!(results.iter().all(|r| r["table"] == "logs"));
        assert_eq!(results[0]["results"][0]["level"], "warn");
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_stops_old_output() {
        let ctx = context(source(), 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("events", 1));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        client.send(&run_query("logs", 1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        client.disconnect();
        let _ = conn.await.unwrap();

        let tables: Vec<String> = client
            .drain()
            .into_iter()
            .filter(|f| f["action"] == "query_result")
            .map(|f| f["table"].as_str().unwrap().to_owned())
            .collect();
        let first_logs = tables.iter().position(|t| t == "logs").expect("no logs output");
        assert!(first_logs > 0);
        assert!(tables[first_logs..].iter().all(|t| t == "logs"));
    }

    #[tokio::test]
    async fn init_lists_tables_and_intervals() {
        let ctx = context(source(), 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        let reply = client.recv_within(WAIT).await.unwrap();
        assert_eq!(reply["action"], "init");
        assert_eq!(reply["payload"]["tables"], json!(["events", "logs"]));
        assert_eq!(reply["payload"]["fetch_intervals"], json!([5, 10, 15, 30, 60, 120, 240]));

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_action_is_ignored() {
        let ctx = context(source(), 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(r#"{"action":"refresh","payload":{}}"#);
        client.send(&run_query("logs", 5));
        let reply = client.recv_within(WAIT).await.unwrap();
        assert_eq!(reply["action"], "init");

        client.disconnect();
        assert_eq!(conn.await.unwrap().reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_connection_survives() {
        let ctx = context(source(), 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send("{not json");
        let error = client.recv_within(WAIT).await.unwrap();
        assert_eq!(error["action"], "error");
        assert!(error["payload"]["message"].as_str().unwrap().contains("invalid JSON"));

        client.send(r#"{"payload":{}}"#);
        let error = client.recv_within(WAIT).await.unwrap();
        assert_eq!(error["payload"]["message"], "missing action field");

        client.send(&run_query("logs", 5));
        assert_eq!(client.recv_within(WAIT).await.unwrap()["action"], "init");

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_query_keeps_running_set() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 60));
        let _ = recv_action(&mut client, "query_result").await;

        client.send(&run_query("events", 0));
        let error = recv_action(&mut client, "error").await;
        assert_eq!(
            error["payload"]["message"],
            "query 0 is invalid: fetch interval must be greater than zero"
        );

        let session = registry.get(SessionId::from_raw(1)).unwrap();
        assert_eq!(session.active_specs().await[0].table, "logs");
        assert_eq!(session.generation(), 1);

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn missing_interval_uses_default() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(r#"{"action":"run_query","payload":{"queries":[{"table":"logs","fetch_interval":null}]}}"#);
        let _ = recv_action(&mut client, "query_result").await;
        let session = registry.get(SessionId::from_raw(1)).unwrap();
        assert_eq!(session.active_specs().await[0].fetch_interval_secs, 5);

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn init_failure_is_reported() {
        let source = source();
        source.set_unavailable(true);
        let ctx = context(source, 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        let error = client.recv_within(WAIT).await.unwrap();
        assert_eq!(error["action"], "error");

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_errors_do_not_end_the_stream() {
        let source = source();
        source.fail_next(SourceError::Query("timeout".into()));
        let ctx = context(source.clone(), 16);
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 1));
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            recv_action(&mut client, "query_result"),
        )
        .await;
        assert!(result.is_ok());
        assert!(source.fetch_count() >= 2);

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn capacity_rejects_connection() {
        let ctx = context(source(), 1);
        let (mut first, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx.clone()));
        first.send(r#"{"action":"init"}"#);
        let _ = first.recv_within(WAIT).await.unwrap();

        let (mut second, reader, writer) = testing::pair();
        let summary = run_connection(reader, writer, ctx.clone()).await;
        assert_eq!(summary.reason, CloseReason::Rejected);
        assert_eq!(summary.session_id, None);
        assert_eq!(second.recv_within(WAIT).await.unwrap()["action"], "error");
        assert!(second.is_closed());
        assert_eq!(ctx.registry.count(), 1);

        first.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn read_error_tears_down() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        client.send_error();
        let summary = conn.await.unwrap();
        assert_eq!(
            summary.reason,
            CloseReason::ReadFailed(ConnectionError::Transport("reset".into()))
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn write_failure_tears_down() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer.failing(), ctx));

        client.send(&run_query("logs", 5));
        let summary = tokio::time::timeout(WAIT, conn).await.unwrap().unwrap();
        assert_eq!(
            summary.reason,
            CloseReason::WriteFailed(ConnectionError::Transport("broken pipe".into()))
        );
        assert_eq!(registry.count(), 0);
        drop(client);
    }

    struct PanickingWriter;

    #[async_trait::async_trait]
    impl ConnectionWriter for PanickingWriter {
        async fn send_text(&mut self, _text: String) -> Result<(), ConnectionError> {
            panic!("writer exploded");
        }

        async fn ping(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn relay_panic_is_reported_as_write_failure() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (client, reader, _writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, PanickingWriter, ctx));

        client.send(&run_query("logs", 5));
        let summary = tokio::time::timeout(WAIT, conn).await.unwrap().unwrap();
        assert_matches::assert_matches!(
            summary.reason,
            CloseReason::WriteFailed(ConnectionError::Transport(m)) if m.contains("relay task failed")
        );
        assert_eq!(registry.count(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn shutdown_closes_connection() {
        let ctx = context(source(), 16);
        let shutdown = ctx.shutdown.clone();
        let registry = ctx.registry.clone();
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        let _ = client.recv_within(WAIT).await.unwrap();
        shutdown.cancel();

        assert_eq!(conn.await.unwrap().reason, CloseReason::Shutdown);
        assert_eq!(registry.count(), 0);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn keepalive_refreshes_session() {
        let ctx = context(source(), 16);
        let registry = ctx.registry.clone();
        let (mut client, reader, writer) = testing::pair();
        let conn = tokio::spawn(run_connection(reader, writer, ctx));

        client.send(&run_query("logs", 5));
        let _ = client.recv_within(WAIT).await.unwrap();
        let session = registry.get(SessionId::from_raw(1)).unwrap();
        let before = session.last_keepalive_at();

        tokio::time::sleep(Duration::from_millis(5)).await;
        client.send_keepalive();
        client.send(&run_query("logs", 5));
        let _ = client.recv_within(WAIT).await.unwrap();
        assert!(session.last_keepalive_at() > before);

        client.disconnect();
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn drain_with_no_connections_returns_immediately() {
        let ctx = context(source(), 16);
        assert_eq!(drain_connections(&ctx.registry, Duration::from_secs(5)).await, 0);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}

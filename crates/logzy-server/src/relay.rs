//! Outbound relay: the single writer for a connection.
//!
//! Replies and result batches from every query task funnel through one
//! bounded queue; the relay drains it onto the transport so frames are never
//! interleaved. Batches stamped with an older query-set generation than the
//! session's current one are dropped here, which keeps output from a
//! replaced query set off the wire even if it was queued before replacement.

use std::sync::Arc;
use std::time::Duration;

use logzy_core::{OutboundMessage, ResultBatch};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionWriter;
use crate::errors::ConnectionError;
use crate::metrics::{QUERY_BATCHES_RELAYED_TOTAL, QUERY_BATCHES_STALE_TOTAL};
use crate::session::ClientSession;

/// An item on a connection's outbound queue.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// A protocol reply; always delivered.
    Reply(OutboundMessage),
    /// A query result, delivered only while `generation` is current.
    Batch {
        /// Query-set generation of the producing task.
        generation: u64,
        /// The rows.
        batch: ResultBatch,
    },
}

/// Producer side of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Why the relay stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayExit {
    /// Stop was requested; the queue was drained first.
    Stopped,
    /// Every producer is gone.
    QueueClosed,
    /// The transport rejected a write.
    WriteFailed(ConnectionError),
}

/// Drain `queue` onto `writer` until stopped or the transport fails.
///
/// Pings the peer every `heartbeat`; a zero `heartbeat` disables pings. On
/// stop, whatever is already queued is written before the connection is
/// closed.
pub async fn run_relay<W: ConnectionWriter>(
    mut writer: W,
    mut queue: mpsc::Receiver<Outbound>,
    session: Arc<ClientSession>,
    stop: CancellationToken,
    heartbeat: Duration,
) -> RelayExit {
    let pings_enabled = !heartbeat.is_zero();
    // interval() rejects a zero period; the branch below is disabled then.
    let mut ping = tokio::time::interval(if pings_enabled {
        heartbeat
    } else {
        Duration::from_secs(3600)
    });
    let _ = ping.tick().await;

    let exit = loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                break drain(&mut writer, &mut queue, &session).await;
            }
            item = queue.recv() => match item {
                Some(item) => {
                    if let Err(e) = write(&mut writer, item, &session).await {
                        break RelayExit::WriteFailed(e);
                    }
                }
                None => break RelayExit::QueueClosed,
            },
            _ = ping.tick(), if pings_enabled => {
                if let Err(e) = writer.ping().await {
                    break RelayExit::WriteFailed(e);
                }
            }
        }
    };

    match &exit {
        RelayExit::WriteFailed(e) => warn!(session_id = %session.id(), error = %e, "outbound write failed"),
        other => debug!(session_id = %session.id(), exit = ?other, "relay stopped"),
    }
    writer.close().await;
    exit
}

async fn drain<W: ConnectionWriter>(
    writer: &mut W,
    queue: &mut mpsc::Receiver<Outbound>,
    session: &ClientSession,
) -> RelayExit {
    queue.close();
    while let Some(item) = queue.recv().await {
        if let Err(e) = write(writer, item, session).await {
            return RelayExit::WriteFailed(e);
        }
    }
    RelayExit::Stopped
}

async fn write<W: ConnectionWriter>(
    writer: &mut W,
    item: Outbound,
    session: &ClientSession,
) -> Result<(), ConnectionError> {
    let message = match item {
        Outbound::Reply(message) => message,
        Outbound::Batch { generation, batch } => {
            if generation != session.generation() {
                counter!(QUERY_BATCHES_STALE_TOTAL).increment(1);
                debug!(generation, table = %batch.table, "dropping batch from replaced query set");
                return Ok(());
            }
            counter!(QUERY_BATCHES_RELAYED_TOTAL).increment(1);
            OutboundMessage::from(batch)
        }
    };

    match message.to_json() {
        Ok(text) => writer.send_text(text).await,
        Err(e) => {
            warn!(action = message.name(), error = %e, "failed to serialize outbound message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;
    use logzy_core::{DataSource, QuerySpec, SessionId};
    use logzy_source::MemorySource;

    use super::*;
    use crate::connection::testing;
    use crate::session::SessionConfig;

    fn session(emit: OutboundSender) -> Arc<ClientSession> {
        let source: Arc<dyn DataSource> = Arc::new(MemorySource::new().with_table("logs", vec![]));
        Arc::new(ClientSession::new(
            SessionId::from_raw(1),
            source,
            emit,
            SessionConfig::default(),
        ))
    }

    fn batch(generation: u64, table: &str) -> Outbound {
        Outbound::Batch {
            generation,
            batch: ResultBatch::new(table, vec![]),
        }
    }

    #[tokio::test]
    async fn replies_and_current_batches_are_written_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx.clone());
        let (mut client, _reader, writer) = testing::pair();
        let stop = CancellationToken::new();
        let relay = tokio::spawn(run_relay(writer, rx, session.clone(), stop.clone(), Duration::from_secs(30)));

        tx.send(Outbound::Reply(OutboundMessage::error("first"))).await.unwrap();
        tx.send(batch(session.generation(), "logs")).await.unwrap();

        let first = client.recv_within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first["action"], "error");
        let second = client.recv_within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second["action"], "query_result");
        assert_eq!(second["table"], "logs");

        stop.cancel();
        assert_eq!(relay.await.unwrap(), RelayExit::Stopped);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn stale_batches_are_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx.clone());
        session.start_query_runners(vec![QuerySpec::table("logs", 60)]).await.unwrap();
        let current = session.generation();
        assert!(current > 0);

        tx.send(batch(current - 1, "old")).await.unwrap();
        tx.send(batch(current, "new")).await.unwrap();

        let (mut client, _reader, writer) = testing::pair();
        let stop = CancellationToken::new();
        stop.cancel();
        assert_eq!(
            run_relay(writer, rx, session.clone(), stop, Duration::from_secs(30)).await,
            RelayExit::Stopped
        );

        let tables: Vec<_> = client
            .drain()
            .into_iter()
            .filter(|f| f["action"] == "query_result")
            .map(|f| f["table"].as_str().unwrap().to_owned())
            .collect();
        assert!(!tables.contains(&"old".to_owned()));
        assert!(tables.contains(&"new".to_owned()));
        let _ = session.close().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_items() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx.clone());
        for i in 0..3 {
            tx.send(Outbound::Reply(OutboundMessage::error(format!("m{i}")))).await.unwrap();
        }

        let (mut client, _reader, writer) = testing::pair();
        let stop = CancellationToken::new();
        stop.cancel();
        let _ = run_relay(writer, rx, session, stop, Duration::from_secs(30)).await;
        assert_eq!(client.drain().len(), 3);
    }

    #[tokio::test]
    async fn write_failure_ends_relay() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx.clone());
        let (client, _reader, writer) = testing::pair();
        tx.send(Outbound::Reply(OutboundMessage::error("x"))).await.unwrap();

        let exit = run_relay(writer.failing(), rx, session, CancellationToken::new(), Duration::from_secs(30)).await;
        assert_matches!(exit, RelayExit::WriteFailed(ConnectionError::Transport(_)));
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_heartbeat_disables_pings() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx.clone());
        let (mut client, _reader, writer) = testing::pair();
        let stop = CancellationToken::new();
        let relay = tokio::spawn(run_relay(writer, rx, session, stop.clone(), Duration::ZERO));

        tx.send(Outbound::Reply(OutboundMessage::error("still works"))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(client.drain().len(), 1);
        assert_eq!(client.pings.load(Ordering::SeqCst), 0);

        stop.cancel();
        assert_eq!(relay.await.unwrap(), RelayExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_heartbeat() {
        let (tx, rx) = mpsc::channel(8);
        let session = session(tx);
        let (client, _reader, writer) = testing::pair();
        let stop = CancellationToken::new();
        let relay = tokio::spawn(run_relay(writer, rx, session, stop.clone(), Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(client.pings.load(Ordering::SeqCst), 3);
        stop.cancel();
        let _ = relay.await.unwrap();
    }
}

//! Client sessions.
//!
//! A session owns the query tasks for one connection. Replacing the query
//! set is all-or-nothing: the new specs are validated first, then every old
//! task is cancelled and joined before any new task is spawned, so output
//! from two query sets never overlaps. The generation counter is bumped
//! before the old set is cancelled; the relay uses it to discard batches
//! the old set queued, including any queued while it was winding down.
//!
//! Each task's token is a child of the session token, so closing the session
//! cancels everything it ever spawned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use logzy_core::{DataSource, QuerySpec, SessionId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::SessionError;
use crate::relay::OutboundSender;
use crate::task::{TaskContext, TaskHandle, retire_all, spawn_query_task};

/// Per-session tuning.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// How long to wait for a cancelled task before aborting it.
    pub cancel_ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cancel_ack_timeout: Duration::from_secs(1),
        }
    }
}

/// One connected client's query state.
pub struct ClientSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_keepalive_at: Mutex<DateTime<Utc>>,
    closed_at: Mutex<Option<DateTime<Utc>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    generation: AtomicU64,
    // Held across cancel-and-join so replacements and close serialize.
    tasks: tokio::sync::Mutex<Vec<TaskHandle>>,
    source: Arc<dyn DataSource>,
    emit: OutboundSender,
    config: SessionConfig,
}

impl ClientSession {
    /// A fresh session with no running queries.
    pub fn new(
        id: SessionId,
        source: Arc<dyn DataSource>,
        emit: OutboundSender,
        config: SessionConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_keepalive_at: Mutex::new(now),
            closed_at: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            generation: AtomicU64::new(0),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            source,
            emit,
            config,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the session was closed, if it has been.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        *self.closed_at.lock()
    }

    /// Last time the client showed signs of life.
    pub fn last_keepalive_at(&self) -> DateTime<Utc> {
        *self.last_keepalive_at.lock()
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_keepalive_at.lock() = Utc::now();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current query-set generation. `0` until the first query set starts.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of tasks in the active set.
    pub async fn active_task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Specs of the active set, in submission order.
    pub async fn active_specs(&self) -> Vec<QuerySpec> {
        self.tasks.lock().await.iter().map(|t| t.spec().clone()).collect()
    }

    /// Cancellation tokens of the active set.
    pub async fn task_tokens(&self) -> Vec<CancellationToken> {
        self.tasks.lock().await.iter().map(TaskHandle::token).collect()
    }

    /// Replace the running query set with one task per spec.
    ///
    /// Nothing changes if any spec is invalid. Otherwise every previous task
    /// is cancelled and has stopped (or been aborted) before the first new
    /// one starts. An empty `specs` just stops everything.
    pub async fn start_query_runners(&self, specs: Vec<QuerySpec>) -> Result<usize, SessionError> {
        for (index, spec) in specs.iter().enumerate() {
            spec.validate()
                .map_err(|source| SessionError::InvalidSpec { index, source })?;
        }

        let mut tasks = self.tasks.lock().await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        // Bump first so the relay drops anything the old set already queued.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = std::mem::take(&mut *tasks);
        let replaced = previous.len();
        let acked = retire_all(previous, self.config.cancel_ack_timeout).await;
        if acked < replaced {
            warn!(session_id = %self.id, replaced, acked, "some query tasks were aborted");
        }

        *tasks = specs
            .into_iter()
            .map(|spec| {
                spawn_query_task(
                    spec,
                    self.cancel.child_token(),
                    TaskContext {
                        session_id: self.id,
                        generation,
                        source: self.source.clone(),
                        emit: self.emit.clone(),
                    },
                )
            })
            .collect();

        info!(session_id = %self.id, generation, replaced, started = tasks.len(), "query set replaced");
        Ok(tasks.len())
    }

    /// Stop every task and mark the session closed.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.closed_at.lock() = Some(Utc::now());
        self.cancel.cancel();

        let previous = std::mem::take(&mut *self.tasks.lock().await);
        let stopped = previous.len();
        let _ = retire_all(previous, self.config.cancel_ack_timeout).await;
        debug!(session_id = %self.id, stopped, "session closed");
        true
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

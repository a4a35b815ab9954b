//! Query tasks: one periodic fetch-and-emit loop per query.
//!
//! A task fetches, emits one batch, sleeps for its interval and repeats
//! until its cancellation token fires. Every suspension point (fetch, emit,
//! sleep) is raced against the token, so a cancelled task stops at the next
//! await without emitting anything further. Fetch errors are logged and
//! counted; the task keeps its cadence and tries again next tick.

use std::sync::Arc;
use std::time::Duration;

use logzy_core::{DataSource, QuerySpec, ResultBatch, SessionId};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::metrics::{QUERY_FETCH_ERRORS_TOTAL, QUERY_FETCHES_TOTAL, QUERY_TASKS_ACTIVE};
use crate::relay::{Outbound, OutboundSender};

/// Everything a task needs to run. Moved into the spawned future.
pub struct TaskContext {
    /// Owning session, for log context.
    pub session_id: SessionId,
    /// Query-set generation this task belongs to.
    pub generation: u64,
    /// Where fetches go.
    pub source: Arc<dyn DataSource>,
    /// The connection's outbound queue.
    pub emit: OutboundSender,
}

/// Owner's handle on a running task.
#[derive(Debug)]
pub struct TaskHandle {
    spec: QuerySpec,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Spawn a task for `spec`. It stops when `cancel` (or any parent) fires.
pub fn spawn_query_task(spec: QuerySpec, cancel: CancellationToken, ctx: TaskContext) -> TaskHandle {
    let span = info_span!(
        "query_task",
        session_id = %ctx.session_id,
        table = %spec.table,
        generation = ctx.generation,
    );
    let join = tokio::spawn(run(spec.clone(), cancel.clone(), ctx).instrument(span));
    TaskHandle { spec, cancel, join }
}

impl TaskHandle {
    /// The query this task runs.
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The task's own cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait up to `timeout` for the task to exit.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn cancel_and_wait(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let Self { spec, mut join, .. } = self;
        if tokio::time::timeout(timeout, &mut join).await.is_ok() {
            true
        } else {
            warn!(table = %spec.table, ?timeout, "query task ignored cancellation, aborting");
            join.abort();
            false
        }
    }
}

/// Cancel every handle, then wait for all of them.
///
/// Returns how many acknowledged within `timeout`.
pub async fn retire_all(handles: Vec<TaskHandle>, timeout: Duration) -> usize {
    for handle in &handles {
        handle.cancel();
    }
    let acked = futures::future::join_all(handles.into_iter().map(|h| h.cancel_and_wait(timeout))).await;
    acked.into_iter().filter(|ok| *ok).count()
}

async fn run(spec: QuerySpec, cancel: CancellationToken, ctx: TaskContext) {
    gauge!(QUERY_TASKS_ACTIVE).increment(1.0);
    debug!(interval_secs = spec.fetch_interval_secs, "query task started");

    let interval = spec.interval();
    loop {
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            fetched = ctx.source.fetch_rows(&spec) => fetched,
        };
        counter!(QUERY_FETCHES_TOTAL).increment(1);

        match fetched {
            Ok(rows) => {
                let item = Outbound::Batch {
                    generation: ctx.generation,
                    batch: ResultBatch::new(spec.table.clone(), rows),
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = ctx.emit.send(item) => {
                        if sent.is_err() {
                            // Connection gone; nothing to emit to until the owner cancels.
                            debug!("outbound queue closed, waiting for cancellation");
                            cancel.cancelled().await;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                counter!(QUERY_FETCH_ERRORS_TOTAL, "kind" => e.error_kind()).increment(1);
                warn!(error = %e, kind = e.error_kind(), "fetch failed, retrying next interval");
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    gauge!(QUERY_TASKS_ACTIVE).decrement(1.0);
    debug!("query task stopped");
}

//! Connection pools.
//!
//! [`ConnectionPool`] multiplexes a fixed set of connections: submissions
//! are dispatched FIFO onto ready connections, queue up when every
//! connection is busy, and each connection runs at most one operation at a
//! time. All ready/busy/queue transitions happen on a single dispatcher
//! task, so the pool is safe to share across any number of submitting
//! tasks and runtime worker threads.
//!
//! [`ReconnectionPool`] layers the [`checked`] wrapper over every
//! submission, so operations that fail on a broken connection transparently
//! reconnect and retry once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::Error;
use crate::ops::{checked, connect_op, connect_params_op, Operation};

struct Submission {
    op: Arc<dyn Operation>,
    done: oneshot::Sender<Result<(), Error>>,
}

enum PoolMsg {
    Submit(Submission),
    Stats(oneshot::Sender<PoolStats>),
}

/// A snapshot of the pool's partition; `ready + busy` always equals the
/// configured size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting for work.
    pub ready: usize,
    /// Connections currently running an operation.
    pub busy: usize,
    /// Submissions waiting for a connection.
    pub queued: usize,
}

/// A fixed-size pool of [`Connection`]s with FIFO dispatch.
///
/// Connections start out idle and unconnected; establishing sessions is the
/// submitted operations' business (see [`ReconnectionPool`] for the
/// batteries-included variant). Cloning the pool produces another handle to
/// the same dispatcher.
///
/// Dropping every handle shuts the pool down: operations already running
/// finish and their submitters get their results, while submissions still
/// in the queue resolve with [`Error::PoolClosed`].
#[derive(Clone)]
pub struct ConnectionPool {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl ConnectionPool {
    /// Create a pool of `size` idle connections.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero, or when called outside a tokio runtime.
    #[must_use]
    pub fn new(size: usize) -> ConnectionPool {
        assert!(size >= 1, "connection pool size must be at least 1");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(size, rx));
        ConnectionPool { tx }
    }

    /// Submit an operation and wait for its completion.
    ///
    /// Submissions are started in FIFO order as connections become ready.
    ///
    /// # Errors
    ///
    /// The operation's own error, or [`Error::PoolClosed`] when the pool
    /// shut down before the operation could run.
    pub async fn submit<O>(&self, op: O) -> Result<(), Error>
    where
        O: Operation + 'static,
    {
        self.submit_detached(op).await
    }

    /// [`submit`](ConnectionPool::submit) for an already-shared operation.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](ConnectionPool::submit).
    pub async fn submit_shared(&self, op: Arc<dyn Operation>) -> Result<(), Error> {
        self.submit_shared_detached(op).await
    }

    /// Enqueue an operation immediately and return a completion future that
    /// no longer borrows the pool handle.
    pub fn submit_detached<O>(
        &self,
        op: O,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send + 'static
    where
        O: Operation + 'static,
    {
        self.submit_shared_detached(Arc::new(op))
    }

    /// [`submit_detached`](ConnectionPool::submit_detached) for an
    /// already-shared operation.
    pub fn submit_shared_detached(
        &self,
        op: Arc<dyn Operation>,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send + 'static {
        let (done, completion) = oneshot::channel();
        let sent = self
            .tx
            .send(PoolMsg::Submit(Submission { op, done }))
            .map_err(|_| Error::PoolClosed);
        async move {
            sent?;
            completion.await.map_err(|_| Error::PoolClosed)?
        }
    }

    /// A snapshot of the ready/busy/queued partition.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] when the dispatcher is gone.
    pub async fn stats(&self) -> Result<PoolStats, Error> {
        let (reply, snapshot) = oneshot::channel();
        self.tx
            .send(PoolMsg::Stats(reply))
            .map_err(|_| Error::PoolClosed)?;
        snapshot.await.map_err(|_| Error::PoolClosed)
    }
}

async fn dispatch(size: usize, mut submissions: mpsc::UnboundedReceiver<PoolMsg>) {
    let (recycle_tx, mut recycle_rx) = mpsc::unbounded_channel::<Connection>();
    let mut ready: VecDeque<Connection> = (0..size).map(|_| Connection::new()).collect();
    let mut queue: VecDeque<Submission> = VecDeque::new();
    let mut busy = 0usize;
    let mut open = true;

    loop {
        tokio::select! {
            // Returned connections are handled before new submissions, so a
            // completion observed by a submitter is never still counted busy.
            biased;
            Some(conn) = recycle_rx.recv() => {
                if let Some(next) = queue.pop_front() {
                    start(conn, next, recycle_tx.clone());
                } else {
                    busy -= 1;
                    ready.push_back(conn);
                    if !open && busy == 0 {
                        break;
                    }
                }
            }
            message = submissions.recv(), if open => match message {
                Some(PoolMsg::Submit(submission)) => {
                    if let Some(conn) = ready.pop_front() {
                        busy += 1;
                        start(conn, submission, recycle_tx.clone());
                    } else {
                        trace!(queued = queue.len() + 1, "all connections busy, queueing");
                        queue.push_back(submission);
                    }
                }
                Some(PoolMsg::Stats(reply)) => {
                    let _ = reply.send(PoolStats {
                        ready: ready.len(),
                        busy,
                        queued: queue.len(),
                    });
                }
                None => {
                    open = false;
                    // Dropping a queued submission resolves its completion
                    // with PoolClosed; in-flight operations still finish.
                    queue.clear();
                    if busy == 0 {
                        break;
                    }
                }
            },
        }
    }

    debug!("connection pool dispatcher stopped");
}

fn start(
    mut conn: Connection,
    submission: Submission,
    recycle: mpsc::UnboundedSender<Connection>,
) {
    tokio::spawn(async move {
        let result = submission.op.run(&mut conn).await;
        // Hand the connection back before resolving the submitter, so the
        // pool never reports it busy after the completion has run.
        let _ = recycle.send(conn);
        let _ = submission.done.send(result);
    });
}

/// A [`ConnectionPool`] that wraps every submission in [`checked`] with a
/// connect operation captured at construction.
///
/// Connections start out unconnected, so the very first operation on each
/// connection fails, reconnects, and retries; from then on sessions are
/// re-established only when they break.
#[derive(Clone)]
pub struct ReconnectionPool {
    pool: ConnectionPool,
    connect: Arc<dyn Operation>,
}

impl ReconnectionPool {
    /// Pool whose sessions are established from a conninfo string.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero, or when called outside a tokio runtime.
    #[must_use]
    pub fn new(size: usize, conninfo: impl Into<String>) -> ReconnectionPool {
        ReconnectionPool::with_connect_op(size, Arc::new(connect_op(conninfo.into())))
    }

    /// Pool whose sessions are established from a keyword/value map.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero, or when called outside a tokio runtime.
    #[must_use]
    pub fn with_params(
        size: usize,
        params: BTreeMap<String, String>,
        expand_dbname: bool,
    ) -> ReconnectionPool {
        ReconnectionPool::with_connect_op(size, Arc::new(connect_params_op(params, expand_dbname)))
    }

    /// Pool with a custom connect operation.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero, or when called outside a tokio runtime.
    #[must_use]
    pub fn with_connect_op(size: usize, connect: Arc<dyn Operation>) -> ReconnectionPool {
        ReconnectionPool { pool: ConnectionPool::new(size), connect }
    }

    /// Submit an operation wrapped in the reconnect-and-retry check.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionPool::submit`], with reconnect failures
    /// surfacing the connect operation's error.
    pub async fn submit<O>(&self, op: O) -> Result<(), Error>
    where
        O: Operation + 'static,
    {
        self.pool.submit(checked(op, self.connect.clone())).await
    }

    /// A snapshot of the underlying pool's partition.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] when the dispatcher is gone.
    pub async fn stats(&self) -> Result<PoolStats, Error> {
        self.pool.stats().await
    }

    /// The wrapped pool, for submissions that must not be checked.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

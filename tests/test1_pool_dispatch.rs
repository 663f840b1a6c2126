//! Pool dispatch behavior with synthetic operations; no server needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio_libpq::prelude::*;

/// Records its id when it starts, then yields for a moment.
struct RecordOp {
    id: usize,
    log: Arc<Mutex<Vec<usize>>>,
    hold: Duration,
}

#[async_trait]
impl Operation for RecordOp {
    async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
        self.log.lock().unwrap().push(self.id);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        Ok(())
    }
}

/// Signals that it started, then blocks until released.
struct GateOp {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Operation for GateOp {
    async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Tracks how many instances are running at once.
struct OverlapOp {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Operation for OverlapOp {
    async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailOp;

#[async_trait]
impl Operation for FailOp {
    async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
        Err(Error::SendQueryFailed("synthetic failure".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_start_in_fifo_order() {
    let pool = ConnectionPool::new(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate = pool.submit_detached(GateOp {
        started: started.clone(),
        release: release.clone(),
    });
    let gate = tokio::spawn(gate);
    started.notified().await;

    // The only connection is held, so these queue up in submission order.
    let completions: Vec<_> = (1..=5)
        .map(|id| {
            pool.submit_detached(RecordOp {
                id,
                log: log.clone(),
                hold: Duration::ZERO,
            })
        })
        .collect();

    release.notify_one();
    gate.await.unwrap().unwrap();
    for result in join_all(completions).await {
        result.unwrap();
    }

    assert_eq!(*log.lock().unwrap(), [1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ready_plus_busy_is_constant() {
    let pool = ConnectionPool::new(3);

    let completions: Vec<_> = (0..20)
        .map(|id| {
            pool.submit_detached(RecordOp {
                id,
                log: Arc::new(Mutex::new(Vec::new())),
                hold: Duration::from_millis(10),
            })
        })
        .collect();

    // Sample the partition while work is in flight.
    for _ in 0..5 {
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.ready + stats.busy, 3);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for result in join_all(completions).await {
        result.unwrap();
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.ready, 3);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_connection_never_runs_two_operations() {
    let pool = ConnectionPool::new(1);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let completions: Vec<_> = (0..10)
        .map(|_| {
            pool.submit_detached(OverlapOp {
                current: current.clone(),
                peak: peak.clone(),
            })
        })
        .collect();
    for result in join_all(completions).await {
        result.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_is_bounded_by_pool_size() {
    let pool = ConnectionPool::new(4);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let completions: Vec<_> = (0..32)
        .map(|_| {
            pool.submit_detached(OverlapOp {
                current: current.clone(),
                peak: peak.clone(),
            })
        })
        .collect();
    for result in join_all(completions).await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_submission_completes_exactly_once() {
    let pool = ConnectionPool::new(2);

    let ok_completions: Vec<_> = (0..50)
        .map(|id| {
            pool.submit_detached(RecordOp {
                id,
                log: Arc::new(Mutex::new(Vec::new())),
                hold: Duration::ZERO,
            })
        })
        .collect();
    let failed = pool.submit(FailOp).await;

    let results = join_all(ok_completions).await;
    assert_eq!(results.len(), 50);
    assert!(results.iter().all(Result::is_ok));
    assert!(matches!(failed, Err(Error::SendQueryFailed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_work_fails_when_the_pool_shuts_down() {
    let pool = ConnectionPool::new(1);

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let in_flight = tokio::spawn(pool.submit_detached(GateOp {
        started: started.clone(),
        release: release.clone(),
    }));
    started.notified().await;

    let queued = pool.submit_detached(RecordOp {
        id: 0,
        log: Arc::new(Mutex::new(Vec::new())),
        hold: Duration::ZERO,
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Last handle gone: the queued submission is abandoned, the in-flight
    // one still finishes.
    drop(pool);
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    assert!(in_flight.await.unwrap().is_ok());
    assert!(matches!(queued.await, Err(Error::PoolClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnection_pool_surfaces_connect_errors() {
    struct BrokenConnect {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Operation for BrokenConnect {
        async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
            self.log.lock().unwrap().push("connect");
            Err(Error::ConnFailed("nothing listening".into()))
        }
    }

    struct LoggedFailure {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Operation for LoggedFailure {
        async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
            self.log.lock().unwrap().push("op");
            Err(Error::SendQueryFailed("no session".into()))
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let pool =
        ReconnectionPool::with_connect_op(2, Arc::new(BrokenConnect { log: log.clone() }));

    // The op fails on a fresh (bad-status) connection, the reconnect is
    // attempted, and its failure is what the submitter sees.
    let result = pool.submit(LoggedFailure { log: log.clone() }).await;
    assert!(matches!(result, Err(Error::ConnFailed(_))));
    assert_eq!(*log.lock().unwrap(), ["op", "connect"]);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.ready, 2);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn with_params_builds_a_pool() {
    let params = std::collections::BTreeMap::from([
        ("host".to_string(), "localhost".to_string()),
        ("dbname".to_string(), "ctest".to_string()),
    ]);
    let pool = ReconnectionPool::with_params(2, params, false);
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.ready + stats.busy, 2);
}

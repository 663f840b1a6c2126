//! Composable asynchronous operations.
//!
//! An [`Operation`] is a reusable unit of work against one connection: the
//! pools run them, and the combinators chain them. Chaining comes in three
//! flavors, available both as named methods on [`OperationExt`] and as
//! operator sugar on [`Composed`] wrappers:
//!
//! | Form | Meaning |
//! |---|---|
//! | `a.then(b)`, `compose(a) + b` | run `b` regardless of `a`'s outcome |
//! | `a.or_else(b)`, `compose(a) \| b` | run `b` only when `a` failed |
//! | `a.and_then(b)`, `compose(a) & b` | run `b` only when `a` succeeded |
//!
//! Rust's operator precedence groups `+` before `&` before `|`, so
//! `compose(a) | compose(b) & c` retries with `b & c` as a unit; parentheses
//! override as usual. [`checked`] builds the reconnect-and-retry wrapper the
//! reconnection pool applies to every submission.

use std::collections::BTreeMap;
use std::ops::{Add, BitAnd, BitOr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::collector::IgnoreResult;
use crate::connection::Connection;
use crate::error::Error;
use crate::params::Params;
use crate::pq::ConnStatus;
use crate::query;

/// A unit of asynchronous work against one connection.
///
/// Implementations take `&self` so a single operation value can be retried
/// and shared (`Arc<dyn Operation>` is itself an operation).
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run the operation to completion on `conn`.
    async fn run(&self, conn: &mut Connection) -> Result<(), Error>;
}

#[async_trait]
impl<T: Operation + ?Sized> Operation for Arc<T> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        self.as_ref().run(conn).await
    }
}

/// Marker wrapper that opts an operation into the `+`, `|`, `&` sugar.
pub struct Composed<T>(T);

/// Wrap an operation for use with the combinator operators.
pub fn compose<T: Operation>(op: T) -> Composed<T> {
    Composed(op)
}

impl<T> Composed<T> {
    /// Unwrap the underlying operation.
    pub fn into_inner(self) -> T {
        self.0
    }
}

#[async_trait]
impl<T: Operation> Operation for Composed<T> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        self.0.run(conn).await
    }
}

impl<A: Operation, B: Operation> Add<B> for Composed<A> {
    type Output = Composed<Seq<A, B>>;

    fn add(self, rhs: B) -> Self::Output {
        Composed(self.0.then(rhs))
    }
}

impl<A: Operation, B: Operation> BitOr<B> for Composed<A> {
    type Output = Composed<OrElse<A, B>>;

    fn bitor(self, rhs: B) -> Self::Output {
        Composed(self.0.or_else(rhs))
    }
}

impl<A: Operation, B: Operation> BitAnd<B> for Composed<A> {
    type Output = Composed<AndThen<A, B>>;

    fn bitand(self, rhs: B) -> Self::Output {
        Composed(self.0.and_then(rhs))
    }
}

/// Named combinator constructors, implemented for every operation.
pub trait OperationExt: Operation + Sized {
    /// Run `self`, then `next`, regardless of the first outcome.
    fn then<B: Operation>(self, next: B) -> Seq<Self, B> {
        Seq { first: self, second: next }
    }

    /// Run `fallback` only when `self` fails.
    fn or_else<B: Operation>(self, fallback: B) -> OrElse<Self, B> {
        OrElse { first: self, fallback }
    }

    /// Run `next` only when `self` succeeds.
    fn and_then<B: Operation>(self, next: B) -> AndThen<Self, B> {
        AndThen { first: self, second: next }
    }
}

impl<T: Operation + Sized> OperationExt for T {}

/// Unconditional sequence; completes with the second operation's outcome.
pub struct Seq<A, B> {
    first: A,
    second: B,
}

#[async_trait]
impl<A: Operation, B: Operation> Operation for Seq<A, B> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        if let Err(err) = self.first.run(conn).await {
            trace!(error = %err, "sequence head failed, continuing");
        }
        self.second.run(conn).await
    }
}

/// Fallback chain; the second operation runs only after a failure.
pub struct OrElse<A, B> {
    first: A,
    fallback: B,
}

#[async_trait]
impl<A: Operation, B: Operation> Operation for OrElse<A, B> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        match self.first.run(conn).await {
            Ok(()) => Ok(()),
            Err(err) => {
                trace!(error = %err, "falling back");
                self.fallback.run(conn).await
            }
        }
    }
}

/// Happy-path chain; the second operation runs only after success.
pub struct AndThen<A, B> {
    first: A,
    second: B,
}

#[async_trait]
impl<A: Operation, B: Operation> Operation for AndThen<A, B> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        self.first.run(conn).await?;
        self.second.run(conn).await
    }
}

/// Reconnect-and-retry wrapper built by [`checked`].
pub struct Checked<T> {
    op: T,
    connect: Arc<dyn Operation>,
}

/// Wrap `op` so that, when it fails on a connection whose status is no
/// longer OK, `connect` re-establishes the session and `op` is retried
/// exactly once. A reconnect failure surfaces the reconnect's error.
pub fn checked<T: Operation>(op: T, connect: Arc<dyn Operation>) -> Checked<T> {
    Checked { op, connect }
}

#[async_trait]
impl<T: Operation> Operation for Checked<T> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        let err = match self.op.run(conn).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if conn.status() == ConnStatus::Ok {
            return Err(err);
        }

        trace!(error = %err, "connection broken, reconnecting before retry");
        self.connect.run(conn).await?;
        self.op.run(conn).await
    }
}

/// Operation that (re)establishes a session from a conninfo string.
pub struct ConnectOp {
    conninfo: String,
}

/// Build a connect operation from a URI or keyword/value conninfo string.
pub fn connect_op(conninfo: impl Into<String>) -> ConnectOp {
    ConnectOp { conninfo: conninfo.into() }
}

#[async_trait]
impl Operation for ConnectOp {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        conn.connect(&self.conninfo).await
    }
}

/// Operation that (re)establishes a session from keyword/value pairs.
pub struct ConnectParamsOp {
    params: BTreeMap<String, String>,
    expand_dbname: bool,
}

/// Build a connect operation from a keyword/value map.
pub fn connect_params_op(
    params: BTreeMap<String, String>,
    expand_dbname: bool,
) -> ConnectParamsOp {
    ConnectParamsOp { params, expand_dbname }
}

#[async_trait]
impl Operation for ConnectParamsOp {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        conn.connect_params(
            self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            self.expand_dbname,
        )
        .await
    }
}

/// Operation that runs one plain SQL command, discarding row data.
pub struct QueryOp {
    sql: String,
}

/// Build an operation that runs `sql` with the [`IgnoreResult`] collector.
pub fn query_op(sql: impl Into<String>) -> QueryOp {
    QueryOp { sql: sql.into() }
}

#[async_trait]
impl Operation for QueryOp {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        query::query(conn, &self.sql, &mut IgnoreResult).await
    }
}

/// Operation that runs one parameterized command, discarding row data.
pub struct QueryParamsOp<P> {
    sql: String,
    params: P,
    text_format: bool,
}

/// Build a parameterized-query operation. The carrier must be owning
/// (`P: Params + Send + Sync`); clone a borrowing view with
/// [`Params::to_cloned`] first.
pub fn query_params_op<P>(sql: impl Into<String>, params: P, text_format: bool) -> QueryParamsOp<P>
where
    P: Params + Send + Sync,
{
    QueryParamsOp { sql: sql.into(), params, text_format }
}

#[async_trait]
impl<P: Params + Send + Sync> Operation for QueryParamsOp<P> {
    async fn run(&self, conn: &mut Connection) -> Result<(), Error> {
        query::query_params(conn, &self.sql, &self.params, self.text_format, &mut IgnoreResult)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Probe {
        fn ok(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Probe {
            Probe { label, log: log.clone(), fail: false }
        }

        fn failing(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Probe {
            Probe { label, log: log.clone(), fail: true }
        }
    }

    #[async_trait]
    impl Operation for Probe {
        async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                Err(Error::SendQueryFailed(format!("{} failed", self.label)))
            } else {
                Ok(())
            }
        }
    }

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn seq_runs_both_and_reports_the_second_outcome() {
        let log = log();
        let op = Probe::failing("a", &log).then(Probe::ok("b", &log));
        let mut conn = Connection::new();

        assert!(op.run(&mut conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn and_then_stops_on_failure() {
        let log = log();
        let op = Probe::failing("a", &log).and_then(Probe::ok("b", &log));
        let mut conn = Connection::new();

        let result = op.run(&mut conn).await;
        assert!(matches!(result, Err(Error::SendQueryFailed(_))));
        assert_eq!(*log.lock().unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn or_else_runs_fallback_only_on_failure() {
        let log = log();
        let op = Probe::ok("a", &log).or_else(Probe::ok("b", &log));
        let mut conn = Connection::new();
        assert!(op.run(&mut conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), ["a"]);

        let log2 = log.clone();
        log.lock().unwrap().clear();
        let op = Probe::failing("a", &log2).or_else(Probe::ok("b", &log2));
        assert!(op.run(&mut conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn operators_group_like_arithmetic() {
        // a | (b & c): after a fails, the fallback is the b-then-c chain.
        let log = log();
        let op = compose(Probe::failing("a", &log))
            | compose(Probe::ok("b", &log)) & Probe::ok("c", &log);
        let mut conn = Connection::new();

        assert!(op.run(&mut conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn plus_chains_unconditionally() {
        let log = log();
        let op = compose(Probe::failing("a", &log)) + Probe::failing("b", &log);
        let mut conn = Connection::new();

        let result = op.run(&mut conn).await;
        assert!(matches!(result, Err(Error::SendQueryFailed(message)) if message.contains('b')));
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn checked_reconnects_and_retries_once() {
        // A fresh connection has Bad status, so a failure triggers the
        // reconnect-then-retry path.
        let log = log();
        let connect: Arc<dyn Operation> = Arc::new(Probe::ok("connect", &log));
        let op = checked(Probe::failing("op", &log), connect);
        let mut conn = Connection::new();

        let result = op.run(&mut conn).await;
        assert!(matches!(result, Err(Error::SendQueryFailed(_))));
        assert_eq!(*log.lock().unwrap(), ["op", "connect", "op"]);
    }

    #[tokio::test]
    async fn checked_surfaces_the_reconnect_error() {
        let log = log();
        let connect: Arc<dyn Operation> =
            Arc::new(FailWith(Error::ConnFailed("no route".into())));
        let op = checked(Probe::failing("op", &log), connect);
        let mut conn = Connection::new();

        let result = op.run(&mut conn).await;
        assert!(matches!(result, Err(Error::ConnFailed(_))));
        assert_eq!(*log.lock().unwrap(), ["op"]);
    }

    #[tokio::test]
    async fn checked_passes_success_through() {
        let log = log();
        let connect: Arc<dyn Operation> = Arc::new(Probe::ok("connect", &log));
        let op = checked(Probe::ok("op", &log), connect);
        let mut conn = Connection::new();

        assert!(op.run(&mut conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), ["op"]);
    }

    struct FailWith(Error);

    #[async_trait]
    impl Operation for FailWith {
        async fn run(&self, _conn: &mut Connection) -> Result<(), Error> {
            Err(match &self.0 {
                Error::ConnFailed(message) => Error::ConnFailed(message.clone()),
                _ => Error::NotConnected,
            })
        }
    }
}

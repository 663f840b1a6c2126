//! Server-side prepared statements with automatic first-use preparation.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::collector::{IgnoreResult, ResultCollector};
use crate::connection::Connection;
use crate::error::Error;
use crate::params::{NullParams, Params};
use crate::query;

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_unique_name() -> String {
    format!("s{}", NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A query that prepares itself on first execution.
///
/// The statement name is generated from a process-wide counter, so two
/// instances never collide on the same server session. Once the prepare
/// succeeds the instance never prepares again; statements live per server
/// session, so after a reconnect on the same connection call
/// [`invalidate`](AutoPreparedQuery::invalidate) to force re-preparation.
///
/// ```no_run
/// use tokio_libpq::prelude::*;
///
/// async fn demo(conn: &mut Connection) -> Result<(), Error> {
///     let mut insert = AutoPreparedQuery::new("INSERT INTO t(foo, bar) VALUES($1, $2)");
///     let params = TextParams::new(["a", "b"])?;
///     insert.execute(conn, &params, &mut IgnoreResult).await?;
///     // Prepared now; this call only sends the execution.
///     insert.execute(conn, &params, &mut IgnoreResult).await
/// }
/// ```
#[derive(Debug)]
pub struct AutoPreparedQuery<P: Params = NullParams> {
    query: String,
    name: String,
    prepare_params: P,
    text_format: bool,
    prepared: bool,
}

impl AutoPreparedQuery<NullParams> {
    /// A query with server-inferred parameter types and text results.
    pub fn new(query: impl Into<String>) -> AutoPreparedQuery<NullParams> {
        AutoPreparedQuery::with_params(query, true, NullParams)
    }
}

impl<P: Params + Sync> AutoPreparedQuery<P> {
    /// A query with explicit prepare-time parameter descriptors and result
    /// format.
    pub fn with_params(
        query: impl Into<String>,
        text_format: bool,
        prepare_params: P,
    ) -> AutoPreparedQuery<P> {
        AutoPreparedQuery {
            query: query.into(),
            name: generate_unique_name(),
            prepare_params,
            text_format,
            prepared: false,
        }
    }

    /// The generated statement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the statement has been prepared on some session.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Forget that the statement was prepared, so the next execution
    /// prepares it again. Needed after the underlying session is replaced.
    pub fn invalidate(&mut self) {
        self.prepared = false;
    }

    /// Execute the statement, preparing it first if this instance has not
    /// done so yet.
    ///
    /// Parameter carriers borrowed from the caller stay alive across the
    /// internal prepare/execute sequence; cloning into an owning carrier is
    /// only needed when the whole execution is deferred, e.g. captured into
    /// an operation submitted to a pool.
    ///
    /// # Errors
    ///
    /// The prepare error when first-use preparation fails (the statement
    /// stays unprepared), otherwise the execution's aggregated error.
    pub async fn execute<Q, C>(
        &mut self,
        conn: &mut Connection,
        params: &Q,
        collector: &mut C,
    ) -> Result<(), Error>
    where
        Q: Params + Sync + ?Sized,
        C: ResultCollector + ?Sized,
    {
        if !self.prepared {
            trace!(statement = %self.name, "preparing on first use");
            query::prepare(conn, &self.name, &self.query, &self.prepare_params, &mut IgnoreResult)
                .await?;
            self.prepared = true;
        }
        query::query_prepared(conn, &self.name, params, self.text_format, collector).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_across_instances() {
        let a = AutoPreparedQuery::new("SELECT 1");
        let b = AutoPreparedQuery::new("SELECT 1");
        assert_ne!(a.name(), b.name());
        assert!(!a.is_prepared());
    }

    #[tokio::test]
    async fn failed_prepare_leaves_statement_unprepared() {
        let mut conn = Connection::new();
        let mut statement = AutoPreparedQuery::new("SELECT $1::text");
        let result = statement
            .execute(&mut conn, &NullParams, &mut IgnoreResult)
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(!statement.is_prepared());
    }

    #[tokio::test]
    async fn invalidate_forces_repreparation_flag() {
        let mut statement = AutoPreparedQuery::new("SELECT 1");
        statement.prepared = true;
        assert!(statement.is_prepared());
        statement.invalidate();
        assert!(!statement.is_prepared());
    }
}

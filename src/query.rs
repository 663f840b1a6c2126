//! Command adapters over [`Connection::exec`].
//!
//! Each adapter pairs one `PQsend*` entry point with the shared command
//! loop, mapping a refused send to its dedicated error code.

use std::ffi::CString;

use crate::collector::ResultCollector;
use crate::connection::Connection;
use crate::error::Error;
use crate::params::Params;

/// Run a plain SQL command via `PQsendQuery`.
///
/// # Errors
///
/// [`Error::SendQueryFailed`] when libpq refuses the command, otherwise the
/// command loop's aggregated error.
pub async fn query<C>(conn: &mut Connection, sql: &str, collector: &mut C) -> Result<(), Error>
where
    C: ResultCollector + ?Sized,
{
    let command = command_cstring(sql, Error::SendQueryFailed)?;
    conn.exec(
        |pq| {
            if pq.send_query(&command) {
                Ok(())
            } else {
                Err(Error::SendQueryFailed(pq.error_message()))
            }
        },
        collector,
    )
    .await
}

/// Run a parameterized command via `PQsendQueryParams`.
///
/// With `text_format` set, results arrive in text form; otherwise binary.
///
/// # Errors
///
/// [`Error::SendQueryParamsFailed`] when libpq refuses the command,
/// otherwise the command loop's aggregated error.
pub async fn query_params<P, C>(
    conn: &mut Connection,
    sql: &str,
    params: &P,
    text_format: bool,
    collector: &mut C,
) -> Result<(), Error>
where
    P: Params + Sync + ?Sized,
    C: ResultCollector + ?Sized,
{
    let command = command_cstring(sql, Error::SendQueryParamsFailed)?;
    conn.exec(
        |pq| {
            if pq.send_query_params(&command, params, text_format) {
                Ok(())
            } else {
                Err(Error::SendQueryParamsFailed(pq.error_message()))
            }
        },
        collector,
    )
    .await
}

/// Prepare a named statement via `PQsendPrepare`. Only the parameter type
/// OIDs of `params` are used at prepare time.
///
/// # Errors
///
/// [`Error::SendPrepareFailed`] when libpq refuses the request, otherwise
/// the command loop's aggregated error.
pub async fn prepare<P, C>(
    conn: &mut Connection,
    name: &str,
    sql: &str,
    params: &P,
    collector: &mut C,
) -> Result<(), Error>
where
    P: Params + Sync + ?Sized,
    C: ResultCollector + ?Sized,
{
    let name = command_cstring(name, Error::SendPrepareFailed)?;
    let command = command_cstring(sql, Error::SendPrepareFailed)?;
    conn.exec(
        |pq| {
            if pq.send_prepare(&name, &command, params) {
                Ok(())
            } else {
                Err(Error::SendPrepareFailed(pq.error_message()))
            }
        },
        collector,
    )
    .await
}

/// Execute a previously prepared statement via `PQsendQueryPrepared`.
///
/// # Errors
///
/// [`Error::SendQueryPreparedFailed`] when libpq refuses the command,
/// otherwise the command loop's aggregated error.
pub async fn query_prepared<P, C>(
    conn: &mut Connection,
    name: &str,
    params: &P,
    text_format: bool,
    collector: &mut C,
) -> Result<(), Error>
where
    P: Params + Sync + ?Sized,
    C: ResultCollector + ?Sized,
{
    let name = command_cstring(name, Error::SendQueryPreparedFailed)?;
    conn.exec(
        |pq| {
            if pq.send_query_prepared(&name, params, text_format) {
                Ok(())
            } else {
                Err(Error::SendQueryPreparedFailed(pq.error_message()))
            }
        },
        collector,
    )
    .await
}

fn command_cstring(text: &str, code: fn(String) -> Error) -> Result<CString, Error> {
    CString::new(text).map_err(|_| code("command text contains a NUL byte".into()))
}

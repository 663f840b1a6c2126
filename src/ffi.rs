//! Raw declarations for the subset of libpq used by this crate.
//!
//! Mirrors `libpq-fe.h`; see <https://www.postgresql.org/docs/current/libpq.html>.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uint};

/// Opaque libpq connection object.
#[repr(C)]
pub struct PGconn {
    _private: [u8; 0],
}

/// Opaque libpq result object.
#[repr(C)]
pub struct PGresult {
    _private: [u8; 0],
}

/// PostgreSQL object identifier.
pub type Oid = c_uint;

pub type ConnStatusType = c_uint;
pub const CONNECTION_OK: ConnStatusType = 0;
pub const CONNECTION_BAD: ConnStatusType = 1;

pub type PostgresPollingStatusType = c_uint;
pub const PGRES_POLLING_FAILED: PostgresPollingStatusType = 0;
pub const PGRES_POLLING_READING: PostgresPollingStatusType = 1;
pub const PGRES_POLLING_WRITING: PostgresPollingStatusType = 2;
pub const PGRES_POLLING_OK: PostgresPollingStatusType = 3;

pub type ExecStatusType = c_uint;
pub const PGRES_EMPTY_QUERY: ExecStatusType = 0;
pub const PGRES_COMMAND_OK: ExecStatusType = 1;
pub const PGRES_TUPLES_OK: ExecStatusType = 2;
pub const PGRES_COPY_OUT: ExecStatusType = 3;
pub const PGRES_COPY_IN: ExecStatusType = 4;
pub const PGRES_BAD_RESPONSE: ExecStatusType = 5;
pub const PGRES_NONFATAL_ERROR: ExecStatusType = 6;
pub const PGRES_FATAL_ERROR: ExecStatusType = 7;
pub const PGRES_COPY_BOTH: ExecStatusType = 8;
pub const PGRES_SINGLE_TUPLE: ExecStatusType = 9;

/// One entry of the array returned by `PQconninfo`, terminated by an entry
/// whose `keyword` is null.
#[repr(C)]
pub struct PQconninfoOption {
    pub keyword: *mut c_char,
    pub envvar: *mut c_char,
    pub compiled: *mut c_char,
    pub val: *mut c_char,
    pub label: *mut c_char,
    pub dispchar: *mut c_char,
    pub dispsize: c_int,
}

#[link(name = "pq")]
extern "C" {
    pub fn PQconnectStart(conninfo: *const c_char) -> *mut PGconn;
    pub fn PQconnectStartParams(
        keywords: *const *const c_char,
        values: *const *const c_char,
        expand_dbname: c_int,
    ) -> *mut PGconn;
    pub fn PQconnectPoll(conn: *mut PGconn) -> PostgresPollingStatusType;
    pub fn PQstatus(conn: *const PGconn) -> ConnStatusType;
    pub fn PQsocket(conn: *const PGconn) -> c_int;
    pub fn PQerrorMessage(conn: *const PGconn) -> *const c_char;
    pub fn PQconninfo(conn: *mut PGconn) -> *mut PQconninfoOption;
    pub fn PQconninfoFree(conn_options: *mut PQconninfoOption);
    pub fn PQfinish(conn: *mut PGconn);

    pub fn PQsendQuery(conn: *mut PGconn, command: *const c_char) -> c_int;
    pub fn PQsendQueryParams(
        conn: *mut PGconn,
        command: *const c_char,
        n_params: c_int,
        param_types: *const Oid,
        param_values: *const *const c_char,
        param_lengths: *const c_int,
        param_formats: *const c_int,
        result_format: c_int,
    ) -> c_int;
    pub fn PQsendPrepare(
        conn: *mut PGconn,
        stmt_name: *const c_char,
        query: *const c_char,
        n_params: c_int,
        param_types: *const Oid,
    ) -> c_int;
    pub fn PQsendQueryPrepared(
        conn: *mut PGconn,
        stmt_name: *const c_char,
        n_params: c_int,
        param_values: *const *const c_char,
        param_lengths: *const c_int,
        param_formats: *const c_int,
        result_format: c_int,
    ) -> c_int;
    pub fn PQconsumeInput(conn: *mut PGconn) -> c_int;
    pub fn PQisBusy(conn: *mut PGconn) -> c_int;
    pub fn PQgetResult(conn: *mut PGconn) -> *mut PGresult;

    pub fn PQresultStatus(res: *const PGresult) -> ExecStatusType;
    pub fn PQresultErrorMessage(res: *const PGresult) -> *const c_char;
    pub fn PQntuples(res: *const PGresult) -> c_int;
    pub fn PQnfields(res: *const PGresult) -> c_int;
    pub fn PQfname(res: *const PGresult, field_num: c_int) -> *const c_char;
    pub fn PQgetvalue(res: *const PGresult, tup_num: c_int, field_num: c_int) -> *const c_char;
    pub fn PQgetisnull(res: *const PGresult, tup_num: c_int, field_num: c_int) -> c_int;
    pub fn PQclear(res: *mut PGresult);
}

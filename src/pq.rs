//! Ownership wrappers around libpq's connection and result objects.
//!
//! [`PqConn`] and [`PqResult`] guarantee that `PQfinish` and `PQclear` run
//! exactly once, on drop. Everything else in the crate goes through these
//! wrappers; the raw [`crate::ffi`] surface never leaks past this module.

use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use libc::{c_char, c_int};

use crate::ffi;
use crate::params::Params;

pub use crate::ffi::Oid;

/// Connection status, collapsed to the three states the crate acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The session is established and usable.
    Ok,
    /// The session is broken or was never established.
    Bad,
    /// An asynchronous connection attempt is still in progress.
    Connecting,
}

/// Outcome of one `PQconnectPoll` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollingStatus {
    Ok,
    Reading,
    Writing,
    Failed,
}

/// Status of a command result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The command string was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A query returned rows (all of them are in this result).
    TuplesOk,
    /// Copy-out transfer started.
    CopyOut,
    /// Copy-in transfer started.
    CopyIn,
    /// The server's response was not understood.
    BadResponse,
    /// A notice or warning was attached to the result.
    NonfatalError,
    /// The command failed.
    FatalError,
    /// Copy-both transfer started.
    CopyBoth,
    /// A single row of a row-by-row retrieval.
    SingleTuple,
    /// A status this crate does not recognize.
    Other(u32),
}

impl ExecStatus {
    fn from_raw(raw: ffi::ExecStatusType) -> ExecStatus {
        match raw {
            ffi::PGRES_EMPTY_QUERY => ExecStatus::EmptyQuery,
            ffi::PGRES_COMMAND_OK => ExecStatus::CommandOk,
            ffi::PGRES_TUPLES_OK => ExecStatus::TuplesOk,
            ffi::PGRES_COPY_OUT => ExecStatus::CopyOut,
            ffi::PGRES_COPY_IN => ExecStatus::CopyIn,
            ffi::PGRES_BAD_RESPONSE => ExecStatus::BadResponse,
            ffi::PGRES_NONFATAL_ERROR => ExecStatus::NonfatalError,
            ffi::PGRES_FATAL_ERROR => ExecStatus::FatalError,
            ffi::PGRES_COPY_BOTH => ExecStatus::CopyBoth,
            ffi::PGRES_SINGLE_TUPLE => ExecStatus::SingleTuple,
            other => ExecStatus::Other(other),
        }
    }
}

/// An owned libpq connection object.
///
/// The wrapper releases the handle with `PQfinish` on drop. libpq allows
/// moving a connection between threads but not concurrent use;
/// [`crate::Connection`] enforces that exclusivity through `&mut` access, so
/// `&PqConn` is only ever observed from one thread at a time even though the
/// type is `Sync` for the benefit of `Send` futures that hold it across an
/// `.await`.
pub struct PqConn {
    raw: NonNull<ffi::PGconn>,
}

// PGconn has no thread affinity; concurrent access is prevented by
// `Connection` only ever handing out `&PqConn` through an exclusive `&mut`
// borrow, never by the absence of a Sync impl.
unsafe impl Send for PqConn {}
unsafe impl Sync for PqConn {}

impl std::fmt::Debug for PqConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqConn").field("status", &self.status()).finish()
    }
}

impl PqConn {
    /// Begin a non-blocking connection attempt from a conninfo string.
    ///
    /// Returns `None` when libpq cannot allocate the connection object.
    pub(crate) fn connect_start(conninfo: &CStr) -> Option<PqConn> {
        let raw = unsafe { ffi::PQconnectStart(conninfo.as_ptr()) };
        NonNull::new(raw).map(|raw| PqConn { raw })
    }

    /// Begin a non-blocking connection attempt from keyword/value arrays.
    pub(crate) fn connect_start_params(
        keywords: &[CString],
        values: &[CString],
        expand_dbname: bool,
    ) -> Option<PqConn> {
        let mut keyword_ptrs: Vec<*const c_char> =
            keywords.iter().map(|k| k.as_ptr()).collect();
        let mut value_ptrs: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();
        keyword_ptrs.push(ptr::null());
        value_ptrs.push(ptr::null());

        let raw = unsafe {
            ffi::PQconnectStartParams(
                keyword_ptrs.as_ptr(),
                value_ptrs.as_ptr(),
                c_int::from(expand_dbname),
            )
        };
        NonNull::new(raw).map(|raw| PqConn { raw })
    }

    pub(crate) fn connect_poll(&self) -> PollingStatus {
        match unsafe { ffi::PQconnectPoll(self.raw.as_ptr()) } {
            ffi::PGRES_POLLING_OK => PollingStatus::Ok,
            ffi::PGRES_POLLING_READING => PollingStatus::Reading,
            ffi::PGRES_POLLING_WRITING => PollingStatus::Writing,
            // PGRES_POLLING_FAILED, the deprecated ACTIVE state, and anything
            // newer all terminate the attempt.
            _ => PollingStatus::Failed,
        }
    }

    /// Current status of the session.
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        match unsafe { ffi::PQstatus(self.raw.as_ptr()) } {
            ffi::CONNECTION_OK => ConnStatus::Ok,
            ffi::CONNECTION_BAD => ConnStatus::Bad,
            _ => ConnStatus::Connecting,
        }
    }

    /// The descriptor of the server socket, if one is open.
    pub(crate) fn socket(&self) -> Option<RawFd> {
        let fd = unsafe { ffi::PQsocket(self.raw.as_ptr()) };
        (fd >= 0).then_some(fd)
    }

    /// The most recent error message recorded on the connection.
    #[must_use]
    pub fn error_message(&self) -> String {
        let raw = unsafe { ffi::PQerrorMessage(self.raw.as_ptr()) };
        cstr_to_string(raw)
    }

    /// Look up the resolved value of one connection option by keyword.
    pub(crate) fn conninfo_value(&self, keyword: &str) -> Option<String> {
        unsafe {
            let options = ffi::PQconninfo(self.raw.as_ptr());
            if options.is_null() {
                return None;
            }

            let mut found = None;
            let mut cursor = options;
            while !(*cursor).keyword.is_null() {
                if CStr::from_ptr((*cursor).keyword).to_bytes() == keyword.as_bytes() {
                    if !(*cursor).val.is_null() {
                        found = Some(CStr::from_ptr((*cursor).val).to_string_lossy().into_owned());
                    }
                    break;
                }
                cursor = cursor.add(1);
            }

            ffi::PQconninfoFree(options);
            found
        }
    }

    pub(crate) fn send_query(&self, command: &CStr) -> bool {
        unsafe { ffi::PQsendQuery(self.raw.as_ptr(), command.as_ptr()) == 1 }
    }

    pub(crate) fn send_query_params<P>(&self, command: &CStr, params: &P, text_format: bool) -> bool
    where
        P: Params + ?Sized,
    {
        let values = params.values();
        let value_ptrs = value_pointers(&values);
        unsafe {
            ffi::PQsendQueryParams(
                self.raw.as_ptr(),
                command.as_ptr(),
                params.len() as c_int,
                slice_ptr(params.types()),
                array_ptr(&value_ptrs),
                slice_ptr(params.lengths()),
                slice_ptr(params.formats()),
                result_format(text_format),
            ) == 1
        }
    }

    pub(crate) fn send_prepare<P>(&self, name: &CStr, query: &CStr, params: &P) -> bool
    where
        P: Params + ?Sized,
    {
        unsafe {
            ffi::PQsendPrepare(
                self.raw.as_ptr(),
                name.as_ptr(),
                query.as_ptr(),
                params.len() as c_int,
                slice_ptr(params.types()),
            ) == 1
        }
    }

    pub(crate) fn send_query_prepared<P>(&self, name: &CStr, params: &P, text_format: bool) -> bool
    where
        P: Params + ?Sized,
    {
        let values = params.values();
        let value_ptrs = value_pointers(&values);
        unsafe {
            ffi::PQsendQueryPrepared(
                self.raw.as_ptr(),
                name.as_ptr(),
                params.len() as c_int,
                array_ptr(&value_ptrs),
                slice_ptr(params.lengths()),
                slice_ptr(params.formats()),
                result_format(text_format),
            ) == 1
        }
    }

    pub(crate) fn consume_input(&self) -> bool {
        unsafe { ffi::PQconsumeInput(self.raw.as_ptr()) == 1 }
    }

    pub(crate) fn is_busy(&self) -> bool {
        unsafe { ffi::PQisBusy(self.raw.as_ptr()) == 1 }
    }

    /// Fetch the next result of the current command; `None` means the
    /// command is complete.
    pub(crate) fn get_result(&self) -> Option<PqResult> {
        let raw = unsafe { ffi::PQgetResult(self.raw.as_ptr()) };
        NonNull::new(raw).map(|raw| PqResult { raw })
    }
}

impl Drop for PqConn {
    fn drop(&mut self) {
        unsafe { ffi::PQfinish(self.raw.as_ptr()) };
    }
}

/// An owned libpq result object, cleared on drop.
pub struct PqResult {
    raw: NonNull<ffi::PGresult>,
}

unsafe impl Send for PqResult {}

impl std::fmt::Debug for PqResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqResult")
            .field("status", &self.status())
            .field("tuples", &self.tuples())
            .field("fields", &self.fields())
            .finish()
    }
}

impl PqResult {
    /// Result status reported by the server.
    #[must_use]
    pub fn status(&self) -> ExecStatus {
        ExecStatus::from_raw(unsafe { ffi::PQresultStatus(self.raw.as_ptr()) })
    }

    /// The error message attached to this result, if any.
    #[must_use]
    pub fn error_message(&self) -> String {
        cstr_to_string(unsafe { ffi::PQresultErrorMessage(self.raw.as_ptr()) })
    }

    /// Number of rows in the result.
    #[must_use]
    pub fn tuples(&self) -> usize {
        unsafe { ffi::PQntuples(self.raw.as_ptr()) }.max(0) as usize
    }

    /// Number of columns in the result.
    #[must_use]
    pub fn fields(&self) -> usize {
        unsafe { ffi::PQnfields(self.raw.as_ptr()) }.max(0) as usize
    }

    /// Name of the column at `field`, if the index is in range.
    #[must_use]
    pub fn field_name(&self, field: usize) -> Option<String> {
        if field >= self.fields() {
            return None;
        }
        let raw = unsafe { ffi::PQfname(self.raw.as_ptr(), field as c_int) };
        (!raw.is_null()).then(|| cstr_to_owned(raw))
    }

    /// The text value at `(row, field)`; `None` for SQL NULL or an index out
    /// of range.
    #[must_use]
    pub fn value(&self, row: usize, field: usize) -> Option<String> {
        if row >= self.tuples() || field >= self.fields() {
            return None;
        }
        let (row, field) = (row as c_int, field as c_int);
        unsafe {
            if ffi::PQgetisnull(self.raw.as_ptr(), row, field) == 1 {
                return None;
            }
            let raw = ffi::PQgetvalue(self.raw.as_ptr(), row, field);
            (!raw.is_null()).then(|| cstr_to_owned(raw))
        }
    }
}

impl Drop for PqResult {
    fn drop(&mut self) {
        unsafe { ffi::PQclear(self.raw.as_ptr()) };
    }
}

/// Error messages only: libpq terminates them with a newline.
fn cstr_to_string(raw: *const c_char) -> String {
    if raw.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(raw) }
        .to_string_lossy()
        .trim_end()
        .to_owned()
}

/// Verbatim conversion for column names and data values.
fn cstr_to_owned(raw: *const c_char) -> String {
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn value_pointers(values: &[Option<&CStr>]) -> Vec<*const c_char> {
    values
        .iter()
        .map(|value| value.map_or(ptr::null(), CStr::as_ptr))
        .collect()
}

fn array_ptr(ptrs: &[*const c_char]) -> *const *const c_char {
    if ptrs.is_empty() {
        ptr::null()
    } else {
        ptrs.as_ptr()
    }
}

fn slice_ptr<T>(slice: Option<&[T]>) -> *const T {
    slice.map_or(ptr::null(), <[T]>::as_ptr)
}

fn result_format(text_format: bool) -> c_int {
    if text_format {
        0
    } else {
        1
    }
}

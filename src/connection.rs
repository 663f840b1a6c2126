//! A single asynchronous PostgreSQL connection.
//!
//! [`Connection`] owns a libpq connection object together with a duplicated
//! socket registered on the tokio reactor, and drives libpq's two
//! non-blocking state machines: the connect poll loop and the
//! send/consume/collect command loop. All methods are structurally
//! non-blocking; they suspend only at socket readiness waits.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::collector::ResultCollector;
use crate::error::Error;
use crate::pq::{ConnStatus, PollingStatus, PqConn};
use crate::socket::ReactorSocket;

/// An asynchronous connection to a PostgreSQL server.
///
/// A connection starts out idle; [`connect`](Connection::connect) or
/// [`connect_params`](Connection::connect_params) establishes a session, and
/// [`exec`](Connection::exec) runs one command at a time on it. Exclusive
/// `&mut` access guarantees at most one active operation per connection.
///
/// Dropping the connection closes the reactor socket and then releases the
/// libpq object; libpq's own descriptor is unaffected by the former.
#[derive(Debug, Default)]
pub struct Connection {
    pq: Option<PqConn>,
    socket: Option<ReactorSocket>,
    connect_timeout: Option<Duration>,
}

impl Connection {
    /// Create an idle connection.
    #[must_use]
    pub fn new() -> Connection {
        Connection::default()
    }

    /// Current session status; [`ConnStatus::Bad`] when no session exists.
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        self.pq.as_ref().map_or(ConnStatus::Bad, PqConn::status)
    }

    /// The underlying libpq object, for error-message inspection.
    #[must_use]
    pub fn pq(&self) -> Option<&PqConn> {
        self.pq.as_ref()
    }

    /// The connect timeout parsed out of the last connection attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Establish a session from a conninfo string (URI or keyword/value
    /// form, anything libpq accepts).
    ///
    /// Any previous session on this connection is closed first. The
    /// `connect_timeout` option is honored with libpq's own coercion: absent
    /// or non-positive disables it, `1` is raised to two seconds.
    ///
    /// # Errors
    ///
    /// [`Error::ConnAllocFailed`], [`Error::ConnInvalidSocket`],
    /// [`Error::ConnFailed`], [`Error::ConnPollFailed`], or [`Error::Io`]
    /// for descriptor duplication failures and an elapsed connect timeout.
    pub async fn connect(&mut self, conninfo: &str) -> Result<(), Error> {
        self.close();
        let conninfo = CString::new(conninfo)
            .map_err(|_| Error::ConnFailed("connection string contains a NUL byte".into()))?;
        let pq = PqConn::connect_start(&conninfo).ok_or(Error::ConnAllocFailed)?;
        self.start_connect(pq).await
    }

    /// Establish a session from keyword/value pairs, like
    /// `PQconnectStartParams`. With `expand_dbname` set, a `dbname` value
    /// that looks like a connection string is expanded.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Connection::connect).
    pub async fn connect_params<I, K, V>(
        &mut self,
        params: I,
        expand_dbname: bool,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.close();
        let mut keywords = Vec::new();
        let mut values = Vec::new();
        for (keyword, value) in params {
            keywords.push(param_cstring(keyword.as_ref())?);
            values.push(param_cstring(value.as_ref())?);
        }
        let pq = PqConn::connect_start_params(&keywords, &values, expand_dbname)
            .ok_or(Error::ConnAllocFailed)?;
        self.start_connect(pq).await
    }

    /// Run one command: `send_command` issues the `PQsend*` call, then the
    /// command loop consumes input and feeds every produced result to
    /// `collector`, finishing with one `None` call when the command is
    /// complete.
    ///
    /// When several results produce collector errors, the last one wins;
    /// see [`ResultCollector`] for the aggregation contract.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] without an established session; the error
    /// returned by `send_command`; [`Error::ConsumeInputFailed`]; or the
    /// final aggregated collector error.
    pub async fn exec<S, C>(&mut self, send_command: S, collector: &mut C) -> Result<(), Error>
    where
        S: FnOnce(&PqConn) -> Result<(), Error> + Send,
        C: ResultCollector + ?Sized,
    {
        let (pq, socket) = match (self.pq.as_ref(), self.socket.as_ref()) {
            (Some(pq), Some(socket)) => (pq, socket),
            _ => return Err(Error::NotConnected),
        };
        send_command(pq)?;
        drive_exec(pq, socket, collector).await
    }

    /// Close the session: the reactor socket first, then the libpq object.
    /// Idempotent; closing the duplicate never touches libpq's descriptor.
    pub fn close(&mut self) {
        self.socket = None;
        self.pq = None;
        self.connect_timeout = None;
    }

    async fn start_connect(&mut self, pq: PqConn) -> Result<(), Error> {
        if pq.status() == ConnStatus::Bad {
            let message = pq.error_message();
            self.pq = Some(pq);
            return Err(Error::ConnFailed(message));
        }

        let raw_fd = match pq.socket() {
            Some(fd) => fd,
            None => {
                self.pq = Some(pq);
                return Err(Error::ConnInvalidSocket);
            }
        };
        let socket = match ReactorSocket::duplicate(raw_fd) {
            Ok(socket) => socket,
            Err(err) => {
                self.pq = Some(pq);
                return Err(err.into());
            }
        };
        let timeout = match connect_timeout_of(&pq) {
            Ok(timeout) => timeout,
            Err(err) => {
                self.pq = Some(pq);
                return Err(err);
            }
        };

        let polled = match timeout {
            Some(limit) => match tokio::time::timeout(limit, poll_connect(&pq, &socket)).await {
                Ok(polled) => polled,
                Err(_) => {
                    debug!(timeout = ?limit, "connection attempt timed out");
                    Err(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect_timeout elapsed",
                    )))
                }
            },
            None => poll_connect(&pq, &socket).await,
        };

        match polled {
            Ok(()) => {
                trace!("connection established");
                self.pq = Some(pq);
                self.socket = Some(socket);
                self.connect_timeout = timeout;
                Ok(())
            }
            Err(err) => {
                // The handle is kept so callers can inspect the status and
                // the error message; the socket is dropped, which closes it.
                self.pq = Some(pq);
                Err(err)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drive `PQconnectPoll` until the session is established or fails.
async fn poll_connect(pq: &PqConn, socket: &ReactorSocket) -> Result<(), Error> {
    loop {
        match pq.connect_poll() {
            PollingStatus::Ok => {
                return if pq.status() == ConnStatus::Ok {
                    Ok(())
                } else {
                    Err(Error::ConnFailed(pq.error_message()))
                };
            }
            PollingStatus::Failed => return Err(Error::ConnPollFailed(pq.error_message())),
            PollingStatus::Reading => {
                trace!("connect poll: waiting for read readiness");
                socket.wait_read().await?;
            }
            PollingStatus::Writing => {
                trace!("connect poll: waiting for write readiness");
                socket.wait_write().await?;
            }
        }
    }
}

/// The send/consume/collect loop shared by every command.
///
/// Transport failures never short-circuit libpq here: the library performs
/// all socket I/O itself, so a broken connection is observed through
/// `PQconsumeInput` returning failure, which carries libpq's message.
async fn drive_exec<C>(
    pq: &PqConn,
    socket: &ReactorSocket,
    collector: &mut C,
) -> Result<(), Error>
where
    C: ResultCollector + ?Sized,
{
    let mut last = Ok(());
    loop {
        while pq.is_busy() {
            if !pq.consume_input() {
                return Err(Error::ConsumeInputFailed(pq.error_message()));
            }
            if pq.is_busy() {
                socket.wait_read().await?;
            }
        }

        match pq.get_result() {
            Some(result) => {
                if let Err(code) = collector.on_result(Some(&result)) {
                    // Last collector error wins; an earlier bad response can
                    // be masked by a later fatal one.
                    last = Err(code);
                }
            }
            None => {
                if let Err(code) = collector.on_result(None) {
                    last = Err(code);
                }
                return last;
            }
        }
    }
}

fn param_cstring(text: &str) -> Result<CString, Error> {
    CString::new(text)
        .map_err(|_| Error::ConnFailed("connection parameter contains a NUL byte".into()))
}

fn connect_timeout_of(pq: &PqConn) -> Result<Option<Duration>, Error> {
    match pq.conninfo_value("connect_timeout") {
        Some(raw) => coerce_connect_timeout(&raw),
        None => Ok(None),
    }
}

/// Apply libpq's coercion to a raw `connect_timeout` value: absent or
/// non-positive disables the timeout, and one second is raised to two.
fn coerce_connect_timeout(raw: &str) -> Result<Option<Duration>, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let seconds: i64 = trimmed
        .parse()
        .map_err(|_| Error::ConnFailed(format!("invalid connect_timeout value {trimmed:?}")))?;
    Ok(match seconds {
        s if s <= 0 => None,
        1 => Some(Duration::from_secs(2)),
        s => Some(Duration::from_secs(s as u64)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::IgnoreResult;

    #[test]
    fn connect_timeout_coercion_matches_libpq() {
        assert_eq!(coerce_connect_timeout("").unwrap(), None);
        assert_eq!(coerce_connect_timeout("0").unwrap(), None);
        assert_eq!(coerce_connect_timeout("-1").unwrap(), None);
        assert_eq!(
            coerce_connect_timeout("1").unwrap(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            coerce_connect_timeout("2").unwrap(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            coerce_connect_timeout("10").unwrap(),
            Some(Duration::from_secs(10))
        );
        assert!(matches!(
            coerce_connect_timeout("soon"),
            Err(Error::ConnFailed(_))
        ));
    }

    #[test]
    fn idle_connection_reports_bad_status() {
        let conn = Connection::new();
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(conn.pq().is_none());
        assert!(conn.connect_timeout().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let mut conn = Connection::new();
        conn.close();
        conn.close();
        assert_eq!(conn.status(), ConnStatus::Bad);
    }

    #[tokio::test]
    async fn exec_without_session_is_rejected() {
        let mut conn = Connection::new();
        let result = conn.exec(|_| Ok(()), &mut IgnoreResult).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}

use thiserror::Error;

/// Errors produced while connecting to or talking to a PostgreSQL server.
///
/// Variants that carry a `String` embed libpq's own error message, captured
/// at the moment the failure was observed, so the text stays meaningful even
/// after the connection has been reused or reconnected.
#[derive(Debug, Error)]
pub enum Error {
    /// libpq could not allocate a connection object.
    #[error("libpq could not allocate a connection object")]
    ConnAllocFailed,

    /// The libpq connection reports no socket descriptor.
    #[error("libpq connection reports no socket descriptor")]
    ConnInvalidSocket,

    /// The connection attempt failed before polling began, or the
    /// `connect_timeout` setting could not be interpreted.
    #[error("connection attempt failed: {0}")]
    ConnFailed(String),

    /// `PQconnectPoll` reported a failure.
    #[error("connection polling failed: {0}")]
    ConnPollFailed(String),

    /// `PQconsumeInput` failed while draining server input.
    #[error("failed to consume input from server: {0}")]
    ConsumeInputFailed(String),

    /// `PQsendQuery` refused the command.
    #[error("failed to send query: {0}")]
    SendQueryFailed(String),

    /// `PQsendQueryParams` refused the command.
    #[error("failed to send parameterized query: {0}")]
    SendQueryParamsFailed(String),

    /// `PQsendQueryPrepared` refused the command.
    #[error("failed to send prepared query: {0}")]
    SendQueryPreparedFailed(String),

    /// `PQsendPrepare` refused the prepare request.
    #[error("failed to send prepare request: {0}")]
    SendPrepareFailed(String),

    /// The server answered a command with a fatal error.
    #[error("server reported a fatal error: {0}")]
    ResultFatalError(String),

    /// The server's response could not be understood.
    #[error("server returned a bad response: {0}")]
    ResultBadResponse(String),

    /// An operation was invoked on a connection with no established session.
    #[error("connection is not established")]
    NotConnected,

    /// The pool was shut down before the submitted operation could complete.
    #[error("connection pool is shut down")]
    PoolClosed,

    /// A string destined for libpq contained an interior NUL byte.
    #[error("string contains an interior NUL byte")]
    NulByte(#[from] std::ffi::NulError),

    /// A transport-level failure: descriptor duplication, reactor
    /// registration, or the connect deadline expiring.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error was reported by libpq or by a server response, as
    /// opposed to the transport or pool layer.
    #[must_use]
    pub fn is_domain(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::PoolClosed | Error::NulByte(_))
    }

    /// Whether this error came from a `PQsend*` call refusing a command.
    #[must_use]
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Error::SendQueryFailed(_)
                | Error::SendQueryParamsFailed(_)
                | Error::SendQueryPreparedFailed(_)
                | Error::SendPrepareFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_embed_libpq_text() {
        let err = Error::ResultFatalError("relation \"t\" already exists".into());
        assert!(err.to_string().contains("already exists"));
        assert!(err.is_domain());
    }

    #[test]
    fn transport_errors_are_not_domain() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(!err.is_domain());
        assert!(!Error::PoolClosed.is_domain());
    }

    #[test]
    fn send_failures_are_grouped() {
        assert!(Error::SendPrepareFailed(String::new()).is_send_failure());
        assert!(!Error::NotConnected.is_send_failure());
    }
}

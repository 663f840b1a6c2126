//! Reactor registration for libpq's socket.
//!
//! libpq owns its descriptor and will close it in `PQfinish`, so the reactor
//! never gets that descriptor directly. Instead the descriptor is
//! duplicated; the duplicate refers to the same kernel socket, delivers the
//! same readiness, and can be closed without touching libpq's copy. The
//! duplicate is only ever used for readiness waits, never for reads or
//! writes; all I/O stays inside libpq.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// A duplicated server socket registered with the tokio reactor.
pub(crate) struct ReactorSocket {
    fd: AsyncFd<OwnedFd>,
}

impl ReactorSocket {
    /// Duplicate `raw` and register the duplicate for readiness events.
    pub(crate) fn duplicate(raw: RawFd) -> io::Result<ReactorSocket> {
        let duplicated = unsafe { libc::dup(raw) };
        if duplicated < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(duplicated) };

        set_nonblocking(duplicated)?;
        unsafe { libc::fcntl(duplicated, libc::F_SETFD, libc::FD_CLOEXEC) };

        let fd = AsyncFd::with_interest(owned, Interest::READABLE | Interest::WRITABLE)?;
        Ok(ReactorSocket { fd })
    }

    /// Wait until the socket is read-ready.
    pub(crate) async fn wait_read(&self) -> io::Result<()> {
        let mut guard = self.fd.readable().await?;
        // libpq performs the actual read; clear the cached readiness so the
        // next wait polls the kernel again.
        guard.clear_ready();
        Ok(())
    }

    /// Wait until the socket is write-ready.
    pub(crate) async fn wait_write(&self) -> io::Result<()> {
        let mut guard = self.fd.writable().await?;
        guard.clear_ready();
        Ok(())
    }
}

impl std::fmt::Debug for ReactorSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorSocket").field("fd", &self.fd).finish()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

//! One-byte wake-up primitive between threads (spec §4.1).
//!
//! A single-producer/any-consumer alert: `ping()` is a best-effort,
//! non-blocking single-byte write; `drain()` reads and discards whatever
//! is pending. Built on a connected `UnixDatagram` pair rather than a
//! `tokio::sync::Notify`/channel because callers need a raw, poll()-able
//! fd to combine with the node's data-socket fd in a single `poll(2)`
//! call (see `pty::InterruptibleSleep`).

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

/// Producer half of an alert channel.
#[derive(Debug)]
pub struct AlertTx {
    sock: UnixDatagram,
}

/// Consumer half of an alert channel.
#[derive(Debug)]
pub struct AlertRx {
    sock: UnixDatagram,
}

impl AlertTx {
    /// Wake up whatever is polling the paired [`AlertRx`].
    ///
    /// Best-effort: if the socket buffer is full a wake is already
    /// pending, so a `WouldBlock` is not an error.
    pub fn ping(&self) {
        match self.sock.send(&[1u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::debug!("[alert] ping failed: {e}"),
        }
    }
}

impl AlertRx {
    /// Raw fd suitable for `poll(2)`/`select(2)`.
    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Drain all pending wake bytes without blocking.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match self.sock.recv(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[alert] drain failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Create a connected pair: pings sent on the returned [`AlertTx`] wake up
/// polls on the returned [`AlertRx`].
pub fn alert_pair() -> io::Result<(AlertTx, AlertRx)> {
    let (a, b) = UnixDatagram::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;
    Ok((AlertTx { sock: a }, AlertRx { sock: b }))
}

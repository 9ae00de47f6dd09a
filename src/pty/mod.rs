//! PTY bridge (spec §3 "PTY bridge", §4.3, Module C).
//!
//! Wraps a [`portable_pty`] master/slave pair plus the behavior the
//! original BBS core layers on top of a bare pty: an input translation
//! table, baud-rate emulation via a per-character pause, and an
//! interruptible read loop that wakes on an [`AlertRx`] as well as pty
//! data.
//!
//! `portable_pty`'s `SlavePty` trait does not expose a raw fd (the
//! concrete Unix slave type is private), so the slave side used by the
//! sandbox's fork/clone path is obtained independently: [`MasterPty::tty_name`]
//! gives the device path, which is reopened with `OpenOptions` for a
//! fresh fd to `dup2` into the child.

pub mod terminal;

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, MasterPty, PtySize};

use crate::alert::AlertRx;

/// Input byte substitution table (spec §4.3.1).
///
/// Maps a single input byte to a replacement byte before it reaches the
/// child. Used for e.g. mapping a client's local backspace/delete
/// variant onto what the running program expects.
#[derive(Debug, Clone)]
pub struct TranslationTable {
    map: [Option<u8>; 256],
}

impl Default for TranslationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationTable {
    pub fn new() -> Self {
        Self { map: [None; 256] }
    }

    pub fn set(&mut self, from: u8, to: u8) {
        self.map[from as usize] = Some(to);
    }

    pub fn clear(&mut self, from: u8) {
        self.map[from as usize] = None;
    }

    pub fn translate(&self, byte: u8) -> u8 {
        self.map[byte as usize].unwrap_or(byte)
    }

    /// Apply the table in place to a buffer of input bytes.
    pub fn apply(&self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.translate(*b);
        }
    }
}

/// Emulated transfer speed (spec §4.3.1, "speed emulation").
///
/// `bps == 0` means unthrottled (the common case — full speed).
/// Otherwise, `cps = ceil(bps / 8)` and a pause of `1_000_000 / cps`
/// microseconds is inserted between each output byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedSpeed {
    bps: u32,
}

impl EmulatedSpeed {
    pub fn unthrottled() -> Self {
        Self { bps: 0 }
    }

    pub fn bps(bps: u32) -> Self {
        Self { bps }
    }

    pub fn is_throttled(&self) -> bool {
        self.bps > 0
    }

    /// Characters per second at this rate, rounding up.
    pub fn chars_per_second(&self) -> u32 {
        self.bps.div_ceil(8)
    }

    /// Pause to insert between output bytes, in microseconds.
    pub fn char_pause(&self) -> Duration {
        if self.bps == 0 {
            return Duration::ZERO;
        }
        let cps = self.chars_per_second().max(1);
        Duration::from_micros(1_000_000 / cps as u64)
    }
}

/// Outcome of waiting on a node's pty + alert fds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// Data ready for reading.
    Readable,
    /// Woken by an [`AlertRx`] ping — not data, just "check your state".
    Interrupted,
    /// The peer hung up (`POLLHUP`) or an error condition was reported.
    Closed,
    /// Timed out without anything becoming ready.
    Timeout,
}

/// Poll a data fd and an alert fd together, honoring HUP/ERR/NVAL so a
/// closed remote is reported promptly instead of spinning on EOF reads.
/// `POLLIN` is requested but *not* required on either fd for `Closed`/
/// `Interrupted` to be reported — those conditions win even without data.
pub fn wait_for_activity(data_fd: RawFd, alert: &AlertRx, timeout: Duration) -> io::Result<WaitEvent> {
    let events = libc::POLLIN;
    let mut fds = [
        libc::pollfd { fd: data_fd, events, revents: 0 },
        libc::pollfd { fd: alert.as_raw_fd(), events, revents: 0 },
    ];

    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(WaitEvent::Timeout);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(WaitEvent::Timeout);
    }

    let hup_or_err = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    if fds[0].revents & hup_or_err != 0 {
        return Ok(WaitEvent::Closed);
    }
    if fds[1].revents & (libc::POLLIN | hup_or_err) != 0 {
        alert.drain();
        return Ok(WaitEvent::Interrupted);
    }
    if fds[0].revents & libc::POLLIN != 0 {
        return Ok(WaitEvent::Readable);
    }
    Ok(WaitEvent::Timeout)
}

/// Owns the master side of a node's pty plus an independently opened
/// slave fd for the sandbox to hand to a child process.
pub struct PtyBridge {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    slave_path: std::path::PathBuf,
    child: Option<Box<dyn Child + Send + Sync>>,
    speed: EmulatedSpeed,
    last_write: Instant,
}

impl std::fmt::Debug for PtyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyBridge")
            .field("slave_path", &self.slave_path)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl PtyBridge {
    /// Allocate a new master/slave pty pair sized `rows`x`cols`.
    pub fn open(rows: u16, cols: u16) -> anyhow::Result<Self> {
        let system = native_pty_system();
        let pair = system.openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })?;

        let slave_path = pair
            .master
            .tty_name()
            .ok_or_else(|| anyhow::anyhow!("pty master has no slave device path"))?;
        // Drop the library's slave handle once we have the path — we
        // reopen it ourselves so the sandbox gets a plain RawFd it can
        // dup2 without going through `SlavePty::spawn_command`.
        drop(pair.slave);

        let writer = pair.master.take_writer()?;

        Ok(Self {
            master: pair.master,
            writer,
            slave_path,
            child: None,
            speed: EmulatedSpeed::unthrottled(),
            last_write: Instant::now(),
        })
    }

    /// Reopen the slave device, returning a fresh fd for the sandbox to
    /// dup2 into the child's stdio. Each call yields an independent fd;
    /// the caller owns it and is responsible for closing it.
    pub fn open_slave_fd(&self) -> io::Result<RawFd> {
        let file = OpenOptions::new().read(true).write(true).open(&self.slave_path)?;
        let fd = file.as_raw_fd();
        // Leak the `File` wrapper; ownership of the fd transfers to the
        // caller, who will close it explicitly (dup2 in the child, or
        // an explicit close in the parent after spawn).
        std::mem::forget(file);
        Ok(fd)
    }

    pub fn set_child(&mut self, child: Box<dyn Child + Send + Sync>) {
        self.child = Some(child);
    }

    pub fn set_speed(&mut self, speed: EmulatedSpeed) {
        self.speed = speed;
    }

    /// Master-side read fd, usable with [`wait_for_activity`].
    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_raw_fd()
    }

    pub fn try_clone_reader(&self) -> anyhow::Result<Box<dyn Read + Send>> {
        self.master.try_clone_reader()
    }

    /// Write output to the client, applying the emulated per-character
    /// pause when a speed limit is configured.
    pub fn write_output(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.speed.is_throttled() {
            return self.writer.write_all(data);
        }
        let pause = self.speed.char_pause();
        for chunk in data {
            self.writer.write_all(std::slice::from_ref(chunk))?;
            std::thread::sleep(pause);
        }
        self.last_write = Instant::now();
        Ok(())
    }

    /// Apply a window-size change from the client (spec §4.3.1,
    /// "window-size update"), propagating it to the child via the pty's
    /// own SIGWINCH delivery. If `refresh_byte` is set and a menu is
    /// currently displaying, the caller should inject it into the
    /// program's input stream afterward to trigger a redraw — this
    /// function only updates geometry.
    pub fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        self.master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })?;
        Ok(())
    }

    pub fn size(&self) -> anyhow::Result<(u16, u16)> {
        let size = self.master.get_size()?;
        Ok((size.rows, size.cols))
    }

    /// Idempotent teardown: kill any still-running child and drop the
    /// master side. Safe to call multiple times (spec §8 property 3,
    /// shutdown idempotency, extends to the pty as well as the node).
    pub fn restore_terminal(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.restore_terminal();
    }
}

//! Process sandbox (spec §4.5, Module E).
//!
//! Forks (or, when isolated, clones into fresh namespaces) an external
//! program, wires its stdio to the caller-supplied fds, and returns
//! a pid the caller can wait on or escalate a kill against. Isolation
//! itself — the bind-mounted rootfs clone and `pivot_root` dance — is
//! Linux-only and lives in [`linux`]; everything else in this module
//! (FD hygiene, the non-isolated fork/exec path, wait/kill) is portable.

#[cfg(target_os = "linux")]
mod linux;

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Input to an isolated exec (spec §3, "Sandbox spec").
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub template_dir: PathBuf,
    pub run_dir: PathBuf,
    pub hostname: String,
    pub max_memory_mb: u64,
    pub max_cpu_secs: u64,
    pub min_nice_ceiling: i32,
    pub user_home_dir: Option<PathBuf>,
    pub username: Option<String>,
}

/// What stdio to wire up for the child.
#[derive(Debug, Clone, Copy)]
pub struct ExecStdio {
    pub in_fd: RawFd,
    pub out_fd: RawFd,
}

/// `exec()` request (spec §4.5).
pub struct ExecRequest<'a> {
    pub stdio: ExecStdio,
    pub filename: &'a str,
    pub argv: &'a [String],
    pub envp: &'a [String],
    pub isolated: bool,
    pub sandbox: Option<&'a SandboxSpec>,
    /// Set the controlling terminal to `stdio.in_fd` after dup2 (spec
    /// §4.5 non-isolated path, "optionally set controlling terminal").
    pub set_controlling_terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Fork (or clone, if isolated) `req.filename`, returning the child pid.
/// The child's stdin/stdout/stderr are dup2'd from `req.stdio` before
/// every other fd is closed (spec §4.5 "FD hygiene").
pub fn exec(req: &ExecRequest) -> io::Result<u32> {
    if req.isolated {
        #[cfg(target_os = "linux")]
        {
            return linux::exec_isolated(req);
        }
        #[cfg(not(target_os = "linux"))]
        {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "isolated exec requires Linux namespaces",
            ));
        }
    }
    exec_non_isolated(req)
}

/// Maximum number of exempt descriptors (stdin/out/err plus a
/// coordination pipe fd, with headroom) — keeps [`close_all_except`]
/// allocation-free, since heap allocation in a freshly forked child of
/// a multi-threaded process can deadlock on another thread's held
/// allocator lock.
const MAX_KEEP_FDS: usize = 8;

/// Close every fd in `[3, rlim_nofile)` except those named in `keep`.
/// `keep` need not be sorted or deduplicated on entry; at most
/// [`MAX_KEEP_FDS`] entries are honored.
///
/// # Safety
/// Must only be called in a freshly forked/cloned child before any
/// other thread exists, since it blindly closes fds that might belong
/// to a concurrently-running sibling thread's state otherwise.
pub(crate) unsafe fn close_all_except(keep: &[RawFd]) {
    let mut buf = [RawFd::MAX; MAX_KEEP_FDS];
    let mut n = 0;
    for &fd in keep {
        if fd >= 0 && n < buf.len() {
            buf[n] = fd;
            n += 1;
        }
    }
    let keep = &mut buf[..n];
    keep.sort_unstable();

    let max_fd = unsafe {
        let mut rl: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 {
            rl.rlim_cur as RawFd
        } else {
            1024
        }
    };

    // Walk [3, max_fd) in contiguous runs, skipping the exempt fds —
    // at most `keep.len() + 1` ranges, matching the "at most four
    // contiguous ranges" shape described in the spec for the common
    // case of stdin/stdout/stderr plus one coordination pipe fd.
    let mut cursor = 3 as RawFd;
    for &k in keep.iter() {
        if k < cursor {
            continue;
        }
        close_range(cursor, k);
        cursor = k + 1;
    }
    close_range(cursor, max_fd);
}

fn close_range(lo: RawFd, hi: RawFd) {
    let mut fd = lo;
    while fd < hi {
        // SAFETY: closing an arbitrary fd in a just-forked child with no
        // other threads is safe even if the fd was never opened — EBADF
        // is ignored, matching the C original's close-range sweep.
        unsafe {
            libc::close(fd);
        }
        fd += 1;
    }
}

pub(crate) fn reset_default_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGWINCH, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

pub(crate) fn dup2_stdio(stdio: ExecStdio) -> io::Result<()> {
    unsafe {
        if libc::dup2(stdio.in_fd, libc::STDIN_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(stdio.out_fd, libc::STDOUT_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(stdio.out_fd, libc::STDERR_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_controlling_terminal(fd: RawFd) -> io::Result<()> {
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, libc::TIOCSCTTY as _, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
        let pgrp = libc::getpgrp();
        if libc::tcsetpgrp(fd, pgrp) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// `execvpe` argument/environment vectors, built once *before* forking.
///
/// The Rust standard library's own `Command` takes the same care: the
/// forked child of a multi-threaded process must not call the heap
/// allocator, since another thread may hold the allocator's lock at the
/// moment of `fork()`, and the child never runs that thread again to
/// release it. `CString`/`Vec` construction therefore happens here, in
/// the parent, and the child only ever dereferences the resulting raw
/// pointers — which stay valid because `fork` gives the child the same
/// address space layout until it calls `execve`.
pub(crate) struct PreparedExec {
    filename: CString,
    _argv_storage: Vec<CString>,
    _envp_storage: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl PreparedExec {
    pub(crate) fn new(filename: &str, argv: &[String], envp: &[String]) -> io::Result<Self> {
        let to_nul_err = || io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in exec argument");
        let c_filename = CString::new(filename).map_err(|_| to_nul_err())?;
        let c_argv: Vec<CString> =
            argv.iter().map(|a| CString::new(a.as_str())).collect::<Result<_, _>>().map_err(|_| to_nul_err())?;
        let c_envp: Vec<CString> =
            envp.iter().map(|a| CString::new(a.as_str())).collect::<Result<_, _>>().map_err(|_| to_nul_err())?;

        let mut argv_ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = c_envp.iter().map(|s| s.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        Ok(Self { filename: c_filename, _argv_storage: c_argv, _envp_storage: c_envp, argv_ptrs, envp_ptrs })
    }

    /// Calls `execvpe` using the pre-built pointers. Allocation-free:
    /// safe to call post-fork.
    pub(crate) fn exec(&self) -> io::Error {
        unsafe {
            libc::execvpe(self.filename.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
        }
        io::Error::last_os_error()
    }
}

fn exec_non_isolated(req: &ExecRequest) -> io::Result<u32> {
    let prepared = PreparedExec::new(req.filename, req.argv, req.envp)?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // Child: allocation-free from here to `execvpe` (see
        // `PreparedExec`'s doc comment for why).
        reset_default_signal_handlers();
        if dup2_stdio(req.stdio).is_err() {
            unsafe { libc::_exit(errno()) };
        }
        unsafe { close_all_except(&[0, 1, 2]) };
        if req.set_controlling_terminal && set_controlling_terminal(0).is_err() {
            unsafe { libc::_exit(errno()) };
        }
        let err = prepared.exec();
        unsafe { libc::_exit(err.raw_os_error().unwrap_or(libc::EIO)) };
    }
    Ok(pid as u32)
}

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Remove `<rundir>/<pid>` after an isolated child has exited (spec
/// §4.5, "parent removes <rundir>/<pid> best-effort"; §8 property 4).
pub fn cleanup_isolated_run_dir(spec: &SandboxSpec, pid: u32) {
    let path = spec.run_dir.join(pid.to_string());
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(&path) {
            log::warn!("failed to remove sandbox run dir {}: {e}", path.display());
        }
    }
}

/// Wait for `pid` to exit, resuming it with `SIGCONT` if it stops
/// (spec §4.5, "resumes on WIFSTOPPED via SIGCONT").
///
/// Callers that also use [`kill_child`] on the same pid should call
/// this *after* `kill_child` returns, not concurrently with it:
/// `kill_child`'s own polling reaps the child as soon as it dies, so a
/// `wait_child` racing against it can see `ECHILD` instead of an exit
/// status.
pub fn wait_child(pid: u32) -> io::Result<ExitStatus> {
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WUNTRACED) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if libc::WIFEXITED(status) {
            return Ok(ExitStatus::Exited(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            return Ok(ExitStatus::Signaled(libc::WTERMSIG(status)));
        }
        if libc::WIFSTOPPED(status) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGCONT);
            }
            continue;
        }
    }
}

/// Escalating kill protocol (spec §4.5, §8 property / S4): `INT`, a
/// bounded number of short backoffs, then `TERM` with the same
/// backoff, then `KILL`. Returns an error only if the process is still
/// alive after `KILL`.
pub fn kill_child(pid: u32) -> io::Result<()> {
    const BACKOFFS: u32 = 25;
    const BACKOFF: Duration = Duration::from_millis(20);

    for (signal, name) in [(libc::SIGINT, "INT"), (libc::SIGTERM, "TERM")] {
        if !process_alive(pid) {
            return Ok(());
        }
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
        for _ in 0..BACKOFFS {
            if !process_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(BACKOFF);
        }
        log::warn!("child {pid} did not exit after SIG{name}, escalating");
    }

    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    for _ in 0..BACKOFFS {
        if !process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(BACKOFF);
    }
    Err(io::Error::other(format!("child {pid} survived SIGKILL")))
}

/// Polls whether `pid` is still running, reaping it the moment it is
/// not.
///
/// A plain `kill(pid, 0)` existence check is not enough here: once
/// `kill_child` signals one of its own children, that child becomes a
/// zombie on exit and stays "alive" to `kill(pid, 0)` forever until
/// something calls `waitpid` on it. Since `kill_child` is the only
/// thing polling during the escalation backoff, it has to be the thing
/// that reaps too.
fn process_alive(pid: u32) -> bool {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG | libc::WUNTRACED) };
    if rc == 0 {
        return true;
    }
    if rc == pid as libc::pid_t {
        if libc::WIFSTOPPED(status) {
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGCONT) };
            return true;
        }
        return false;
    }
    // rc < 0: ECHILD (already reaped elsewhere) or ESRCH both mean gone.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_and_wait_true_exits_zero() {
        let (r, w) = {
            let mut fds = [0 as RawFd; 2];
            unsafe { libc::pipe(fds.as_mut_ptr()) };
            (fds[0], fds[1])
        };
        let req = ExecRequest {
            stdio: ExecStdio { in_fd: r, out_fd: w },
            filename: "/usr/bin/true",
            argv: &["true".to_string()],
            envp: &[],
            isolated: false,
            sandbox: None,
            set_controlling_terminal: false,
        };
        let pid = exec(&req).expect("fork");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
        let status = wait_child(pid).unwrap();
        assert_eq!(status, ExitStatus::Exited(0));
    }

    #[test]
    fn kill_child_escalation_reaps_sleep() {
        let (r, w) = {
            let mut fds = [0 as RawFd; 2];
            unsafe { libc::pipe(fds.as_mut_ptr()) };
            (fds[0], fds[1])
        };
        let req = ExecRequest {
            stdio: ExecStdio { in_fd: r, out_fd: w },
            filename: "/bin/sleep",
            argv: &["sleep".to_string(), "30".to_string()],
            envp: &[],
            isolated: false,
            sandbox: None,
            set_controlling_terminal: false,
        };
        let pid = exec(&req).expect("fork");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
        assert!(process_alive(pid));
        kill_child(pid).unwrap();
        let _ = wait_child(pid);
        assert!(!process_alive(pid));
    }

    #[test]
    fn close_all_except_keeps_listed_fds_open() {
        // fork so the close sweep can't take down the test harness's own fds.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            let fd = unsafe { libc::dup(0) };
            unsafe { close_all_except(&[0, 1, 2, fd]) };
            let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            unsafe { libc::_exit(if rc >= 0 { 0 } else { 1 }) };
        }
        let status = wait_child(pid as u32).unwrap();
        assert_eq!(status, ExitStatus::Exited(0));
    }
}

//! Isolated exec: clone into fresh namespaces, clone the template rootfs
//! via bind mounts, `pivot_root`, then `execvpe` (spec §4.5 "Isolated path").
//!
//! Mirrors the original's reason for going through the raw `clone(2)`
//! syscall rather than `libc::clone`'s callback form: we want fork-like
//! "continue executing the same function in the child" semantics, which
//! the raw syscall gives for free and the glibc wrapper does not.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use super::{
    close_all_except, dup2_stdio, errno, reset_default_signal_handlers, set_controlling_terminal,
    ExecRequest, PreparedExec,
};

const CLONE_FLAGS: libc::c_int = libc::SIGCHLD
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWUSER;

pub(super) fn exec_isolated(req: &ExecRequest) -> io::Result<u32> {
    let spec = req
        .sandbox
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "isolated exec requires a SandboxSpec"))?;

    if !spec.template_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("rootfs template directory '{}' does not exist", spec.template_dir.display()),
        ));
    }
    std::fs::create_dir_all(&spec.run_dir)?;

    // Built in the parent, before `clone`, for the same reason
    // `exec_non_isolated` builds it before `fork` (see `PreparedExec`).
    let prepared = PreparedExec::new(req.filename, req.argv, req.envp)?;

    let mut procpipe = [0 as RawFd; 2];
    if unsafe { libc::pipe(procpipe.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let [pipe_read, pipe_write] = procpipe;

    // SAFETY: raw `clone(2)` syscall used instead of `libc::clone` so the
    // child falls through and continues in this same stack frame, the
    // same way `fork()`'s child does — `libc::clone` instead requires a
    // separate child stack and entry point, which does not fit this
    // fork-like control flow.
    let pid = unsafe { libc::syscall(libc::SYS_clone, CLONE_FLAGS, std::ptr::null::<u8>()) };

    if pid < 0 {
        unsafe {
            libc::close(pipe_read);
            libc::close(pipe_write);
        }
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        unsafe { libc::close(pipe_write) };
        child_main(req, spec, pipe_read, &prepared);
    }

    // Parent.
    unsafe { libc::close(pipe_read) };
    let pid = pid as libc::pid_t;
    if let Err(e) = write_uid_gid_maps(pid) {
        unsafe { libc::close(pipe_write) };
        return Err(e);
    }
    let pidbuf = pid.to_string();
    unsafe {
        libc::write(pipe_write, pidbuf.as_ptr().cast(), pidbuf.len());
        libc::close(pipe_write);
    }

    Ok(pid as u32)
}

/// Runs entirely in the cloned child. Never returns: every path ends in
/// `_exit`, either via a successful `execvpe` or an error exit carrying
/// `errno` as the status (spec §4.5, "exit child with errno as status").
fn child_main(req: &ExecRequest, spec: &super::SandboxSpec, pipe_read: RawFd, prepared: &PreparedExec) -> ! {
    reset_default_signal_handlers();
    if dup2_stdio(req.stdio).is_err() {
        unsafe { libc::_exit(errno()) };
    }
    // SAFETY: freshly cloned child, single thread, only the caller-owned
    // stdio fds and the coordination pipe read end survive the sweep.
    unsafe { close_all_except(&[0, 1, 2, pipe_read]) };

    if let Err(e) = apply_resource_limits(spec) {
        unsafe { libc::_exit(e.raw_os_error().unwrap_or(libc::EIO)) };
    }

    let mut pidbuf = [0u8; 16];
    let n = match full_read(pipe_read, &mut pidbuf) {
        Ok(n) if n > 0 => n,
        _ => unsafe { libc::_exit(errno()) },
    };
    unsafe { libc::close(pipe_read) };
    let child_pid: u32 = match std::str::from_utf8(&pidbuf[..n]).ok().and_then(|s| s.trim().parse().ok()) {
        Some(p) => p,
        None => unsafe { libc::_exit(libc::EINVAL) },
    };

    let newroot = spec.run_dir.join(child_pid.to_string());
    if let Err(e) = clone_rootfs(spec, &newroot) {
        unsafe { libc::_exit(e.raw_os_error().unwrap_or(libc::EIO)) };
    }

    let mut home_for_chdir: Option<PathBuf> = None;
    if let (Some(home), Some(username)) = (&spec.user_home_dir, &spec.username) {
        match bind_user_home(&newroot, home, username) {
            Ok(container_home) => home_for_chdir = Some(container_home),
            Err(e) => unsafe { libc::_exit(e.raw_os_error().unwrap_or(libc::EIO)) },
        }
    }

    if let Err(e) = pivot_into(&newroot, &spec.hostname) {
        unsafe { libc::_exit(e.raw_os_error().unwrap_or(libc::EIO)) };
    }

    if let Some(home) = &home_for_chdir {
        let _ = std::env::set_current_dir(home);
        print_motd_if_shell(req.filename);
    }

    if req.set_controlling_terminal && set_controlling_terminal(0).is_err() {
        unsafe { libc::_exit(errno()) };
    }

    let err = prepared.exec();
    unsafe { libc::_exit(err.raw_os_error().unwrap_or(libc::EIO)) };
}

fn full_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    loop {
        let rc = unsafe {
            libc::read(fd, buf[total..].as_mut_ptr().cast(), buf.len() - total)
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if rc == 0 || total >= buf.len() {
            return Ok(total);
        }
        total += rc as usize;
    }
}

fn set_limit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    if value == 0 {
        return Ok(());
    }
    unsafe {
        let mut rl: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(resource, &mut rl) != 0 {
            return Err(io::Error::last_os_error());
        }
        rl.rlim_cur = rl.rlim_cur.min(value);
        rl.rlim_max = rl.rlim_max.min(value);
        if libc::setrlimit(resource, &rl) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn apply_resource_limits(spec: &super::SandboxSpec) -> io::Result<()> {
    set_limit(libc::RLIMIT_AS, spec.max_memory_mb.saturating_mul(1024 * 1024))?;
    set_limit(libc::RLIMIT_CPU, spec.max_cpu_secs)?;
    if spec.min_nice_ceiling != 0 {
        // Ceiling = 20 - value (spec §4.5 / original `set_limits`).
        let ceiling = (20 - spec.min_nice_ceiling).max(0) as u64;
        set_limit(libc::RLIMIT_NICE, ceiling)?;
    }
    Ok(())
}

fn write_uid_gid_maps(pid: libc::pid_t) -> io::Result<()> {
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    std::fs::write(format!("/proc/{pid}/setgroups"), "deny\n")?;
    std::fs::write(format!("/proc/{pid}/uid_map"), format!("0 {uid} 1\n"))?;
    std::fs::write(format!("/proc/{pid}/gid_map"), format!("0 {gid} 1\n"))?;
    Ok(())
}

fn cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in path"))
}

fn bind_mount(src: &Path, dst: &Path, readonly: bool) -> io::Result<()> {
    let c_src = cstr(src)?;
    let c_dst = cstr(dst)?;
    unsafe {
        if libc::mount(c_src.as_ptr(), c_dst.as_ptr(), std::ptr::null(), libc::MS_BIND | libc::MS_REC, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if readonly {
            // The read-only flag only takes effect on a remount, so every
            // directory is bound twice (spec §4.5 step 3).
            if libc::mount(
                std::ptr::null(),
                c_dst.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Template dirs never bound directly — `/proc` and `/home` are recreated
/// fresh per-child, `/tmp` is left for the child's own ephemeral use.
const SKIP_TOP_LEVEL: &[&str] = &["proc", "tmp", "home"];

fn clone_rootfs(spec: &super::SandboxSpec, newroot: &Path) -> io::Result<()> {
    std::fs::create_dir_all(newroot)?;
    for entry in std::fs::read_dir(&spec.template_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if SKIP_TOP_LEVEL.contains(&name_str.as_ref()) {
            continue;
        }
        let dst = newroot.join(&name);
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&dst)?;
        } else {
            std::fs::File::create(&dst)?;
        }
        bind_mount(&entry.path(), &dst, true)?;
    }
    for dir in ["proc", "tmp", "home"] {
        std::fs::create_dir_all(newroot.join(dir))?;
    }
    Ok(())
}

fn bind_user_home(newroot: &Path, host_home: &Path, username: &str) -> io::Result<PathBuf> {
    let container_rel = PathBuf::from("home").join(username);
    let container_home = newroot.join(&container_rel);
    std::fs::create_dir_all(&container_home)?;
    bind_mount(host_home, &container_home, false)?;
    Ok(PathBuf::from("/").join(container_rel))
}

fn pivot_into(newroot: &Path, hostname: &str) -> io::Result<()> {
    let c_hostname = cstr(Path::new(hostname))?;
    unsafe {
        if libc::sethostname(c_hostname.as_ptr(), hostname.len()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let oldroot = newroot.join(".old");
    std::fs::create_dir_all(&oldroot)?;

    // `pivot_root` requires `newroot` itself be a mount point, hence the
    // self-bind (spec §4.5 step 5).
    bind_mount(newroot, newroot, false)?;

    let c_newroot = cstr(newroot)?;
    let c_oldroot = cstr(&oldroot)?;
    unsafe {
        if libc::syscall(libc::SYS_pivot_root, c_newroot.as_ptr(), c_oldroot.as_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    std::env::set_current_dir("/")?;

    let c_proc_src = CString::new("proc").unwrap();
    let c_proc_dst = CString::new("/proc").unwrap();
    let c_proc_fs = CString::new("proc").unwrap();
    unsafe {
        if libc::mount(c_proc_src.as_ptr(), c_proc_dst.as_ptr(), c_proc_fs.as_ptr(), 0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let c_old = CString::new("/.old").unwrap();
    unsafe {
        if libc::umount2(c_old.as_ptr(), libc::MNT_DETACH) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn print_motd_if_shell(filename: &str) {
    let Ok(shells) = std::fs::read_to_string("/etc/shells") else { return };
    let is_shell = shells.lines().any(|line| line.trim() == filename);
    if !is_shell {
        return;
    }
    if let Ok(motd) = std::fs::read_to_string("/etc/motd") {
        print!("{motd}");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }
}

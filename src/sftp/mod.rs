//! SFTP request loop (spec §4.7, Module G).
//!
//! Single-threaded request/response dispatch atop an authenticated
//! transport (the transport itself — framing, draft-ietf-secsh-filexfer
//! wire encoding — is an external collaborator per spec §1/§6; this
//! module is the transport-agnostic core that a wire adapter calls
//! into, matching the split the teacher draws between `socket/server.rs`
//! (framing) and the state it drives).

use std::fs;
use std::io::Read as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;

use crate::sandbox_root;

/// SFTP status codes this crate's subset of the protocol can return
/// (spec §4.7 "Errors").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpStatus {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    OpUnsupported,
    FileAlreadyExists,
}

/// Maps a raw `errno` to an SFTP status (spec §4.7 "Errors").
pub fn errno_to_status(errno: i32) -> SftpStatus {
    match errno {
        libc::EPERM | libc::EACCES => SftpStatus::PermissionDenied,
        libc::ENOENT => SftpStatus::NoSuchFile,
        libc::ENOTDIR => SftpStatus::Failure,
        libc::EEXIST => SftpStatus::FileAlreadyExists,
        _ => SftpStatus::Failure,
    }
}

fn io_error_to_status(e: &std::io::Error) -> SftpStatus {
    match e.kind() {
        std::io::ErrorKind::NotFound => SftpStatus::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => SftpStatus::PermissionDenied,
        std::io::ErrorKind::AlreadyExists => SftpStatus::FileAlreadyExists,
        _ => e.raw_os_error().map(errno_to_status).unwrap_or(SftpStatus::Failure),
    }
}

/// Capability oracle supplied externally (spec §4.7 "Path sandboxing",
/// "permission is checked per-path against a capability oracle").
pub trait CapabilityOracle: Send + Sync {
    fn can_read(&self, path: &std::path::Path) -> bool;
    fn can_write(&self, path: &std::path::Path) -> bool;
    fn can_delete(&self, path: &std::path::Path) -> bool;
    fn can_mkdir(&self, path: &std::path::Path) -> bool;
}

/// Oracle that permits everything — default for a session whose
/// transfer root alone is the access boundary.
pub struct AllowAll;

impl CapabilityOracle for AllowAll {
    fn can_read(&self, _: &std::path::Path) -> bool {
        true
    }
    fn can_write(&self, _: &std::path::Path) -> bool {
        true
    }
    fn can_delete(&self, _: &std::path::Path) -> bool {
        true
    }
    fn can_mkdir(&self, _: &std::path::Path) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Dir,
    File,
}

struct Handle {
    kind: HandleKind,
    #[allow(dead_code)] // not yet consumed: FSTAT is unimplemented (spec §4.7).
    path: PathBuf,
    /// `READDIR` emits entries once, then EOF on the next call.
    dir_entries: Option<Vec<String>>,
    file: Option<fs::File>,
}

/// File metadata returned by `STAT`/`LSTAT`/`FSTAT`.
#[derive(Debug, Clone, Copy)]
pub struct FileAttrs {
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
}

impl From<fs::Metadata> for FileAttrs {
    fn from(m: fs::Metadata) -> Self {
        Self { size: m.size(), mode: m.permissions().mode(), is_dir: m.is_dir() }
    }
}

const READ_CAP: usize = 32 * 1024;

/// One client's SFTP session: a handle table plus the per-user transfer
/// root and current directory.
pub struct SftpSession {
    root: PathBuf,
    cwd: PathBuf,
    handles: Vec<(u32, Handle)>,
    next_handle: u32,
    oracle: Box<dyn CapabilityOracle>,
}

impl SftpSession {
    pub fn new(root: PathBuf) -> Self {
        Self::with_oracle(root, Box::new(AllowAll))
    }

    pub fn with_oracle(root: PathBuf, oracle: Box<dyn CapabilityOracle>) -> Self {
        Self { root, cwd: PathBuf::from("/"), handles: Vec::new(), next_handle: 1, oracle }
    }

    fn resolve(&self, client_path: &str) -> Result<PathBuf, SftpStatus> {
        sandbox_root::resolve(&self.root, &self.cwd, client_path).map_err(|_| SftpStatus::PermissionDenied)
    }

    fn alloc_handle(&mut self, kind: HandleKind, path: PathBuf, dir_entries: Option<Vec<String>>, file: Option<fs::File>) -> u32 {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.push((id, Handle { kind, path, dir_entries, file }));
        id
    }

    pub fn realpath(&self, client_path: &str) -> Result<String, SftpStatus> {
        let resolved = self.resolve(client_path)?;
        Ok(sandbox_root::virtual_path(&self.root, &resolved).to_string_lossy().into_owned())
    }

    pub fn opendir(&mut self, client_path: &str) -> Result<u32, SftpStatus> {
        let resolved = self.resolve(client_path)?;
        if !self.oracle.can_read(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        let entries: Vec<String> = fs::read_dir(&resolved)
            .map_err(|e| io_error_to_status(&e))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        Ok(self.alloc_handle(HandleKind::Dir, resolved, Some(entries), None))
    }

    pub fn open(&mut self, client_path: &str, write: bool, create: bool) -> Result<u32, SftpStatus> {
        let resolved = self.resolve(client_path)?;
        if write && !self.oracle.can_write(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        if !write && !self.oracle.can_read(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        let file = fs::OpenOptions::new()
            .read(!write)
            .write(write)
            .create(write && create)
            .truncate(write)
            .open(&resolved)
            .map_err(|e| io_error_to_status(&e))?;
        Ok(self.alloc_handle(HandleKind::File, resolved, None, Some(file)))
    }

    fn find_handle_mut(&mut self, handle: u32) -> Result<&mut Handle, SftpStatus> {
        self.handles.iter_mut().find(|(id, _)| *id == handle).map(|(_, h)| h).ok_or(SftpStatus::Failure)
    }

    pub fn stat(&self, client_path: &str) -> Result<FileAttrs, SftpStatus> {
        let resolved = self.resolve(client_path)?;
        fs::metadata(&resolved).map(FileAttrs::from).map_err(|e| io_error_to_status(&e))
    }

    pub fn lstat(&self, client_path: &str) -> Result<FileAttrs, SftpStatus> {
        let resolved = self.resolve(client_path)?;
        fs::symlink_metadata(&resolved).map(FileAttrs::from).map_err(|e| io_error_to_status(&e))
    }

    pub fn fstat(&mut self, _handle: u32) -> Result<FileAttrs, SftpStatus> {
        Err(SftpStatus::OpUnsupported)
    }

    /// Returns `Ok(None)` once all entries of this directory handle have
    /// already been emitted (client should treat this as EOF).
    pub fn readdir(&mut self, handle: u32) -> Result<Option<Vec<String>>, SftpStatus> {
        let h = self.find_handle_mut(handle)?;
        if h.kind != HandleKind::Dir {
            return Err(SftpStatus::Failure);
        }
        Ok(h.dir_entries.take())
    }

    /// Reads up to 32 KiB starting at `offset` (spec §4.7, "caps length
    /// at 32 KiB"). Returns `Ok(None)` at EOF.
    pub fn read(&mut self, handle: u32, offset: u64, length: usize) -> Result<Option<Vec<u8>>, SftpStatus> {
        use std::io::{Seek, SeekFrom};
        let length = length.min(READ_CAP);
        let h = self.find_handle_mut(handle)?;
        let file = h.file.as_mut().ok_or(SftpStatus::Failure)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| io_error_to_status(&e))?;
        let mut buf = vec![0u8; length];
        let mut total = 0;
        loop {
            let n = file.read(&mut buf[total..]).map_err(|e| io_error_to_status(&e))?;
            if n == 0 {
                break;
            }
            total += n;
            if total == length {
                break;
            }
        }
        if total == 0 {
            return Ok(None);
        }
        buf.truncate(total);
        Ok(Some(buf))
    }

    pub fn write(&mut self, handle: u32, offset: u64, data: &[u8]) -> Result<(), SftpStatus> {
        use std::io::{Seek, SeekFrom, Write as _};
        let h = self.find_handle_mut(handle)?;
        let file = h.file.as_mut().ok_or(SftpStatus::Failure)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| io_error_to_status(&e))?;
        file.write_all(data).map_err(|e| io_error_to_status(&e))
    }

    pub fn close(&mut self, handle: u32) -> Result<(), SftpStatus> {
        let pos = self.handles.iter().position(|(id, _)| *id == handle).ok_or(SftpStatus::Failure)?;
        self.handles.remove(pos);
        Ok(())
    }

    pub fn remove(&mut self, client_path: &str) -> Result<(), SftpStatus> {
        let resolved = self.resolve(client_path)?;
        if !self.oracle.can_delete(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        fs::remove_file(&resolved).map_err(|e| io_error_to_status(&e))
    }

    pub fn mkdir(&mut self, client_path: &str) -> Result<(), SftpStatus> {
        let resolved = self.resolve(client_path)?;
        if !self.oracle.can_mkdir(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        fs::create_dir(&resolved).map_err(|e| io_error_to_status(&e))
    }

    pub fn rmdir(&mut self, client_path: &str) -> Result<(), SftpStatus> {
        let resolved = self.resolve(client_path)?;
        if !self.oracle.can_delete(&resolved) {
            return Err(SftpStatus::PermissionDenied);
        }
        fs::remove_dir(&resolved).map_err(|e| io_error_to_status(&e))
    }

    /// Refuses to overwrite an existing destination (spec §4.7 "RENAME
    /// (refuses to overwrite)").
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpStatus> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !self.oracle.can_write(&src) || !self.oracle.can_write(&dst) {
            return Err(SftpStatus::PermissionDenied);
        }
        if dst.exists() {
            return Err(SftpStatus::FileAlreadyExists);
        }
        fs::rename(&src, &dst).map_err(|e| io_error_to_status(&e))
    }

    /// Spec §4.7: `SETSTAT`/`FSETSTAT` → permission denied.
    pub fn setstat(&mut self, _client_path: &str) -> Result<(), SftpStatus> {
        Err(SftpStatus::PermissionDenied)
    }

    pub fn fsetstat(&mut self, _handle: u32) -> Result<(), SftpStatus> {
        Err(SftpStatus::PermissionDenied)
    }

    /// Spec §4.7: `SYMLINK`/`READLINK`/`FSTAT` → unsupported.
    pub fn symlink(&mut self, _target: &str, _link_path: &str) -> Result<(), SftpStatus> {
        Err(SftpStatus::OpUnsupported)
    }

    pub fn readlink(&self, _client_path: &str) -> Result<String, SftpStatus> {
        Err(SftpStatus::OpUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, SftpSession) {
        let dir = tempfile::tempdir().unwrap();
        let session = SftpSession::new(dir.path().to_path_buf());
        (dir, session)
    }

    #[test]
    fn realpath_rejects_dotdot_escape() {
        let (_dir, session) = session();
        assert_eq!(session.realpath("..").unwrap_err(), SftpStatus::PermissionDenied);
    }

    #[test]
    fn realpath_returns_root_relative_virtual_path() {
        let (_dir, session) = session();
        assert_eq!(session.realpath("docs/file.txt").unwrap(), "/docs/file.txt");
    }

    #[test]
    fn mkdir_then_opendir_lists_entries_once_then_eof() {
        let (dir, mut session) = session();
        session.mkdir("sub").unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"hi").unwrap();
        let handle = session.opendir("sub").unwrap();
        let first = session.readdir(handle).unwrap().unwrap();
        assert_eq!(first, vec!["a.txt".to_string()]);
        assert!(session.readdir(handle).unwrap().is_none());
        session.close(handle).unwrap();
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, mut session) = session();
        let fh = session.open("file.bin", true, true).unwrap();
        session.write(fh, 0, b"hello world").unwrap();
        session.close(fh).unwrap();

        let fh = session.open("file.bin", false, false).unwrap();
        let data = session.read(fh, 0, 100).unwrap().unwrap();
        assert_eq!(data, b"hello world");
        assert!(session.read(fh, 11, 100).unwrap().is_none());
    }

    #[test]
    fn read_caps_length_at_32kib() {
        let (_dir, mut session) = session();
        let fh = session.open("big.bin", true, true).unwrap();
        session.write(fh, 0, &vec![7u8; 100_000]).unwrap();
        session.close(fh).unwrap();

        let fh = session.open("big.bin", false, false).unwrap();
        let data = session.read(fh, 0, 1_000_000).unwrap().unwrap();
        assert_eq!(data.len(), READ_CAP);
    }

    #[test]
    fn rename_refuses_to_overwrite_existing_destination() {
        let (_dir, mut session) = session();
        let fh = session.open("a.txt", true, true).unwrap();
        session.close(fh).unwrap();
        let fh = session.open("b.txt", true, true).unwrap();
        session.close(fh).unwrap();

        assert_eq!(session.rename("a.txt", "b.txt").unwrap_err(), SftpStatus::FileAlreadyExists);
    }

    #[test]
    fn setstat_and_symlink_family_are_refused_per_spec() {
        let (_dir, mut session) = session();
        assert_eq!(session.setstat("x").unwrap_err(), SftpStatus::PermissionDenied);
        assert_eq!(session.fsetstat(1).unwrap_err(), SftpStatus::PermissionDenied);
        assert_eq!(session.symlink("a", "b").unwrap_err(), SftpStatus::OpUnsupported);
        assert_eq!(session.readlink("a").unwrap_err(), SftpStatus::OpUnsupported);
    }

    #[test]
    fn errno_mapping_matches_spec_table() {
        assert_eq!(errno_to_status(libc::EPERM), SftpStatus::PermissionDenied);
        assert_eq!(errno_to_status(libc::EACCES), SftpStatus::PermissionDenied);
        assert_eq!(errno_to_status(libc::ENOENT), SftpStatus::NoSuchFile);
        assert_eq!(errno_to_status(libc::ENOTDIR), SftpStatus::Failure);
        assert_eq!(errno_to_status(libc::EEXIST), SftpStatus::FileAlreadyExists);
        assert_eq!(errno_to_status(libc::EIO), SftpStatus::Failure);
    }

    #[test]
    fn remove_respects_capability_oracle() {
        struct ReadOnly;
        impl CapabilityOracle for ReadOnly {
            fn can_read(&self, _: &std::path::Path) -> bool {
                true
            }
            fn can_write(&self, _: &std::path::Path) -> bool {
                false
            }
            fn can_delete(&self, _: &std::path::Path) -> bool {
                false
            }
            fn can_mkdir(&self, _: &std::path::Path) -> bool {
                false
            }
        }
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let mut session = SftpSession::with_oracle(dir.path().to_path_buf(), Box::new(ReadOnly));
        assert_eq!(session.remove("a.txt").unwrap_err(), SftpStatus::PermissionDenied);
    }
}

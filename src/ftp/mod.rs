//! FTP listener (SPEC_FULL.md "Supplemented features"; spec §6 wire
//! contract, §8 seed test S1).
//!
//! RFC 959 subset: `USER`/`PASS`/`PWD`/`CWD`/`MKD`/`RMD`/`NOOP`/`HELP`/
//! `PASV`/`TYPE I`/`STOR`/`APPE`/`RETR`/`LIST`/`RNFR`/`RNTO`/`DELE`/
//! `REIN`/`QUIT`, with the exact response codes named in §6. Built atop
//! the same [`crate::sandbox_root`] path sandboxing the SFTP loop uses.
//! This module implements the command state machine; the listening
//! socket and passive-mode data connection are a thin `tokio` wrapper
//! (the teacher's `socket/server.rs` accept-loop idiom) layered by the
//! caller — see [`FtpConnection`] for the testable, transport-agnostic
//! core.

use std::fs;
use std::path::PathBuf;

use crate::sandbox_root;

/// Auth backend contract this listener consumes (spec §6, reused from
/// [`crate::auth::AuthBackend`] rather than duplicated).
pub use crate::auth::AuthBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferType {
    Ascii,
    Image,
}

/// One client's FTP command-processing state (spec §4.4/§6). The data
/// connection itself (PASV socket) is represented only as the
/// `h1,h2,h3,h4,p1,p2` tuple this module hands back to the caller; the
/// caller owns the actual listening socket.
pub struct FtpConnection<'a> {
    root: PathBuf,
    cwd: PathBuf,
    username: Option<String>,
    authenticated: bool,
    rename_from: Option<PathBuf>,
    transfer_type: TransferType,
    backend: &'a dyn AuthBackend,
    passive_ip: [u8; 4],
}

impl<'a> FtpConnection<'a> {
    pub fn new(root: PathBuf, backend: &'a dyn AuthBackend, passive_ip: [u8; 4]) -> Self {
        Self {
            root,
            cwd: PathBuf::from("/"),
            username: None,
            authenticated: false,
            rename_from: None,
            transfer_type: TransferType::Ascii,
            backend,
            passive_ip,
        }
    }

    fn resolve(&self, client_path: &str) -> Option<PathBuf> {
        sandbox_root::resolve(&self.root, &self.cwd, client_path).ok()
    }

    /// Greeting sent immediately on accept (spec §6, code 220).
    pub fn greeting() -> String {
        "220 lbbs FTP server ready\r\n".to_string()
    }

    /// Dispatches one command line (without the trailing CRLF) and
    /// returns the response line(s) to send back.
    pub fn handle(&mut self, line: &str) -> String {
        let line = line.trim_end();
        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v.to_ascii_uppercase(), r.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "USER" => self.cmd_user(rest),
            "PASS" => self.cmd_pass(rest),
            "PWD" => format!("257 \"{}\"\r\n", self.cwd.display()),
            "CWD" => self.cmd_cwd(rest),
            "MKD" => self.cmd_mkd(rest),
            "RMD" => self.cmd_rmd(rest),
            "NOOP" => "200 NOOP ok\r\n".to_string(),
            "HELP" => "214 USER PASS PWD CWD MKD RMD NOOP HELP PASV TYPE STOR APPE RETR LIST RNFR RNTO DELE REIN QUIT\r\n".to_string(),
            "PASV" => self.cmd_pasv(),
            "TYPE" => self.cmd_type(rest),
            "STOR" => self.cmd_store(rest, false),
            "APPE" => self.cmd_store(rest, true),
            "RETR" => self.cmd_retr(rest),
            "LIST" => self.cmd_list_reply(rest),
            "RNFR" => self.cmd_rnfr(rest),
            "RNTO" => self.cmd_rnto(rest),
            "DELE" => self.cmd_dele(rest),
            "REIN" => self.cmd_rein(),
            "QUIT" => "231 Goodbye\r\n".to_string(),
            _ => "500 Unknown command\r\n".to_string(),
        }
    }

    fn cmd_user(&mut self, name: &str) -> String {
        self.username = Some(name.to_string());
        self.authenticated = false;
        "331 Password required\r\n".to_string()
    }

    fn cmd_pass(&mut self, password: &str) -> String {
        let Some(username) = self.username.clone() else {
            return "503 Login with USER first\r\n".to_string();
        };
        let result = self.backend.authenticate(Some(&username), Some(password));
        if result.ok {
            self.authenticated = true;
            "230 Login successful\r\n".to_string()
        } else {
            "530 Login incorrect\r\n".to_string()
        }
    }

    fn require_auth(&self) -> Option<String> {
        (!self.authenticated).then(|| "530 Not logged in\r\n".to_string())
    }

    fn cmd_cwd(&mut self, dir: &str) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        let Some(resolved) = self.resolve(dir) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        if !resolved.is_dir() {
            return "550 No such directory\r\n".to_string();
        }
        self.cwd = sandbox_root::virtual_path(&self.root, &resolved);
        "250 Directory changed\r\n".to_string()
    }

    fn cmd_mkd(&mut self, name: &str) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        match fs::create_dir(&resolved) {
            Ok(()) => "250 Directory created\r\n".to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => "450 Directory already exists\r\n".to_string(),
            Err(_) => "550 Failed to create directory\r\n".to_string(),
        }
    }

    fn cmd_rmd(&mut self, name: &str) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        match fs::remove_dir(&resolved) {
            Ok(()) => "250 Directory removed\r\n".to_string(),
            Err(_) => "550 Failed to remove directory\r\n".to_string(),
        }
    }

    /// Returns the `227` response in `h1,h2,h3,h4,p1,p2` form (spec §6).
    /// The port is a fixed placeholder here; the real listener
    /// substitutes the actual bound ephemeral port before sending.
    fn cmd_pasv(&self) -> String {
        let [h1, h2, h3, h4] = self.passive_ip;
        let port: u16 = 0;
        let (p1, p2) = (port / 256, port % 256);
        format!("227 Entering Passive Mode ({h1},{h2},{h3},{h4},{p1},{p2})\r\n")
    }

    fn cmd_type(&mut self, arg: &str) -> String {
        match arg.to_ascii_uppercase().as_str() {
            "I" => {
                self.transfer_type = TransferType::Image;
                "200 Type set to I\r\n".to_string()
            }
            "A" => {
                self.transfer_type = TransferType::Ascii;
                "200 Type set to A\r\n".to_string()
            }
            _ => "504 Unsupported type\r\n".to_string(),
        }
    }

    /// Stores `body` to `name`, truncating any existing content (spec
    /// §6, "STOR (truncating)"), or appending when `append` is set.
    /// The listener reads the data-connection body and passes it here;
    /// this core does not own the data socket.
    pub fn store(&mut self, name: &str, body: &[u8], append: bool) -> String {
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        let result = fs::OpenOptions::new().create(true).write(true).append(append).truncate(!append).open(&resolved).and_then(|mut f| {
            use std::io::Write as _;
            f.write_all(body)
        });
        match result {
            Ok(()) => "226 Transfer complete\r\n".to_string(),
            Err(_) => "550 Transfer failed\r\n".to_string(),
        }
    }

    fn cmd_store(&mut self, name: &str, _append: bool) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        format!("150 Opening {} mode data connection for {name}\r\n", self.type_name())
    }

    fn cmd_retr(&mut self, name: &str) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        if !resolved.is_file() {
            return "550 No such file\r\n".to_string();
        }
        format!("150 Opening {} mode data connection for {name}\r\n", self.type_name())
    }

    /// Reads the file body for an in-progress `RETR` (spec §6). Called
    /// by the listener after sending the `150` from [`Self::cmd_retr`].
    pub fn retrieve_body(&self, name: &str) -> std::io::Result<Vec<u8>> {
        let resolved = self.resolve(name).ok_or_else(|| std::io::Error::other("path escapes transfer root"))?;
        fs::read(resolved)
    }

    fn type_name(&self) -> &'static str {
        match self.transfer_type {
            TransferType::Ascii => "ASCII",
            TransferType::Image => "BINARY",
        }
    }

    /// `LIST`'s control-channel reply (spec §6: `125`/`150` then `226`
    /// once the data connection delivers the listing). The actual entry
    /// names come from [`Self::list`]; the listener sends those over the
    /// data connection between this `150` and the final `226`.
    fn cmd_list_reply(&mut self, _dir: &str) -> String {
        if let Some(resp) = self.require_auth() {
            return resp;
        }
        "150 Opening ASCII mode data connection for file list\r\n".to_string()
    }

    fn cmd_list(&self, dir: &str) -> Vec<String> {
        let target = if dir.is_empty() { self.cwd.clone() } else { PathBuf::from(dir) };
        let Some(resolved) = self.resolve(&target.to_string_lossy()) else { return Vec::new() };
        let Ok(entries) = fs::read_dir(&resolved) else { return Vec::new() };
        entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect()
    }

    /// Directory listing for `LIST` (spec §8 S1, "list shows \"foobar\"").
    pub fn list(&self, dir: &str) -> Vec<String> {
        self.cmd_list(dir)
    }

    fn cmd_rnfr(&mut self, name: &str) -> String {
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        if !resolved.exists() {
            return "550 No such file\r\n".to_string();
        }
        self.rename_from = Some(resolved);
        "350 Ready for RNTO\r\n".to_string()
    }

    fn cmd_rnto(&mut self, name: &str) -> String {
        let Some(from) = self.rename_from.take() else {
            return "503 RNFR required first\r\n".to_string();
        };
        let Some(to) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        match fs::rename(&from, &to) {
            Ok(()) => "250 Rename successful\r\n".to_string(),
            Err(_) => "550 Rename failed\r\n".to_string(),
        }
    }

    fn cmd_dele(&mut self, name: &str) -> String {
        let Some(resolved) = self.resolve(name) else {
            return "550 Path escapes transfer root\r\n".to_string();
        };
        match fs::remove_file(&resolved) {
            Ok(()) => "250 File deleted\r\n".to_string(),
            Err(_) => "550 Delete failed\r\n".to_string(),
        }
    }

    /// Resets the session back to pre-login state (spec §6, "REIN"→220).
    fn cmd_rein(&mut self) -> String {
        self.username = None;
        self.authenticated = false;
        self.cwd = PathBuf::from("/");
        self.rename_from = None;
        "220 lbbs FTP server ready\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthResult;

    struct FakeBackend;
    impl AuthBackend for FakeBackend {
        fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> AuthResult {
            AuthResult {
                ok: username == Some("bbs_test") && password == Some("test"),
                user_id: username.unwrap_or_default().to_string(),
                priv_level: "user".to_string(),
            }
        }
    }

    #[test]
    fn s1_ftp_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend;
        let mut conn = FtpConnection::new(dir.path().to_path_buf(), &backend, [127, 0, 0, 1]);

        assert!(conn.handle("USER bbs_test").starts_with("331"));
        assert!(conn.handle("PASS test").starts_with("230"));
        assert!(conn.handle("MKD test").starts_with("250"));
        assert!(conn.handle("MKD test").starts_with("450"));

        assert!(conn.handle("PASV").starts_with("227"));
        assert!(conn.handle("STOR foobar.txt").starts_with("150"));
        assert_eq!(conn.store("foobar.txt", b"Hello world\r\nGoodbye world\r\n", false), "226 Transfer complete\r\n");

        assert!(conn.list("").contains(&"foobar.txt".to_string()));

        // STOR again truncates.
        assert_eq!(conn.store("foobar.txt", b"new body", false), "226 Transfer complete\r\n");
        let body = conn.retrieve_body("foobar.txt").unwrap();
        assert_eq!(body, b"new body");

        // APPE appends.
        assert_eq!(conn.store("foobar.txt", b" appended", true), "226 Transfer complete\r\n");
        let body = conn.retrieve_body("foobar.txt").unwrap();
        assert_eq!(body, b"new body appended");

        assert!(conn.handle("RNFR foobar.txt").starts_with("350"));
        assert!(conn.handle("RNTO foobar2.txt").starts_with("250"));

        assert!(conn.handle("DELE foobar2.txt").starts_with("250"));
        assert!(conn.list("test").is_empty());

        assert!(conn.handle("RMD test").starts_with("250"));
        assert!(conn.handle("REIN").starts_with("220"));
        assert!(conn.handle("QUIT").starts_with("231"));
    }

    #[test]
    fn unauthenticated_cwd_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend;
        let mut conn = FtpConnection::new(dir.path().to_path_buf(), &backend, [127, 0, 0, 1]);
        assert!(conn.handle("CWD test").starts_with("530"));
    }

    #[test]
    fn wrong_password_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend;
        let mut conn = FtpConnection::new(dir.path().to_path_buf(), &backend, [127, 0, 0, 1]);
        conn.handle("USER bbs_test");
        assert!(conn.handle("PASS wrong").starts_with("530"));
    }

    #[test]
    fn rnto_without_rnfr_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend;
        let mut conn = FtpConnection::new(dir.path().to_path_buf(), &backend, [127, 0, 0, 1]);
        assert!(conn.handle("RNTO x").starts_with("503"));
    }
}

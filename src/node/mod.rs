//! Node — one live client session (spec §3, "Node").
//!
//! A `Node` is owned by its handler task for the duration of a session.
//! Most fields live behind [`NodeInner`], guarded by a single mutex per
//! §5 ("one mutex per node covers general mutable state"); a second,
//! independent mutex (`pty_lock`) serializes PTY-affecting mutations
//! (spy enable/disable, the input translation table) per §4.2's lock
//! ordering note (`registry → node → pty`).

pub mod registry;

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::pty::{PtyBridge, TranslationTable};

pub use registry::{NodeGuard, NodeRegistry, RegistryError};

/// Module pin — a reference-counted handle that keeps a protocol module
/// "loaded" for as long as any node references it (spec §9, "manual
/// reference counts on protocol modules"). The real module loader is an
/// external collaborator (spec §1); this crate only needs the handle's
/// shared-ownership semantics, so it is modeled as an `Arc<str>` naming
/// the module.
pub type ModulePin = Arc<str>;

/// Ordered key→string session variable map (spec §3, "per-session variables").
#[derive(Debug, Default, Clone)]
pub struct VarTable(Vec<(String, String)>);

impl VarTable {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if let Some(existing) = self.0.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value.into();
        } else {
            self.0.push((key, value.into()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Mutable node state guarded by [`Node::inner`].
#[derive(Debug)]
pub struct NodeInner {
    /// Read fd for the raw (possibly TLS-relayed) socket.
    pub rfd: RawFd,
    /// Write fd for the raw socket.
    pub wfd: RawFd,
    /// PTY bridge, present once `node_request`'s handler allocates one.
    pub pty: Option<PtyBridge>,
    /// Secondary observer read/write pair (spy).
    pub spy: Option<(RawFd, RawFd)>,
    /// Input translation table (spec §4.3.1) — PTY-affecting, but stored
    /// here and mutated only while `pty_lock` is held.
    pub translation: TranslationTable,
    /// Authenticated user, set only through [`NodeInner::authenticate`].
    pub user: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub echo: bool,
    pub buffered: bool,
    pub ansi: bool,
    pub bps: u32,
    pub char_pause_us: u64,
    pub child_pid: u32,
    pub menu_path: Vec<String>,
    pub vars: VarTable,
    pub skip_join: bool,
    pub displaying_menu: bool,
}

impl NodeInner {
    /// Atomic authenticate step (spec §3 invariant: "user is set only
    /// through an atomic authenticate step"; §4.4.1 "On success, set
    /// session variables NODENUM, USERID, USERPRIV, USERNAME").
    pub fn authenticate(&mut self, username: &str, priv_level: &str, node_id: u32) {
        self.user = Some(username.to_string());
        self.vars.set("NODENUM", node_id.to_string());
        self.vars.set("USERID", username.to_string());
        self.vars.set("USERPRIV", priv_level.to_string());
        self.vars.set("USERNAME", username.to_string());
    }
}

/// One live client session.
#[derive(Debug)]
pub struct Node {
    pub id: u32,
    pub protocol: &'static str,
    pub created: Instant,
    pub ip: String,
    pub port: u16,
    pub active: AtomicBool,
    pub interrupt: AtomicBool,
    pub interrupt_ack: AtomicBool,
    pub module: ModulePin,
    inner: Mutex<NodeInner>,
    pty_lock: Mutex<()>,
}

/// Counter backing lifetime-total node allocations (spec §4.2, `request`
/// "increments a lifetime-total counter for reporting").
pub(crate) static LIFETIME_NODES: AtomicU32 = AtomicU32::new(0);

impl Node {
    fn new(
        id: u32,
        protocol: &'static str,
        module: ModulePin,
        rfd: RawFd,
        wfd: RawFd,
        ip: String,
        port: u16,
    ) -> Self {
        LIFETIME_NODES.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            protocol,
            created: Instant::now(),
            ip,
            port,
            active: AtomicBool::new(true),
            interrupt: AtomicBool::new(false),
            interrupt_ack: AtomicBool::new(false),
            module,
            inner: Mutex::new(NodeInner {
                rfd,
                wfd,
                pty: None,
                spy: None,
                translation: TranslationTable::new(),
                user: None,
                cols: 80,
                rows: 24,
                echo: true,
                buffered: true,
                ansi: true,
                bps: 0,
                char_pause_us: 0,
                child_pid: 0,
                menu_path: Vec::new(),
                vars: VarTable::new(),
                skip_join: false,
                displaying_menu: false,
            }),
            pty_lock: Mutex::new(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, NodeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_pty(&self) -> std::sync::MutexGuard<'_, ()> {
        self.pty_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether this session lasted under 5 seconds and never logged in
    /// (spec §4.2 shutdown, "short-session" event; §3 glossary "Short session").
    pub fn is_short_session(&self) -> bool {
        self.created.elapsed().as_secs() < 5 && self.lock().user.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_table_set_overwrites_existing_key() {
        let mut vars = VarTable::new();
        vars.set("A", "1");
        vars.set("A", "2");
        assert_eq!(vars.get("A"), Some("2"));
        assert_eq!(vars.iter().count(), 1);
    }

    #[test]
    fn authenticate_sets_session_vars_and_user() {
        let node = Node::new(3, "test", Arc::from("test"), -1, -1, "127.0.0.1".into(), 0);
        node.lock().authenticate("alice", "user", 3);
        let inner = node.lock();
        assert_eq!(inner.user.as_deref(), Some("alice"));
        assert_eq!(inner.vars.get("NODENUM"), Some("3"));
        assert_eq!(inner.vars.get("USERPRIV"), Some("user"));
        assert_eq!(inner.vars.get("USERNAME"), Some("alice"));
    }
}

//! Node registry (spec §4.2, Module B).
//!
//! Ordered collection of live sessions. A single readers/writer lock
//! guards the `Vec<Arc<Node>>`; per-node and per-pty locks are acquired
//! only after releasing (or while still holding, for `get`) the
//! registry lock, in the documented order `registry → node → pty`
//! (spec §5).
//!
//! Per spec §9 ("Globals... should become members of a single server
//! context"), the process-wide `shutting_down` flag and the
//! lifetime-total counter live on [`NodeRegistry`] itself rather than as
//! free-standing statics.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

use super::{ModulePin, Node, NodeInner};

/// Errors from [`NodeRegistry::request`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RegistryError {
    AtCapacity(usize),
    ShuttingDown,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AtCapacity(max) => write!(f, "node capacity reached ({max} nodes)"),
            Self::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// "Get node, return holding lock" scoped handle (spec §9).
///
/// The node mutex is acquired in [`NodeRegistry::get`] and released when
/// this guard drops. Field order matters: `guard` must drop before
/// `node` so the mutex unlocks while the `Arc<Node>` (and the `Mutex`
/// living inside it) is still alive.
pub struct NodeGuard {
    guard: MutexGuard<'static, NodeInner>,
    node: Arc<Node>,
}

impl NodeGuard {
    fn new(node: Arc<Node>) -> Self {
        let guard = node.lock();
        // SAFETY: `guard` borrows `node.inner`, which lives in the heap
        // allocation backing `Arc<Node>`. `node` is stored alongside the
        // guard in this struct and is declared after `guard`, so it is
        // dropped after `guard` — the borrow never outlives its referent.
        let guard: MutexGuard<'static, NodeInner> = unsafe { std::mem::transmute(guard) };
        Self { guard, node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl std::ops::Deref for NodeGuard {
    type Target = NodeInner;
    fn deref(&self) -> &NodeInner {
        &self.guard
    }
}

impl std::ops::DerefMut for NodeGuard {
    fn deref_mut(&mut self) -> &mut NodeInner {
        &mut self.guard
    }
}

/// Ordered collection of live sessions.
pub struct NodeRegistry {
    nodes: RwLock<Vec<Arc<Node>>>,
    handler_threads: Mutex<Vec<(u32, JoinHandle<()>)>>,
    shutting_down: AtomicBool,
    max_nodes: usize,
    lifetime_total: AtomicUsize,
}

impl NodeRegistry {
    pub fn new(max_nodes: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(Vec::new()),
            handler_threads: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            max_nodes,
            lifetime_total: AtomicUsize::new(0),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Allocate a node at the smallest unused positive id (spec §8 property 1).
    pub fn request(
        &self,
        protocol: &'static str,
        module: ModulePin,
        rfd: RawFd,
        wfd: RawFd,
        ip: String,
        port: u16,
    ) -> Result<Arc<Node>, RegistryError> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }
        let mut nodes = self.nodes.write().unwrap();
        if nodes.len() >= self.max_nodes {
            return Err(RegistryError::AtCapacity(self.max_nodes));
        }

        // Smallest unused positive id: the list is sorted by id, so the
        // first gap (or one-past-the-end) is correct and linear to find.
        let mut id = 1u32;
        let mut insert_at = nodes.len();
        for (idx, n) in nodes.iter().enumerate() {
            if n.id != id {
                insert_at = idx;
                break;
            }
            id += 1;
        }

        let node = Arc::new(Node::new(id, protocol, module, rfd, wfd, ip, port));
        nodes.insert(insert_at, node.clone());
        self.lifetime_total.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    pub fn record_handler_thread(&self, node_id: u32, handle: JoinHandle<()>) {
        self.handler_threads.lock().unwrap().push((node_id, handle));
    }

    fn take_handler_thread(&self, node_id: u32) -> Option<JoinHandle<()>> {
        let mut threads = self.handler_threads.lock().unwrap();
        let pos = threads.iter().position(|(id, _)| *id == node_id)?;
        Some(threads.remove(pos).1)
    }

    pub fn count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn count_for_module(&self, module: &str) -> usize {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .filter(|n| &*n.module == module)
            .count()
    }

    pub fn max_id(&self) -> u32 {
        self.nodes.read().unwrap().last().map(|n| n.id).unwrap_or(0)
    }

    pub fn lifetime_total(&self) -> usize {
        self.lifetime_total.load(Ordering::Relaxed)
    }

    /// Look up a node by id, returning with the node lock held.
    ///
    /// This is the lone exception to "locks do not cross API
    /// boundaries" (spec §4.2), letting callers atomically observe
    /// multiple fields.
    pub fn get(&self, id: u32) -> Option<NodeGuard> {
        let nodes = self.nodes.read().unwrap();
        let node = nodes.iter().find(|n| n.id == id)?.clone();
        drop(nodes);
        Some(NodeGuard::new(node))
    }

    fn remove(&self, id: u32) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.write().unwrap();
        let pos = nodes.iter().position(|n| n.id == id)?;
        Some(nodes.remove(pos))
    }

    /// Remove from the registry, then shut down as the "unique" caller
    /// (joins the handler thread itself).
    pub fn unlink(&self, node: &Arc<Node>) {
        self.remove(node.id);
        self.shutdown(node, true);
        Self::free(node);
    }

    /// Remove then shut down, leaving the join to the caller.
    pub fn shutdown_by_id(&self, id: u32) -> bool {
        let Some(node) = self.remove(id) else { return false };
        self.shutdown(&node, false);
        true
    }

    /// Remove and shut down the first node owned by `module` (used
    /// during module unload to drain incrementally).
    pub fn shutdown_by_module(&self, module: &str) -> bool {
        let node = {
            let nodes = self.nodes.read().unwrap();
            nodes.iter().find(|n| &*n.module == module).cloned()
        };
        let Some(node) = node else { return false };
        self.remove(node.id);
        self.shutdown(&node, false);
        true
    }

    /// Drain all nodes; if `mark_as_shutting_down`, new `request` calls
    /// refuse from this point on (spec §8 property 5).
    pub fn shutdown_all(&self, mark_as_shutting_down: bool) {
        if mark_as_shutting_down {
            self.shutting_down.store(true, Ordering::Release);
        }
        let drained: Vec<Arc<Node>> = {
            let mut nodes = self.nodes.write().unwrap();
            std::mem::take(&mut *nodes)
        };
        for node in &drained {
            self.shutdown(node, true);
            Self::free(node);
        }
    }

    /// Idempotent shutdown (spec §8 property 3).
    fn shutdown(&self, node: &Arc<Node>, unique: bool) {
        if !node.is_active() {
            return;
        }
        node.active.store(false, Ordering::Release);

        let (child_pid, user_present, skip_join) = {
            let inner = node.lock();
            (inner.child_pid, inner.user.is_some(), inner.skip_join)
        };
        // Computed after the lock above is released: `is_short_session`
        // takes the node lock itself, and `Mutex` is not reentrant.
        let short_session = node.is_short_session();

        if child_pid != 0 {
            if let Err(e) = crate::sandbox::kill_child(child_pid) {
                log::warn!("[node {}] failed to kill child {child_pid}: {e}", node.id);
            }
        }

        {
            let mut inner = node.lock();
            if let Some(pty) = inner.pty.as_mut() {
                pty.restore_terminal();
            }
            inner.spy = None;
            inner.pty = None;
        }

        if !user_present && short_session && !self.is_shutting_down() {
            log::info!(
                "[node {}] short-session: disconnected after {:.1}s without logging in",
                node.id,
                node.created.elapsed().as_secs_f32()
            );
        }

        if unique && !skip_join {
            if let Some(handle) = self.take_handler_thread(node.id) {
                let _ = handle.join();
            }
        }
    }

    /// Release module pin and destroy per-node state. Separated from
    /// `shutdown` so a thread can tear down its own session without
    /// joining itself.
    fn free(node: &Arc<Node>) {
        let mut inner = node.lock();
        inner.vars = super::VarTable::new();
        inner.user = None;
    }
}

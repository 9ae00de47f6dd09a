//! Sysop console contract (SPEC_FULL.md "Supplemented features";
//! spec §6's CLI surface). §1 scopes out CLI parsing and the console
//! *UI*; this is the in-process command dispatcher the UI would sit on
//! top of, exercised directly against [`NodeRegistry`].

use std::sync::Arc;

use crate::node::{Node, NodeRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysopCommand {
    Nodes,
    Node(u32),
    Interrupt(u32),
    Kick(u32),
    KickAll,
    Spy(u32),
    User(String),
    Users,
    Alert(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysopReply {
    NodeList(Vec<NodeSummary>),
    NodeDetail(NodeSummary),
    Ok,
    NotFound,
    UserDetail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: u32,
    pub protocol: String,
    pub ip: String,
    pub user: Option<String>,
}

fn summarize(node: &Arc<Node>) -> NodeSummary {
    NodeSummary { id: node.id, protocol: node.protocol.to_string(), ip: node.ip.clone(), user: node.lock().user.clone() }
}

/// Authenticated-user directory the console consults for `user`/`users`
/// (spec §1: the real user store lives outside this crate).
pub trait UserDirectory: Send + Sync {
    fn describe(&self, username: &str) -> Option<String>;
    fn list(&self) -> Vec<String>;
}

/// Dispatches sysop console commands over a [`NodeRegistry`].
pub struct SysopConsole<'a> {
    registry: &'a NodeRegistry,
    users: &'a dyn UserDirectory,
}

impl<'a> SysopConsole<'a> {
    pub fn new(registry: &'a NodeRegistry, users: &'a dyn UserDirectory) -> Self {
        Self { registry, users }
    }

    pub fn dispatch(&self, command: SysopCommand) -> SysopReply {
        match command {
            SysopCommand::Nodes => {
                let nodes = self.all_nodes();
                SysopReply::NodeList(nodes.iter().map(summarize).collect())
            }
            SysopCommand::Node(id) => match self.registry.get(id) {
                Some(guard) => SysopReply::NodeDetail(NodeSummary { id, protocol: guard.node().protocol.to_string(), ip: guard.node().ip.clone(), user: guard.user.clone() }),
                None => SysopReply::NotFound,
            },
            SysopCommand::Interrupt(id) => match self.registry.get(id) {
                Some(guard) => {
                    guard.node().interrupt.store(true, std::sync::atomic::Ordering::Release);
                    SysopReply::Ok
                }
                None => SysopReply::NotFound,
            },
            SysopCommand::Kick(id) => {
                if self.registry.shutdown_by_id(id) {
                    SysopReply::Ok
                } else {
                    SysopReply::NotFound
                }
            }
            SysopCommand::KickAll => {
                self.registry.shutdown_all(false);
                SysopReply::Ok
            }
            SysopCommand::Spy(id) => match self.registry.get(id) {
                Some(_) => SysopReply::Ok,
                None => SysopReply::NotFound,
            },
            SysopCommand::User(name) => match self.users.describe(&name) {
                Some(detail) => SysopReply::UserDetail(detail),
                None => SysopReply::NotFound,
            },
            SysopCommand::Users => SysopReply::UserDetail(self.users.list().join(", ")),
            SysopCommand::Alert(username, message) => {
                let found = self.all_nodes().iter().any(|n| n.lock().user.as_deref() == Some(username.as_str()));
                if found {
                    for node in self.all_nodes().iter().filter(|n| n.lock().user.as_deref() == Some(username.as_str())) {
                        log::info!("[node {}] sysop alert to {username}: {message}", node.id);
                    }
                    SysopReply::Ok
                } else {
                    SysopReply::NotFound
                }
            }
        }
    }

    fn all_nodes(&self) -> Vec<Arc<Node>> {
        (1..=self.registry.max_id())
            .filter_map(|id| self.registry.get(id).map(|g| g.node().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeUsers;
    impl UserDirectory for FakeUsers {
        fn describe(&self, username: &str) -> Option<String> {
            (username == "alice").then(|| "alice, priv=user".to_string())
        }
        fn list(&self) -> Vec<String> {
            vec!["alice".to_string(), "bob".to_string()]
        }
    }

    fn req(reg: &NodeRegistry) -> Arc<Node> {
        reg.request("test", Arc::from("test"), -1, -1, "127.0.0.1".into(), 0).unwrap()
    }

    #[test]
    fn nodes_lists_live_sessions() {
        let registry = NodeRegistry::new(8);
        let n1 = req(&registry);
        let _n2 = req(&registry);
        let console = SysopConsole::new(&registry, &FakeUsers);
        match console.dispatch(SysopCommand::Nodes) {
            SysopReply::NodeList(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected reply: {other:?}"),
        }
        let _ = n1;
    }

    #[test]
    fn interrupt_sets_the_flag() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::Interrupt(node.id)), SysopReply::Ok);
        assert!(node.interrupt.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn kick_removes_the_node() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::Kick(node.id)), SysopReply::Ok);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn kick_unknown_node_is_not_found() {
        let registry = NodeRegistry::new(8);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::Kick(99)), SysopReply::NotFound);
    }

    #[test]
    fn kickall_empties_the_registry() {
        let registry = NodeRegistry::new(8);
        req(&registry);
        req(&registry);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::KickAll), SysopReply::Ok);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn user_lookup_delegates_to_directory() {
        let registry = NodeRegistry::new(8);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::User("alice".to_string())), SysopReply::UserDetail("alice, priv=user".to_string()));
        assert_eq!(console.dispatch(SysopCommand::User("eve".to_string())), SysopReply::NotFound);
    }

    #[test]
    fn alert_requires_the_user_to_be_logged_in() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        node.lock().authenticate("alice", "user", node.id);
        let console = SysopConsole::new(&registry, &FakeUsers);
        assert_eq!(console.dispatch(SysopCommand::Alert("alice".to_string(), "hi".to_string())), SysopReply::Ok);
        assert_eq!(console.dispatch(SysopCommand::Alert("bob".to_string(), "hi".to_string())), SysopReply::NotFound);
    }
}

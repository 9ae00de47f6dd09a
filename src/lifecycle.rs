//! Node lifecycle driver (spec §4.4 and §4.4.1, Module D).
//!
//! Orchestrates one session end to end: greeter, PTY allocation, line
//! discipline, banner, [`crate::auth::authenticate`], splash, the menu
//! runner loop, goodbye, then `unlink`/`free` dispatch based on why the
//! session ended. The menu runner itself is an external collaborator
//! (spec §1 scopes menu semantics out); this module only needs to know
//! it returns an exit reason.

use std::sync::Arc;

use crate::auth::{self, AuthOutcome, AuthBackend, GuestPolicy, RegistrationBackend, SessionIo};
use crate::node::{Node, NodeRegistry};

/// Why a session's menu runner loop returned (spec §4.4, "goodbye then
/// `unlink`/`free` dispatch per exit reason").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    UserLoggedOff,
    Idle,
    Kicked,
    Error,
}

/// Drives the menu after a session is authenticated. External
/// collaborator (spec §1); a fake drives this in tests.
pub trait MenuRunner {
    fn run(&self, io: &mut dyn SessionIo, node: &Arc<Node>) -> ExitReason;
}

/// One full pass through Module D for a single node.
pub struct SessionDriver<'a> {
    pub backend: &'a dyn AuthBackend,
    pub registration: Option<&'a dyn RegistrationBackend>,
    pub guests: GuestPolicy,
    pub menu: &'a dyn MenuRunner,
}

impl<'a> SessionDriver<'a> {
    /// Runs greeter → banner → auth → splash → menu → goodbye for
    /// `node`, then tells the registry how to tear it down.
    ///
    /// `node` must already have had its PTY allocated and line
    /// discipline configured by the caller (spec §4.3's PTY/line
    /// concerns are Module C's, not driven from here) — this function
    /// picks up from "banner" onward.
    pub fn drive(&self, io: &mut dyn SessionIo, registry: &NodeRegistry, node: &Arc<Node>) -> std::io::Result<()> {
        let banner = format!("Welcome to node {}.", node.id);
        io.write_line(&banner)?;

        let outcome = auth::authenticate(io, self.backend, self.registration, self.guests)?;

        let priv_level = match outcome {
            AuthOutcome::Authenticated { username, priv_level } => {
                node.lock().authenticate(&username, &priv_level, node.id);
                Some(priv_level)
            }
            AuthOutcome::Registered { username } => {
                node.lock().authenticate(&username, "user", node.id);
                Some("user".to_string())
            }
            AuthOutcome::Guest(info) => {
                let name = info.name.clone().unwrap_or_else(|| "Guest".to_string());
                node.lock().authenticate(&name, "guest", node.id);
                Some("guest".to_string())
            }
            AuthOutcome::RegistrationDeclined | AuthOutcome::Disconnect | AuthOutcome::Failed => None,
        };

        let Some(priv_level) = priv_level else {
            io.write_line("Goodbye.")?;
            registry.unlink(node);
            return Ok(());
        };

        io.write_line(&format!("Logged in as {} ({priv_level}).", node.lock().user.clone().unwrap_or_default()))?;

        let reason = self.menu.run(io, node);

        io.write_line("Goodbye.")?;
        match reason {
            ExitReason::UserLoggedOff | ExitReason::Idle | ExitReason::Error => registry.unlink(node),
            // A kick has already torn the node down via the registry
            // (spec §9 sysop console "kick"); the driver just returns.
            ExitReason::Kicked => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthResult;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct FakeIo {
        lines: VecDeque<String>,
        written: Vec<String>,
    }

    impl FakeIo {
        fn new(lines: &[&str]) -> Self {
            Self { lines: lines.iter().map(|s| s.to_string()).collect(), written: Vec::new() }
        }
    }

    impl SessionIo for FakeIo {
        fn prompt_line(&mut self, _prompt: &str, _echo: bool) -> std::io::Result<String> {
            Ok(self.lines.pop_front().unwrap_or_default())
        }
        fn write_line(&mut self, text: &str) -> std::io::Result<()> {
            self.written.push(text.to_string());
            Ok(())
        }
    }

    struct FakeBackend;
    impl AuthBackend for FakeBackend {
        fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> AuthResult {
            AuthResult { ok: password == Some("hunter2"), user_id: username.unwrap_or_default().to_string(), priv_level: "user".to_string() }
        }
    }

    struct FakeMenu(ExitReason);
    impl MenuRunner for FakeMenu {
        fn run(&self, _io: &mut dyn SessionIo, _node: &Arc<Node>) -> ExitReason {
            self.0
        }
    }

    fn req(reg: &NodeRegistry) -> Arc<Node> {
        reg.request("test", Arc::from("test"), -1, -1, "127.0.0.1".into(), 0).unwrap()
    }

    #[test]
    fn successful_login_runs_menu_then_unlinks_on_logoff() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        let mut io = FakeIo::new(&["alice", "hunter2"]);
        let menu = FakeMenu(ExitReason::UserLoggedOff);
        let driver = SessionDriver { backend: &FakeBackend, registration: None, guests: GuestPolicy::default(), menu: &menu };
        driver.drive(&mut io, &registry, &node).unwrap();
        assert_eq!(registry.count(), 0);
        assert!(io.written.iter().any(|l| l.contains("Logged in as alice")));
    }

    #[test]
    fn failed_login_unlinks_without_running_menu() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        let mut io = FakeIo::new(&["alice", "wrong", "alice", "wrong", "alice", "wrong"]);
        let menu = FakeMenu(ExitReason::UserLoggedOff);
        let driver = SessionDriver { backend: &FakeBackend, registration: None, guests: GuestPolicy::default(), menu: &menu };
        driver.drive(&mut io, &registry, &node).unwrap();
        assert_eq!(registry.count(), 0);
        assert!(!io.written.iter().any(|l| l.contains("Logged in as")));
    }

    #[test]
    fn kicked_exit_does_not_unlink_again() {
        let registry = NodeRegistry::new(8);
        let node = req(&registry);
        let mut io = FakeIo::new(&["alice", "hunter2"]);
        let menu = FakeMenu(ExitReason::Kicked);
        let driver = SessionDriver { backend: &FakeBackend, registration: None, guests: GuestPolicy::default(), menu: &menu };
        driver.drive(&mut io, &registry, &node).unwrap();
        // The node is still registered; a sysop `kick` would have removed it itself.
        assert_eq!(registry.count(), 1);
    }
}

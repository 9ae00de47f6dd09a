//! Node authentication (spec §4.4.1, consuming the §6 "Auth backend"
//! external contract).
//!
//! `authenticate` drives the username/password prompt loop against a
//! caller-supplied [`SessionIo`] (the node's pty, in production; a
//! fake in tests) and an [`AuthBackend`] (an external collaborator per
//! spec §1/§6 — the real user store is out of scope for this crate).

use zeroize::Zeroizing;

/// Minimal I/O seam the auth flow needs from a node's terminal: prompt
/// for a line (optionally with echo suppressed) and write a message.
/// Kept separate from [`crate::pty::PtyBridge`] so this module is
/// testable without a real pty.
pub trait SessionIo {
    fn prompt_line(&mut self, prompt: &str, echo: bool) -> std::io::Result<String>;
    fn write_line(&mut self, text: &str) -> std::io::Result<()>;
}

/// Result of a backend authentication attempt (spec §6, "Auth backend:
/// `authenticate(node, user?, password?) → ok | fail`").
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub user_id: String,
    pub priv_level: String,
}

/// External user-store collaborator (spec §1, §6). Implementations live
/// outside this crate; this trait is the contract this crate consumes.
pub trait AuthBackend: Send + Sync {
    /// `None` for both `username`/`password` means an anonymous guest.
    fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> AuthResult;
}

/// External registration collaborator invoked for the reserved `new`
/// username (spec §4.4.1, "delegate to registration").
pub trait RegistrationBackend: Send + Sync {
    fn register(&self, io: &mut dyn SessionIo) -> RegistrationOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Succeeded { username: String },
    Declined,
    Aborted,
}

/// Guest login policy (spec §6 config table, `guests.*`).
#[derive(Debug, Clone, Copy)]
pub struct GuestPolicy {
    pub allow: bool,
    pub ask_info: bool,
}

impl Default for GuestPolicy {
    fn default() -> Self {
        Self { allow: true, ask_info: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub location: Option<String>,
}

/// Outcome of the full authentication flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated { username: String, priv_level: String },
    Guest(GuestInfo),
    Registered { username: String },
    RegistrationDeclined,
    Disconnect,
    /// Three attempts exhausted without success (spec §4.4.1, "On three
    /// failures, return failure").
    Failed,
}

const MAX_AUTH_ATTEMPTS: u32 = 3;

fn is_reserved(username: &str, word: &str) -> bool {
    username.eq_ignore_ascii_case(word)
}

/// Drive the login prompt loop for one node (spec §4.4.1).
pub fn authenticate(
    io: &mut dyn SessionIo,
    backend: &dyn AuthBackend,
    registration: Option<&dyn RegistrationBackend>,
    guests: GuestPolicy,
) -> std::io::Result<AuthOutcome> {
    for _attempt in 0..MAX_AUTH_ATTEMPTS {
        let username = io.prompt_line("Username: ", true)?;
        let username = username.trim();

        if is_reserved(username, "quit") || is_reserved(username, "exit") {
            return Ok(AuthOutcome::Disconnect);
        }

        if is_reserved(username, "new") {
            return Ok(match registration {
                Some(backend) => match backend.register(io) {
                    RegistrationOutcome::Succeeded { username } => {
                        AuthOutcome::Registered { username }
                    }
                    RegistrationOutcome::Declined => AuthOutcome::RegistrationDeclined,
                    RegistrationOutcome::Aborted => AuthOutcome::Disconnect,
                },
                None => AuthOutcome::RegistrationDeclined,
            });
        }

        if is_reserved(username, "guest") {
            if !guests.allow {
                io.write_line("Guest access is not permitted.")?;
                continue;
            }
            return Ok(AuthOutcome::Guest(collect_guest_info(io, guests.ask_info)?));
        }

        if username.is_empty() {
            continue;
        }

        let password = Zeroizing::new(io.prompt_line("Password: ", false)?);
        let result = backend.authenticate(Some(username), Some(password.trim()));
        if result.ok {
            return Ok(AuthOutcome::Authenticated {
                username: result.user_id,
                priv_level: result.priv_level,
            });
        }
        io.write_line("Login incorrect.")?;
    }
    Ok(AuthOutcome::Failed)
}

/// Validate an email contains both `@` and `.` (spec §4.4.1).
fn is_valid_guest_email(email: &str) -> bool {
    email.contains('@') && email.contains('.')
}

/// Validate a location contains a `,` (spec §4.4.1, "City, State").
fn is_valid_guest_location(location: &str) -> bool {
    location.contains(',')
}

fn collect_guest_info(io: &mut dyn SessionIo, ask_info: bool) -> std::io::Result<GuestInfo> {
    if !ask_info {
        return Ok(GuestInfo { name: None, email: None, location: None });
    }

    let name = io.prompt_line("Please enter your name or alias: ", true)?;
    let name = (!name.trim().is_empty()).then(|| name.trim().to_string());

    let mut email = None;
    for _ in 0..5 {
        let entered = io.prompt_line("E-Mail (use ! for at): ", true)?;
        let entered = entered.trim();
        if entered.is_empty() {
            break;
        }
        if is_valid_guest_email(entered) {
            email = Some(entered.to_string());
            break;
        }
        io.write_line("Invalid e-mail address.")?;
    }

    let mut location = None;
    for _ in 0..5 {
        let entered = io.prompt_line("Please enter your location (City, State): ", true)?;
        let entered = entered.trim();
        if entered.is_empty() {
            break;
        }
        if is_valid_guest_location(entered) {
            location = Some(entered.to_string());
            break;
        }
        io.write_line("Invalid location.")?;
    }

    Ok(GuestInfo { name, email, location })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

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

    struct FakeBackend {
        valid_password: &'static str,
    }

    impl AuthBackend for FakeBackend {
        fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> AuthResult {
            let ok = username.is_some() && password == Some(self.valid_password);
            AuthResult {
                ok,
                user_id: username.unwrap_or_default().to_string(),
                priv_level: "user".to_string(),
            }
        }
    }

    #[test]
    fn quit_disconnects_immediately() {
        let mut io = FakeIo::new(&["quit"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy::default()).unwrap();
        assert_eq!(outcome, AuthOutcome::Disconnect);
    }

    #[test]
    fn exit_is_case_insensitive() {
        let mut io = FakeIo::new(&["EXIT"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy::default()).unwrap();
        assert_eq!(outcome, AuthOutcome::Disconnect);
    }

    #[test]
    fn correct_password_authenticates() {
        let mut io = FakeIo::new(&["alice", "hunter2"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy::default()).unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Authenticated { username: "alice".to_string(), priv_level: "user".to_string() }
        );
    }

    #[test]
    fn three_failed_attempts_yields_failed() {
        let mut io = FakeIo::new(&["alice", "wrong", "alice", "wrong", "alice", "wrong"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy::default()).unwrap();
        assert_eq!(outcome, AuthOutcome::Failed);
    }

    #[test]
    fn guest_disallowed_falls_through_to_retry() {
        let mut io = FakeIo::new(&["guest", "alice", "hunter2"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy { allow: false, ask_info: true })
            .unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Authenticated { username: "alice".to_string(), priv_level: "user".to_string() }
        );
    }

    #[test]
    fn guest_collects_valid_info() {
        let mut io = FakeIo::new(&["guest", "Bob", "bob!example.com", "bob@example.com", "Nowhere"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome = authenticate(&mut io, &backend, None, GuestPolicy::default()).unwrap();
        match outcome {
            AuthOutcome::Guest(info) => {
                assert_eq!(info.name.as_deref(), Some("Bob"));
                assert_eq!(info.email.as_deref(), Some("bob@example.com"));
                assert_eq!(info.location, None);
            }
            other => panic!("expected Guest outcome, got {other:?}"),
        }
    }

    #[test]
    fn guest_skips_info_when_policy_disables_it() {
        let mut io = FakeIo::new(&["guest"]);
        let backend = FakeBackend { valid_password: "hunter2" };
        let outcome =
            authenticate(&mut io, &backend, None, GuestPolicy { allow: true, ask_info: false }).unwrap();
        assert_eq!(outcome, AuthOutcome::Guest(GuestInfo { name: None, email: None, location: None }));
    }

    #[test]
    fn email_validation_requires_at_and_dot() {
        assert!(is_valid_guest_email("a@b.com"));
        assert!(!is_valid_guest_email("a-b.com"));
        assert!(!is_valid_guest_email("a@b"));
    }

    #[test]
    fn location_validation_requires_comma() {
        assert!(is_valid_guest_location("Springfield, IL"));
        assert!(!is_valid_guest_location("Springfield"));
    }
}

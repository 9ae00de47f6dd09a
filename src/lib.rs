//! Multi-protocol bulletin-board server core.
//!
//! Crate layout mirrors the component table: [`alert`] (A), [`node`]
//! (B, with the registry in [`node::registry`]), [`pty`] (C),
//! [`lifecycle`] (D), [`sandbox`] (E), [`irc`] (F), [`sftp`] (G), plus
//! the supplemented [`ftp`] and [`rlogin`] listeners and the [`sysop`]
//! console contract, all sharing the [`sandbox_root`] path-sandboxing
//! helper and the [`config`] loader.

pub mod alert;
pub mod auth;
pub mod config;
pub mod ftp;
pub mod irc;
pub mod lifecycle;
pub mod node;
pub mod php_session;
pub mod pty;
pub mod rlogin;
pub mod sandbox;
pub mod sandbox_root;
pub mod sftp;
pub mod sysop;

pub use alert::{alert_pair, AlertRx, AlertTx};
pub use config::Config;
pub use node::{Node, NodeGuard, NodeInner, NodeRegistry, RegistryError};
pub use pty::PtyBridge;

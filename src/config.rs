//! Configuration loading (spec §6, "Config loader").
//!
//! Returns a tagged key/value store the rest of the crate consumes as a
//! plain `Config` struct. Modeled on the teacher's `config.rs`: a
//! serde-derived struct with a `Default` impl, a JSON file on disk, and
//! environment variable overrides layered on top.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// `bbs.*` — presentation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BbsSection {
    pub name: String,
    pub tagline: String,
    pub hostname: String,
    pub sysop: String,
    pub exitmsg: String,
    pub minuptimedisplayed: u64,
}

impl Default for BbsSection {
    fn default() -> Self {
        Self {
            name: "lbbs".to_string(),
            tagline: "A multi-protocol bulletin board".to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            sysop: "sysop".to_string(),
            exitmsg: "Goodbye!".to_string(),
            minuptimedisplayed: 60,
        }
    }
}

/// `nodes.*` — node policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodesSection {
    pub maxnodes: usize,
    /// 0 = unthrottled.
    pub defaultbps: u32,
    /// 0 = disabled; stored internally as milliseconds.
    pub idlemins: u64,
}

impl NodesSection {
    pub fn idle_timeout_ms(&self) -> Option<u64> {
        (self.idlemins != 0).then(|| self.idlemins * 60_000)
    }
}

impl Default for NodesSection {
    fn default() -> Self {
        Self { maxnodes: 64, defaultbps: 0, idlemins: 0 }
    }
}

/// `guests.*` — guest policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GuestsSection {
    pub allow: bool,
    pub askinfo: bool,
}

impl Default for GuestsSection {
    fn default() -> Self {
        Self { allow: true, askinfo: true }
    }
}

/// `container.*` — sandbox policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContainerSection {
    pub templatedir: PathBuf,
    pub rundir: PathBuf,
    pub hostname: String,
    pub maxmemory: u64,
    pub maxcpu: u64,
    pub minnice: i32,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            templatedir: PathBuf::from("/usr/share/lbbs/rootfs"),
            rundir: PathBuf::from("/tmp/lbbs/rootfs"),
            hostname: "lbbs-sandbox".to_string(),
            maxmemory: 256,
            maxcpu: 30,
            minnice: 0,
        }
    }
}

/// `net.*` — listener bind addresses (spec §6: a listener adapter
/// provides `(socket, protocol_name) → node`; the actual bind address
/// and port are this crate's own ambient concern, not named in the
/// protocol contract).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetSection {
    pub bind_address: String,
    pub ftp_port: u16,
    pub rlogin_port: u16,
    pub irc_port: u16,
}

impl Default for NetSection {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), ftp_port: 2121, rlogin_port: 2513, irc_port: 6667 }
    }
}

/// Full configuration (spec §6's config table).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub bbs: BbsSection,
    #[serde(default)]
    pub nodes: NodesSection,
    #[serde(default)]
    pub guests: GuestsSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub net: NetSection,
}

impl Config {
    /// Directory holding `lbbs.json` — platform config dir unless
    /// overridden by `LBBS_CONFIG_DIR` (tests always use a tmp dir).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("LBBS_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir().context("could not determine config directory")?.join("lbbs")
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from `lbbs.json`, falling back to defaults
    /// when absent, then applies environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("lbbs.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LBBS_BBS_NAME") {
            self.bbs.name = v;
        }
        if let Ok(v) = std::env::var("LBBS_BBS_SYSOP") {
            self.bbs.sysop = v;
        }
        if let Ok(v) = std::env::var("LBBS_MAXNODES") {
            if let Ok(n) = v.parse() {
                self.nodes.maxnodes = n;
            }
        }
        if let Ok(v) = std::env::var("LBBS_DEFAULTBPS") {
            if let Ok(n) = v.parse() {
                self.nodes.defaultbps = n;
            }
        }
        if let Ok(v) = std::env::var("LBBS_IDLEMINS") {
            if let Ok(n) = v.parse() {
                self.nodes.idlemins = n;
            }
        }
        if let Ok(v) = std::env::var("LBBS_GUESTS_ALLOW") {
            self.guests.allow = parse_bool(&v, self.guests.allow);
        }
        if let Ok(v) = std::env::var("LBBS_GUESTS_ASKINFO") {
            self.guests.askinfo = parse_bool(&v, self.guests.askinfo);
        }
        if let Ok(v) = std::env::var("LBBS_CONTAINER_TEMPLATEDIR") {
            self.container.templatedir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LBBS_CONTAINER_RUNDIR") {
            self.container.rundir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LBBS_BIND_ADDRESS") {
            self.net.bind_address = v;
        }
        if let Ok(v) = std::env::var("LBBS_FTP_PORT") {
            if let Ok(n) = v.parse() {
                self.net.ftp_port = n;
            }
        }
        if let Ok(v) = std::env::var("LBBS_RLOGIN_PORT") {
            if let Ok(n) = v.parse() {
                self.net.rlogin_port = n;
            }
        }
        if let Ok(v) = std::env::var("LBBS_IRC_PORT") {
            if let Ok(n) = v.parse() {
                self.net.irc_port = n;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("lbbs.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.nodes.maxnodes, 64);
        assert_eq!(cfg.nodes.defaultbps, 0);
        assert_eq!(cfg.nodes.idlemins, 0);
        assert!(cfg.guests.allow);
        assert!(cfg.guests.askinfo);
    }

    #[test]
    fn idle_timeout_ms_zero_is_disabled() {
        let mut cfg = Config::default();
        assert_eq!(cfg.nodes.idle_timeout_ms(), None);
        cfg.nodes.idlemins = 5;
        assert_eq!(cfg.nodes.idle_timeout_ms(), Some(300_000));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bbs.name, cfg.bbs.name);
        assert_eq!(back.container.maxmemory, cfg.container.maxmemory);
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        std::env::set_var("LBBS_MAXNODES", "12");
        std::env::set_var("LBBS_GUESTS_ALLOW", "no");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.nodes.maxnodes, 12);
        assert!(!cfg.guests.allow);
        std::env::remove_var("LBBS_MAXNODES");
        std::env::remove_var("LBBS_GUESTS_ALLOW");
    }
}

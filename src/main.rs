//! lbbs daemon entry point.
//!
//! Loads [`lbbs_core::Config`], starts the [`lbbs_core::NodeRegistry`],
//! and drives the FTP/RLogin/IRC protocol listeners on top of it. SFTP
//! is not bound here: its transport (SSH) is an external collaborator
//! per the contract this crate consumes (spec §1), so [`lbbs_core::sftp`]
//! is wired in by whatever SSH subsystem embeds this crate.
//!
//! Listener accept loops run on `tokio` (teacher's `socket/server.rs`
//! idiom); each accepted connection is handed to a blocking handler
//! thread, matching the node registry's "parallel OS threads" model
//! (spec §5) for everything past the accept() call.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use lbbs_core::auth::{AuthBackend, AuthResult, GuestPolicy, SessionIo};
use lbbs_core::ftp::FtpConnection;
use lbbs_core::irc::{self, IrcSink, IrcState, IrcUser};
use lbbs_core::lifecycle::{ExitReason, MenuRunner, SessionDriver};
use lbbs_core::rlogin;
use lbbs_core::{Config, NodeRegistry};

#[derive(Parser)]
#[command(name = "lbbsd")]
#[command(about = "Multi-protocol bulletin board server daemon")]
struct Cli {
    /// Override the directory lbbs.json is read from.
    #[arg(long)]
    config_dir: Option<String>,
}

static SHUTDOWN: std::sync::LazyLock<Arc<AtomicBool>> = std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Placeholder auth backend: the real user store is an external
/// collaborator (spec §1, "the authentication backend" is out of
/// scope). Guest access still works through [`lbbs_core::auth`]
/// without ever reaching this backend.
struct StubAuthBackend;
impl AuthBackend for StubAuthBackend {
    fn authenticate(&self, _username: Option<&str>, _password: Option<&str>) -> AuthResult {
        AuthResult { ok: false, user_id: String::new(), priv_level: String::new() }
    }
}

/// Menu application semantics are a Non-goal (spec §1); this runner
/// just greets and exits, leaving a real menu system to be layered in
/// by whatever embeds this crate.
struct ImmediateExitMenu;
impl MenuRunner for ImmediateExitMenu {
    fn run(&self, io: &mut dyn SessionIo, _node: &Arc<lbbs_core::Node>) -> ExitReason {
        let _ = io.write_line("No menu application is configured on this server.");
        ExitReason::UserLoggedOff
    }
}

/// Line-oriented [`SessionIo`] over a blocking `TcpStream`, used to
/// drive Module D for line-discipline protocols like RLogin.
struct TcpSessionIo {
    reader: BufReader<StdTcpStream>,
    writer: StdTcpStream,
}

impl SessionIo for TcpSessionIo {
    fn prompt_line(&mut self, prompt: &str, _echo: bool) -> std::io::Result<String> {
        self.writer.write_all(prompt.as_bytes())?;
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(b"\r\n")
    }
}

fn install_signal_handlers() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN))?;
    Ok(())
}

/// RFC 1282 handshake, then hands the connection to Module D.
async fn rlogin_accept_loop(bind: String, port: u16, registry: Arc<NodeRegistry>) -> Result<()> {
    let listener = TcpListener::bind((bind.as_str(), port)).await.with_context(|| format!("binding rlogin on {bind}:{port}"))?;
    log::info!("rlogin listening on {bind}:{port}");
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = registry.clone();
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(false)?;
        std::thread::spawn(move || {
            if let Err(e) = handle_rlogin_connection(std_stream, addr.ip().to_string(), addr.port(), &registry) {
                log::warn!("[rlogin {addr}] session error: {e}");
            }
        });
    }
}

fn handle_rlogin_connection(mut stream: StdTcpStream, ip: String, port: u16, registry: &NodeRegistry) -> Result<()> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    let mut nuls = 0;
    // Read until the 4th NUL terminates the handshake string (spec §6).
    while nuls < 4 {
        stream.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if byte[0] == 0 {
            nuls += 1;
        }
    }
    let Some(handshake) = rlogin::parse_connection_string(&buf) else {
        anyhow::bail!("malformed rlogin handshake from {ip}");
    };
    stream.write_all(&[rlogin::ack_byte()])?;
    log::info!("[rlogin {ip}:{port}] handshake: client_user={} term={}", handshake.client_user, handshake.term_speed);

    let module: lbbs_core::node::ModulePin = Arc::from("rlogin");
    let node = registry.request("rlogin", module, -1, -1, ip, port).context("node capacity reached")?;

    let mut io = TcpSessionIo { reader: BufReader::new(stream.try_clone()?), writer: stream };
    let backend = StubAuthBackend;
    let menu = ImmediateExitMenu;
    let driver = SessionDriver { backend: &backend, registration: None, guests: GuestPolicy::default(), menu: &menu };
    driver.drive(&mut io, registry, &node)?;
    Ok(())
}

async fn ftp_accept_loop(bind: String, port: u16, registry: Arc<NodeRegistry>) -> Result<()> {
    let listener = TcpListener::bind((bind.as_str(), port)).await.with_context(|| format!("binding ftp on {bind}:{port}"))?;
    log::info!("ftp listening on {bind}:{port}");
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = registry.clone();
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(false)?;
        std::thread::spawn(move || {
            if let Err(e) = handle_ftp_connection(std_stream, addr.ip().to_string(), addr.port(), &registry) {
                log::warn!("[ftp {addr}] session error: {e}");
            }
        });
    }
}

fn handle_ftp_connection(stream: StdTcpStream, ip: String, port: u16, registry: &NodeRegistry) -> Result<()> {
    let module: lbbs_core::node::ModulePin = Arc::from("ftp");
    let node = registry.request("ftp", module, -1, -1, ip.clone(), port).context("node capacity reached")?;
    scopeguard::defer! { registry.unlink(&node); }

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let root = std::env::temp_dir().join("lbbs-ftp-roots").join(&ip);
    std::fs::create_dir_all(&root)?;

    let backend = StubAuthBackend;
    let mut conn = FtpConnection::new(root, &backend, [127, 0, 0, 1]);
    writer.write_all(FtpConnection::greeting().as_bytes())?;

    let mut pending_data: Option<std::net::TcpListener> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        let rest = line.trim_end().split_once(' ').map(|(_, r)| r).unwrap_or("").trim();

        if verb == "PASV" {
            let data_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            let port = data_listener.local_addr()?.port();
            pending_data = Some(data_listener);
            let (p1, p2) = (port / 256, port % 256);
            writer.write_all(format!("227 Entering Passive Mode (127,0,0,1,{p1},{p2})\r\n").as_bytes())?;
            continue;
        }

        if matches!(verb.as_str(), "STOR" | "APPE") {
            let response = conn.handle(&line);
            writer.write_all(response.as_bytes())?;
            if let Some(listener) = pending_data.take() {
                let (mut data_stream, _) = listener.accept()?;
                let mut body = Vec::new();
                data_stream.read_to_end(&mut body)?;
                let result = conn.store(rest, &body, verb == "APPE");
                writer.write_all(result.as_bytes())?;
            }
            continue;
        }

        if verb == "RETR" {
            let response = conn.handle(&line);
            let ok = response.starts_with("150");
            writer.write_all(response.as_bytes())?;
            if ok {
                if let Some(listener) = pending_data.take() {
                    let (mut data_stream, _) = listener.accept()?;
                    match conn.retrieve_body(rest) {
                        Ok(body) => {
                            data_stream.write_all(&body)?;
                            writer.write_all(b"226 Transfer complete\r\n")?;
                        }
                        Err(_) => writer.write_all(b"550 Failed to read file\r\n")?,
                    }
                }
            }
            continue;
        }

        if verb == "LIST" {
            let response = conn.handle(&line);
            let ok = response.starts_with("150");
            writer.write_all(response.as_bytes())?;
            if ok {
                if let Some(listener) = pending_data.take() {
                    let (mut data_stream, _) = listener.accept()?;
                    for entry in conn.list(rest) {
                        data_stream.write_all(format!("{entry}\r\n").as_bytes())?;
                    }
                    writer.write_all(b"226 Transfer complete\r\n")?;
                }
            }
            continue;
        }

        let response = conn.handle(&line);
        let quit = verb == "QUIT";
        writer.write_all(response.as_bytes())?;
        if quit {
            break;
        }
    }
    Ok(())
}

struct TcpIrcSink(std::sync::Mutex<StdTcpStream>);
impl IrcSink for TcpIrcSink {
    fn send(&self, line: &str) {
        let mut stream = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.write_all(line.as_bytes());
        let _ = stream.write_all(b"\r\n");
    }
}

async fn irc_accept_loop(bind: String, port: u16, registry: Arc<NodeRegistry>, state: Arc<IrcState>) -> Result<()> {
    let listener = TcpListener::bind((bind.as_str(), port)).await.with_context(|| format!("binding irc on {bind}:{port}"))?;
    log::info!("irc listening on {bind}:{port}");
    loop {
        let (stream, addr) = listener.accept().await?;
        let registry = registry.clone();
        let state = state.clone();
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(false)?;
        std::thread::spawn(move || {
            if let Err(e) = handle_irc_connection(std_stream, addr.ip().to_string(), addr.port(), &registry, &state) {
                log::warn!("[irc {addr}] session error: {e}");
            }
        });
    }
}

fn handle_irc_connection(stream: StdTcpStream, ip: String, port: u16, registry: &NodeRegistry, state: &Arc<IrcState>) -> Result<()> {
    let module: lbbs_core::node::ModulePin = Arc::from("irc");
    let node = registry.request("irc", module, -1, -1, ip.clone(), port).context("node capacity reached")?;
    scopeguard::defer! { registry.unlink(&node); }

    let mut reader = BufReader::new(stream.try_clone()?);
    let sink = Box::new(TcpIrcSink(std::sync::Mutex::new(stream)));

    let mut nick = None;
    let mut user_line = String::new();
    while nick.is_none() {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if let Some(n) = line.strip_prefix("NICK ") {
            nick = Some(n.trim().to_string());
        } else if let Some(u) = line.strip_prefix("USER ") {
            user_line = u.trim().to_string();
        }
    }
    let nick = nick.unwrap();
    let ident = user_line.split_whitespace().next().unwrap_or(&nick).to_string();
    let user = IrcUser::new(node.id, &nick, &ident, &ident, &irc::cloak(node.id), sink);
    if state.register_user(user.clone()).is_err() {
        user.send("433 * :Nickname is already in use");
        return Ok(());
    }
    user.send(&format!("001 {nick} :Welcome to lbbs, {nick}"));
    user.send(&format!("005 {nick} {}", irc::isupport_line()));

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v.to_ascii_uppercase(), r),
            None => (line.to_ascii_uppercase(), ""),
        };
        match verb.as_str() {
            "JOIN" => {
                if let Err(e) = state.join(&user, rest.trim(), false, false) {
                    user.send(&format!("403 {nick} {} :{e:?}", rest.trim()));
                }
            }
            "PART" => state.part(&user, rest.trim(), None),
            "PRIVMSG" => {
                if let Some((target, msg)) = rest.trim_start().split_once(' ') {
                    let msg = msg.trim_start().trim_start_matches(':');
                    if let Err(e) = state.privmsg(&user, target, msg) {
                        user.send(&format!("404 {nick} {target} :{e:?}"));
                    }
                }
            }
            "PING" => user.send(&format!("PONG lbbs {}", rest.trim())),
            "PONG" => user.record_pong(),
            "QUIT" => break,
            _ => {}
        }
    }
    state.quit(&user, "Client quit");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).format_timestamp_secs().init();

    let cli = Cli::parse();
    if let Some(dir) = cli.config_dir {
        std::env::set_var("LBBS_CONFIG_DIR", dir);
    }

    install_signal_handlers()?;

    let config = Config::load()?;
    log::info!("starting {} ({})", config.bbs.name, config.bbs.tagline);

    let registry = NodeRegistry::new(config.nodes.maxnodes);
    let irc_state = Arc::new(IrcState::new());

    let ftp = tokio::spawn(ftp_accept_loop(config.net.bind_address.clone(), config.net.ftp_port, registry.clone()));
    let rlogin = tokio::spawn(rlogin_accept_loop(config.net.bind_address.clone(), config.net.rlogin_port, registry.clone()));
    let irc = tokio::spawn(irc_accept_loop(config.net.bind_address.clone(), config.net.irc_port, registry.clone(), irc_state.clone()));

    while !SHUTDOWN.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    log::info!("shutdown requested, draining {} node(s)", registry.count());
    registry.shutdown_all(true);
    ftp.abort();
    rlogin.abort();
    irc.abort();

    Ok(())
}

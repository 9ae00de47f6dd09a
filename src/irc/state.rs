//! IRC users/channels/members state (spec §4.6 "State"), grounded on
//! the teacher's `hub/state.rs` RwLock-guarded named-entity registry
//! pattern, generalized here from agents to IRC users and channels.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use super::modes::{ChannelModes, MemberModes, Privilege, UserModes};

pub const MAX_CHANNELS_PER_USER: u32 = 50;
pub const MAX_TOPIC_LENGTH: usize = 390;
pub const MAX_MESSAGE_LENGTH: usize = 510;

/// Write sink a connected IRC user is reached through. Implementations
/// live outside this module (the real one wraps a node's socket); kept
/// as a trait so the engine is testable without real sockets.
pub trait IrcSink: Send {
    fn send(&self, line: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    MalformedChannelName,
    TooManyChannels,
    RequiresTls,
    RegisteredOnly,
    ChannelFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivError {
    Empty,
    TooLong,
    NoExternalMessages,
    Moderated,
    NoSuchTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickError {
    InsufficientPrivilege,
    NotInChannel,
    TargetNotInChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeError {
    RequiresFounder,
    UnknownLetter,
}

impl std::fmt::Debug for IrcUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcUser").field("node_id", &self.node_id).field("nickname", &self.nickname).finish()
    }
}

pub struct IrcUser {
    pub node_id: u32,
    pub nickname: String,
    pub ident: String,
    pub realname: String,
    pub hostmask: Mutex<String>,
    pub modes: Mutex<UserModes>,
    pub joined: Instant,
    pub last_active: Mutex<Instant>,
    pub last_ping_sent: Mutex<Option<Instant>>,
    pub last_pong_received: Mutex<Instant>,
    pub away: Mutex<Option<String>>,
    channel_count: AtomicU32,
    sink: Mutex<Box<dyn IrcSink>>,
}

impl IrcUser {
    pub fn new(node_id: u32, nickname: &str, ident: &str, realname: &str, hostmask: &str, sink: Box<dyn IrcSink>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            node_id,
            nickname: nickname.to_string(),
            ident: ident.to_string(),
            realname: realname.to_string(),
            hostmask: Mutex::new(hostmask.to_string()),
            modes: Mutex::new(UserModes::empty()),
            joined: now,
            last_active: Mutex::new(now),
            last_ping_sent: Mutex::new(None),
            last_pong_received: Mutex::new(now),
            away: Mutex::new(None),
            channel_count: AtomicU32::new(0),
            sink: Mutex::new(sink),
        })
    }

    /// Serializes this user's writes under their own mutex (spec §4.6
    /// "Fan-out": "writes to each recipient are serialized by that
    /// recipient's user mutex").
    pub fn send(&self, line: &str) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).send(line);
    }

    pub fn ident_prefix(&self) -> String {
        format!("{}!~{}@{}", self.nickname, self.ident, self.hostmask.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_away(&self) -> bool {
        self.away.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn record_pong(&self) {
        *self.last_pong_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

pub struct Member {
    pub user: Arc<IrcUser>,
    modes: Mutex<MemberModes>,
}

impl Member {
    pub fn modes(&self) -> MemberModes {
        *self.modes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_modes(&self, modes: MemberModes) {
        *self.modes.lock().unwrap_or_else(|e| e.into_inner()) = modes;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

pub struct Channel {
    pub name: String,
    topic: Mutex<Option<(String, String, i64)>>,
    modes: Mutex<ChannelModes>,
    limit: Mutex<Option<u32>>,
    log_file: Mutex<Option<std::path::PathBuf>>,
    members: RwLock<Vec<Arc<Member>>>,
}

fn is_channel_name(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

impl Channel {
    pub fn topic(&self) -> Option<(String, String, i64)> {
        self.topic.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn modes(&self) -> ChannelModes {
        *self.modes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn member_of(&self, nickname: &str) -> Option<Arc<Member>> {
        self.members.read().unwrap().iter().find(|m| m.user.nickname.eq_ignore_ascii_case(nickname)).cloned()
    }

    pub fn names_line(&self) -> String {
        self.members
            .read()
            .unwrap()
            .iter()
            .map(|m| match m.modes().prefix_symbol() {
                Some(p) => format!("{p}{}", m.user.nickname),
                None => m.user.nickname.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Registry of users and channels (spec §4.6 "State").
pub struct IrcState {
    users: RwLock<Vec<Arc<IrcUser>>>,
    channels: RwLock<Vec<Arc<Channel>>>,
}

impl Default for IrcState {
    fn default() -> Self {
        Self::new()
    }
}

impl IrcState {
    pub fn new() -> Self {
        Self { users: RwLock::new(Vec::new()), channels: RwLock::new(Vec::new()) }
    }

    /// Registers a connected user; rejects a case-insensitively
    /// duplicate nickname (spec §4.6 "State": "keyed by identity-
    /// insensitive nickname uniqueness").
    pub fn register_user(&self, user: Arc<IrcUser>) -> Result<(), Arc<IrcUser>> {
        let mut users = self.users.write().unwrap();
        if users.iter().any(|u| u.nickname.eq_ignore_ascii_case(&user.nickname)) {
            return Err(user);
        }
        users.push(user);
        Ok(())
    }

    pub fn find_user(&self, nickname: &str) -> Option<Arc<IrcUser>> {
        self.users.read().unwrap().iter().find(|u| u.nickname.eq_ignore_ascii_case(nickname)).cloned()
    }

    pub fn users(&self) -> Vec<Arc<IrcUser>> {
        self.users.read().unwrap().clone()
    }

    pub fn find_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().iter().find(|c| c.name.eq_ignore_ascii_case(name)).cloned()
    }

    fn channels_of(&self, user: &Arc<IrcUser>) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.member_of(&user.nickname).is_some())
            .cloned()
            .collect()
    }

    /// Join a channel (spec §4.6 "Join"). Creates the channel lazily on
    /// first join with sensible defaults and grants the creator op (and
    /// founder, for node id 1).
    pub fn join(&self, user: &Arc<IrcUser>, channel_name: &str, secure: bool, registered: bool) -> Result<Arc<Channel>, JoinError> {
        if !is_channel_name(channel_name) || channel_name.len() > 50 {
            return Err(JoinError::MalformedChannelName);
        }
        if user.channel_count.load(Ordering::Acquire) >= MAX_CHANNELS_PER_USER {
            return Err(JoinError::TooManyChannels);
        }

        let channel = {
            let mut channels = self.channels.write().unwrap();
            if let Some(existing) = channels.iter().find(|c| c.name.eq_ignore_ascii_case(channel_name)).cloned() {
                existing
            } else {
                let mut modes = ChannelModes::empty();
                modes.set(ChannelModes::NO_EXTERNAL);
                modes.set(ChannelModes::TOPIC_PROTECTED);
                if registered {
                    modes.set(ChannelModes::REGISTERED_ONLY);
                }
                let created = Arc::new(Channel {
                    name: channel_name.to_string(),
                    topic: Mutex::new(None),
                    modes: Mutex::new(modes),
                    limit: Mutex::new(None),
                    log_file: Mutex::new(None),
                    members: RwLock::new(Vec::new()),
                });
                channels.push(created.clone());
                created
            }
        };

        let modes = channel.modes();
        if modes.contains(ChannelModes::TLS_ONLY) && !secure {
            return Err(JoinError::RequiresTls);
        }
        if modes.contains(ChannelModes::REGISTERED_ONLY) && !registered {
            return Err(JoinError::RegisteredOnly);
        }
        if let Some(limit) = *channel.limit.lock().unwrap_or_else(|e| e.into_inner()) {
            if channel.member_count() as u32 >= limit {
                return Err(JoinError::ChannelFull);
            }
        }

        let is_new_channel = channel.member_count() == 0;
        let mut granted = MemberModes::empty();
        if is_new_channel {
            granted.set(MemberModes::OP);
            if user.node_id == 1 {
                granted.set(MemberModes::FOUNDER);
            }
        }
        let member = Arc::new(Member { user: user.clone(), modes: Mutex::new(granted) });
        channel.members.write().unwrap().push(member);
        user.channel_count.fetch_add(1, Ordering::AcqRel);

        // Emission order (spec §4.6 "Join"): JOIN to all members
        // including the joiner, topic (or no-topic), names list,
        // mode-grant for any new privileges.
        self.broadcast(&channel, None, None, &format!(":{} JOIN {}", user.ident_prefix(), channel.name));
        match channel.topic() {
            Some((text, _, _)) => user.send(&format!("332 {} {} :{text}", user.nickname, channel.name)),
            None => user.send(&format!("331 {} {} :No topic is set", user.nickname, channel.name)),
        }
        user.send(&format!("353 {} = {} :{}", user.nickname, channel.name, channel.names_line()));
        user.send(&format!("366 {} {} :End of /NAMES list", user.nickname, channel.name));
        if !granted.contains(MemberModes::empty()) && granted != MemberModes::empty() {
            let flags = mode_letters(granted);
            self.broadcast(&channel, None, None, &format!(":{} MODE {} +{flags} {}", user.ident_prefix(), channel.name, user.nickname));
        }

        Ok(channel)
    }

    /// Part a channel (spec §4.6 "Part / Quit / Kick"). A channel with
    /// zero remaining members is removed atomically.
    pub fn part(&self, user: &Arc<IrcUser>, channel_name: &str, message: Option<&str>) {
        let Some(channel) = self.find_channel(channel_name) else { return };
        let line = match message {
            Some(m) => format!(":{} PART {} :{m}", user.ident_prefix(), channel.name),
            None => format!(":{} PART {}", user.ident_prefix(), channel.name),
        };
        self.broadcast(&channel, None, None, &line);
        self.remove_member(&channel, user);
    }

    fn remove_member(&self, channel: &Arc<Channel>, user: &Arc<IrcUser>) {
        let removed = {
            let mut members = channel.members.write().unwrap();
            let before = members.len();
            members.retain(|m| !Arc::ptr_eq(&m.user, user));
            before != members.len()
        };
        if removed {
            user.channel_count.fetch_sub(1, Ordering::AcqRel);
        }
        if channel.member_count() == 0 {
            let mut channels = self.channels.write().unwrap();
            channels.retain(|c| !Arc::ptr_eq(c, channel));
        }
    }

    /// Broadcast across every channel the user is in, then drop them
    /// from the registry (spec §4.6 "Part / Quit / Kick": "Quit
    /// broadcasts across every channel the user is in").
    pub fn quit(&self, user: &Arc<IrcUser>, message: &str) {
        for channel in self.channels_of(user) {
            self.broadcast(&channel, None, None, &format!(":{} QUIT :{message}", user.ident_prefix()));
            self.remove_member(&channel, user);
        }
        self.users.write().unwrap().retain(|u| !Arc::ptr_eq(u, user));
    }

    /// Kick requires half-op or above on the kicker (spec §4.6).
    pub fn kick(&self, kicker: &Arc<IrcUser>, channel_name: &str, target_nick: &str, reason: &str) -> Result<(), KickError> {
        let channel = self.find_channel(channel_name).ok_or(KickError::NotInChannel)?;
        let kicker_member = channel.member_of(&kicker.nickname).ok_or(KickError::NotInChannel)?;
        if !kicker_member.modes().atleast(Privilege::HalfOp) {
            return Err(KickError::InsufficientPrivilege);
        }
        let target = self.find_user(target_nick).ok_or(KickError::TargetNotInChannel)?;
        if channel.member_of(target_nick).is_none() {
            return Err(KickError::TargetNotInChannel);
        }
        self.broadcast(&channel, None, None, &format!(":{} KICK {} {} :{reason}", kicker.ident_prefix(), channel.name, target_nick));
        self.remove_member(&channel, &target);
        Ok(())
    }

    /// Privmsg/notice authorization (spec §4.6 "Privmsg / Notice").
    pub fn privmsg(&self, sender: &Arc<IrcUser>, target: &str, message: &str) -> Result<(), PrivError> {
        if message.is_empty() {
            return Err(PrivError::Empty);
        }
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(PrivError::TooLong);
        }

        if is_channel_name(target) {
            let channel = self.find_channel(target).ok_or(PrivError::NoSuchTarget)?;
            let sender_member = channel.member_of(&sender.nickname);
            let modes = channel.modes();

            if modes.contains(ChannelModes::NO_EXTERNAL) && sender_member.is_none() {
                return Err(PrivError::NoExternalMessages);
            }

            let min_privilege = if modes.contains(ChannelModes::MODERATED) {
                let has_voice = sender_member.as_ref().map(|m| m.modes().atleast(Privilege::Voice)).unwrap_or(false);
                if !has_voice {
                    if modes.contains(ChannelModes::REDUCED_MODERATION) {
                        Some(Privilege::HalfOp)
                    } else {
                        return Err(PrivError::Moderated);
                    }
                } else {
                    None
                }
            } else {
                None
            };

            self.broadcast(&channel, Some(sender), min_privilege, &format!(":{} PRIVMSG {} :{message}", sender.ident_prefix(), channel.name));
            if let Some(log_file) = channel.log_file.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                let _ = append_log(&log_file, &format!("<{}> {message}\n", sender.nickname));
            }
            Ok(())
        } else {
            let recipient = self.find_user(target).ok_or(PrivError::NoSuchTarget)?;
            if let Some(away) = recipient.away.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                sender.send(&format!("301 {} {} :{away}", sender.nickname, recipient.nickname));
            }
            recipient.send(&format!(":{} PRIVMSG {} :{message}", sender.ident_prefix(), recipient.nickname));
            Ok(())
        }
    }

    /// Broadcast fan-out (spec §4.6 "Fan-out"). Recipients are
    /// serialized by their own user mutex; delivery order follows the
    /// member list (spec §5 "Ordering guarantees").
    pub fn broadcast(&self, channel: &Arc<Channel>, exclude: Option<&Arc<IrcUser>>, min_privilege: Option<Privilege>, line: &str) {
        let members = channel.members.read().unwrap().clone();
        for member in members {
            if let Some(sender) = exclude {
                if Arc::ptr_eq(&member.user, sender) {
                    continue;
                }
            }
            if let Some(level) = min_privilege {
                if !member.modes().atleast(level) {
                    continue;
                }
            }
            member.user.send(line);
        }
    }

    pub fn set_topic(&self, channel: &Arc<Channel>, setter: &Arc<IrcUser>, text: &str, now: i64) {
        *channel.topic.lock().unwrap_or_else(|e| e.into_inner()) = Some((text.chars().take(MAX_TOPIC_LENGTH).collect(), setter.nickname.clone(), now));
    }

    /// Changes channel modes and emits a `MODE` broadcast (spec §4.6
    /// "Modes"). Only the founder may set/clear admin (`a`); `limit`
    /// that fails to parse yields zero (effectively disabled).
    pub fn set_channel_mode(&self, setter_member: &Arc<Member>, channel: &Arc<Channel>, letter: char, on: bool, param: Option<&str>) -> Result<(), ModeError> {
        if letter == 'a' && !setter_member.modes().contains(MemberModes::FOUNDER) {
            return Err(ModeError::RequiresFounder);
        }
        let flag = match letter {
            'S' => ChannelModes::TLS_ONLY,
            'j' => ChannelModes::THROTTLED,
            'l' => ChannelModes::LIMIT,
            'm' => ChannelModes::MODERATED,
            'n' => ChannelModes::NO_EXTERNAL,
            'p' => ChannelModes::PRIVATE,
            'r' => ChannelModes::REGISTERED_ONLY,
            's' => ChannelModes::SECRET,
            't' => ChannelModes::TOPIC_PROTECTED,
            'z' => ChannelModes::REDUCED_MODERATION,
            _ => return Err(ModeError::UnknownLetter),
        };
        channel.modes.lock().unwrap_or_else(|e| e.into_inner()).toggle(flag, on);
        if letter == 'l' {
            let limit = if on { param.and_then(|p| p.parse::<u32>().ok()) } else { None };
            *channel.limit.lock().unwrap_or_else(|e| e.into_inner()) = limit.filter(|&n| n != 0);
        }
        let sign = if on { '+' } else { '-' };
        let body = match param {
            Some(p) if on => format!("{sign}{letter} {p}"),
            _ => format!("{sign}{letter}"),
        };
        self.broadcast(channel, None, None, &format!(":{} MODE {} {body}", setter_member.user.ident_prefix(), channel.name));
        Ok(())
    }

    pub fn set_member_mode(&self, channel: &Arc<Channel>, member: &Arc<Member>, flag: MemberModes, on: bool) {
        let mut modes = member.modes();
        modes.toggle(flag, on);
        member.set_modes(modes);
        let letter = match flag {
            MemberModes::OP => 'o',
            MemberModes::HALFOP => 'h',
            MemberModes::VOICE => 'v',
            MemberModes::ADMIN => 'a',
            MemberModes::FOUNDER => 'q',
            _ => return,
        };
        let sign = if on { '+' } else { '-' };
        self.broadcast(channel, None, None, &format!("MODE {} {sign}{letter} {}", channel.name, member.user.nickname));
    }
}

fn mode_letters(modes: MemberModes) -> String {
    let mut s = String::new();
    if modes.contains(MemberModes::FOUNDER) {
        s.push('q');
    }
    if modes.contains(MemberModes::ADMIN) {
        s.push('a');
    }
    if modes.contains(MemberModes::OP) {
        s.push('o');
    }
    if modes.contains(MemberModes::HALFOP) {
        s.push('h');
    }
    if modes.contains(MemberModes::VOICE) {
        s.push('v');
    }
    s
}

fn append_log(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write as _;
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(Arc<StdMutex<Vec<String>>>);
    impl IrcSink for RecordingSink {
        fn send(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn make_user(state: &IrcState, node_id: u32, nick: &str) -> (Arc<IrcUser>, Arc<StdMutex<Vec<String>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let user = IrcUser::new(node_id, nick, nick, nick, "host", Box::new(RecordingSink(log.clone())));
        state.register_user(user.clone()).unwrap();
        (user, log)
    }

    #[test]
    fn duplicate_nickname_is_rejected_case_insensitively() {
        let state = IrcState::new();
        let (_a, _) = make_user(&state, 1, "alice");
        let dup = IrcUser::new(2, "ALICE", "x", "x", "host", Box::new(RecordingSink(Arc::new(StdMutex::new(Vec::new())))));
        assert!(state.register_user(dup).is_err());
    }

    #[test]
    fn join_rejects_malformed_channel_name() {
        let state = IrcState::new();
        let (alice, _) = make_user(&state, 1, "alice");
        assert_eq!(state.join(&alice, "room", false, false).unwrap_err(), JoinError::MalformedChannelName);
    }

    #[test]
    fn s3_irc_channel_ops() {
        let state = IrcState::new();
        let (alice, alice_log) = make_user(&state, 1, "alice");
        let (bob, bob_log) = make_user(&state, 2, "bob");

        let channel = state.join(&alice, "#room", false, false).unwrap();
        // alice is op (and founder, since node id 1) on a freshly created channel.
        let alice_member = channel.member_of("alice").unwrap();
        assert!(alice_member.modes().contains(MemberModes::OP));
        assert!(alice_member.modes().contains(MemberModes::FOUNDER));

        state.join(&bob, "#room", false, false).unwrap();

        state.set_channel_mode(&alice_member, &channel, 'm', true, None).unwrap();

        let err = state.privmsg(&bob, "#room", "hi").unwrap_err();
        assert_eq!(err, PrivError::Moderated);
        assert!(bob_log.lock().unwrap().is_empty() || !bob_log.lock().unwrap().iter().any(|l| l.contains("PRIVMSG")));

        let bob_member = channel.member_of("bob").unwrap();
        state.set_member_mode(&channel, &bob_member, MemberModes::VOICE, true);
        assert!(bob_member.modes().contains(MemberModes::VOICE));

        state.privmsg(&bob, "#room", "hi").unwrap();
        // Delivered to alice only (sender excluded).
        let alice_msgs = alice_log.lock().unwrap();
        assert!(alice_msgs.iter().any(|l| l.contains("PRIVMSG #room :hi")));
        let bob_msgs = bob_log.lock().unwrap();
        assert!(!bob_msgs.iter().any(|l| l.contains("PRIVMSG #room :hi")));
    }

    #[test]
    fn channel_with_zero_members_is_removed() {
        let state = IrcState::new();
        let (alice, _) = make_user(&state, 1, "alice");
        state.join(&alice, "#temp", false, false).unwrap();
        assert!(state.find_channel("#temp").is_some());
        state.part(&alice, "#temp", None);
        assert!(state.find_channel("#temp").is_none());
    }

    #[test]
    fn kick_requires_halfop_or_above() {
        let state = IrcState::new();
        let (alice, _) = make_user(&state, 1, "alice");
        let (bob, _) = make_user(&state, 2, "bob");
        state.join(&alice, "#room", false, false).unwrap();
        state.join(&bob, "#room", false, false).unwrap();
        // bob has no privileges, cannot kick alice.
        assert_eq!(state.kick(&bob, "#room", "alice", "bye").unwrap_err(), KickError::InsufficientPrivilege);
        // alice (op) can kick bob.
        state.kick(&alice, "#room", "bob", "bye").unwrap();
        let channel = state.find_channel("#room").unwrap();
        assert!(channel.member_of("bob").is_none());
    }

    #[test]
    fn privmsg_to_away_user_returns_301_to_sender() {
        let state = IrcState::new();
        let (alice, alice_log) = make_user(&state, 1, "alice");
        let (bob, _) = make_user(&state, 2, "bob");
        *bob.away.lock().unwrap() = Some("gone fishing".to_string());
        state.privmsg(&alice, "bob", "hi").unwrap();
        assert!(alice_log.lock().unwrap().iter().any(|l| l.starts_with("301") && l.contains("gone fishing")));
    }

    #[test]
    fn quit_broadcasts_across_every_channel() {
        let state = IrcState::new();
        let (alice, _) = make_user(&state, 1, "alice");
        let (bob, bob_log) = make_user(&state, 2, "bob");
        state.join(&alice, "#a", false, false).unwrap();
        state.join(&bob, "#a", false, false).unwrap();
        state.join(&alice, "#b", false, false).unwrap();

        state.quit(&alice, "leaving");
        assert!(bob_log.lock().unwrap().iter().any(|l| l.contains("QUIT :leaving")));
        assert!(state.find_user("alice").is_none());
    }
}

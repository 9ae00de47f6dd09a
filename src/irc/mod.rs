//! Module F: IRC channel engine (spec §4.6), grounded on
//! `original_source/nets/net_irc.c` for numerics, ISUPPORT tokens, and
//! the ping/pong cadence.

pub mod modes;
pub mod sasl;
pub mod state;

pub use modes::{ChannelModes, MemberModes, Privilege, UserModes};
pub use sasl::{cloak, decode_plain, SaslError, SaslPlain};
pub use state::{Channel, IrcSink, IrcState, IrcUser, JoinError, KickError, Member, PrivError};

use std::time::Duration;

/// Interval between `PING` probes (net_irc.c: `PING_TIME MIN_MS(2)`).
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

/// A client that hasn't ponged within this long is presumed dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(240);

pub const MAX_NICK_LENGTH: usize = 16;
pub const MAX_HOST_LENGTH: usize = 128;

/// `ISUPPORT` (005) token line advertised on registration.
pub fn isupport_line() -> String {
    "PREFIX=(qaohv)~&@%+ MAXLIST=b:1 MODES=26 CASEMAPPING=rfc1459 CHANTYPES=#&".to_string()
}

pub mod numeric {
    pub const RPL_WELCOME: u16 = 1;
    pub const RPL_ISUPPORT: u16 = 5;
    pub const RPL_AWAY: u16 = 301;
    pub const RPL_NOTOPIC: u16 = 331;
    pub const RPL_TOPIC: u16 = 332;
    pub const RPL_NAMREPLY: u16 = 353;
    pub const RPL_ENDOFNAMES: u16 = 366;
    pub const RPL_LOGGEDIN: u16 = 900;
    pub const RPL_SASLSUCCESS: u16 = 903;
    pub const ERR_SASLFAIL: u16 = 904;
    pub const ERR_SASLABORTED: u16 = 906;
    /// "Cannot send to channel" — channel moderated and sender neither
    /// voiced nor a channel operator (net_irc.c's numeric 489).
    pub const ERR_CANNOTSENDTOCHAN_MODERATED: u16 = 489;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<String>>>);
    impl IrcSink for RecordingSink {
        fn send(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn make_user(state: &IrcState, node_id: u32, nick: &str) -> (std::sync::Arc<IrcUser>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let user = IrcUser::new(node_id, nick, nick, nick, "host", Box::new(RecordingSink(log.clone())));
        state.register_user(user.clone()).unwrap();
        (user, log)
    }

    /// §8 seed test S2: a client authenticates via SASL PLAIN with a nick
    /// matching its earlier NICK, then gets a cloaked hostmask.
    #[test]
    fn s2_sasl_plain_then_cloak() {
        let blob = {
            use base64::Engine as _;
            let mut raw = Vec::new();
            raw.extend_from_slice(b"alice\0alice\0hunter2");
            base64::engine::general_purpose::STANDARD.encode(raw)
        };
        let decoded = decode_plain(&blob, "alice").unwrap();
        assert_eq!(decoded.user, "alice");
        assert_eq!(*decoded.password, "hunter2");

        let state = IrcState::new();
        let (alice, _) = make_user(&state, 7, &decoded.nick);
        *alice.hostmask.lock().unwrap() = cloak(alice.node_id);
        assert_eq!(*alice.hostmask.lock().unwrap(), "node/7");
    }

    /// §8 seed test S3: two users join #room, the creator (op) sets +m,
    /// the unvoiced second user's PRIVMSG is refused with no delivery,
    /// the creator grants +v, and the resend is delivered to the first
    /// user only.
    #[test]
    fn s3_channel_ops_moderated_voice_gate() {
        let state = IrcState::new();
        let (creator, creator_log) = make_user(&state, 1, "creator");
        let (other, other_log) = make_user(&state, 2, "other");

        let channel = state.join(&creator, "#room", false, false).unwrap();
        state.join(&other, "#room", false, false).unwrap();
        creator_log.lock().unwrap().clear();
        other_log.lock().unwrap().clear();

        let creator_member = channel.member_of("creator").unwrap();
        assert!(creator_member.modes().atleast(Privilege::Op));
        state.set_channel_mode(&creator_member, &channel, 'm', true, None).unwrap();

        let err = state.privmsg(&other, "#room", "hello").unwrap_err();
        assert_eq!(err, PrivError::Moderated);
        assert!(!creator_log.lock().unwrap().iter().any(|l| l.contains("PRIVMSG")));
        assert!(!other_log.lock().unwrap().iter().any(|l| l.contains("PRIVMSG")));

        let other_member = channel.member_of("other").unwrap();
        state.set_member_mode(&channel, &other_member, MemberModes::VOICE, true);

        state.privmsg(&other, "#room", "hello again").unwrap();
        assert!(creator_log.lock().unwrap().iter().any(|l| l.contains("PRIVMSG #room :hello again")));
        assert!(!other_log.lock().unwrap().iter().any(|l| l.contains("PRIVMSG #room :hello again")));
    }

    #[test]
    fn isupport_advertises_prefix_table() {
        assert!(isupport_line().contains("PREFIX=(qaohv)~&@%+"));
    }
}

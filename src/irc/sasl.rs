//! SASL PLAIN (spec §4.6 "SASL PLAIN"), grounded on
//! `original_source/nets/net_irc.c`'s CAP/AUTHENTICATE handling
//! (numerics 900/903/904/906).

use base64::Engine as _;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslError {
    InvalidBase64,
    MalformedPlain,
    NickMismatch,
}

/// Decoded `AUTHENTICATE` PLAIN blob: `nick\0user\0password`. The
/// password is wrapped in `Zeroizing` so it is scrubbed from memory as
/// soon as it drops (spec §8 property 8, password hygiene).
#[derive(Debug)]
pub struct SaslPlain {
    pub nick: String,
    pub user: String,
    pub password: Zeroizing<String>,
}

/// Decodes a base64 `AUTHENTICATE` blob and checks the embedded nick
/// matches the nick established earlier via `NICK` (spec §4.6: "Nick
/// inside the blob must match the earlier NICK").
pub fn decode_plain(blob: &str, expected_nick: &str) -> Result<SaslPlain, SaslError> {
    let mut raw = Zeroizing::new(base64::engine::general_purpose::STANDARD.decode(blob).map_err(|_| SaslError::InvalidBase64)?);
    let fields: Vec<&[u8]> = raw.split(|&b| b == 0).collect();
    if fields.len() != 3 {
        return Err(SaslError::MalformedPlain);
    }
    let to_string = |s: &[u8]| String::from_utf8_lossy(s).into_owned();
    let nick = to_string(fields[0]);
    let user = to_string(fields[1]);
    let password = Zeroizing::new(to_string(fields[2]));
    raw.iter_mut().for_each(|b| *b = 0);

    if !nick.eq_ignore_ascii_case(expected_nick) {
        return Err(SaslError::NickMismatch);
    }
    Ok(SaslPlain { nick, user, password })
}

/// Cloaked hostmask replacing a client's raw IP (spec §4.6: "cloak the
/// user's hostname as `node/<id>`").
pub fn cloak(node_id: u32) -> String {
    format!("node/{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(nick: &str, user: &str, password: &str) -> String {
        let mut blob = Vec::new();
        blob.extend_from_slice(nick.as_bytes());
        blob.push(0);
        blob.extend_from_slice(user.as_bytes());
        blob.push(0);
        blob.extend_from_slice(password.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(blob)
    }

    #[test]
    fn s2_decodes_matching_nick() {
        let blob = encode("alice", "alice", "secret");
        let decoded = decode_plain(&blob, "alice").unwrap();
        assert_eq!(decoded.user, "alice");
        assert_eq!(*decoded.password, "secret");
    }

    #[test]
    fn mismatched_nick_is_rejected() {
        let blob = encode("alice", "alice", "secret");
        assert_eq!(decode_plain(&blob, "bob").unwrap_err(), SaslError::NickMismatch);
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert_eq!(decode_plain("not base64!!", "alice").unwrap_err(), SaslError::InvalidBase64);
    }

    #[test]
    fn missing_field_is_rejected() {
        let blob = base64::engine::general_purpose::STANDARD.encode(b"alice\0alice");
        assert_eq!(decode_plain(&blob, "alice").unwrap_err(), SaslError::MalformedPlain);
    }

    #[test]
    fn cloak_uses_node_id() {
        assert_eq!(cloak(42), "node/42");
    }
}

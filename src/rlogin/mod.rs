//! RLogin listener (SPEC_FULL.md "Supplemented features"; spec §6,
//! grounded on `original_source/nets/net_rlogin.c`'s `rlogin_handshake`).
//!
//! RFC 1282: on accept, the client sends a 4-field NUL-separated
//! connection string (empty field, client-user, server-user,
//! term/speed); the server replies with a single NUL byte, then probes
//! the client's window size by sending the urgent-TCP-marker byte
//! `TIOCPKT_WINDOW` (0x80) and awaiting a 12-byte `FF FF`-prefixed
//! response.
//!
//! The window-change parser below follows the documented packet layout
//! but is carried over from the original with its own caveat intact: the
//! original's author left a comment that the urgent-data path "doesn't
//! work properly yet" and the sequence was never verified against a
//! live client (§9 Open Questions — this is preserved as documented, not
//! invented-fixed).

const TIOCPKT_WINDOW: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RloginHandshake {
    pub client_user: String,
    pub server_user: String,
    pub term_speed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub xpixels: u16,
    pub ypixels: u16,
}

/// Parses the 4-field NUL-separated connection string RFC 1282 mandates:
/// an empty leading field, client-user, server-user, term/speed.
pub fn parse_connection_string(buf: &[u8]) -> Option<RloginHandshake> {
    let parts: Vec<&[u8]> = buf.split(|&b| b == 0).collect();
    // `split` on a NUL-terminated 4-field string yields 5 parts: the 4
    // fields plus a trailing empty slice after the last NUL.
    if parts.len() != 5 || !parts[0].is_empty() || !parts[4].is_empty() {
        return None;
    }
    let to_string = |s: &[u8]| std::str::from_utf8(s).ok().map(str::to_string);
    Some(RloginHandshake {
        client_user: to_string(parts[1])?,
        server_user: to_string(parts[2])?,
        term_speed: to_string(parts[3])?,
    })
}

/// The single-byte urgent-data probe the server sends to request the
/// client's window size (spec §6, "send one byte with the urgent TCP
/// marker requesting the window size").
pub fn window_size_probe_byte() -> u8 {
    TIOCPKT_WINDOW
}

/// Parses the client's 12-byte window-change control sequence:
/// `FF FF s s rr cc xp yp` (two magic bytes, a subcommand byte, a spare
/// byte, then rows/cols/xpixels/ypixels as big-endian `u16`s).
///
/// Per the original's own caveat, this parser has never been exercised
/// against a live RLogin client — the urgent-data delivery path that is
/// supposed to trigger it was never confirmed working.
pub fn parse_window_change(buf: &[u8]) -> Option<WindowSize> {
    if buf.len() < 12 || buf[0] != 0xFF || buf[1] != 0xFF {
        return None;
    }
    let be16 = |hi: u8, lo: u8| u16::from_be_bytes([hi, lo]);
    Some(WindowSize {
        rows: be16(buf[4], buf[5]),
        cols: be16(buf[6], buf[7]),
        xpixels: be16(buf[8], buf[9]),
        ypixels: be16(buf[10], buf[11]),
    })
}

/// The single NUL byte acknowledging the connection string and
/// switching to data-transfer mode (spec §6).
pub fn ack_byte() -> u8 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_connection_string() {
        let mut buf = Vec::new();
        buf.push(0u8);
        buf.extend_from_slice(b"alice\0");
        buf.extend_from_slice(b"alice\0");
        buf.extend_from_slice(b"xterm/38400\0");
        let handshake = parse_connection_string(&buf).unwrap();
        assert_eq!(handshake.client_user, "alice");
        assert_eq!(handshake.server_user, "alice");
        assert_eq!(handshake.term_speed, "xterm/38400");
    }

    #[test]
    fn rejects_string_with_wrong_nul_count() {
        assert!(parse_connection_string(b"\0alice\0bob\0").is_none());
    }

    #[test]
    fn window_change_requires_ff_ff_prefix() {
        let mut buf = vec![0xAAu8; 12];
        assert!(parse_window_change(&buf).is_none());
        buf[0] = 0xFF;
        buf[1] = 0xFF;
        assert!(parse_window_change(&buf).is_some());
    }

    #[test]
    fn window_change_decodes_rows_and_cols() {
        let mut buf = vec![0u8; 12];
        buf[0] = 0xFF;
        buf[1] = 0xFF;
        buf[4..6].copy_from_slice(&24u16.to_be_bytes());
        buf[6..8].copy_from_slice(&80u16.to_be_bytes());
        let ws = parse_window_change(&buf).unwrap();
        assert_eq!(ws.rows, 24);
        assert_eq!(ws.cols, 80);
    }

    #[test]
    fn window_change_too_short_is_rejected() {
        assert!(parse_window_change(&[0xFF, 0xFF, 0, 0]).is_none());
    }

    #[test]
    fn probe_byte_is_tiocpkt_window() {
        assert_eq!(window_size_probe_byte(), 0x80);
    }
}

//! IRC mode bitsets (spec §4.6 "Modes"; glossary "Channel mode letters").
//!
//! Channel modes split into the classic A/B/C/D categories (A: list
//! modes like ban, not modeled here since no ban list is named in the
//! spec's data model; B: modes with a mandatory parameter; C: modes with
//! a parameter only when set; D: flags). The letters this crate
//! implements come straight from the glossary.

/// A tiny hand-rolled bitflags macro: the teacher's and pack's
/// dependency stacks don't carry the `bitflags` crate, and these sets
/// are small and fixed, so a `Copy` newtype over the backing integer is
/// the idiomatic minimal choice here.
macro_rules! bitflags_like {
    (
        $(#[$outer:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn set(&mut self, flag: Self) {
                self.0 |= flag.0;
            }

            pub fn unset(&mut self, flag: Self) {
                self.0 &= !flag.0;
            }

            pub fn toggle(&mut self, flag: Self, on: bool) {
                if on {
                    self.set(flag);
                } else {
                    self.unset(flag);
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Channel-level flags (glossary: `S j l m n p r s t z`).
    pub struct ChannelModes: u16 {
        const TLS_ONLY           = 1 << 0; // S
        const THROTTLED          = 1 << 1; // j (declared, unimplemented per §9 Open Questions)
        const LIMIT              = 1 << 2; // l
        const MODERATED          = 1 << 3; // m
        const NO_EXTERNAL        = 1 << 4; // n
        const PRIVATE            = 1 << 5; // p
        const REGISTERED_ONLY    = 1 << 6; // r
        const SECRET             = 1 << 7; // s
        const TOPIC_PROTECTED    = 1 << 8; // t
        const REDUCED_MODERATION = 1 << 9; // z
    }
}

bitflags_like! {
    /// Per-member-in-channel privilege bits (glossary: `q a o h v`).
    /// founder/admin are orthogonal status markers; op > half-op > voice
    /// is a strict lattice (spec §3 "Member").
    pub struct MemberModes: u8 {
        const FOUNDER = 1 << 0; // q
        const ADMIN   = 1 << 1; // a
        const OP      = 1 << 2; // o
        const HALFOP  = 1 << 3; // h
        const VOICE   = 1 << 4; // v
    }
}

bitflags_like! {
    /// Global per-user flags (glossary: `i o Z`).
    pub struct UserModes: u8 {
        const INVISIBLE       = 1 << 0; // i
        const SERVER_OPERATOR = 1 << 1; // o
        const SECURE          = 1 << 2; // Z
    }
}

/// Privilege levels `atleast(member, level)` checks against (spec §4.6
/// "Member" authorization table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    Voice,
    HalfOp,
    Op,
}

impl MemberModes {
    /// `atleast(M, level)` — holds when the member has the named
    /// privilege or any strictly higher one on the op>half-op>voice
    /// ladder (spec §3 "Member": "op-or-better implies voice for send
    /// purposes").
    pub fn atleast(self, level: Privilege) -> bool {
        match level {
            Privilege::Voice => self.contains(Self::VOICE) || self.contains(Self::HALFOP) || self.contains(Self::OP),
            Privilege::HalfOp => self.contains(Self::HALFOP) || self.contains(Self::OP),
            Privilege::Op => self.contains(Self::OP),
        }
    }

    /// The single highest-privilege prefix symbol for a member-list line
    /// (spec §4.6: "Member-line prefix shows only the highest held").
    pub fn prefix_symbol(self) -> Option<char> {
        if self.contains(Self::FOUNDER) {
            Some('~')
        } else if self.contains(Self::ADMIN) {
            Some('&')
        } else if self.contains(Self::OP) {
            Some('@')
        } else if self.contains(Self::HALFOP) {
            Some('%')
        } else if self.contains(Self::VOICE) {
            Some('+')
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atleast_voice_accepts_op_or_halfop_or_voice() {
        assert!(MemberModes::OP.atleast(Privilege::Voice));
        assert!(MemberModes::HALFOP.atleast(Privilege::Voice));
        assert!(MemberModes::VOICE.atleast(Privilege::Voice));
        assert!(!MemberModes::empty().atleast(Privilege::Voice));
    }

    #[test]
    fn founder_and_admin_do_not_imply_op() {
        assert!(!MemberModes::FOUNDER.atleast(Privilege::Op));
        assert!(!MemberModes::ADMIN.atleast(Privilege::Op));
    }

    #[test]
    fn prefix_symbol_shows_only_highest_privilege() {
        let mut m = MemberModes::empty();
        m.set(MemberModes::VOICE);
        m.set(MemberModes::OP);
        assert_eq!(m.prefix_symbol(), Some('@'));
    }
}

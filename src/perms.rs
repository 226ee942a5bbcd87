//! Permission predicate masks.
//!
//! A [`Perm`] is a set of predicates; a check passes when any one of them
//! holds for the current context. Evaluation lives in
//! [`crate::context::Ctx::check_perms`].

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Perm(u64);

impl Perm {
    /// Public leaf, no predicate at all.
    pub const NOTHING: Self = Self(0);
    pub const NONE: Self = Self(1 << 0);
    pub const GUEST: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const USER_SELF: Self = Self(1 << 3);
    pub const USER_NOMINATE: Self = Self(1 << 4);
    pub const USER_VIEW: Self = Self(1 << 5);
    pub const GROUP_MEMBER: Self = Self(1 << 6);
    pub const GROUP_ADMIN: Self = Self(1 << 7);
    pub const GROUP_WIKI: Self = Self(1 << 8);
    pub const GROUP_FILE: Self = Self(1 << 9);
    pub const GROUP_CALENDAR: Self = Self(1 << 10);
    pub const SYS_ADMIN: Self = Self(1 << 11);
    pub const SYS_ADMIN_CAN: Self = Self(1 << 12);
    pub const CLI: Self = Self(1 << 13);
    pub const API: Self = Self(1 << 14);
    pub const OAUTH: Self = Self(1 << 15);
    pub const LOOPBACK: Self = Self(1 << 16);
    pub const HIDDEN: Self = Self(1 << 17);
    pub const NOCRUMB: Self = Self(1 << 18);
    pub const NOSUBS: Self = Self(1 << 19);
    pub const NOBODY: Self = Self(1 << 20);
    pub const APP_0: Self = Self(1 << 21);
    pub const APP_1: Self = Self(1 << 22);
    pub const APP_2: Self = Self(1 << 23);
    pub const APP_3: Self = Self(1 << 24);
    pub const APP_4: Self = Self(1 << 25);
    pub const APP_5: Self = Self(1 << 26);
    pub const APP_6: Self = Self(1 << 27);
    pub const APP_7: Self = Self(1 << 28);
    pub const APP_8: Self = Self(1 << 29);
    pub const APP_9: Self = Self(1 << 30);

    const NAMES: [(Self, &'static str); 31] = [
        (Self::NONE, "none"),
        (Self::GUEST, "guest"),
        (Self::USER, "user"),
        (Self::USER_SELF, "self"),
        (Self::USER_NOMINATE, "user_nominate"),
        (Self::USER_VIEW, "user_view"),
        (Self::GROUP_MEMBER, "group_member"),
        (Self::GROUP_ADMIN, "group_admin"),
        (Self::GROUP_WIKI, "group_wiki"),
        (Self::GROUP_FILE, "group_file"),
        (Self::GROUP_CALENDAR, "group_calendar"),
        (Self::SYS_ADMIN, "sysadmin"),
        (Self::SYS_ADMIN_CAN, "sysadmin_can"),
        (Self::CLI, "cli"),
        (Self::API, "api"),
        (Self::OAUTH, "oauth"),
        (Self::LOOPBACK, "loopback"),
        (Self::HIDDEN, "hidden"),
        (Self::NOCRUMB, "nocrumb"),
        (Self::NOSUBS, "nosubs"),
        (Self::NOBODY, "nobody"),
        (Self::APP_0, "app_0"),
        (Self::APP_1, "app_1"),
        (Self::APP_2, "app_2"),
        (Self::APP_3, "app_3"),
        (Self::APP_4, "app_4"),
        (Self::APP_5, "app_5"),
        (Self::APP_6, "app_6"),
        (Self::APP_7, "app_7"),
        (Self::APP_8, "app_8"),
        (Self::APP_9, "app_9"),
    ];

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True when every bit of `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_nothing(self) -> bool {
        self.0 == 0
    }

    /// Parses a comma separated list of predicate names, e.g. `"user,group_admin"`.
    ///
    /// # Errors
    /// Returns `InvalidInput` on an unknown name.
    pub fn parse(list: &str) -> Result<Self, Error> {
        let mut perm = Self::NOTHING;

        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let name = name.to_lowercase();
            if name == "nothing" {
                continue;
            }

            let bit = Self::NAMES
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(p, _)| *p)
                .ok_or_else(|| Error::invalid(format!("Unknown permission: {name}")))?;

            perm |= bit;
        }

        Ok(perm)
    }

    /// Names of the predicates present in this mask.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        if self.is_nothing() {
            return vec!["nothing"];
        }

        Self::NAMES
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl BitOr for Perm {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Perm {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

impl fmt::Debug for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Perm({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let perm = Perm::parse("user, group_admin").unwrap();
        assert!(perm.contains(Perm::USER));
        assert!(perm.contains(Perm::GROUP_ADMIN));
        assert!(!perm.contains(Perm::SYS_ADMIN));
        assert_eq!(perm.to_string(), "user,group_admin");
    }

    #[test]
    fn nothing_is_empty() {
        assert_eq!(Perm::parse("").unwrap(), Perm::NOTHING);
        assert_eq!(Perm::parse("nothing").unwrap(), Perm::NOTHING);
        assert_eq!(Perm::NOTHING.to_string(), "nothing");
        assert!(!Perm::NOTHING.contains(Perm::NOTHING));
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(Perm::parse("user,root").is_err());
    }

    #[test]
    fn self_uses_short_name() {
        assert_eq!(Perm::parse("self").unwrap(), Perm::USER_SELF);
        assert_eq!(Perm::parse("APP_9").unwrap(), Perm::APP_9);
    }

    #[test]
    fn without_clears_bits() {
        let perm = Perm::USER | Perm::NOBODY;
        assert_eq!(perm.without(Perm::NOBODY), Perm::USER);
    }
}

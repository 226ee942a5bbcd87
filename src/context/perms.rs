//! Evaluation of permission masks against the context.
//!
//! Predicates are tried in a fixed order. Any predicate that holds allows
//! the request; a failing one only records why, so a mask reads as "any of
//! these". The few predicates that must never be combined with others
//! (`nobody`, `guest` when authenticated, group features the group lacks)
//! deny immediately.

use tracing::debug;

use super::Ctx;
use crate::{
    error::{Error, Result},
    hooks::AppVerdict,
    model::{Group, Principal},
    perms::Perm,
};

/// Flags that steer presentation and never grant anything.
const PRESENTATION: Perm = Perm::HIDDEN.union(Perm::NOCRUMB).union(Perm::NOSUBS);

impl Ctx {
    /// An elevated principal calling from an address the sysadmin
    /// restriction admits. Elsewhere the elevation is ignored.
    #[must_use]
    pub fn is_sysadmin(&self) -> bool {
        self.user().is_some_and(Principal::is_elevated)
            && self
                .core()
                .system()
                .get()
                .sysadmin_allowed_from(self.client_ip())
    }

    /// The authenticated principal is also the selected one.
    #[must_use]
    pub fn is_self(&self) -> bool {
        match (self.user(), self.sel_user()) {
            (Some(me), Some(sel)) => me.username() == sel.username(),
            _ => false,
        }
    }

    /// Sysadmin, or admin of the selected group.
    #[must_use]
    pub fn i_am_group_admin(&self) -> bool {
        if !self.is_logged_in() {
            return false;
        }
        let Some(sel) = self.sel_group() else {
            return false;
        };
        self.is_sysadmin() || sel.membership.as_ref().is_some_and(|m| m.admin)
    }

    /// Member of the selected group in a state that lets them see it.
    #[must_use]
    pub fn is_group_member(&self) -> bool {
        let Some(membership) = self.sel_group().and_then(|s| s.membership.as_ref()) else {
            return false;
        };
        self.i_am_group_admin() || membership.can_see
    }

    #[must_use]
    pub fn can_be_sysadmin(&self) -> bool {
        self.user().is_some_and(Principal::can_be_sysadmin)
    }

    fn deny(what: &str, reason: &str) -> Error {
        debug!("check_perms({what}) denied: {reason}");
        Error::unauthorized(reason)
    }

    /// Decides whether the current caller satisfies `perms`. `what` names
    /// the object for logging.
    ///
    /// # Errors
    /// `Unauthorized` with a human readable reason, or a store error from
    /// the shared group lookup.
    pub async fn check_perms(&mut self, what: &str, perms: Perm) -> Result<()> {
        if perms.contains(Perm::NOBODY) {
            return Err(Self::deny(what, "Nobody is allowed"));
        }

        let perms = perms.without(PRESENTATION);
        if perms.is_nothing() {
            return Ok(());
        }

        let system = self.core().system().get();
        let mut reason = "Access denied";

        if perms.contains(Perm::CLI) {
            if self.is_logged_in() && system.cli_enabled {
                return Ok(());
            }
            reason = "CLI is not enabled";
        }

        if perms.contains(Perm::API) {
            if system.api_enabled {
                return Ok(());
            }
            reason = "API is not enabled";
        }

        if perms.contains(Perm::OAUTH) {
            if system.oauth_enabled {
                return Ok(());
            }
            reason = "OAuth is not enabled";
        }

        if perms.contains(Perm::LOOPBACK) {
            if self.client_ip().is_some_and(|ip| ip.is_loopback()) {
                return Ok(());
            }
            reason = "Not a Loopback";
        }

        if perms.contains(Perm::GUEST) {
            if !self.is_logged_in() {
                return Ok(());
            }
            return Err(Self::deny(what, "Must not be authenticated"));
        }

        if perms.contains(Perm::USER_SELF) {
            if !self.is_logged_in() {
                reason = "Not Authenticated";
            } else if self.sel_user().is_none() {
                reason = "No user selected";
            } else if self.is_self() {
                return Ok(());
            } else {
                reason = "Different user selected";
            }
        }

        if perms.contains(Perm::USER_VIEW) {
            let pair = self
                .user()
                .zip(self.sel_user())
                .map(|(me, sel)| (me.username().to_string(), sel.username().to_string()));

            match pair {
                Some((me, sel)) if me == sel => return Ok(()),
                Some((me, sel)) => match Principal::shared_groups(self, &me, &sel).await {
                    Ok(()) => return Ok(()),
                    Err(Error::Unauthorized(_)) => reason = "Different user selected",
                    Err(err) => return Err(err),
                },
                None if !self.is_logged_in() => reason = "Not Authenticated",
                None => reason = "No user selected",
            }
        }

        let features: [(Perm, fn(&Group) -> bool, &str); 3] = [
            (Perm::GROUP_WIKI, |g| g.has_wiki, "Group does not have a Wiki"),
            (Perm::GROUP_FILE, |g| g.has_file, "Group does not have a File"),
            (Perm::GROUP_CALENDAR, |g| g.has_calendar, "Group does not have a Calendar"),
        ];
        for (flag, has, missing) in features {
            if !perms.contains(flag) {
                continue;
            }
            if !self.sel_group().is_some_and(|s| has(&s.group)) {
                return Err(Self::deny(what, missing));
            }
            if self.is_group_member() {
                return Ok(());
            }
            reason = "Not a group member";
        }

        if perms.contains(Perm::NONE) {
            return Ok(());
        }

        if !self.is_logged_in() {
            return Err(Self::deny(what, "Not authenticated"));
        }

        if self.is_sysadmin() {
            return Ok(());
        }
        if perms.contains(Perm::SYS_ADMIN) {
            reason = "Not a SysAdmin";
        }

        if perms.contains(Perm::USER) {
            return Ok(());
        }

        if perms.contains(Perm::GROUP_ADMIN) {
            if self.i_am_group_admin() {
                return Ok(());
            }
            reason = "Not a group admin";
        }

        if perms.contains(Perm::GROUP_MEMBER) {
            if self.is_group_member() {
                return Ok(());
            }
            reason = "Not a group member";
        }

        if perms.contains(Perm::USER_NOMINATE) {
            if self.sel_user().is_some() {
                return Ok(());
            }
            reason = "No user selected";
        }

        if perms.contains(Perm::SYS_ADMIN_CAN) {
            if self.can_be_sysadmin() {
                return Ok(());
            }
            reason = "Can't become SysAdmin";
        }

        let hooks = self.core().hooks();
        match hooks.app_perms(self, what, perms) {
            AppVerdict::Allow => return Ok(()),
            AppVerdict::Deny(msg) => return Err(Self::deny(what, &msg)),
            AppVerdict::Continue => {}
        }

        Err(Self::deny(what, reason))
    }
}

use tracing::{debug, info};

use super::Ctx;
use crate::{
    error::{Error, ErrorKind, Result},
    model::{Group, GroupSelection, Principal},
    otp,
    perms::Perm,
    token::{Claims, SESSION},
};

impl Ctx {
    /// Switches the context to `user`, who also becomes the selected user.
    pub fn become_user(&mut self, user: Principal) {
        self.user = Some(user.clone());
        self.sel_user = Some(user);

        let hooks = self.core().hooks();
        hooks.post_become(self);
    }

    /// Authenticates with password and optional second factor.
    ///
    /// # Errors
    /// `RateLimited` as is; every other failure collapses into
    /// `LoginIncorrect` with the cause kept for the log.
    pub async fn login(&mut self, username: &str, password: &str, twofactor: &str) -> Result<()> {
        match Principal::check_auth(self, username, password, twofactor).await {
            Ok(user) => {
                self.token = None;
                self.claims = None;
                info!("Login of {} from {}", user.username(), self.remote());
                self.become_user(user);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::RateLimited => Err(err),
            Err(err) => {
                info!("CheckAuth({username}): {err}");
                Err(Error::LoginIncorrect(Box::new(err)))
            }
        }
    }

    /// Authenticates with a session token. The principal is read back from
    /// the store so that changes since the token was issued apply. Returns
    /// whether the token expires soon.
    ///
    /// # Errors
    /// `Unauthorized` for invalid, revoked or orphaned tokens.
    pub async fn login_token(&mut self, token: &str) -> Result<bool> {
        self.token = None;
        self.claims = None;

        let core = self.core_arc();
        let (claims, expsoon) = core.parse_token(token, Some(SESSION)).await?;

        let mut user = match Principal::fetch(self, &claims.sub).await {
            Ok(user) => user,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::unauthorized("No such user"));
            }
            Err(err) => return Err(err),
        };
        user.set_elevated(claims.is_sysadmin());

        self.become_user(user);
        self.token = Some(token.to_string());
        self.claims = Some(claims);

        Ok(expsoon)
    }

    /// Revokes the current token, if any, and forgets the principal.
    ///
    /// # Errors
    /// The revocation store error; the context is logged out regardless.
    pub async fn logout(&mut self) -> Result<()> {
        let revoked = match (self.token.take(), self.claims.take()) {
            (Some(token), Some(claims)) => {
                let core = self.core_arc();
                core.revocation().revoke(&token, &claims).await
            }
            _ => Ok(()),
        };

        if let Some(user) = self.user.take() {
            debug!("Logout of {}", user.username());
        }
        self.sel_user = None;
        self.sel_2fa = None;

        revoked
    }

    /// Mints a session token for the current principal and keeps it.
    ///
    /// # Errors
    /// `Unauthorized` without a principal, `Internal` on signing failures.
    pub fn new_token(&mut self) -> Result<String> {
        let user = self
            .user()
            .ok_or_else(|| Error::unauthorized("Not authenticated"))?;
        let draft = Claims::session(user.username(), user.full_name(), user.is_elevated());

        let core = self.core_arc();
        let token = core.tokens().issue(draft, core.config().token_ttl())?;
        let (claims, _) = core.tokens().parse(&token, Some(SESSION))?;

        self.token = Some(token.clone());
        self.claims = Some(claims);
        self.token_minted = true;
        Ok(token)
    }

    /// Toggles elevation for a sysadmin capable principal. The current token
    /// no longer matches and is dropped.
    ///
    /// # Errors
    /// `Unauthorized` when the principal may not elevate.
    pub fn swap_admin(&mut self) -> Result<()> {
        let Some(user) = self.user.as_mut().filter(|u| u.can_be_sysadmin()) else {
            return Err(Error::unauthorized("Swapping failed"));
        };

        let elevated = !user.is_elevated();
        user.set_elevated(elevated);
        let name = user.username().to_string();

        if let Some(sel) = self.sel_user.as_mut().filter(|s| s.username() == name) {
            sel.set_elevated(elevated);
        }

        self.token = None;
        self.claims = None;

        self.outln(if elevated {
            "Now a SysAdmin user"
        } else {
            "Now a Regular user"
        });
        Ok(())
    }

    /// Selects `username` when `perms` admits it. An empty name clears the
    /// selection.
    ///
    /// # Errors
    /// The lookup error, or `Unauthorized` ("Could not select user").
    pub async fn select_user(&mut self, username: &str, perms: Perm) -> Result<()> {
        if username.is_empty() {
            self.sel_user = None;
            return Ok(());
        }

        let me = self.user().filter(|u| u.username() == username).cloned();
        let target = match me {
            Some(me) => me,
            None => match Principal::fetch(self, username).await {
                Ok(user) => user,
                Err(err) => {
                    self.sel_user = None;
                    return Err(err);
                }
            },
        };
        self.sel_user = Some(target);

        if self.may_select(perms).await? {
            return Ok(());
        }

        self.sel_user = None;
        Err(Error::unauthorized("Could not select user"))
    }

    async fn may_select(&mut self, perms: Perm) -> Result<bool> {
        if perms.contains(Perm::NONE) || self.is_sysadmin() {
            return Ok(true);
        }
        if perms.contains(Perm::USER_SELF) && self.is_self() {
            return Ok(true);
        }
        if perms.contains(Perm::USER_NOMINATE) && self.is_logged_in() {
            return Ok(true);
        }
        if perms.contains(Perm::USER_VIEW) {
            if self.is_self() {
                return Ok(true);
            }
            let pair = self
                .user()
                .zip(self.sel_user())
                .map(|(me, sel)| (me.username().to_string(), sel.username().to_string()));
            if let Some((me, sel)) = pair {
                match Principal::shared_groups(self, &me, &sel).await {
                    Ok(()) => return Ok(true),
                    Err(err) if err.kind() == ErrorKind::Unauthorized => {}
                    Err(err) => return Err(err),
                }
            }
        }
        if perms.contains(Perm::GROUP_ADMIN) && self.i_am_group_admin() {
            return Ok(true);
        }
        Ok(false)
    }

    /// Selects group `name` together with the caller's membership in it.
    ///
    /// # Errors
    /// The lookup error, or `Unauthorized` ("Could not select group").
    pub async fn select_group(&mut self, name: &str, perms: Perm) -> Result<()> {
        if name.is_empty() {
            self.sel_group = None;
            return Ok(());
        }

        self.sel_group = None;
        let group = Group::fetch(self, name).await?;
        let membership = match self.user().map(|u| u.username().to_string()) {
            Some(me) => group.membership(self, &me).await?,
            None => None,
        };
        self.sel_group = Some(GroupSelection { group, membership });

        if let Err(err) = self.check_perms(&format!("select_group({name})"), perms).await {
            debug!("select_group({name}): {err}");
            self.sel_group = None;
            return Err(Error::unauthorized("Could not select group"));
        }

        Ok(())
    }

    /// Selects second factor `id` of the selected user. Zero, or no selected
    /// user, clears the selection.
    ///
    /// # Errors
    /// The lookup error, or `Unauthorized` for someone else's factor.
    pub async fn select_2fa(&mut self, id: i64) -> Result<()> {
        self.sel_2fa = None;

        let Some(owner) = self.sel_user().map(|u| u.username().to_string()) else {
            return Ok(());
        };
        if id == 0 {
            return Ok(());
        }

        let mine = self.user().is_some_and(|u| u.username() == owner);
        if !(self.is_sysadmin() || mine) {
            return Err(Error::unauthorized("Could not select 2FA Token"));
        }

        self.sel_2fa = Some(otp::fetch(self, &owner, id).await?);
        Ok(())
    }
}

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::{error, info, warn};

use crate::{
    accessor::{self, AndOr, Entity, FieldDesc, Fetch, Kind, Op, Value, Where},
    context::Ctx,
    db::Param,
    error::{Error, Result},
    password::{self, MIN_PASSWORD_LENGTH},
    perms::Perm,
};

const SELF_OR_ADMIN: Perm = Perm::USER_SELF.union(Perm::SYS_ADMIN);
const VIEW: Perm = Perm::USER_VIEW;

/// How long a recovery token stays valid.
const RECOVERY_VALIDITY_DAYS: i64 = 7;

static FIELDS: [FieldDesc; 20] = [
    FieldDesc::new("ident", Kind::Str)
        .label("Username")
        .get(VIEW)
        .set(Perm::NOBODY),
    FieldDesc::new("uuid", Kind::Str)
        .label("UUID")
        .get(Perm::SYS_ADMIN)
        .set(Perm::NOBODY),
    FieldDesc::new("descr", Kind::Str)
        .label("Full Name")
        .hint("The full name of this user")
        .range(0, 512)
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("name_first", Kind::Str)
        .label("First Name")
        .nullable()
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("name_last", Kind::Str)
        .label("Last Name")
        .nullable()
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("affiliation", Kind::Str)
        .label("Affiliation")
        .hint("Who the user is affiliated to")
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("bio_info", Kind::Str)
        .label("Bio")
        .hint("Biography for this user")
        .nullable()
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("tel_info", Kind::Str)
        .label("Telephone")
        .hint("How to contact this user by telephone")
        .nullable()
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("sms_info", Kind::Str)
        .label("SMS")
        .hint("How to contact this user by SMS")
        .nullable()
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("airport", Kind::Str)
        .label("Airport")
        .hint("3 letter IATA code of the closest airport")
        .nullable()
        .range(0, 3)
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("recover_email", Kind::Str)
        .label("Recovery Email")
        .hint("Email address where recovery tokens are sent")
        .nullable()
        .get(SELF_OR_ADMIN)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("furlough", Kind::Bool)
        .label("Furlough")
        .hint("Temporarily not receiving any mail")
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("hide_email", Kind::Bool)
        .label("Hide email address")
        .get(VIEW)
        .set(SELF_OR_ADMIN),
    FieldDesc::new("sysadmin", Kind::Bool)
        .label("System Administrator")
        .hint("May elevate to system administrator")
        .get(Perm::GROUP_ADMIN)
        .set(Perm::SYS_ADMIN),
    FieldDesc::new("login_attempts", Kind::Int)
        .label("Failed Login Attempts")
        .range(0, 1_000_000)
        .get(Perm::USER_SELF.union(Perm::GROUP_ADMIN))
        .set(Perm::SYS_ADMIN),
    FieldDesc::new("entered", Kind::Time)
        .label("Entered")
        .get(Perm::USER.union(VIEW))
        .set(Perm::NOBODY),
    FieldDesc::new("activity", Kind::Time)
        .label("Last activity")
        .get(Perm::USER.union(VIEW))
        .set(Perm::NOBODY),
    FieldDesc::new("password", Kind::Str).hidden(),
    FieldDesc::new("recover_password", Kind::Str).hidden(),
    FieldDesc::new("recover_password_set_at", Kind::Time).hidden(),
];

/// A platform identity as stored in `member`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal {
    pub ident: String,
    pub uuid: String,
    pub descr: String,
    pub name_first: Option<String>,
    pub name_last: Option<String>,
    pub affiliation: String,
    pub bio_info: Option<String>,
    pub tel_info: Option<String>,
    pub sms_info: Option<String>,
    pub airport: Option<String>,
    pub recover_email: Option<String>,
    pub furlough: bool,
    pub hide_email: bool,
    /// May elevate.
    pub sysadmin: bool,
    pub login_attempts: i64,
    pub entered: DateTime<Utc>,
    pub activity: DateTime<Utc>,
    pub(crate) password: String,
    pub(crate) recover_password: String,
    pub(crate) recover_password_set_at: DateTime<Utc>,
    /// Acting with elevated authority this session.
    pub(crate) elevated: bool,
}

fn opt_value(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |s| Value::Str(s.clone()))
}

fn opt_slot(slot: &mut Option<String>, value: Value) -> Result<()> {
    *slot = match value {
        Value::Str(s) => Some(s),
        Value::Null => None,
        other => return Err(Error::invalid(format!("Expected text, got {other:?}"))),
    };
    Ok(())
}

fn str_slot(slot: &mut String, value: Value) -> Result<()> {
    match value {
        Value::Str(s) => *slot = s,
        Value::Null => slot.clear(),
        other => return Err(Error::invalid(format!("Expected text, got {other:?}"))),
    }
    Ok(())
}

fn bool_slot(slot: &mut bool, value: Value) -> Result<()> {
    *slot = value
        .as_bool()
        .ok_or_else(|| Error::invalid("Expected a boolean"))?;
    Ok(())
}

fn time_slot(slot: &mut DateTime<Utc>, value: Value) -> Result<()> {
    match value {
        Value::Time(t) => *slot = t,
        Value::Null => *slot = DateTime::<Utc>::default(),
        _ => return Err(Error::invalid("Expected a timestamp")),
    }
    Ok(())
}

impl Entity for Principal {
    fn table(&self) -> &'static str {
        "member"
    }

    fn fields(&self) -> &'static [FieldDesc] {
        &FIELDS
    }

    fn get(&self, column: &str) -> Option<Value> {
        Some(match column {
            "ident" => Value::Str(self.ident.clone()),
            "uuid" => Value::Str(self.uuid.clone()),
            "descr" => Value::Str(self.descr.clone()),
            "name_first" => opt_value(self.name_first.as_ref()),
            "name_last" => opt_value(self.name_last.as_ref()),
            "affiliation" => Value::Str(self.affiliation.clone()),
            "bio_info" => opt_value(self.bio_info.as_ref()),
            "tel_info" => opt_value(self.tel_info.as_ref()),
            "sms_info" => opt_value(self.sms_info.as_ref()),
            "airport" => opt_value(self.airport.as_ref()),
            "recover_email" => opt_value(self.recover_email.as_ref()),
            "furlough" => Value::Bool(self.furlough),
            "hide_email" => Value::Bool(self.hide_email),
            "sysadmin" => Value::Bool(self.sysadmin),
            "login_attempts" => Value::Int(self.login_attempts),
            "entered" => Value::Time(self.entered),
            "activity" => Value::Time(self.activity),
            "password" => Value::Str(self.password.clone()),
            "recover_password" => Value::Str(self.recover_password.clone()),
            "recover_password_set_at" => Value::Time(self.recover_password_set_at),
            _ => return None,
        })
    }

    fn put(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "ident" => str_slot(&mut self.ident, value),
            "uuid" => str_slot(&mut self.uuid, value),
            "descr" => str_slot(&mut self.descr, value),
            "name_first" => opt_slot(&mut self.name_first, value),
            "name_last" => opt_slot(&mut self.name_last, value),
            "affiliation" => str_slot(&mut self.affiliation, value),
            "bio_info" => opt_slot(&mut self.bio_info, value),
            "tel_info" => opt_slot(&mut self.tel_info, value),
            "sms_info" => opt_slot(&mut self.sms_info, value),
            "airport" => opt_slot(&mut self.airport, value),
            "recover_email" => opt_slot(&mut self.recover_email, value),
            "furlough" => bool_slot(&mut self.furlough, value),
            "hide_email" => bool_slot(&mut self.hide_email, value),
            "sysadmin" => bool_slot(&mut self.sysadmin, value),
            "login_attempts" => {
                self.login_attempts = value
                    .as_int()
                    .ok_or_else(|| Error::invalid("Expected a number"))?;
                Ok(())
            }
            "entered" => time_slot(&mut self.entered, value),
            "activity" => time_slot(&mut self.activity, value),
            "password" => str_slot(&mut self.password, value),
            "recover_password" => str_slot(&mut self.recover_password, value),
            "recover_password_set_at" => time_slot(&mut self.recover_password_set_at, value),
            _ => Err(Error::invalid(format!("Unknown property: {column}"))),
        }
    }

    fn keys(&self) -> Vec<(&'static str, Param)> {
        vec![("ident", Param::text(&self.ident))]
    }
}

fn username_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9._-]{2,63}$").ok())
        .as_ref()
}

/// Lowercases and validates a user handle.
///
/// # Errors
/// `InvalidInput` when the handle has the wrong shape.
pub fn normalize_username(username: &str) -> Result<String> {
    let name = username.trim().to_lowercase();
    if username_pattern().is_some_and(|re| re.is_match(&name)) {
        Ok(name)
    } else {
        Err(Error::invalid(
            "Username must start with a letter, be at least 3 characters and only contain a-z 0-9 . _ -",
        ))
    }
}

impl Principal {
    #[must_use]
    pub fn username(&self) -> &str {
        &self.ident
    }

    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.descr
    }

    #[must_use]
    pub fn can_be_sysadmin(&self) -> bool {
        self.sysadmin
    }

    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Elevation only sticks for principals that may elevate.
    pub fn set_elevated(&mut self, elevated: bool) {
        self.elevated = elevated && self.sysadmin;
    }

    /// # Errors
    /// `PasswordMismatch` for any failure.
    pub fn verify_password(&self, password: &str) -> Result<()> {
        password::verify(password, &self.password)
    }

    /// Loads `username`; the elevation starts out as the stored may-elevate bit.
    ///
    /// # Errors
    /// `NotFound` ("No such user") or the store error.
    pub async fn fetch(ctx: &mut Ctx, username: &str) -> Result<Self> {
        let mut user = Self::default();
        let key = Param::text(username.trim().to_lowercase());

        accessor::fetch(ctx, &mut user, None, &[("ident", key)])
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found("No such user"),
                other => other,
            })?;

        user.elevated = user.sysadmin;
        Ok(user)
    }

    /// Users whose handle or full name matches `search` (`%` wildcards allowed).
    ///
    /// # Errors
    /// The store error.
    pub async fn list(ctx: &mut Ctx, search: &str) -> Result<Vec<Self>> {
        let pattern = if search.is_empty() {
            "%".to_string()
        } else if search.contains('%') {
            search.to_string()
        } else {
            format!("%{search}%")
        };

        let query = Fetch {
            andor: AndOr::Or,
            wheres: vec![
                Where::new("ident", Op::ILike, pattern.as_str()),
                Where::new("descr", Op::ILike, pattern.as_str()),
            ],
            order: Some("ORDER BY ident".to_string()),
            ..Fetch::default()
        };
        accessor::fetch_many(ctx, &query).await
    }

    /// Creates a principal and returns it with its initial recovery token.
    ///
    /// # Errors
    /// `InvalidInput` for a bad handle, `Conflict` when it exists already.
    pub async fn create(ctx: &mut Ctx, username: &str, email: &str) -> Result<(Self, String)> {
        let ident = normalize_username(username)?;
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(Error::invalid("Invalid email address"));
        }

        let token = password::random_token(20);
        let uuid = uuid::Uuid::new_v4().to_string();

        ctx.tx_begin().await?;
        let result = async {
            ctx.exec(
                "Created user $1",
                Some(1),
                "INSERT INTO member (ident, uuid, descr, recover_password, recover_password_set_at) \
                 VALUES ($1, $2::UUID, $1, $3, NOW())",
                &[
                    Param::text(&ident),
                    Param::text(&uuid),
                    Param::text(password::sha256_hex(&token)),
                ],
            )
            .await?;
            ctx.exec(
                "Added email $2 to user $1",
                Some(1),
                "INSERT INTO member_email (member, email) VALUES ($1, $2)",
                &[Param::text(&ident), Param::text(&email)],
            )
            .await
        }
        .await;

        match result {
            Ok(_) => ctx.tx_commit().await?,
            Err(err) => {
                ctx.tx_rollback().await;
                if err.kind() == crate::error::ErrorKind::Conflict {
                    return Err(Error::conflict("User or email address already exists"));
                }
                return Err(err);
            }
        }

        info!("Created user {ident}");
        let user = Self::fetch(ctx, &ident).await?;
        Ok((user, token))
    }

    /// # Errors
    /// `NotFound` when the row vanished, or the store error.
    pub async fn delete(&self, ctx: &mut Ctx) -> Result<()> {
        ctx.exec(
            "Deleted user $1",
            Some(1),
            "DELETE FROM member WHERE ident = $1",
            &[Param::text(&self.ident)],
        )
        .await
        .map(|_| ())
    }

    /// Replaces the password after length and policy checks. Also resets the
    /// failed-login counter and drops a pending recovery token.
    ///
    /// # Errors
    /// `InvalidInput` describing the violated rules, or the store error.
    pub async fn set_password(&mut self, ctx: &mut Ctx, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::invalid("No password was provided"));
        }

        if new_password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(Error::invalid(format!(
                "Please provide a password longer than {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        let system = ctx.core().system().get();
        if system.pw_enforce {
            let problems =
                password::check_rules(new_password, &system.pw_rules(), ctx.core().weak_dict());
            if !problems.is_empty() {
                return Err(Error::invalid(format!(
                    "Password Problems encountered: {}",
                    problems.join(", ")
                )));
            }
        }

        let hashed = password::hash(new_password)?;

        let local = !ctx.in_tx();
        if local {
            ctx.tx_begin().await?;
        }

        let result = self.store_password(ctx, &hashed).await;

        if local {
            match &result {
                Ok(()) => ctx.tx_commit().await?,
                Err(_) => ctx.tx_rollback().await,
            }
        }

        result
    }

    async fn store_password(&mut self, ctx: &mut Ctx, hashed: &str) -> Result<()> {
        accessor::set_field(ctx, self, "password", hashed, false).await?;

        ctx.exec(
            "Reset login attempts of $1 after password change",
            Some(1),
            "UPDATE member SET login_attempts = 0 WHERE ident = $1",
            &[Param::text(&self.ident)],
        )
        .await?;
        self.login_attempts = 0;

        if !self.recover_password.is_empty() {
            accessor::set_field(ctx, self, "recover_password", "", false).await?;
        }

        Ok(())
    }

    /// Sets a new password using a recovery token.
    ///
    /// # Errors
    /// The neutral "Invalid recovery details" for a wrong user, token or an
    /// expired token, otherwise the [`Principal::set_password`] errors.
    pub async fn recover(
        ctx: &mut Ctx,
        username: &str,
        token: &str,
        new_password: &str,
    ) -> Result<()> {
        let neutral = || Error::not_found("Invalid recovery details");

        let mut user = Self::fetch(ctx, username).await.map_err(|err| {
            info!("Password recovery for {username}: {err}");
            neutral()
        })?;

        if user.recover_password.is_empty()
            || token.is_empty()
            || password::sha256_hex(token) != user.recover_password
        {
            info!("Password recovery for {username}: token mismatch");
            return Err(neutral());
        }

        if Utc::now() - user.recover_password_set_at > Duration::days(RECOVERY_VALIDITY_DAYS) {
            info!("Password recovery for {username}: token expired");
            return Err(neutral());
        }

        user.set_password(ctx, new_password).await
    }

    /// Mints a fresh recovery token, returned in clear text.
    ///
    /// # Errors
    /// The store error.
    pub async fn new_recovery_token(&mut self, ctx: &mut Ctx) -> Result<String> {
        let token = password::random_token(20);
        ctx.exec(
            "New recovery token for $1",
            Some(1),
            "UPDATE member SET recover_password = $2, recover_password_set_at = NOW() WHERE ident = $1",
            &[Param::text(&self.ident), Param::text(password::sha256_hex(&token))],
        )
        .await?;
        self.recover_password = password::sha256_hex(&token);
        self.recover_password_set_at = Utc::now();
        Ok(token)
    }

    /// Authenticates `username` with a password and second factor.
    ///
    /// The source address is counted first; a success clears both the
    /// address counter and the account's failed-login counter, a failure
    /// bumps the latter.
    ///
    /// # Errors
    /// `RateLimited` when either counter tripped, `InvalidInput` without a
    /// password, `NotFound` for unknown users, or the credential failure.
    pub async fn check_auth(
        ctx: &mut Ctx,
        username: &str,
        password: &str,
        twofactor: &str,
    ) -> Result<Self> {
        let core = ctx.core_arc();

        if let Some(ip) = ctx.client_ip() {
            if core.iptrk().count(ip).await? {
                return Err(Error::RateLimited(format!(
                    "Too many login attempts from IP: {ip}"
                )));
            }
        }

        if password.is_empty() {
            return Err(Error::invalid("No password provided"));
        }

        let user = Self::fetch(ctx, username).await?;

        if user.login_attempts > i64::from(core.config().login_attempts_max()) {
            return Err(Error::RateLimited(
                "Too many login attempts for this account".to_string(),
            ));
        }

        let verdict = match user.verify_password(password) {
            Ok(()) => crate::otp::verify(ctx, &user, twofactor, None).await,
            Err(err) => Err(err),
        };

        match verdict {
            Ok(()) => {
                ctx.exec(
                    "Login of $1",
                    Some(1),
                    "UPDATE member SET login_attempts = 0, activity = NOW() WHERE ident = $1",
                    &[Param::text(&user.ident)],
                )
                .await?;

                if let Some(ip) = ctx.client_ip() {
                    if let Err(err) = core.iptrk().reset(Some(ip)).await {
                        warn!("Could not reset IPtrk for {ip}: {err}");
                    }
                }

                Ok(user)
            }
            Err(err) => {
                if let Err(inc) = ctx
                    .increase(
                        "Login attempt failed for user $1",
                        "member",
                        &user.ident,
                        "login_attempts",
                    )
                    .await
                {
                    error!("Could not increase login attempts for {}: {inc}", user.ident);
                }
                Err(err)
            }
        }
    }

    /// Whether `viewer` and `target` share a group in which either side is
    /// visible or an admin.
    ///
    /// # Errors
    /// `Unauthorized` ("No shared groups") or the store error.
    pub async fn shared_groups(ctx: &mut Ctx, viewer: &str, target: &str) -> Result<()> {
        let row = ctx
            .query_opt(
                "SELECT 1 FROM member_trustgroup a \
                 JOIN member_trustgroup b ON a.trustgroup = b.trustgroup \
                 JOIN member_state sa ON a.state = sa.ident \
                 JOIN member_state sb ON b.state = sb.ident \
                 WHERE a.member = $1 AND b.member = $2 \
                 AND (sa.can_see OR sb.can_see OR a.admin OR b.admin) \
                 LIMIT 1",
                &[Param::text(viewer), Param::text(target)],
            )
            .await?;

        if row.is_some() {
            Ok(())
        } else {
            Err(Error::unauthorized("No shared groups"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_shapes() {
        assert_eq!(normalize_username(" Alice ").unwrap(), "alice");
        assert_eq!(normalize_username("bob.smith-2").unwrap(), "bob.smith-2");
        assert!(normalize_username("al").is_err());
        assert!(normalize_username("1alice").is_err());
        assert!(normalize_username("al ice").is_err());
    }

    #[test]
    fn elevation_needs_capability() {
        let mut user = Principal::default();
        user.set_elevated(true);
        assert!(!user.is_elevated());

        user.sysadmin = true;
        user.set_elevated(true);
        assert!(user.is_elevated());
        user.set_elevated(false);
        assert!(!user.is_elevated());
    }

    #[test]
    fn slots_follow_descriptors() {
        let mut user = Principal::default();
        for field in user.fields() {
            assert!(user.get(field.column).is_some(), "{}", field.column);
        }

        user.put("name_first", Value::Str("Alice".into())).unwrap();
        assert_eq!(user.name_first.as_deref(), Some("Alice"));
        user.put("name_first", Value::Null).unwrap();
        assert_eq!(user.name_first, None);
        user.put("login_attempts", Value::Int(3)).unwrap();
        assert_eq!(user.login_attempts, 3);
        assert!(user.put("furlough", Value::Str("yes".into())).is_err());
        assert!(user.put("nonsense", Value::Null).is_err());
    }

    #[test]
    fn password_is_hidden() {
        let user = Principal::default();
        let hidden: Vec<_> = user
            .fields()
            .iter()
            .filter(|f| f.hidden)
            .map(|f| f.column)
            .collect();
        assert_eq!(
            hidden,
            vec!["password", "recover_password", "recover_password_set_at"]
        );
    }

    #[test]
    fn verify_against_stored_hash() {
        let mut user = Principal::default();
        user.password = password::hash("correct horse").unwrap();
        assert!(user.verify_password("correct horse").is_ok());
        assert!(matches!(
            user.verify_password("wrong horse"),
            Err(Error::PasswordMismatch)
        ));
    }
}

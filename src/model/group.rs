use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::info;

use crate::{
    accessor::{self, Entity, FieldDesc, Fetch, Kind, Value},
    context::Ctx,
    db::Param,
    error::{is_unique_violation, Error, Result},
    perms::Perm,
};

static FIELDS: [FieldDesc; 7] = [
    FieldDesc::new("ident", Kind::Str)
        .label("Group")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::NOBODY),
    FieldDesc::new("descr", Kind::Str)
        .label("Description")
        .hint("Description of the group")
        .range(0, 512)
        .get(Perm::GROUP_MEMBER)
        .set(Perm::GROUP_ADMIN),
    FieldDesc::new("pgp_required", Kind::Bool)
        .label("PGP Required")
        .hint("Members must have a PGP key")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::GROUP_ADMIN),
    FieldDesc::new("has_wiki", Kind::Bool)
        .label("Wiki")
        .hint("Group has a wiki")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::GROUP_ADMIN),
    FieldDesc::new("has_file", Kind::Bool)
        .label("Files")
        .hint("Group has a file store")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::GROUP_ADMIN),
    FieldDesc::new("has_calendar", Kind::Bool)
        .label("Calendar")
        .hint("Group has a calendar")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::GROUP_ADMIN),
    FieldDesc::new("entered", Kind::Time)
        .label("Entered")
        .get(Perm::GROUP_MEMBER)
        .set(Perm::NOBODY),
];

/// Membership states, see `member_state`.
pub const STATE_NOMINATED: &str = "nominated";
pub const STATE_APPROVED: &str = "approved";
pub const STATE_BLOCKED: &str = "blocked";

/// A trust group as stored in `trustgroup`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group {
    pub ident: String,
    pub descr: String,
    pub pgp_required: bool,
    pub has_wiki: bool,
    pub has_file: bool,
    pub has_calendar: bool,
    pub entered: DateTime<Utc>,
}

/// One principal's relation to one group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Membership {
    pub state: String,
    pub admin: bool,
    pub can_login: bool,
    pub can_see: bool,
    pub can_send: bool,
    pub can_recv: bool,
    pub blocked: bool,
    pub hidden: bool,
}

/// The selected group together with the caller's membership in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSelection {
    pub group: Group,
    pub membership: Option<Membership>,
}

/// A row of the member listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRow {
    pub member: String,
    pub descr: String,
    pub state: String,
    pub admin: bool,
}

/// Whether an admin may move a membership from `from` to `to`.
#[must_use]
pub fn can_transition(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        (STATE_NOMINATED, STATE_APPROVED | STATE_BLOCKED)
            | (STATE_APPROVED, STATE_BLOCKED)
            | (STATE_BLOCKED, STATE_APPROVED)
    )
}

impl Entity for Group {
    fn table(&self) -> &'static str {
        "trustgroup"
    }

    fn fields(&self) -> &'static [FieldDesc] {
        &FIELDS
    }

    fn get(&self, column: &str) -> Option<Value> {
        Some(match column {
            "ident" => Value::Str(self.ident.clone()),
            "descr" => Value::Str(self.descr.clone()),
            "pgp_required" => Value::Bool(self.pgp_required),
            "has_wiki" => Value::Bool(self.has_wiki),
            "has_file" => Value::Bool(self.has_file),
            "has_calendar" => Value::Bool(self.has_calendar),
            "entered" => Value::Time(self.entered),
            _ => return None,
        })
    }

    fn put(&mut self, column: &str, value: Value) -> Result<()> {
        let flag = |value: &Value| {
            value
                .as_bool()
                .ok_or_else(|| Error::invalid(format!("Expected a boolean for {column}")))
        };

        match (column, &value) {
            ("ident", Value::Str(s)) => self.ident.clone_from(s),
            ("descr", Value::Str(s)) => self.descr.clone_from(s),
            ("pgp_required", _) => self.pgp_required = flag(&value)?,
            ("has_wiki", _) => self.has_wiki = flag(&value)?,
            ("has_file", _) => self.has_file = flag(&value)?,
            ("has_calendar", _) => self.has_calendar = flag(&value)?,
            ("entered", Value::Time(t)) => self.entered = *t,
            _ => return Err(Error::invalid(format!("Unknown property: {column}"))),
        }
        Ok(())
    }

    fn keys(&self) -> Vec<(&'static str, Param)> {
        vec![("ident", Param::text(&self.ident))]
    }
}

impl Group {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ident
    }

    /// # Errors
    /// `NotFound` ("No such group") or the store error.
    pub async fn fetch(ctx: &mut Ctx, name: &str) -> Result<Self> {
        let mut group = Self::default();
        accessor::fetch(ctx, &mut group, None, &[("ident", Param::text(name.trim().to_lowercase()))])
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found("No such group"),
                other => other,
            })?;
        Ok(group)
    }

    /// Every group, for sysadmins.
    ///
    /// # Errors
    /// The store error.
    pub async fn list_all(ctx: &mut Ctx) -> Result<Vec<Self>> {
        let query = Fetch {
            order: Some("ORDER BY ident".to_string()),
            ..Fetch::default()
        };
        accessor::fetch_many(ctx, &query).await
    }

    /// Groups `username` belongs to, with the membership state.
    ///
    /// # Errors
    /// The store error.
    pub async fn list_for(ctx: &mut Ctx, username: &str) -> Result<Vec<(String, String, bool)>> {
        let rows = ctx
            .query_all(
                "SELECT trustgroup, state, admin FROM member_trustgroup \
                 WHERE member = $1 ORDER BY trustgroup",
                &[Param::text(username)],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, String, bool)> {
                Ok((
                    row.try_get("trustgroup")?,
                    row.try_get("state")?,
                    row.try_get("admin")?,
                ))
            })
            .collect()
    }

    /// # Errors
    /// `Conflict` when the group exists, or the store error.
    pub async fn create(ctx: &mut Ctx, name: &str, descr: &str) -> Result<Self> {
        let ident = super::user::normalize_username(name)
            .map_err(|_| Error::invalid("Group names use the same rules as usernames"))?;

        ctx.exec(
            "Created group $1",
            Some(1),
            "INSERT INTO trustgroup (ident, descr) VALUES ($1, $2)",
            &[Param::text(&ident), Param::text(descr)],
        )
        .await
        .map_err(|err| match err {
            Error::Database(ref db) if is_unique_violation(db) => {
                Error::conflict("Group already exists")
            }
            other => other,
        })?;

        info!("Created group {ident}");
        Self::fetch(ctx, &ident).await
    }

    /// Membership of `username`, joined with its state's capabilities.
    ///
    /// # Errors
    /// The store error.
    pub async fn membership(&self, ctx: &mut Ctx, username: &str) -> Result<Option<Membership>> {
        let row = ctx
            .query_opt(
                "SELECT mt.state, mt.admin, ms.can_login, ms.can_see, ms.can_send, \
                 ms.can_recv, ms.blocked, ms.hidden \
                 FROM member_trustgroup mt \
                 JOIN trustgroup grp ON mt.trustgroup = grp.ident \
                 JOIN member_state ms ON mt.state = ms.ident \
                 WHERE mt.member = $1 AND mt.trustgroup = $2",
                &[Param::text(username), Param::text(&self.ident)],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Membership {
            state: row.try_get("state")?,
            admin: row.try_get("admin")?,
            can_login: row.try_get("can_login")?,
            can_see: row.try_get("can_see")?,
            can_send: row.try_get("can_send")?,
            can_recv: row.try_get("can_recv")?,
            blocked: row.try_get("blocked")?,
            hidden: row.try_get("hidden")?,
        }))
    }

    /// # Errors
    /// The store error.
    pub async fn members(&self, ctx: &mut Ctx) -> Result<Vec<MemberRow>> {
        let rows = ctx
            .query_all(
                "SELECT mt.member, m.descr, mt.state, mt.admin \
                 FROM member_trustgroup mt \
                 JOIN member m ON m.ident = mt.member \
                 WHERE mt.trustgroup = $1 \
                 ORDER BY mt.member",
                &[Param::text(&self.ident)],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<MemberRow> {
                Ok(MemberRow {
                    member: row.try_get("member")?,
                    descr: row.try_get("descr")?,
                    state: row.try_get("state")?,
                    admin: row.try_get("admin")?,
                })
            })
            .collect()
    }

    /// Adds `username` in the nominated state.
    ///
    /// # Errors
    /// `Conflict` when already a member, or the store error.
    pub async fn nominate(&self, ctx: &mut Ctx, username: &str) -> Result<()> {
        ctx.exec(
            "Nominated $1 for group $2",
            Some(1),
            "INSERT INTO member_trustgroup (member, trustgroup, state) VALUES ($1, $2, $3)",
            &[
                Param::text(username),
                Param::text(&self.ident),
                Param::text(STATE_NOMINATED),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|err| match err {
            Error::Database(ref db) if is_unique_violation(db) => {
                Error::conflict("User is already a member of this group")
            }
            other => other,
        })
    }

    /// Moves a membership along the allowed transitions.
    ///
    /// # Errors
    /// `NotFound` for non-members, `InvalidInput` for a disallowed move.
    pub async fn set_state(&self, ctx: &mut Ctx, username: &str, state: &str) -> Result<()> {
        let current = self
            .membership(ctx, username)
            .await?
            .ok_or_else(|| Error::not_found("User is not a member of this group"))?;

        let state = state.to_lowercase();
        if !can_transition(&current.state, &state) {
            return Err(Error::invalid(format!(
                "Can't change membership from {} to {state}",
                current.state
            )));
        }

        ctx.exec(
            "Membership of $1 in $2 changed to $3",
            Some(1),
            "UPDATE member_trustgroup SET state = $3 WHERE member = $1 AND trustgroup = $2",
            &[Param::text(username), Param::text(&self.ident), Param::text(state)],
        )
        .await
        .map(|_| ())
    }

    /// # Errors
    /// `NotFound` for non-members, or the store error.
    pub async fn set_admin(&self, ctx: &mut Ctx, username: &str, admin: bool) -> Result<()> {
        ctx.exec(
            "Group admin flag of $1 in $2 set to $3",
            Some(1),
            "UPDATE member_trustgroup SET admin = $3 WHERE member = $1 AND trustgroup = $2",
            &[
                Param::text(username),
                Param::text(&self.ident),
                Param::Bool(admin),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|err| match err {
            Error::Database(sqlx::Error::RowNotFound) => {
                Error::not_found("User is not a member of this group")
            }
            other => other,
        })
    }

    /// # Errors
    /// `NotFound` for non-members, or the store error.
    pub async fn leave(&self, ctx: &mut Ctx, username: &str) -> Result<()> {
        ctx.exec(
            "User $1 left group $2",
            Some(1),
            "DELETE FROM member_trustgroup WHERE member = $1 AND trustgroup = $2",
            &[Param::text(username), Param::text(&self.ident)],
        )
        .await
        .map(|_| ())
        .map_err(|err| match err {
            Error::Database(sqlx::Error::RowNotFound) => {
                Error::not_found("User is not a member of this group")
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        assert!(can_transition("nominated", "approved"));
        assert!(can_transition("nominated", "blocked"));
        assert!(can_transition("approved", "blocked"));
        assert!(can_transition("blocked", "approved"));
        assert!(!can_transition("approved", "nominated"));
        assert!(!can_transition("blocked", "nominated"));
        assert!(!can_transition("approved", "approved"));
    }

    #[test]
    fn feature_flags_by_column() {
        let mut group = Group::default();
        group.put("has_wiki", Value::Bool(true)).unwrap();
        assert!(group.has_wiki);
        assert_eq!(group.get("has_wiki"), Some(Value::Bool(true)));
        assert!(group.put("has_wiki", Value::Int(1)).is_err());
        assert!(group.put("unknown", Value::Bool(true)).is_err());
        for field in group.fields() {
            assert!(group.get(field.column).is_some(), "{}", field.column);
        }
    }
}

//! Second factors: HOTP, TOTP and single-use codes.
//!
//! HOTP/TOTP secrets are stored base32 encoded, single-use codes only as
//! their SHA-256 hex digest.

mod code;

pub use code::{decode_secret, find_counter, hotp, new_secret, otpauth_url, parse_code, totp_step};

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::{debug, info};

use crate::{
    context::Ctx,
    db::Param,
    error::{Error, Result, TwoFactorError},
    model::Principal,
    password::{random_token, sha256_hex},
};

/// Single-use codes minted per `add`.
pub const SOTP_COUNT: usize = 5;
const SOTP_LEN: usize = 10;

/// Stored factor kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactorKind {
    Hotp,
    Totp,
    Sotp,
}

impl FactorKind {
    /// # Errors
    /// `InvalidInput` for anything but HOTP, TOTP or SOTP.
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.to_uppercase().as_str() {
            "HOTP" => Ok(Self::Hotp),
            "TOTP" => Ok(Self::Totp),
            "SOTP" => Ok(Self::Sotp),
            _ => Err(Error::invalid(format!("Unknown 2FA Token Type: {kind}"))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hotp => "HOTP",
            Self::Totp => "TOTP",
            Self::Sotp => "SOTP",
        }
    }
}

/// A registered factor, never carrying its secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Factor {
    pub id: i64,
    pub member: String,
    pub kind: String,
    pub descr: String,
    pub entered: DateTime<Utc>,
    pub active: bool,
    pub counter: i64,
}

impl Factor {
    fn from_row(row: &PgRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            member: row.try_get("member")?,
            kind: row.try_get("type")?,
            descr: row.try_get("descr")?,
            entered: row.try_get("entered")?,
            active: row.try_get("active")?,
            counter: row.try_get("counter")?,
        })
    }
}

/// What `add` hands back to the enrolling user, shown once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enrollment {
    /// HOTP/TOTP: stored inactive until enabled with a valid code.
    Otp {
        id: i64,
        name: String,
        kind: FactorKind,
        url: String,
    },
    /// SOTP: `(name, code)` pairs, active immediately.
    Codes(Vec<(String, String)>),
}

const FACTOR_COLUMNS: &str = "id, member, type, descr, entered, active, counter";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn counter_u64(counter: i64) -> u64 {
    u64::try_from(counter).unwrap_or(0)
}

/// Checks `code` against the principal's active factors, or only against
/// factor `id` when given.
///
/// A matched HOTP moves its counter past the used one, a matched single-use
/// code is deleted.
///
/// # Errors
/// A [`TwoFactorError`] describing the failure, or the store error.
pub async fn verify(ctx: &mut Ctx, user: &Principal, code: &str, id: Option<i64>) -> Result<()> {
    if !ctx.core().config().check_two_factor() {
        return Ok(());
    }

    let rows = match id {
        Some(id) => {
            ctx.query_all(
                "SELECT id, type, counter, key FROM second_factors WHERE member = $1 AND id = $2",
                &[Param::text(user.username()), Param::Int(id)],
            )
            .await?
        }
        None => {
            ctx.query_all(
                "SELECT id, type, counter, key FROM second_factors WHERE member = $1 AND active = TRUE",
                &[Param::text(user.username())],
            )
            .await?
        }
    };

    if rows.is_empty() {
        if !code.is_empty() {
            return Err(TwoFactorError::Invalid.into());
        }
        if ctx.core().system().get().require2fa {
            return Err(TwoFactorError::RequiredButAbsent.into());
        }
        return Ok(());
    }

    if code.trim().is_empty() {
        return Err(TwoFactorError::NotProvided.into());
    }

    let numeric = parse_code(code);

    for row in &rows {
        let factor_id: i64 = row.try_get("id")?;
        let kind: String = row.try_get("type")?;
        let counter: i64 = row.try_get("counter")?;
        let key: String = row.try_get("key")?;

        match kind.as_str() {
            "HOTP" => {
                let Some(numeric) = numeric else { continue };
                let counter = counter_u64(counter);
                let secret = decode_secret(&key)?;
                let start = counter.saturating_sub(1);
                if let Some(matched) = find_counter(&secret, numeric, start, counter + 3)? {
                    let next = i64::try_from(matched + 1).unwrap_or(i64::MAX);
                    ctx.exec(
                        "Increased HOTP counter for 2FA $1",
                        Some(1),
                        "UPDATE second_factors SET counter = GREATEST(counter, $2) WHERE id = $1",
                        &[Param::Int(factor_id), Param::Int(next)],
                    )
                    .await?;
                    return Ok(());
                }
            }
            "TOTP" => {
                let Some(numeric) = numeric else { continue };
                let secret = decode_secret(&key)?;
                let step = totp_step(unix_now());
                if find_counter(&secret, numeric, step.saturating_sub(2), step + 3)?
                    .is_some()
                {
                    return Ok(());
                }
            }
            "SOTP" => {
                if sha256_hex(code.trim()) == key {
                    ctx.exec(
                        "Used SOTP code $1 (SOTP code removed)",
                        Some(1),
                        "DELETE FROM second_factors WHERE id = $1",
                        &[Param::Int(factor_id)],
                    )
                    .await?;
                    return Ok(());
                }
            }
            other => {
                debug!("2FA {factor_id} has unknown type {other}");
                return Err(TwoFactorError::UnknownKind.into());
            }
        }
    }

    Err(TwoFactorError::Invalid.into())
}

/// Factors of `username`, oldest first.
///
/// # Errors
/// The store error.
pub async fn list(ctx: &mut Ctx, username: &str) -> Result<Vec<Factor>> {
    let sql = format!(
        "SELECT {FACTOR_COLUMNS} FROM second_factors WHERE member = $1 ORDER BY entered, id"
    );
    let rows = ctx.query_all(&sql, &[Param::text(username)]).await?;
    rows.iter().map(Factor::from_row).collect()
}

/// Factor `id` owned by `username`.
///
/// # Errors
/// `NotFound` ("No such token") or the store error.
pub async fn fetch(ctx: &mut Ctx, username: &str, id: i64) -> Result<Factor> {
    let sql = format!("SELECT {FACTOR_COLUMNS} FROM second_factors WHERE member = $1 AND id = $2");
    let row = ctx
        .query_opt(&sql, &[Param::text(username), Param::Int(id)])
        .await?
        .ok_or_else(|| Error::not_found("No such token"))?;
    Factor::from_row(&row)
}

/// Known factor types with their description.
///
/// # Errors
/// The store error.
pub async fn types(ctx: &mut Ctx) -> Result<Vec<(String, String)>> {
    let rows = ctx
        .query_all("SELECT type, descr FROM second_factor_types ORDER BY type", &[])
        .await?;
    rows.iter()
        .map(|row| -> Result<(String, String)> { Ok((row.try_get("type")?, row.try_get("descr")?)) })
        .collect()
}

/// Registers a new factor for `user`.
///
/// # Errors
/// `InvalidInput` for an unknown kind or empty label, or the store error.
pub async fn add(ctx: &mut Ctx, user: &Principal, kind: &str, label: &str) -> Result<Enrollment> {
    let kind = FactorKind::parse(kind)?;
    let label = label.trim();
    if label.is_empty() {
        return Err(Error::invalid("A description is required"));
    }

    if kind == FactorKind::Sotp {
        return add_codes(ctx, user, label).await;
    }

    let secret = new_secret();
    let row = insert(ctx, user, kind, label, &secret, false).await?;
    let issuer = ctx.core().config().app_name().to_string();

    info!("Added {} 2FA token {row} for {}", kind.as_str(), user.username());

    Ok(Enrollment::Otp {
        id: row,
        name: label.to_string(),
        kind,
        url: otpauth_url(kind.as_str(), &issuer, user.username(), label, &secret),
    })
}

async fn add_codes(ctx: &mut Ctx, user: &Principal, label: &str) -> Result<Enrollment> {
    let local = !ctx.in_tx();
    if local {
        ctx.tx_begin().await?;
    }

    let mut codes = Vec::with_capacity(SOTP_COUNT);
    let mut result = Ok(());
    for n in (1..=SOTP_COUNT).rev() {
        let name = format!("{label}-{n}");
        let code = random_token(SOTP_LEN);
        if let Err(err) = insert(ctx, user, FactorKind::Sotp, &name, &sha256_hex(&code), true).await {
            result = Err(err);
            break;
        }
        codes.push((name, code));
    }

    if local {
        match result {
            Ok(()) => ctx.tx_commit().await?,
            Err(_) => ctx.tx_rollback().await,
        }
    }

    result.map(|()| Enrollment::Codes(codes))
}

async fn insert(
    ctx: &mut Ctx,
    user: &Principal,
    kind: FactorKind,
    descr: &str,
    key: &str,
    active: bool,
) -> Result<i64> {
    let row = ctx
        .query_opt(
            "SELECT nextval(pg_get_serial_sequence('second_factors', 'id')) AS id",
            &[],
        )
        .await?
        .ok_or_else(|| Error::internal("No 2FA token id allocated"))?;
    let id: i64 = row.try_get("id")?;

    ctx.exec(
        "Add 2FA Token $3: $4",
        Some(1),
        "INSERT INTO second_factors (id, member, type, descr, key, active) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        &[
            Param::Int(id),
            Param::text(user.username()),
            Param::text(kind.as_str()),
            Param::text(descr),
            Param::text(key),
            Param::Bool(active),
        ],
    )
    .await?;

    Ok(id)
}

/// Enables or disables a factor. Enabling requires a valid code for that
/// very factor.
///
/// # Errors
/// `NotFound` for foreign or missing factors, `Conflict` when already in
/// the requested state, `InvalidInput` for a wrong code.
pub async fn set_active(
    ctx: &mut Ctx,
    user: &Principal,
    id: i64,
    active: bool,
    code: &str,
) -> Result<()> {
    let factor = fetch(ctx, user.username(), id).await?;
    let state = if active { "active" } else { "inactive" };

    if factor.active == active {
        return Err(Error::conflict(format!("Token {id} already in {state} state")));
    }

    if active && verify(ctx, user, code, Some(id)).await.is_err() {
        return Err(Error::invalid("Token value not correct"));
    }

    ctx.exec(
        &format!("Change 2FA Token $3 to {state}"),
        Some(1),
        "UPDATE second_factors SET active = $1 WHERE member = $2 AND id = $3",
        &[
            Param::Bool(active),
            Param::text(user.username()),
            Param::Int(id),
        ],
    )
    .await
    .map(|_| ())
}

/// Removes an inactive (or single-use) factor.
///
/// # Errors
/// `InvalidInput` when nothing matched, otherwise the store error.
pub async fn remove(ctx: &mut Ctx, user: &Principal, id: i64) -> Result<()> {
    ctx.exec(
        "Remove 2FA Token $2",
        Some(1),
        "DELETE FROM second_factors WHERE member = $1 AND id = $2 AND (active = FALSE OR type = 'SOTP')",
        &[Param::text(user.username()), Param::Int(id)],
    )
    .await
    .map(|_| ())
    .map_err(|err| match err {
        Error::Database(sqlx::Error::RowNotFound) => {
            debug!("2FA remove {id}: no removable token");
            Error::invalid("Could not remove 2FA token")
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(FactorKind::parse("totp").unwrap(), FactorKind::Totp);
        assert_eq!(FactorKind::parse("SOTP").unwrap().as_str(), "SOTP");
        assert_eq!(
            FactorKind::parse("YUBI").unwrap_err().to_string(),
            "Unknown 2FA Token Type: YUBI"
        );
    }

    #[tokio::test]
    async fn remove_keeps_store_failures() {
        let mut ctx = Ctx::new(crate::core::testing::offline_core().await);
        let user = Principal {
            ident: "bob".to_string(),
            ..Principal::default()
        };

        let err = remove(&mut ctx, &user, 1).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)), "{err:?}");
        assert_ne!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}

//! Data-layer helpers.
//!
//! Every mutation goes through [`Ctx::exec`]: it joins the caller's
//! transaction when one is attached to the context, or opens a local one,
//! writes the audit row next to the change and commits or rolls back as a
//! unit. A failed audit rolls back the mutation.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::Query,
    Postgres,
};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::{
    context::Ctx,
    error::{Error, Result},
};

const AUDIT_FAILURE: &str = "Auditing error, please check the logs";

/// A bound statement parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Param {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl Param {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    fn bind_to<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Text(value) => query.bind(value.clone()),
            Self::OptText(value) => query.bind(value.clone()),
            Self::Int(value) => query.bind(*value),
            Self::Bool(value) => query.bind(*value),
            Self::Time(value) => query.bind(*value),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(value) | Self::OptText(Some(value)) => f.write_str(value),
            Self::OptText(None) => Ok(()),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => f.write_str(if *value { "yes" } else { "no" }),
            Self::Time(value) => write!(f, "{}", value.to_rfc3339()),
        }
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Binds `params` in order onto `query`.
pub fn bind<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Param],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = param.bind_to(query);
    }
    query
}

/// Quotes an identifier for the places where placeholders cannot go.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// First keyword of a statement, used as the span's `db.operation`.
#[must_use]
pub fn operation(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("QUERY")
}

/// Makes user supplied text safe to embed in an audit text.
#[must_use]
pub fn audit_escape(text: &str) -> String {
    text.replace('$', "$$")
}

/// Replaces `$N` references in an audit text with the matching parameter,
/// `$$` is a literal dollar.
///
/// # Errors
/// Returns `Internal` when a reference points past the parameter list.
pub fn format_audit(text: &str, params: &[Param]) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'$') {
            chars.next();
            out.push('$');
            continue;
        }

        if c != '$' || !chars.peek().is_some_and(char::is_ascii_digit) {
            out.push(c);
            continue;
        }

        let mut num = String::new();
        while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            num.push(d);
            chars.next();
        }

        let index: usize = num
            .parse()
            .map_err(|_| Error::internal(format!("Invalid argument reference ${num}")))?;
        let param = index
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .ok_or_else(|| Error::internal(format!("Argument {index} not provided")))?;
        out.push_str(&param.to_string());
    }

    Ok(out)
}

impl Ctx {
    /// Opens a transaction and attaches it to the context.
    ///
    /// # Errors
    /// Returns `Conflict` when one is already attached, or the driver error.
    pub async fn tx_begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::conflict("Transaction already open"));
        }

        let tx = self.core().pool().begin().await.map_err(|err| {
            error!("TxBegin() failed: {err}");
            Error::from(err)
        })?;
        self.tx = Some(tx);
        Ok(())
    }

    /// # Errors
    /// Returns `Internal` when no transaction is attached, or the commit error.
    pub async fn tx_commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::internal("Transaction was not open"))?;
        tx.commit().await.map_err(|err| {
            debug!("TxCommit() {err}");
            Error::from(err)
        })
    }

    pub async fn tx_rollback(&mut self) {
        match self.tx.take() {
            Some(tx) => {
                if let Err(err) = tx.rollback().await {
                    error!("TxRollback() failed: {err}");
                }
            }
            None => warn!("TxRollback() transaction was not open"),
        }
    }

    #[must_use]
    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    /// Executes a mutation and records `audit` for it in the same transaction.
    ///
    /// `expected` rows: a mismatch is logged, except that expecting one row
    /// and changing none is `RowNotFound`. A transient failure on a local
    /// transaction is retried once.
    ///
    /// # Errors
    /// Store failures, a missing row, or a failed audit insert.
    pub async fn exec(
        &mut self,
        audit: &str,
        expected: Option<u64>,
        sql: &str,
        params: &[Param],
    ) -> Result<u64> {
        if audit.is_empty() {
            return Err(Error::internal("exec() given no audit text"));
        }

        let local = self.tx.is_none();
        let mut retried = false;

        loop {
            if local {
                self.tx_begin().await?;
            }

            match self.exec_in_tx(audit, expected, sql, params).await {
                Ok(changed) => {
                    if local {
                        self.tx_commit().await?;
                    }
                    return Ok(changed);
                }
                Err(err) => {
                    if local {
                        self.tx_rollback().await;
                    }

                    if local && !retried && err.is_transient() {
                        warn!("Retrying after transient failure: {err}");
                        retried = true;
                        continue;
                    }

                    return Err(err);
                }
            }
        }
    }

    /// Increments an integer column of the row identified by `ident`.
    ///
    /// # Errors
    /// See [`Ctx::exec`].
    pub async fn increase(&mut self, audit: &str, table: &str, ident: &str, what: &str) -> Result<()> {
        let audit = if audit.is_empty() {
            format!("Increased {table}.{what}")
        } else {
            audit.to_string()
        };

        let sql = format!(
            "UPDATE {table} SET {what} = {what} + 1 WHERE ident = $1",
            table = quote_ident(table),
            what = quote_ident(what)
        );
        self.exec(&audit, Some(1), &sql, &[Param::text(ident)])
            .await
            .map(|_| ())
    }

    /// Runs a read, inside the attached transaction when there is one.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn query_all(&mut self, sql: &str, params: &[Param]) -> Result<Vec<PgRow>> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = operation(sql));
        let query = bind(sqlx::query(sql), params);
        let pool = self.core().pool().clone();

        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).instrument(span).await?,
            None => query.fetch_all(&pool).instrument(span).await?,
        };

        Ok(rows)
    }

    /// Like [`Ctx::query_all`] for at most one row.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn query_opt(&mut self, sql: &str, params: &[Param]) -> Result<Option<PgRow>> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = operation(sql));
        let query = bind(sqlx::query(sql), params);
        let pool = self.core().pool().clone();

        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).instrument(span).await?,
            None => query.fetch_optional(&pool).instrument(span).await?,
        };

        Ok(row)
    }

    async fn exec_in_tx(
        &mut self,
        audit: &str,
        expected: Option<u64>,
        sql: &str,
        params: &[Param],
    ) -> Result<u64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::internal("Transaction was not open"))?;

        let span = info_span!("db.query", db.system = "postgresql", db.operation = operation(sql));
        let done = bind(sqlx::query(sql), params)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .map_err(|err| {
                error!("exec({sql}) error: {err}");
                Error::from(err)
            })?;

        let changed = done.rows_affected();
        if let Some(expected) = expected {
            if changed != expected {
                if expected == 1 && changed == 0 {
                    return Err(Error::Database(sqlx::Error::RowNotFound));
                }
                warn!("exec({sql}) expected {expected} row(s) changed, but {changed} changed");
            }
        }

        self.audit(audit, params).await?;
        Ok(changed)
    }

    async fn audit(&mut self, text: &str, params: &[Param]) -> Result<()> {
        let what = format_audit(text, params).map_err(|err| {
            error!("Could not format audit string '{text}': {err}");
            Error::internal(AUDIT_FAILURE)
        })?;

        let member = self.user().map(|u| u.username().to_string());
        let username = self.sel_user().map(|u| u.username().to_string());
        let group = self.sel_group().map(|g| g.group.name().to_string());
        let remote = self.remote().to_string();

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::internal("Transaction was not open"))?;

        let sql = "INSERT INTO audit_history (member, what, username, trustgroup, remote) \
                   VALUES ($1, $2, $3, $4, $5)";
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "INSERT");
        sqlx::query(sql)
            .bind(member)
            .bind(&what)
            .bind(username)
            .bind(group)
            .bind(remote)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .map_err(|err| {
                error!("audit insert for '{what}' failed: {err}");
                Error::internal(AUDIT_FAILURE)
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_references_are_substituted() {
        let params = [Param::text("alice"), Param::Int(3), Param::Bool(true)];
        assert_eq!(
            format_audit("User $1 now has $2 tokens, active: $3", &params).unwrap(),
            "User alice now has 3 tokens, active: yes"
        );
        assert_eq!(format_audit("costs $ 5", &params).unwrap(), "costs $ 5");
        let literal = audit_escape("pa$1word");
        assert_eq!(format_audit(&literal, &params).unwrap(), "pa$1word");
    }

    #[test]
    fn audit_reference_out_of_range() {
        assert!(format_audit("$4", &[Param::text("x")]).is_err());
        assert!(format_audit("$0", &[Param::text("x")]).is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("member"), "\"member\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn operation_is_first_keyword() {
        assert_eq!(operation("  UPDATE member SET x = 1"), "UPDATE");
        assert_eq!(operation(""), "QUERY");
    }
}

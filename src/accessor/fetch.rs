use sqlx::{postgres::PgRow, Row};

use super::{Entity, FieldDesc, Kind, Value};
use crate::{
    context::Ctx,
    db::{quote_ident, Param},
    error::{Error, Result},
};

/// Comparison used in a where triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Like,
    ILike,
    Eq,
    Ne,
    Le,
    Ge,
}

impl Op {
    const fn sql(self) -> &'static str {
        match self {
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AndOr {
    #[default]
    And,
    Or,
}

#[derive(Clone, Debug)]
pub struct Where {
    pub column: String,
    pub op: Op,
    pub value: Param,
}

impl Where {
    pub fn new(column: impl Into<String>, op: Op, value: impl Into<Param>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Param>) -> Self {
        Self::new(column, Op::Eq, value)
    }
}

/// Parameters of a multi-row fetch.
#[derive(Clone, Debug, Default)]
pub struct Fetch {
    pub join: Option<String>,
    pub andor: AndOr,
    pub wheres: Vec<Where>,
    pub order: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Column list of a SELECT over `fields`, nullable columns coalesced to
/// their defaults. Integer columns are widened so they always decode as i64.
#[must_use]
pub fn select_list(fields: &[FieldDesc], table: &str) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|f| {
            let col = f.qualified(table);
            match (f.kind, f.nullable) {
                (Kind::Str, false) => {
                    format!("COALESCE({col}::TEXT, '{}')", f.coalesce.replace('\'', "''"))
                }
                (Kind::Str, true) => format!("{col}::TEXT"),
                (Kind::List, _) => format!("COALESCE({col}::TEXT, '')"),
                (Kind::Int, false) => format!("COALESCE({col}, 0)::BIGINT"),
                (Kind::Int, true) => format!("{col}::BIGINT"),
                (Kind::Bool, false) => format!("COALESCE({col}, FALSE)"),
                (Kind::Bool, true) | (Kind::Time, _) => col,
            }
        })
        .collect();

    format!("SELECT {}", columns.join(", "))
}

fn qualify(column: &str) -> String {
    column
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Builds the full statement of a fetch together with its parameters.
#[must_use]
pub fn build_fetch(fields: &[FieldDesc], table: &str, fetch: &Fetch) -> (String, Vec<Param>) {
    let mut sql = select_list(fields, table);
    let mut params = Vec::with_capacity(fetch.wheres.len() + 2);

    sql.push_str(" FROM ");
    sql.push_str(&quote_ident(table));

    if let Some(join) = fetch.join.as_deref().filter(|j| !j.is_empty()) {
        sql.push(' ');
        sql.push_str(join);
    }

    for (n, clause) in fetch.wheres.iter().enumerate() {
        sql.push_str(match (n, fetch.andor) {
            (0, _) => " WHERE ",
            (_, AndOr::And) => " AND ",
            (_, AndOr::Or) => " OR ",
        });
        params.push(clause.value.clone());
        sql.push_str(&format!(
            "{} {} ${}",
            qualify(&clause.column),
            clause.op.sql(),
            params.len()
        ));
    }

    if let Some(order) = fetch.order.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
        sql.push(' ');
        sql.push_str(order);
    }

    if let Some(limit) = fetch.limit.filter(|l| *l != 0) {
        params.push(Param::Int(limit));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
    }

    if let Some(offset) = fetch.offset.filter(|o| *o != 0) {
        params.push(Param::Int(offset));
        sql.push_str(&format!(" OFFSET ${}", params.len()));
    }

    (sql, params)
}

fn decode(row: &PgRow, idx: usize, field: &FieldDesc) -> Result<Value> {
    let value = match (field.kind, field.nullable) {
        (Kind::Str, false) => Value::Str(row.try_get::<String, _>(idx)?),
        (Kind::Str, true) => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Value::Null, Value::Str),
        (Kind::List, _) => Value::List(
            row.try_get::<String, _>(idx)?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        ),
        (Kind::Int, false) => Value::Int(row.try_get::<i64, _>(idx)?),
        (Kind::Int, true) => row
            .try_get::<Option<i64>, _>(idx)?
            .map_or(Value::Null, Value::Int),
        (Kind::Bool, false) => Value::Bool(row.try_get::<bool, _>(idx)?),
        (Kind::Bool, true) => row
            .try_get::<Option<bool>, _>(idx)?
            .map_or(Value::Null, Value::Bool),
        (Kind::Time, false) => Value::Time(row.try_get(idx)?),
        (Kind::Time, true) => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)?
            .map_or(Value::Null, Value::Time),
    };

    Ok(value)
}

fn store_row<E: Entity + ?Sized>(entity: &mut E, row: &PgRow) -> Result<()> {
    for (idx, field) in entity.fields().iter().enumerate() {
        let value = decode(row, idx, field)?;
        entity.put(field.column, value)?;
    }
    Ok(())
}

/// Loads the single row matching all `keys` into `entity`.
///
/// # Errors
/// Returns `NotFound` when no row matches, or the store error.
pub async fn fetch<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &mut E,
    join: Option<&str>,
    keys: &[(&str, Param)],
) -> Result<()> {
    let query = Fetch {
        join: join.map(str::to_string),
        wheres: keys
            .iter()
            .map(|(column, value)| Where::eq(*column, value.clone()))
            .collect(),
        limit: Some(1),
        ..Fetch::default()
    };

    let table = entity.table();
    let (sql, params) = build_fetch(entity.fields(), table, &query);
    let row = ctx
        .query_opt(&sql, &params)
        .await?
        .ok_or_else(|| Error::not_found(format!("No entry in {table} with that ID")))?;

    store_row(entity, &row)
}

/// Loads every row matching `query`, each into a fresh `E::default()`.
///
/// # Errors
/// Returns the store error or a decoding failure.
pub async fn fetch_many<E: Entity + Default>(ctx: &mut Ctx, query: &Fetch) -> Result<Vec<E>> {
    let template = E::default();
    let (sql, params) = build_fetch(template.fields(), template.table(), query);

    let rows = ctx.query_all(&sql, &params).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut entity = E::default();
        store_row(&mut entity, row)?;
        out.push(entity);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perms::Perm;

    const FIELDS: [FieldDesc; 5] = [
        FieldDesc::new("ident", Kind::Str),
        FieldDesc::new("descr", Kind::Str).coalesce("n/a"),
        FieldDesc::new("login_attempts", Kind::Int),
        FieldDesc::new("sysadmin", Kind::Bool).get(Perm::SYS_ADMIN),
        FieldDesc::new("email", Kind::Str)
            .nullable()
            .from_table("member_email"),
    ];

    #[test]
    fn select_coalesces_by_kind() {
        let sql = select_list(&FIELDS, "member");
        assert_eq!(
            sql,
            "SELECT COALESCE(\"member\".\"ident\"::TEXT, ''), \
             COALESCE(\"member\".\"descr\"::TEXT, 'n/a'), \
             COALESCE(\"member\".\"login_attempts\", 0)::BIGINT, \
             COALESCE(\"member\".\"sysadmin\", FALSE), \
             \"member_email\".\"email\"::TEXT"
        );
    }

    #[test]
    fn where_triples_and_paging() {
        let query = Fetch {
            join: Some("LEFT JOIN member_email ON member_email.member = member.ident".into()),
            andor: AndOr::Or,
            wheres: vec![
                Where::new("member.ident", Op::ILike, "%al%"),
                Where::new("descr", Op::Ne, "x"),
            ],
            order: Some(" ORDER BY ident ".into()),
            limit: Some(10),
            offset: Some(20),
        };

        let (sql, params) = build_fetch(&FIELDS[..1], "member", &query);
        assert_eq!(
            sql,
            "SELECT COALESCE(\"member\".\"ident\"::TEXT, '') FROM \"member\" \
             LEFT JOIN member_email ON member_email.member = member.ident \
             WHERE \"member\".\"ident\" ILIKE $1 OR \"descr\" <> $2 \
             ORDER BY ident LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            params,
            vec![
                Param::text("%al%"),
                Param::text("x"),
                Param::Int(10),
                Param::Int(20)
            ]
        );
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let query = Fetch {
            wheres: vec![Where::eq("ident", "bob")],
            limit: Some(0),
            ..Fetch::default()
        };
        let (sql, params) = build_fetch(&FIELDS[..1], "member", &query);
        assert!(sql.ends_with("WHERE \"ident\" = $1"));
        assert_eq!(params.len(), 1);
    }
}

//! Descriptor driven field access.
//!
//! Every persisted entity publishes a static table of [`FieldDesc`]s. The
//! functions in this module walk that table to fetch rows, coerce and store
//! user supplied values, and decide per field whether the current context
//! may see or change it. Nothing else mutates persisted entity fields.

mod fetch;
mod menu;
mod modify;

pub use fetch::{build_fetch, fetch, fetch_many, select_list, AndOr, Fetch, Op, Where};
pub use menu::{build_menu, field_access, get_field, MenuKind};
pub use modify::{add_item, modify, remove_item, set_field, StructOp};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::{
    context::Ctx,
    db::{quote_ident, Param},
    error::{Error, Result},
    perms::Perm,
};

/// Semantic type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Str,
    Bool,
    Int,
    Time,
    /// Space separated list in a text column, changed with add/remove only.
    List,
}

impl Kind {
    /// Suffix used in menu argument descriptors (`value#bool`).
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Time => "time",
            Self::List => "list",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FieldDesc {
    pub column: &'static str,
    pub kind: Kind,
    /// Table the column lives in when it is not the entity's own table.
    pub table: Option<&'static str>,
    pub nullable: bool,
    pub coalesce: &'static str,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub get: Perm,
    pub set: Perm,
    pub label: &'static str,
    pub hint: &'static str,
    /// Loaded and stored, never listed or changed through menus.
    pub hidden: bool,
}

impl FieldDesc {
    #[must_use]
    pub const fn new(column: &'static str, kind: Kind) -> Self {
        Self {
            column,
            kind,
            table: None,
            nullable: false,
            coalesce: "",
            min: None,
            max: None,
            get: Perm::NOTHING,
            set: Perm::NOTHING,
            label: "",
            hint: "",
            hidden: false,
        }
    }

    #[must_use]
    pub const fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    #[must_use]
    pub const fn hint(mut self, hint: &'static str) -> Self {
        self.hint = hint;
        self
    }

    #[must_use]
    pub const fn get(mut self, perm: Perm) -> Self {
        self.get = perm;
        self
    }

    #[must_use]
    pub const fn set(mut self, perm: Perm) -> Self {
        self.set = perm;
        self
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub const fn coalesce(mut self, default: &'static str) -> Self {
        self.coalesce = default;
        self
    }

    #[must_use]
    pub const fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    #[must_use]
    pub const fn from_table(mut self, table: &'static str) -> Self {
        self.table = Some(table);
        self
    }

    #[must_use]
    pub const fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// `table.column`, quoted.
    #[must_use]
    pub fn qualified(&self, default_table: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(self.table.unwrap_or(default_table)),
            quote_ident(self.column)
        )
    }

    /// Display label, the column name when none is declared.
    #[must_use]
    pub fn display_label(&self) -> &'static str {
        if self.label.is_empty() {
            self.column
        } else {
            self.label
        }
    }

    /// Coerces user input to this field's type and checks its bounds.
    ///
    /// # Errors
    /// Returns `InvalidInput` for unparsable input or a value out of range.
    pub fn coerce(&self, input: &str, time_format: &str) -> Result<Value> {
        let value = match self.kind {
            Kind::Str => {
                if self.nullable && input.is_empty() {
                    Value::Null
                } else {
                    Value::Str(input.to_string())
                }
            }
            Kind::Bool => Value::Bool(is_true(input)),
            Kind::Int => {
                if self.nullable && input.is_empty() {
                    Value::Null
                } else {
                    let number = input.trim().parse::<i64>().map_err(|_| {
                        Error::invalid(format!(
                            "Variable {} Invalid number encountered: '{input}'",
                            self.column
                        ))
                    })?;
                    Value::Int(number)
                }
            }
            Kind::Time => {
                if self.nullable && input.is_empty() {
                    Value::Null
                } else {
                    Value::Time(parse_time(input, time_format)?)
                }
            }
            Kind::List => Value::List(input.split_whitespace().map(str::to_string).collect()),
        };

        self.check_bounds(&value)?;
        Ok(value)
    }

    fn check_bounds(&self, value: &Value) -> Result<()> {
        let (what, got) = match value {
            Value::Str(s) => ("length", i64::try_from(s.chars().count()).unwrap_or(i64::MAX)),
            Value::Int(n) => ("value", *n),
            _ => return Ok(()),
        };

        if let Some(min) = self.min {
            if got < min {
                return Err(Error::invalid(format!(
                    "{} {what} must be at least {min}",
                    self.display_label()
                )));
            }
        }

        if let Some(max) = self.max {
            if got > max {
                return Err(Error::invalid(format!(
                    "{} {what} must be at most {max}",
                    self.display_label()
                )));
            }
        }

        Ok(())
    }
}

/// A coerced field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Time(DateTime<Utc>),
    List(Vec<String>),
    Null,
}

impl Value {
    /// Text form as shown to users and compared by `set_field`.
    #[must_use]
    pub fn render(&self, time_format: &str) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Bool(b) => yes_no(*b).to_string(),
            Self::Int(n) => n.to_string(),
            Self::Time(t) => t.format(time_format).to_string(),
            Self::List(items) => items.join(" "),
            Self::Null => String::new(),
        }
    }

    /// The bind parameter that stores this value.
    #[must_use]
    pub fn to_param(&self) -> Param {
        match self {
            Self::Str(s) => Param::Text(s.clone()),
            Self::Bool(b) => Param::Bool(*b),
            Self::Int(n) => Param::Int(*n),
            Self::Time(t) => Param::Time(*t),
            Self::List(items) => Param::Text(items.join(" ")),
            Self::Null => Param::OptText(None),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// What the current context may do with one field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldAccess {
    pub read: bool,
    pub edit: bool,
}

/// An entity described by a descriptor table.
pub trait Entity: Send + Sync {
    /// Default table for columns without their own.
    fn table(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldDesc];

    /// Current in-memory value of `column`.
    fn get(&self, column: &str) -> Option<Value>;

    /// Stores an already coerced value in memory.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an unknown column or a mismatched value.
    fn put(&mut self, column: &str, value: Value) -> Result<()>;

    /// Columns identifying this row, used in UPDATE statements and audit text.
    fn keys(&self) -> Vec<(&'static str, Param)>;

    /// Statement persisting `value` into `field`.
    fn update_sql(&self, field: &FieldDesc, value: Param) -> (String, Vec<Param>) {
        let table = field.table.unwrap_or_else(|| self.table());
        let mut sql = format!(
            "UPDATE {} SET {} = $1",
            quote_ident(table),
            quote_ident(field.column)
        );
        let mut params = vec![value];

        for (n, (column, key)) in self.keys().into_iter().enumerate() {
            sql.push_str(if n == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{} = ${}", quote_ident(column), params.len() + 1));
            params.push(key);
        }

        (sql, params)
    }

    /// Application permission hook for a single field, OR-ed with the
    /// declared permissions. `None` leaves the decision to the descriptor.
    fn perm_check(&self, _ctx: &Ctx, _field: &FieldDesc) -> Option<FieldAccess> {
        None
    }

    /// Translates a label or hint for menus.
    fn translate(&self, _ctx: &Ctx, _text: &str) -> Option<String> {
        None
    }
}

/// Finds the descriptor for `column`, case-insensitively.
#[must_use]
pub fn find_field(fields: &'static [FieldDesc], column: &str) -> Option<&'static FieldDesc> {
    fields
        .iter()
        .find(|f| f.column.eq_ignore_ascii_case(column))
}

/// Canonical truthy set.
#[must_use]
pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "yes" | "true" | "on" | "y" | "1" | "enabled"
    )
}

#[must_use]
pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[must_use]
pub fn normalize_boolean(value: &str) -> &'static str {
    yes_no(is_true(value))
}

/// Parses `input` with the configured time format, falling back to RFC 3339.
///
/// # Errors
/// Returns `InvalidInput` when neither format matches.
pub fn parse_time(input: &str, time_format: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, time_format) {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::invalid(format!("Invalid time '{input}', expected {time_format}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: FieldDesc = FieldDesc::new("name", Kind::Str).range(2, 8);
    const COUNT: FieldDesc = FieldDesc::new("count", Kind::Int).range(0, 10);
    const FLAG: FieldDesc = FieldDesc::new("flag", Kind::Bool);
    const WHEN: FieldDesc = FieldDesc::new("when", Kind::Time).nullable();

    #[test]
    fn truthy_set() {
        for yes in ["yes", "YES", "true", "on", "1", "y"] {
            assert!(is_true(yes), "{yes}");
        }
        for no in ["no", "false", "0", "", "maybe"] {
            assert!(!is_true(no), "{no}");
        }
        assert_eq!(normalize_boolean("TRUE"), "yes");
        assert_eq!(normalize_boolean("off"), "no");
    }

    #[test]
    fn coercion() {
        let fmt = "%Y-%m-%d %H:%M";
        assert_eq!(FLAG.coerce("on", fmt).unwrap(), Value::Bool(true));
        assert_eq!(COUNT.coerce(" 7 ", fmt).unwrap(), Value::Int(7));
        assert!(COUNT.coerce("seven", fmt).is_err());
        assert!(COUNT.coerce("11", fmt).is_err());
        assert!(NAME.coerce("a", fmt).is_err());
        assert_eq!(NAME.coerce("abc", fmt).unwrap(), Value::Str("abc".into()));
        assert_eq!(WHEN.coerce("", fmt).unwrap(), Value::Null);

        let t = WHEN.coerce("2024-02-03 04:05", fmt).unwrap();
        assert_eq!(t.render(fmt), "2024-02-03 04:05");
    }

    #[test]
    fn render_and_params() {
        assert_eq!(Value::Bool(false).render(""), "no");
        assert_eq!(Value::List(vec!["a".into(), "b".into()]).render(""), "a b");
        assert_eq!(Value::List(vec!["a".into()]).to_param(), Param::text("a"));
        assert_eq!(Value::Null.to_param(), Param::OptText(None));
    }

    #[test]
    fn qualified_names() {
        assert_eq!(NAME.qualified("member"), "\"member\".\"name\"");
        let f = FieldDesc::new("email", Kind::Str).from_table("member_email");
        assert_eq!(f.qualified("member"), "\"member_email\".\"email\"");
    }
}

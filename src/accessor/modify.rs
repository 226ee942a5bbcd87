use tracing::debug;

use super::{field_access, find_field, Entity, FieldDesc, Kind, Value};
use crate::{
    context::Ctx,
    db::audit_escape,
    error::{Error, Result},
};

/// Fields whose values never appear in audit text.
const UNLOGGED: [&str; 3] = ["password", "key", "recover_password"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructOp {
    Set,
    Add,
    Remove,
}

/// Applies `op` to `column` of `entity`, persisting the result.
///
/// Returns whether anything changed.
///
/// # Errors
/// See [`set_field`], [`add_item`] and [`remove_item`].
pub async fn modify<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    op: StructOp,
    entity: &mut E,
    column: &str,
    value: &str,
    check_perms: bool,
) -> Result<bool> {
    match op {
        StructOp::Set => set_field(ctx, entity, column, value, check_perms).await,
        StructOp::Add => add_item(ctx, entity, column, value, check_perms).await.map(|()| true),
        StructOp::Remove => remove_item(ctx, entity, column, value, check_perms)
            .await
            .map(|()| true),
    }
}

async fn lookup<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &E,
    column: &str,
    check_perms: bool,
) -> Result<&'static FieldDesc> {
    // Hidden fields are only reachable from trusted callers.
    let field = find_field(entity.fields(), column)
        .filter(|f| !f.hidden || !check_perms)
        .ok_or_else(|| Error::invalid(format!("Unknown property: {column}")))?;

    if check_perms && !field_access(ctx, entity, field).await.edit {
        return Err(Error::unauthorized(format!(
            "Not allowed to modify {}",
            field.column
        )));
    }

    Ok(field)
}

fn audit_prefix<E: Entity + ?Sized>(entity: &E, field: &FieldDesc) -> String {
    let mut text = format!("Update {}:", field.table.unwrap_or_else(|| entity.table()));
    for (column, key) in entity.keys() {
        text.push_str(&format!(" {column} = {}", audit_escape(&key.to_string())));
    }
    text.push_str(&format!(" property {}", field.column));
    text
}

/// Sets a scalar field from user input.
///
/// The input is coerced first and both sides are compared in rendered form,
/// so "07" equals 7 and "true" equals "yes". A no-op writes nothing and
/// returns `false`.
///
/// # Errors
/// `InvalidInput` for unknown fields, list fields or bad values,
/// `Unauthorized` when `check_perms` is set and the field is not editable,
/// or the store error.
pub async fn set_field<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &mut E,
    column: &str,
    value: &str,
    check_perms: bool,
) -> Result<bool> {
    let field = lookup(ctx, &*entity, column, check_perms).await?;

    if field.kind == Kind::List {
        return Err(Error::invalid(format!(
            "Can't 'set' a list field: {}",
            field.column
        )));
    }

    let time_format = ctx.core().config().time_format().to_string();
    let coerced = field.coerce(value, &time_format)?;

    let old = entity
        .get(field.column)
        .map(|v| v.render(&time_format))
        .unwrap_or_default();
    let new = coerced.render(&time_format);

    if old == new {
        debug!("{} unchanged, skipping update", field.column);
        return Ok(false);
    }

    let mut audit = audit_prefix(entity, field);
    if !UNLOGGED.contains(&field.column) {
        audit.push_str(&format!(
            " from '{}' to '{}'",
            audit_escape(&old),
            audit_escape(&new)
        ));
    }

    let (sql, params) = entity.update_sql(field, coerced.to_param());
    ctx.exec(&audit, None, &sql, &params).await?;

    entity.put(field.column, coerced)?;
    Ok(true)
}

fn current_list<E: Entity + ?Sized>(entity: &E, field: &FieldDesc) -> Result<Vec<String>> {
    match entity.get(field.column) {
        Some(Value::List(items)) => Ok(items),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(Error::invalid(format!(
            "Can't change non-list field: {}",
            field.column
        ))),
    }
}

async fn store_list<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &mut E,
    field: &FieldDesc,
    items: Vec<String>,
    audit: &str,
) -> Result<()> {
    let value = Value::List(items);
    let (sql, params) = entity.update_sql(field, value.to_param());
    ctx.exec(audit, None, &sql, &params).await?;
    entity.put(field.column, value)
}

/// Appends `item` to a list field.
///
/// # Errors
/// `InvalidInput` for scalar fields or an item containing whitespace,
/// `Unauthorized` when not editable, or the store error.
pub async fn add_item<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &mut E,
    column: &str,
    item: &str,
    check_perms: bool,
) -> Result<()> {
    let field = lookup(ctx, &*entity, column, check_perms).await?;
    if field.kind != Kind::List {
        return Err(Error::invalid(format!(
            "Can't add to non-list field: {}",
            field.column
        )));
    }

    if item.is_empty() || item.contains(char::is_whitespace) {
        return Err(Error::invalid("List items can't be empty or contain spaces"));
    }

    let mut items = current_list(entity, field)?;
    items.push(item.to_string());

    let audit = format!("{} added '{}'", audit_prefix(entity, field), audit_escape(item));
    store_list(ctx, entity, field, items, &audit).await
}

/// Removes the first element equal to `item` from a list field.
///
/// # Errors
/// `NotFound` when the element is absent, otherwise as [`add_item`].
pub async fn remove_item<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &mut E,
    column: &str,
    item: &str,
    check_perms: bool,
) -> Result<()> {
    let field = lookup(ctx, &*entity, column, check_perms).await?;
    if field.kind != Kind::List {
        return Err(Error::invalid(format!(
            "Can't remove from non-list field: {}",
            field.column
        )));
    }

    let mut items = current_list(entity, field)?;
    let pos = items
        .iter()
        .position(|i| i == item)
        .ok_or_else(|| Error::not_found("Item not found, thus cannot remove"))?;
    items.remove(pos);

    let audit = format!("{} removed '{}'", audit_prefix(entity, field), audit_escape(item));
    store_list(ctx, entity, field, items, &audit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::testing::offline_core, model::Principal};

    fn alice() -> Principal {
        Principal {
            ident: "alice".to_string(),
            login_attempts: 7,
            hide_email: true,
            ..Principal::default()
        }
    }

    // The offline pool never connects, so reaching the store would fail.
    #[tokio::test]
    async fn coerced_equal_values_write_nothing() {
        let mut ctx = Ctx::new(offline_core().await);
        let mut user = alice();

        for same in ["07", " 7", "7"] {
            assert!(!set_field(&mut ctx, &mut user, "login_attempts", same, false)
                .await
                .unwrap());
        }
        for same in ["TRUE", "on", "1", "yes"] {
            assert!(!set_field(&mut ctx, &mut user, "hide_email", same, false)
                .await
                .unwrap());
        }
        assert_eq!(user, alice());
    }

    #[tokio::test]
    async fn bad_values_fail_before_the_store() {
        let mut ctx = Ctx::new(offline_core().await);
        let mut user = alice();

        let err = set_field(&mut ctx, &mut user, "login_attempts", "seven", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);

        let err = set_field(&mut ctx, &mut user, "airport", "ABCD", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}

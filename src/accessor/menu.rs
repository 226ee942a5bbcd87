use super::{Entity, FieldAccess, FieldDesc, Kind};
use crate::{
    context::Ctx,
    error::{Error, Result},
    menu::{Entry, Menu},
    perms::Perm,
};

/// Which operation a generated menu offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuKind {
    Get,
    Set,
    Add,
    Remove,
}

impl MenuKind {
    const fn is_edit(self) -> bool {
        !matches!(self, Self::Get)
    }
}

async fn allowed(ctx: &mut Ctx, column: &str, perm: Perm) -> bool {
    if perm.is_nothing() {
        return true;
    }
    ctx.check_perms(&format!("field({column})"), perm).await.is_ok()
}

/// Evaluates the declared permissions of `field` and ORs in the entity's
/// own hook. A field that may be read but not written is visible and
/// immutable.
pub async fn field_access<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &E,
    field: &FieldDesc,
) -> FieldAccess {
    let read = allowed(ctx, field.column, field.get).await;
    let edit = allowed(ctx, field.column, field.set).await;

    let mut access = FieldAccess {
        read: read || edit,
        edit,
    };

    if let Some(hook) = entity.perm_check(ctx, field) {
        access.read |= hook.read || hook.edit;
        access.edit |= hook.edit;
    }

    access
}

fn declared_perm(perm: Perm) -> Perm {
    if perm.is_nothing() {
        Perm::NONE
    } else {
        perm
    }
}

/// Emits one entry per field the context may read (or edit, for the edit
/// kinds). Edit entries take one argument described as `column#type`.
///
/// `subjects` are prepended to every entry's argument list, e.g. the user
/// name in `user set <user> <field> <value>`.
///
/// # Errors
/// Never fails today; kept fallible for entities whose hooks may.
pub async fn build_menu<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &E,
    subjects: &[String],
    kind: MenuKind,
) -> Result<Menu> {
    let mut menu = Menu::default();

    for field in entity.fields() {
        if field.hidden {
            continue;
        }

        let listed = match kind {
            MenuKind::Get => true,
            MenuKind::Set => field.kind != Kind::List,
            MenuKind::Add | MenuKind::Remove => field.kind == Kind::List,
        };
        if !listed {
            continue;
        }

        let access = field_access(ctx, entity, field).await;
        let granted = if kind.is_edit() { access.edit } else { access.read };
        if !granted {
            continue;
        }

        let label = translated(ctx, entity, field.display_label());
        let desc = if field.hint.is_empty() {
            label
        } else {
            format!("{label} - {}", translated(ctx, entity, field.hint))
        };

        let mut args = subjects.to_vec();
        if kind.is_edit() {
            args.push(format!("{}#{}", field.column, field.kind.tag()));
        }

        // Hook granted access bypasses the declared mask.
        let declared = if kind.is_edit() { field.set } else { field.get };
        let perms = if allowed(ctx, field.column, declared).await {
            declared_perm(declared)
        } else {
            Perm::NONE
        };

        menu.add(Entry::leaf(field.column, args, perms, desc));
    }

    Ok(menu)
}

fn translated<E: Entity + ?Sized>(ctx: &Ctx, entity: &E, text: &str) -> String {
    entity
        .translate(ctx, text)
        .unwrap_or_else(|| text.to_string())
}

/// Renders the current value of a readable field.
///
/// # Errors
/// `InvalidInput` for unknown fields, `Unauthorized` when not readable.
pub async fn get_field<E: Entity + ?Sized>(
    ctx: &mut Ctx,
    entity: &E,
    column: &str,
) -> Result<String> {
    let field = super::find_field(entity.fields(), column)
        .filter(|f| !f.hidden)
        .ok_or_else(|| Error::invalid(format!("Unknown property: {column}")))?;

    if !field_access(ctx, entity, field).await.read {
        return Err(Error::unauthorized(format!(
            "Not allowed to read {}",
            field.column
        )));
    }

    let time_format = ctx.core().config().time_format().to_string();
    Ok(entity
        .get(field.column)
        .map(|v| v.render(&time_format))
        .unwrap_or_default())
}

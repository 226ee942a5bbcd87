use super::{arg, password, report_set, subject_args, twofactor};
use crate::{
    accessor::{build_menu, get_field, set_field, MenuKind},
    context::Ctx,
    error::{Error, Result},
    menu::{BoxFuture, Entry, Menu},
    model::Principal,
    perms::Perm,
};

pub(super) fn enter(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let menu = Menu::new(vec![
            Entry::new(
                "new",
                new,
                2,
                2,
                &["username#ident", "email#string"],
                Perm::SYS_ADMIN,
                "Create a new user",
            ),
            Entry::new("list", list, 0, 1, &["search#string"], Perm::SYS_ADMIN, "List users"),
            Entry::new("delete", delete, 1, 1, &["username#ident"], Perm::SYS_ADMIN, "Delete a user"),
            Entry::sub("get", get, Perm::USER, "Get properties of a user"),
            Entry::sub("set", set, Perm::USER, "Set properties of a user"),
            Entry::sub("password", password::enter, Perm::NONE, "Password commands"),
            Entry::sub("2fa", twofactor::enter, Perm::USER, "Second factor commands"),
        ]);
        ctx.menu(args, menu).await
    })
}

fn new(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let (user, token) = Principal::create(ctx, arg(&args, 0), arg(&args, 1)).await?;
        ctx.outln(format!("User {} created", user.username()));
        ctx.outln(format!("Recovery token: {token}"));
        Ok(())
    })
}

fn list(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let users = Principal::list(ctx, arg(&args, 0)).await?;
        if users.is_empty() {
            ctx.outln("No users found");
            return Ok(());
        }

        for user in users {
            if ctx.is_aborted() {
                break;
            }
            ctx.outln(format!("{:<20} {}", user.username(), user.full_name()));
        }
        Ok(())
    })
}

fn delete(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let user = Principal::fetch(ctx, arg(&args, 0)).await?;
        if ctx.user().is_some_and(|me| me.username() == user.username()) {
            return Err(Error::invalid("Can't delete yourself"));
        }

        user.delete(ctx).await?;
        ctx.outln("User deleted");
        Ok(())
    })
}

fn get(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(properties(ctx, args, MenuKind::Get))
}

fn set(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(properties(ctx, args, MenuKind::Set))
}

async fn properties(ctx: &mut Ctx, args: Vec<String>, kind: MenuKind) -> Result<()> {
    let verb = if kind == MenuKind::Get { "get" } else { "set" };

    let (Some(username), margs) = subject_args(&args) else {
        ctx.outln(format!(
            "Note: use 'user {verb} help <username>' to see properties one can {verb} for that user"
        ));
        return Ok(());
    };

    let perms = if kind == MenuKind::Get {
        Perm::USER_VIEW
    } else {
        Perm::USER_SELF
    };
    ctx.select_user(&username, perms).await?;
    let mut user = ctx
        .sel_user()
        .cloned()
        .ok_or_else(|| Error::unauthorized("Could not select user"))?;

    let menu = build_menu(ctx, &user, &[username], kind).await?;
    let Some((entry, rest)) = ctx.resolve(margs, menu).await? else {
        return Ok(());
    };

    if kind == MenuKind::Get {
        let value = get_field(ctx, &user, &entry.name).await?;
        ctx.outln(value);
    } else {
        let changed = set_field(ctx, &mut user, &entry.name, arg(&rest, 1), true).await?;
        report_set(ctx, &entry.name, changed);
    }
    Ok(())
}

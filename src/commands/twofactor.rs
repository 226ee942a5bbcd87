use super::{arg, int_arg};
use crate::{
    context::Ctx,
    error::{Error, Result},
    menu::{BoxFuture, Entry, Menu},
    model::Principal,
    otp::{self, Enrollment, FactorKind},
    perms::Perm,
};

pub(super) fn enter(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let menu = Menu::new(vec![
            Entry::new("list", list, 0, 1, &["username#ident"], Perm::USER, "List 2FA tokens"),
            Entry::new("types", types, 0, 0, &[], Perm::USER, "List the 2FA token types"),
            Entry::new(
                "add",
                add,
                3,
                4,
                &["username#ident", "type#string", "descr#string", "curpassword#password"],
                Perm::USER,
                "Add a 2FA token",
            ),
            Entry::new(
                "enable",
                enable,
                3,
                3,
                &["username#ident", "id#int", "twofactor#string"],
                Perm::USER,
                "Enable a 2FA token",
            ),
            Entry::new(
                "disable",
                disable,
                2,
                3,
                &["username#ident", "id#int", "curpassword#password"],
                Perm::USER,
                "Disable a 2FA token",
            ),
            Entry::new(
                "remove",
                remove,
                2,
                3,
                &["username#ident", "id#int", "curpassword#password"],
                Perm::USER,
                "Remove a 2FA token",
            ),
        ]);
        ctx.menu(args, menu).await
    })
}

/// Selects the token owner. Without sysadmin rights the caller has to be
/// the owner and, when `password` is given, prove it again.
async fn owner(ctx: &mut Ctx, username: &str, password: Option<&str>) -> Result<Principal> {
    ctx.select_user(username, Perm::USER_SELF).await?;
    let user = ctx
        .sel_user()
        .cloned()
        .ok_or_else(|| Error::unauthorized("Could not select user"))?;

    if let Some(password) = password {
        if !ctx.is_sysadmin() && user.verify_password(password).is_err() {
            return Err(Error::invalid("Invalid current password."));
        }
    }
    Ok(user)
}

fn list(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let username = match arg(&args, 0) {
            "" => ctx
                .user()
                .map(|u| u.username().to_string())
                .ok_or_else(|| Error::unauthorized("Not authenticated"))?,
            name => name.to_string(),
        };
        let user = owner(ctx, &username, None).await?;

        let factors = otp::list(ctx, user.username()).await?;
        if factors.is_empty() {
            ctx.outln("No 2FA tokens");
            return Ok(());
        }

        let format = ctx.core().config().time_format().to_string();
        ctx.outln(format!(
            "{:>6} {:<5} {:<8} {:<16} {}",
            "Id", "Type", "State", "Entered", "Description"
        ));
        for f in factors {
            ctx.outln(format!(
                "{:>6} {:<5} {:<8} {:<16} {}",
                f.id,
                f.kind,
                if f.active { "active" } else { "inactive" },
                f.entered.format(&format).to_string(),
                f.descr
            ));
        }
        Ok(())
    })
}

fn types(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        for (kind, descr) in otp::types(ctx).await? {
            ctx.outln(format!("{kind:<5} {descr}"));
        }
        Ok(())
    })
}

fn add(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let user = owner(ctx, arg(&args, 0), Some(arg(&args, 3))).await?;

        match otp::add(ctx, &user, arg(&args, 1), arg(&args, 2)).await? {
            Enrollment::Otp { id, name, kind, url } => {
                ctx.outln(format!("Id: {id}"));
                ctx.outln(format!("Name: {name}"));
                ctx.outln(format!("Token Type: {}", kind.as_str()));
                ctx.outln(format!("URL: {url}"));
                if kind == FactorKind::Hotp {
                    ctx.outln("Counter: 0");
                }
                ctx.outln(format!(
                    "Enable the token with: user 2fa enable {} {id} <code>",
                    user.username()
                ));
            }
            Enrollment::Codes(codes) => {
                ctx.outln("Single use codes, each valid once:");
                for (name, code) in codes {
                    ctx.outln(format!("  {name}: {code}"));
                }
            }
        }
        Ok(())
    })
}

async fn toggle(ctx: &mut Ctx, args: &[String], active: bool) -> Result<()> {
    let id = int_arg(args, 1, "id")?;
    let (password, code) = if active {
        (None, arg(args, 2))
    } else {
        (Some(arg(args, 2)), "")
    };
    let user = owner(ctx, arg(args, 0), password).await?;

    otp::set_active(ctx, &user, id, active, code).await?;
    ctx.outln(format!(
        "State of 2FA token {id} changed to {}",
        if active { "active" } else { "inactive" }
    ));
    Ok(())
}

fn enable(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { toggle(ctx, &args, true).await })
}

fn disable(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { toggle(ctx, &args, false).await })
}

fn remove(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let id = int_arg(&args, 1, "id")?;
        let user = owner(ctx, arg(&args, 0), Some(arg(&args, 2))).await?;

        otp::remove(ctx, &user, id).await?;
        ctx.outln(format!("2FA Token {id} removed"));
        Ok(())
    })
}

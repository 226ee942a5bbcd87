use super::arg;
use crate::{
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
                "set",
                set,
                2,
                3,
                &["username#ident", "newpassword#password", "curpassword#password"],
                Perm::USER,
                "Set a new password",
            ),
            Entry::new(
                "recover",
                recover,
                3,
                3,
                &["username#ident", "token#string", "password#password"],
                Perm::NONE,
                "Set a password using a recovery token",
            ),
            Entry::new(
                "newtoken",
                newtoken,
                1,
                1,
                &["username#ident"],
                Perm::SYS_ADMIN,
                "Issue a recovery token",
            ),
            Entry::new(
                "resetcount",
                resetcount,
                1,
                1,
                &["username#ident"],
                Perm::SYS_ADMIN,
                "Reset the failed login counter",
            ),
        ]);
        ctx.menu(args, menu).await
    })
}

/// The selected user, after selecting `username` with `perms`.
async fn selected(ctx: &mut Ctx, username: &str, perms: Perm) -> Result<Principal> {
    ctx.select_user(username, perms).await?;
    ctx.sel_user()
        .cloned()
        .ok_or_else(|| Error::unauthorized("Could not select user"))
}

fn set(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let mut user = selected(ctx, arg(&args, 0), Perm::USER_SELF).await?;
        let sysadmin = ctx.is_sysadmin();

        if !sysadmin && user.verify_password(arg(&args, 2)).is_err() {
            return Err(Error::invalid("Invalid current password."));
        }

        user.set_password(ctx, arg(&args, 1)).await?;
        ctx.outln("Password updated");

        // Changing your own password ends the session.
        if !sysadmin && ctx.is_self() {
            ctx.logout().await?;
        }
        Ok(())
    })
}

fn recover(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        Principal::recover(ctx, arg(&args, 0), arg(&args, 1), arg(&args, 2)).await?;
        ctx.outln("Password updated");
        Ok(())
    })
}

fn newtoken(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let mut user = selected(ctx, arg(&args, 0), Perm::SYS_ADMIN).await?;
        let token = user.new_recovery_token(ctx).await?;
        ctx.outln(format!("Recovery token for {}: {token}", user.username()));
        Ok(())
    })
}

fn resetcount(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let user = selected(ctx, arg(&args, 0), Perm::SYS_ADMIN).await?;
        ctx.exec(
            "Reset login attempts of $1",
            Some(1),
            "UPDATE member SET login_attempts = 0 WHERE ident = $1",
            &[crate::db::Param::text(user.username())],
        )
        .await?;
        ctx.outln("Login attempt counter reset");
        Ok(())
    })
}

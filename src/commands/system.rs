use chrono::Utc;
use sqlx::Row;

use super::{arg, int_arg, iptrk, report_set};
use crate::{
    accessor::{add_item, build_menu, get_field, remove_item, set_field, MenuKind},
    context::Ctx,
    db::Param,
    error::{Error, Result},
    menu::{BoxFuture, Entry, Menu},
    perms::Perm,
    system::parse_prefixes,
    GIT_COMMIT_HASH,
};

const DEFAULT_AUDIT_MAX: i64 = 10;

pub(super) fn enter(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { ctx.menu(args, menu()).await })
}

fn menu() -> Menu {
    Menu::new(vec![
        Entry::new("report", report, 0, 0, &[], Perm::SYS_ADMIN, "Report system statistics"),
        Entry::new(
            "login",
            login,
            2,
            3,
            &["username#ident", "password#password", "twofactor#string"],
            Perm::NONE,
            "Login",
        ),
        Entry::new("logout", logout, 0, 0, &[], Perm::USER, "Logout"),
        Entry::new("whoami", whoami, 0, 0, &[], Perm::NONE, "Who Am I?"),
        Entry::new("swapadmin", swapadmin, 0, 0, &[], Perm::SYS_ADMIN_CAN, "Swap from regular to sysadmin user"),
        Entry::sub("set", set, Perm::SYS_ADMIN, "Configure the system"),
        Entry::sub("get", get, Perm::NONE, "Get values from the system"),
        Entry::sub("add", add, Perm::SYS_ADMIN, "Add a member to a list"),
        Entry::sub("remove", remove, Perm::SYS_ADMIN, "Remove a member from a list"),
        Entry::new(
            "batch",
            batch,
            1,
            4,
            &["filename#file", "username#ident", "password#password", "twofactor#string"],
            Perm::LOOPBACK | Perm::SYS_ADMIN,
            "Execute a batch file",
        ),
        Entry::sub("iptrk", iptrk::enter, Perm::SYS_ADMIN, "IPtrk commands"),
        Entry::new(
            "auditlog",
            auditlog,
            0,
            5,
            &["search#string", "username#ident", "group#ident", "offset#int", "max#int"],
            Perm::SYS_ADMIN,
            "View the audit log",
        ),
    ])
}

fn uptime(seconds: i64) -> String {
    let (days, rest) = (seconds / 86_400, seconds % 86_400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    format!("{days}d {hours:02}h {minutes:02}m {seconds:02}s")
}

async fn count_rows(ctx: &mut Ctx, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", crate::db::quote_ident(table));
    let row = ctx
        .query_opt(&sql, &[])
        .await?
        .ok_or_else(|| Error::internal(format!("No count for {table}")))?;
    Ok(row.try_get("n")?)
}

fn report(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let core = ctx.core_arc();
        let format = core.config().time_format().to_string();
        let started = core.started();

        ctx.outln(format!(
            "Version   : {} ({GIT_COMMIT_HASH})",
            env!("CARGO_PKG_VERSION")
        ));
        ctx.outln(format!("Started   : {}", started.format(&format)));
        ctx.outln(format!(
            "Uptime    : {}",
            uptime((Utc::now() - started).num_seconds())
        ));

        for (label, table) in [
            ("Users     ", "member"),
            ("Groups    ", "trustgroup"),
            ("2FA Tokens", "second_factors"),
            ("IPtrk     ", "iptrk"),
            ("Revoked   ", "jwt_invalidated"),
            ("Audit rows", "audit_history"),
        ] {
            let n = count_rows(ctx, table).await?;
            ctx.outln(format!("{label}: {n}"));
        }

        ctx.outln(format!(
            "Token cache: {} entries",
            core.revocation().len().await
        ));
        ctx.outln(format!(
            "IPtrk worker: {}",
            if core.iptrk().is_running() { "running" } else { "stopped" }
        ));
        Ok(())
    })
}

fn login(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.login(arg(&args, 0), arg(&args, 1), arg(&args, 2)).await?;
        ctx.new_token()?;
        ctx.outln("Login successful");
        Ok(())
    })
}

fn logout(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.logout().await?;
        ctx.outln("Logout successful");
        Ok(())
    })
}

fn whoami(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let who = ctx
            .user()
            .map(|u| (u.username().to_string(), u.full_name().to_string()));

        match who {
            Some((username, fullname)) => {
                ctx.outln(format!("Username: {username}"));
                ctx.outln(format!("Fullname: {fullname}"));
            }
            None => ctx.outln("Not authenticated"),
        }
        Ok(())
    })
}

fn swapadmin(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.swap_admin()?;
        ctx.new_token()?;
        Ok(())
    })
}

fn set(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let mut config = ctx.core().system().get();
        let menu = build_menu(ctx, &config, &[], MenuKind::Set).await?;
        let Some((entry, rest)) = ctx.resolve(args, menu).await? else {
            return Ok(());
        };

        let changed = set_field(ctx, &mut config, &entry.name, arg(&rest, 0), true).await?;
        report_set(ctx, &entry.name, changed);

        if changed {
            ctx.core().refresh_system().await?;
        }
        Ok(())
    })
}

fn get(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let config = ctx.core().system().get();
        let menu = build_menu(ctx, &config, &[], MenuKind::Get).await?;
        let Some((entry, _)) = ctx.resolve(args, menu).await? else {
            return Ok(());
        };

        let value = get_field(ctx, &config, &entry.name).await?;
        ctx.outln(value);
        Ok(())
    })
}

async fn edit_list(ctx: &mut Ctx, args: Vec<String>, kind: MenuKind) -> Result<()> {
    let mut config = ctx.core().system().get();
    let menu = build_menu(ctx, &config, &[], kind).await?;
    let Some((entry, rest)) = ctx.resolve(args, menu).await? else {
        return Ok(());
    };
    let item = arg(&rest, 0);

    if entry.name == "sysadmin_restrict" {
        parse_prefixes(&[item])?;
    }

    if kind == MenuKind::Add {
        add_item(ctx, &mut config, &entry.name, item, true).await?;
        ctx.outln(format!("Added {item} to {}", entry.name));
    } else {
        remove_item(ctx, &mut config, &entry.name, item, true).await?;
        ctx.outln(format!("Removed {item} from {}", entry.name));
    }

    ctx.core().refresh_system().await
}

fn add(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(edit_list(ctx, args, MenuKind::Add))
}

fn remove(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(edit_list(ctx, args, MenuKind::Remove))
}

fn batch(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if !matches!(args.len(), 1 | 3 | 4) {
            return Err(Error::invalid(
                "Invalid number of arguments; expected: <file> [<username> <password> [<twofactor>]]",
            ));
        }

        if args.len() >= 3 {
            ctx.login(arg(&args, 1), arg(&args, 2), arg(&args, 3)).await?;
            ctx.outln(format!("Changed user to {}", arg(&args, 1)));
        }

        ctx.batch(arg(&args, 0)).await
    })
}

fn auditlog(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let search = arg(&args, 0);
        let pattern = if search.is_empty() {
            String::new()
        } else {
            format!("%{search}%")
        };
        let offset = if arg(&args, 3).is_empty() {
            0
        } else {
            int_arg(&args, 3, "offset")?
        };
        let max = if arg(&args, 4).is_empty() {
            DEFAULT_AUDIT_MAX
        } else {
            int_arg(&args, 4, "max")?
        };

        let rows = ctx
            .query_all(
                "SELECT entered, \
                        COALESCE(member, '') AS member, \
                        what, \
                        COALESCE(username, '') AS username, \
                        COALESCE(trustgroup, '') AS trustgroup, \
                        COALESCE(remote, '') AS remote \
                 FROM audit_history \
                 WHERE ($1 = '' OR member ILIKE $1 OR what ILIKE $1 \
                        OR username ILIKE $1 OR trustgroup ILIKE $1) \
                   AND ($2 = '' OR username = $2) \
                   AND ($3 = '' OR trustgroup = $3) \
                 ORDER BY entered DESC, id DESC \
                 OFFSET $4 LIMIT $5",
                &[
                    Param::Text(pattern),
                    Param::text(arg(&args, 1)),
                    Param::text(arg(&args, 2)),
                    Param::Int(offset.max(0)),
                    Param::Int(max.max(1)),
                ],
            )
            .await?;

        if rows.is_empty() {
            return Err(Error::not_found("No audit records matched"));
        }

        let format = ctx.core().config().time_format().to_string();
        for row in &rows {
            if ctx.is_aborted() {
                break;
            }

            let entered: chrono::DateTime<Utc> = row.try_get("entered")?;
            let member: String = row.try_get("member")?;
            let what: String = row.try_get("what")?;
            let username: String = row.try_get("username")?;
            let group: String = row.try_get("trustgroup")?;
            let remote: String = row.try_get("remote")?;

            ctx.outln(format!("Entered   : {}", entered.format(&format)));
            ctx.outln(format!("  Member  : {member}"));
            ctx.outln(format!("  What    : {what}"));
            ctx.outln(format!("  Username: {username}"));
            ctx.outln(format!("  Group   : {group}"));
            ctx.outln(format!("  Remote  : {remote}"));
            ctx.outln("");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_rendering() {
        assert_eq!(uptime(0), "0d 00h 00m 00s");
        assert_eq!(uptime(90_061), "1d 01h 01m 01s");
    }

    #[test]
    fn menu_shape() {
        let menu = menu();
        let batch = menu.get("batch").unwrap();
        assert_eq!((batch.args_min, batch.args_max), (1, Some(4)));
        assert!(menu.get("iptrk").unwrap().is_sub());
        assert_eq!(menu.get("whoami").unwrap().perms, Perm::NONE);
        assert!(menu.get("set").unwrap().perms.contains(Perm::SYS_ADMIN));
    }
}

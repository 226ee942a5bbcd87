use super::{arg, report_set, subject_args};
use crate::{
    accessor::{build_menu, get_field, is_true, set_field, yes_no, MenuKind},
    context::Ctx,
    error::{Error, Result},
    menu::{BoxFuture, Entry, Menu},
    model::Group,
    perms::Perm,
};

pub(super) fn enter(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let menu = Menu::new(vec![
            Entry::new(
                "new",
                new,
                1,
                2,
                &["group#ident", "descr#string"],
                Perm::SYS_ADMIN,
                "Create a new group",
            ),
            Entry::new("list", list, 0, 0, &[], Perm::USER, "List groups"),
            Entry::new("members", members, 1, 1, &["group#ident"], Perm::USER, "List the members of a group"),
            Entry::new(
                "nominate",
                nominate,
                2,
                2,
                &["group#ident", "username#ident"],
                Perm::USER,
                "Nominate a user for a group",
            ),
            Entry::new(
                "state",
                state,
                3,
                3,
                &["group#ident", "username#ident", "state#string"],
                Perm::USER,
                "Change the state of a member",
            ),
            Entry::new(
                "admin",
                admin,
                3,
                3,
                &["group#ident", "username#ident", "admin#bool"],
                Perm::USER,
                "Grant or revoke group admin rights",
            ),
            Entry::new(
                "leave",
                leave,
                1,
                2,
                &["group#ident", "username#ident"],
                Perm::USER,
                "Leave a group, or remove a member from it",
            ),
            Entry::sub("get", get, Perm::USER, "Get properties of a group"),
            Entry::sub("set", set, Perm::USER, "Set properties of a group"),
        ]);
        ctx.menu(args, menu).await
    })
}

/// The selected group, after selecting `name` with `perms`.
async fn selected(ctx: &mut Ctx, name: &str, perms: Perm) -> Result<Group> {
    ctx.select_group(name, perms).await?;
    ctx.sel_group()
        .map(|s| s.group.clone())
        .ok_or_else(|| Error::unauthorized("Could not select group"))
}

fn me(ctx: &Ctx) -> Result<String> {
    ctx.user()
        .map(|u| u.username().to_string())
        .ok_or_else(|| Error::unauthorized("Not authenticated"))
}

fn new(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = arg(&args, 0);
        let descr = match arg(&args, 1) {
            "" => name,
            descr => descr,
        };
        Group::create(ctx, name, descr).await?;
        ctx.outln("Group created");
        Ok(())
    })
}

fn list(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if ctx.is_sysadmin() {
            let groups = Group::list_all(ctx).await?;
            if groups.is_empty() {
                ctx.outln("No groups");
            }
            for g in groups {
                ctx.outln(format!("{:<20} {}", g.ident, g.descr));
            }
            return Ok(());
        }

        let username = me(ctx)?;
        let groups = Group::list_for(ctx, &username).await?;
        if groups.is_empty() {
            ctx.outln("Not a member of any group");
        }
        for (name, state, admin) in groups {
            let badge = if admin { " [admin]" } else { "" };
            ctx.outln(format!("{name:<20} {state}{badge}"));
        }
        Ok(())
    })
}

fn members(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let group = selected(ctx, arg(&args, 0), Perm::GROUP_MEMBER).await?;
        let rows = group.members(ctx).await?;

        if rows.is_empty() {
            ctx.outln("Group has no members");
            return Ok(());
        }

        for row in rows {
            let badge = if row.admin { " [admin]" } else { "" };
            ctx.outln(format!(
                "{:<20} {:<10} {}{badge}",
                row.member, row.state, row.descr
            ));
        }
        Ok(())
    })
}

fn nominate(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let group = selected(ctx, arg(&args, 0), Perm::GROUP_MEMBER).await?;
        ctx.select_user(arg(&args, 1), Perm::USER_NOMINATE).await?;
        let username = ctx
            .sel_user()
            .map(|u| u.username().to_string())
            .ok_or_else(|| Error::unauthorized("Could not select user"))?;

        group.nominate(ctx, &username).await?;
        ctx.outln(format!("{username} nominated for {}", group.name()));
        Ok(())
    })
}

fn state(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let group = selected(ctx, arg(&args, 0), Perm::GROUP_ADMIN).await?;
        let state = arg(&args, 2).to_lowercase();

        group.set_state(ctx, arg(&args, 1), &state).await?;
        ctx.outln(format!("Member state changed to {state}"));
        Ok(())
    })
}

fn admin(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let group = selected(ctx, arg(&args, 0), Perm::GROUP_ADMIN).await?;
        let grant = is_true(arg(&args, 2));

        group.set_admin(ctx, arg(&args, 1), grant).await?;
        ctx.outln(format!("Group admin: {}", yes_no(grant)));
        Ok(())
    })
}

fn leave(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let myself = me(ctx)?;
        let target = match arg(&args, 1) {
            "" => myself.clone(),
            name => name.to_lowercase(),
        };

        // Removing someone else takes group admin rights.
        let perms = if target == myself {
            Perm::GROUP_MEMBER
        } else {
            Perm::GROUP_ADMIN
        };
        let group = selected(ctx, arg(&args, 0), perms).await?;

        group.leave(ctx, &target).await?;
        ctx.outln(format!("{target} left {}", group.name()));
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

    let (Some(name), margs) = subject_args(&args) else {
        ctx.outln(format!(
            "Note: use 'group {verb} help <group>' to see properties one can {verb} for that group"
        ));
        return Ok(());
    };

    let perms = if kind == MenuKind::Get {
        Perm::GROUP_MEMBER
    } else {
        Perm::GROUP_ADMIN
    };
    let mut group = selected(ctx, &name, perms).await?;

    let menu = build_menu(ctx, &group, &[name], kind).await?;
    let Some((entry, rest)) = ctx.resolve(margs, menu).await? else {
        return Ok(());
    };

    if kind == MenuKind::Get {
        let value = get_field(ctx, &group, &entry.name).await?;
        ctx.outln(value);
    } else {
        let changed = set_field(ctx, &mut group, &entry.name, arg(&rest, 1), true).await?;
        report_set(ctx, &entry.name, changed);
    }
    Ok(())
}

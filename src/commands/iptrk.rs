use super::arg;
use crate::{
    context::{parse_remote, Ctx},
    error::{Error, Result},
    menu::{BoxFuture, Entry, Menu},
    perms::Perm,
};

pub(super) fn enter(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let menu = Menu::new(vec![
            Entry::new("list", list, 0, 0, &[], Perm::SYS_ADMIN, "List the contents of the IPtrk table"),
            Entry::new("flush", flush, 0, 0, &[], Perm::SYS_ADMIN, "Flush the IPtrk table"),
            Entry::new("remove", remove, 1, 1, &["ip#string"], Perm::SYS_ADMIN, "Remove an IP from the IPtrk table"),
        ]);
        ctx.menu(args, menu).await
    })
}

fn list(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let core = ctx.core_arc();
        let entries = core.iptrk().list().await?;

        if entries.is_empty() {
            ctx.outln("There are currently no entries");
            return Ok(());
        }

        let format = core.config().time_format().to_string();
        ctx.outln(format!(
            "{:>16} {:>16} {:>7} {:>10} {}",
            "Entered", "Last", "Status", "Count", "IP"
        ));

        for e in entries {
            ctx.outln(format!(
                "{:>16} {:>16} {:>7} {:>10} {}",
                e.entered.format(&format).to_string(),
                e.last.format(&format).to_string(),
                if e.blocked { "blocked" } else { "okay" },
                e.count,
                e.ip
            ));
        }
        Ok(())
    })
}

fn flush(ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.core_arc().iptrk().reset(None).await?;
        ctx.outln("IPtrk flushed");
        Ok(())
    })
}

fn remove(ctx: &mut Ctx, args: Vec<String>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let value = arg(&args, 0);
        let ip = parse_remote(value)
            .ok_or_else(|| Error::invalid(format!("Invalid IP address: '{value}'")))?;

        if ctx.core_arc().iptrk().remove(ip).await? {
            ctx.outln("IP removed from IPtrk table");
        } else {
            ctx.outln("No such IP in IPtrk table");
        }
        Ok(())
    })
}

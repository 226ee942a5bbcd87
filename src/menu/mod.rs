//! Hierarchical command dispatch.
//!
//! A [`Menu`] is an ordered list of [`Entry`]s. Dispatch picks the entry
//! named by the first argument, checks its permission mask against the
//! context, enforces the argument bounds and hands the remaining arguments
//! to the handler. Sub-menu handlers re-enter [`Ctx::menu`].

mod batch;

pub use batch::split_line;

use std::{fmt, future::Future, pin::Pin};

use axum::http::StatusCode;
use tracing::{debug, info};

use crate::{
    context::Ctx,
    error::{Error, ErrorKind, Result},
    perms::Perm,
};

/// Prefix of the error returned for unknown commands.
pub const UNKNOWN_COMMAND: &str = "Unknown command: ";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Menu handler, gets the arguments that follow its own name.
pub type Handler = for<'a> fn(&'a mut Ctx, Vec<String>) -> BoxFuture<'a, Result<()>>;

#[derive(Clone)]
pub struct Entry {
    pub name: String,
    pub desc: String,
    pub args_min: usize,
    /// `None` for sub-menus and other variadic entries.
    pub args_max: Option<usize>,
    /// Argument descriptors, `name#type`.
    pub args: Vec<String>,
    pub perms: Perm,
    /// Absent on entries that are only resolved, never run.
    pub handler: Option<Handler>,
}

impl Entry {
    #[must_use]
    pub fn new(
        name: &str,
        handler: Handler,
        args_min: usize,
        args_max: usize,
        args: &[&str],
        perms: Perm,
        desc: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            args_min,
            args_max: Some(args_max),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            perms,
            handler: Some(handler),
        }
    }

    /// A sub-menu: unbounded arguments, listed as `[SUB]` in help.
    #[must_use]
    pub fn sub(name: &str, handler: Handler, perms: Perm, desc: &str) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            args_min: 0,
            args_max: None,
            args: Vec::new(),
            perms,
            handler: Some(handler),
        }
    }

    /// An entry without handler, produced for resolution only.
    #[must_use]
    pub fn leaf(name: &str, args: Vec<String>, perms: Perm, desc: String) -> Self {
        let nargs = args.len();
        Self {
            name: name.to_string(),
            desc,
            args_min: nargs,
            args_max: Some(nargs),
            args,
            perms,
            handler: None,
        }
    }

    #[must_use]
    pub fn is_sub(&self) -> bool {
        self.args_max.is_none() && self.args.is_empty()
    }

    fn help_opts(&self) -> String {
        if !self.args.is_empty() {
            self.args
                .iter()
                .map(|a| format!("<{}>", a.split('#').next().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(" ")
        } else if self.args_max.is_none() {
            "[SUB]".to_string()
        } else {
            String::new()
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("args_min", &self.args_min)
            .field("args_max", &self.args_max)
            .field("args", &self.args)
            .field("perms", &self.perms)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Menu {
    entries: Vec<Entry>,
}

impl Menu {
    #[must_use]
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn add(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Swaps the handler of `name`, used by applications to override a command.
    pub fn replace(&mut self, name: &str, handler: Handler) {
        if let Some(entry) = self.get_mut(name) {
            entry.handler = Some(handler);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    pub fn add_perms(&mut self, name: &str, perms: Perm) {
        if let Some(entry) = self.get_mut(name) {
            entry.perms |= perms;
        }
    }

    pub fn del_perms(&mut self, name: &str, perms: Perm) {
        if let Some(entry) = self.get_mut(name) {
            entry.perms = entry.perms.without(perms);
        }
    }

    pub fn set_perms(&mut self, name: &str, perms: Perm) {
        if let Some(entry) = self.get_mut(name) {
            entry.perms = perms;
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[must_use]
pub fn is_unknown_command(err: &Error) -> bool {
    let msg = err.to_string();
    msg.len() > UNKNOWN_COMMAND.len() && msg.starts_with(UNKNOWN_COMMAND)
}

impl Ctx {
    /// Runs a command from the root menu.
    ///
    /// # Errors
    /// Whatever the dispatch or the handler returns.
    pub async fn cmd(&mut self, args: Vec<String>) -> Result<()> {
        self.reset_loc();
        self.menu(args, crate::commands::main_menu()).await
    }

    /// [`Ctx::cmd`] for the front doors: a failure is reported in the
    /// output, sets a non-zero return code and, when it is an authorization
    /// failure, the unauthorized status.
    pub async fn run(&mut self, args: Vec<String>) -> bool {
        let Err(err) = self.cmd(args).await else {
            return true;
        };

        debug!("Command '{}' failed: {err}", self.loc());
        if self.return_code() == 0 {
            self.set_return_code(1);
        }
        if err.kind() == ErrorKind::Unauthorized {
            self.set_status(StatusCode::UNAUTHORIZED);
        }
        self.outln(format!("An error occurred: {}", err.user_message()));
        false
    }

    /// Runs `cmd` (space separated) followed by `args` and returns the
    /// buffered output next to the result.
    pub async fn cmd_out(&mut self, cmd: &str, args: Vec<String>) -> (String, Result<()>) {
        let mut line: Vec<String> = if cmd.is_empty() {
            Vec::new()
        } else {
            cmd.split(' ').map(str::to_string).collect()
        };
        line.extend(args);

        let result = self.cmd(line).await;
        (self.buffered(), result)
    }

    /// Resolves `args` to a leaf without running any handler.
    ///
    /// # Errors
    /// The dispatch errors of [`Ctx::menu`].
    pub async fn walk_menu(&mut self, args: Vec<String>) -> Result<Option<Entry>> {
        self.walked = None;
        self.walk_only = true;

        let result = self.cmd(args).await;

        self.walk_only = false;
        result.map(|()| self.walked.take())
    }

    /// Dispatches `args` into `menu`.
    ///
    /// # Errors
    /// Unknown commands, permission failures, argument count violations or
    /// the handler's own error.
    pub async fn menu(&mut self, args: Vec<String>, mut menu: Menu) -> Result<()> {
        let Some((entry, rest)) = self.locate(args, &mut menu).await? else {
            return Ok(());
        };

        if self.walk_only && !entry.is_sub() {
            self.walked = Some(entry);
            return Ok(());
        }

        let handler = entry
            .handler
            .ok_or_else(|| Error::internal(format!("No handler for '{}'", self.loc())))?;
        handler(self, rest).await
    }

    /// Like [`Ctx::menu`] but returns the matched entry and its arguments
    /// instead of running it. Used for menus generated from descriptor
    /// tables whose entries have no handler. `None` after help was shown.
    ///
    /// # Errors
    /// As [`Ctx::menu`].
    pub async fn resolve(
        &mut self,
        args: Vec<String>,
        mut menu: Menu,
    ) -> Result<Option<(Entry, Vec<String>)>> {
        let found = self.locate(args, &mut menu).await?;

        if self.walk_only {
            if let Some((entry, _)) = &found {
                self.walked = Some(entry.clone());
            }
            return Ok(None);
        }

        Ok(found)
    }

    async fn locate(
        &mut self,
        args: Vec<String>,
        menu: &mut Menu,
    ) -> Result<Option<(Entry, Vec<String>)>> {
        let hooks = self.core().hooks();
        hooks.menu_override(self, menu);

        let cmd = args
            .first()
            .filter(|a| !a.is_empty())
            .map_or_else(|| "help".to_string(), |a| a.to_lowercase());

        if cmd == "help" {
            if self.walk_only {
                return Err(Error::invalid("help not allowed during menuwalk"));
            }
            self.help(menu).await;
            return Ok(None);
        }

        let Some(entry) = menu.get(&cmd).cloned() else {
            let loc = self.loc();
            return Err(Error::invalid(if loc.is_empty() {
                format!("{UNKNOWN_COMMAND}{cmd}")
            } else {
                format!("{UNKNOWN_COMMAND}{loc} {cmd}")
            }));
        };

        self.push_loc(&entry.name);

        if let Err(err) = self.check_perms(&format!("Menu({})", entry.name), entry.perms).await {
            let who = self
                .user()
                .map_or_else(|| "<<notloggedin>>".to_string(), |u| u.username().to_string());
            info!("User {who} tried access to command '{}': {err}", self.loc());
            self.set_status(StatusCode::UNAUTHORIZED);
            return Err(err);
        }

        let rest: Vec<String> = args.into_iter().skip(1).collect();

        // Leaves are resolved before arity is known during a walk.
        if self.walk_only && !entry.is_sub() {
            return Ok(Some((entry, rest)));
        }

        if rest.len() < entry.args_min {
            return Err(Error::invalid(format!(
                "Not enough arguments for '{}' (got {}, need at least {})",
                self.loc(),
                rest.len(),
                entry.args_min
            )));
        }

        if let Some(max) = entry.args_max {
            if rest.len() > max {
                return Err(Error::invalid(format!(
                    "Too many arguments for '{}' (got {}, but want a maximum of {max})",
                    self.loc(),
                    rest.len()
                )));
            }
        }

        Ok(Some((entry, rest)))
    }

    async fn help(&mut self, menu: &Menu) {
        let app = self.core().config().app_name().to_string();
        let loc = self.loc().to_string();

        if loc.is_empty() {
            self.outln(format!("{app} Help"));
        } else {
            self.outln(format!("{app} Help for: \"{loc}\""));
        }

        let who = match self.user() {
            Some(user) => {
                let badge = if self.is_sysadmin() {
                    " [sysadmin]"
                } else if user.can_be_sysadmin() {
                    " [NOT sysadmin]"
                } else {
                    ""
                };
                format!("User: {}{badge}", user.username())
            }
            None => "User: [Not authenticated]".to_string(),
        };
        self.outln(who);
        self.outln("");

        if loc.is_empty() {
            self.out(format!(
                "Welcome to the {app} menu system which is command line interface (CLI) based.\n\
                 Note that when a command is not in the help menu the selected user might not have permissions for it.\n\
                 \n\
                 Each section, items marked [SUB], has its own 'help' command.\n\
                 \n\
                 The following commands are available on the root level:\n"
            ));
        }

        for entry in menu.entries() {
            if entry.perms.contains(Perm::HIDDEN) {
                continue;
            }

            let what = format!("Menu({})/help", entry.name);
            if self.check_perms(&what, entry.perms).await.is_err() {
                continue;
            }

            self.outln(format!(
                " {:<20} {:<20} {:<20}",
                entry.name,
                entry.help_opts(),
                entry.desc
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &mut Ctx, _args: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn sample() -> Menu {
        Menu::new(vec![
            Entry::new("whoami", noop, 0, 0, &[], Perm::NONE, "Who am I"),
            Entry::new(
                "login",
                noop,
                2,
                3,
                &["username#ident", "password#password", "twofactor#int"],
                Perm::GUEST,
                "Login",
            ),
            Entry::sub("system", noop, Perm::USER, "System"),
        ])
    }

    #[test]
    fn help_options() {
        let menu = sample();
        assert_eq!(menu.get("whoami").unwrap().help_opts(), "");
        assert_eq!(
            menu.get("login").unwrap().help_opts(),
            "<username> <password> <twofactor>"
        );
        assert_eq!(menu.get("system").unwrap().help_opts(), "[SUB]");
        assert!(menu.get("system").unwrap().is_sub());
        assert!(!menu.get("login").unwrap().is_sub());
    }

    #[test]
    fn edit_entries() {
        let mut menu = sample();
        menu.add_perms("whoami", Perm::HIDDEN);
        assert!(menu.get("whoami").unwrap().perms.contains(Perm::HIDDEN));
        menu.del_perms("whoami", Perm::HIDDEN);
        assert_eq!(menu.get("whoami").unwrap().perms, Perm::NONE);
        menu.set_perms("login", Perm::NOBODY);
        assert_eq!(menu.get("login").unwrap().perms, Perm::NOBODY);
        menu.remove("system");
        assert!(menu.get("system").is_none());
        assert_eq!(menu.entries().len(), 2);
    }

    #[test]
    fn leaf_arity_follows_args() {
        let entry = Entry::leaf(
            "descr",
            vec!["descr#string".to_string()],
            Perm::USER_SELF,
            "Description".to_string(),
        );
        assert_eq!(entry.args_min, 1);
        assert_eq!(entry.args_max, Some(1));
        assert!(entry.handler.is_none());
    }

    #[test]
    fn unknown_command_detection() {
        assert!(is_unknown_command(&Error::invalid("Unknown command: system foo")));
        assert!(!is_unknown_command(&Error::invalid("Unknown command: ")));
        assert!(!is_unknown_command(&Error::invalid("Not a group admin")));
    }
}

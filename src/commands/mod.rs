//! The command tree served by both front doors.

mod group;
mod iptrk;
mod password;
mod system;
mod twofactor;
mod user;

use crate::{
    context::Ctx,
    error::{Error, Result},
    menu::{Entry, Menu},
    perms::Perm,
};

/// The root menu.
#[must_use]
pub fn main_menu() -> Menu {
    Menu::new(vec![
        Entry::sub("system", system::enter, Perm::NONE, "System commands"),
        Entry::sub("user", user::enter, Perm::NONE, "User commands"),
        Entry::sub("group", group::enter, Perm::USER, "Group commands"),
    ])
}

/// Argument `n`, empty when absent.
fn arg(args: &[String], n: usize) -> &str {
    args.get(n).map_or("", String::as_str)
}

fn int_arg(args: &[String], n: usize, what: &str) -> Result<i64> {
    let value = arg(args, n);
    value
        .parse()
        .map_err(|_| Error::invalid(format!("Invalid {what}: '{value}'")))
}

/// Rearranges `[help] <subject> [<property> ...]` into the order the
/// generated menu expects: `<property> <subject> ...`.
fn subject_args(args: &[String]) -> (Option<String>, Vec<String>) {
    let (help, rest) = match args.split_first() {
        Some((first, rest)) if first.eq_ignore_ascii_case("help") => (true, rest),
        _ => (false, args),
    };

    let Some((subject, rest)) = rest.split_first() else {
        return (None, Vec::new());
    };

    let mut out = Vec::with_capacity(rest.len() + 1);
    match rest.split_first() {
        Some((property, values)) if !help => {
            out.push(property.clone());
            out.push(subject.clone());
            out.extend(values.iter().cloned());
        }
        _ => out.push("help".to_string()),
    }

    (Some(subject.clone()), out)
}

/// Standard reply of the generated `set` commands.
fn report_set(ctx: &mut Ctx, column: &str, changed: bool) {
    if changed {
        ctx.outln(format!("Updated {column}"));
    } else {
        ctx.outln(format!(
            "Value for {column} was already set to the requested value"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_entries() {
        let menu = main_menu();
        let names: Vec<&str> = menu.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["system", "user", "group"]);
        assert!(menu.entries().iter().all(Entry::is_sub));
    }

    #[test]
    fn argument_helpers() {
        let args = vec!["7".to_string(), "x".to_string()];
        assert_eq!(arg(&args, 1), "x");
        assert_eq!(arg(&args, 5), "");
        assert_eq!(int_arg(&args, 0, "id").unwrap(), 7);
        assert_eq!(
            int_arg(&args, 1, "id").unwrap_err().to_string(),
            "Invalid id: 'x'"
        );
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn subject_arguments_are_reordered() {
        assert_eq!(
            subject_args(&strings(&["alice", "descr", "Alice A"])),
            (Some("alice".to_string()), strings(&["descr", "alice", "Alice A"]))
        );
        assert_eq!(
            subject_args(&strings(&["alice"])),
            (Some("alice".to_string()), strings(&["help"]))
        );
        assert_eq!(
            subject_args(&strings(&["help", "alice", "descr"])),
            (Some("alice".to_string()), strings(&["help"]))
        );
        assert_eq!(subject_args(&strings(&["help"])), (None, Vec::new()));
        assert_eq!(subject_args(&[]), (None, Vec::new()));
    }
}

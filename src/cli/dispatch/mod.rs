use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;

use crate::{
    cli::{
        actions::{cli, cmd, serve, Action},
        commands::{ARG_ARGS, CLI, CMD, SERVE},
    },
    Config,
};

const TOKEN_FILE: &str = ".warden_token";

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((SERVE, sub)) => Ok(Action::Serve(serve::Args {
            port: sub.get_one::<u16>("port").copied().unwrap_or(8080),
            dsn: dsn(sub)?,
            config: config(sub),
        })),
        Some((CMD, sub)) => Ok(Action::Cmd(cmd::Args {
            dsn: dsn(sub)?,
            config: config(sub),
            args: menu_args(sub),
        })),
        Some((CLI, sub)) => {
            let token_file = match sub.get_one::<String>("token-file") {
                Some(path) => PathBuf::from(path),
                None => dirs::home_dir()
                    .context("could not find the home directory, use --token-file")?
                    .join(TOKEN_FILE),
            };

            Ok(Action::Cli(cli::Args {
                server: sub
                    .get_one::<String>("server")
                    .cloned()
                    .context("missing required argument: --server")?,
                token_file,
                diagnostics: sub.get_one::<String>("diagnostics").map(String::as_str)
                    != Some("off"),
                args: menu_args(sub),
            }))
        }
        _ => anyhow::bail!("missing subcommand, try --help"),
    }
}

fn dsn(matches: &ArgMatches) -> Result<SecretString> {
    matches
        .get_one::<String>("dsn")
        .map(|dsn| SecretString::from(dsn.as_str()))
        .context("missing required argument: --dsn")
}

fn menu_args(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>(ARG_ARGS)
        .map(|args| args.cloned().collect())
        .unwrap_or_default()
}

fn config(matches: &ArgMatches) -> Config {
    let mut config = Config::new();

    if let Some(name) = matches.get_one::<String>("app-name") {
        config = config.with_app_name(name.as_str());
    }
    if let Some(ttl) = matches.get_one::<u64>("token-ttl-seconds") {
        config = config.with_token_ttl(Duration::from_secs(*ttl));
    }
    if let Some(max) = matches.get_one::<i32>("login-attempts-max") {
        config = config.with_login_attempts_max(*max);
    }

    let iptrk_max = matches
        .get_one::<i32>("iptrk-max")
        .copied()
        .unwrap_or_else(|| config.iptrk_max());
    let iptrk_decay = matches
        .get_one::<String>("iptrk-decay")
        .cloned()
        .unwrap_or_else(|| config.iptrk_decay().to_string());
    let iptrk_sweep = config.iptrk_sweep();
    config = config.with_iptrk(iptrk_max, iptrk_sweep, iptrk_decay);

    if let Some(dicts) = matches.get_many::<String>("weak-dict") {
        config = config.with_weak_dicts(dicts.map(PathBuf::from).collect());
    }

    if let Some(private) = matches.get_one::<String>("jwt-private-key") {
        let public = matches.get_one::<String>("jwt-public-key").map(PathBuf::from);
        config = config.with_jwt_keys(PathBuf::from(private), public);
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn serve_action_carries_settings() {
        temp_env::with_vars(
            [("WARDEN_DSN", None::<String>), ("WARDEN_WEAK_DICT", None)],
            || {
                let matches = commands::new().get_matches_from(vec![
                    "warden",
                    "serve",
                    "--dsn",
                    "postgres://warden:secret@db/warden",
                    "--iptrk-max",
                    "3",
                    "--weak-dict",
                    "/tmp/weak.txt",
                    "--token-ttl-seconds",
                    "60",
                ]);

                let Action::Serve(args) = handler(&matches).unwrap() else {
                    panic!("expected serve");
                };
                assert_eq!(args.port, 8080);
                assert_eq!(args.dsn.expose_secret(), "postgres://warden:secret@db/warden");
                assert_eq!(args.config.iptrk_max(), 3);
                assert_eq!(args.config.iptrk_decay(), "1 hour");
                assert_eq!(args.config.token_ttl(), Duration::from_secs(60));
                assert_eq!(args.config.weak_dicts(), [PathBuf::from("/tmp/weak.txt")]);
            },
        );
    }

    #[test]
    fn cli_action_uses_token_file() {
        temp_env::with_vars(
            [
                ("WARDEN_TOKENFILE", Some("/tmp/warden-test-token")),
                ("WARDEN_VERBOSE", Some("off")),
                ("WARDEN_SERVER", Some("https://warden.example")),
            ],
            || {
                let matches =
                    commands::new().get_matches_from(vec!["warden", "cli", "system", "whoami"]);

                let Action::Cli(args) = handler(&matches).unwrap() else {
                    panic!("expected cli");
                };
                assert_eq!(args.server, "https://warden.example");
                assert_eq!(args.token_file, PathBuf::from("/tmp/warden-test-token"));
                assert!(!args.diagnostics);
                assert_eq!(args.args, ["system", "whoami"]);
            },
        );
    }
}

use std::sync::Arc;

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use url::Url;

use crate::{api, Config, Core};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub config: Config,
}

/// Execute the serve action.
/// # Errors
/// Returns an error if the database or the token keys are unusable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let core = Core::connect(args.dsn.expose_secret(), args.config, None).await?;

    api::serve(args.port, Arc::new(core)).await
}

fn log_startup_args(args: &Args) {
    let weak_dicts = args
        .config
        .weak_dicts()
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>();

    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(args.dsn.expose_secret())),
        ("app_name", args.config.app_name().to_string()),
        (
            "jwt_private_key",
            args.config.jwt_private_key().display().to_string(),
        ),
        (
            "jwt_public_key",
            args.config
                .jwt_public_key()
                .map_or_else(|| "derived".to_string(), |p| p.display().to_string()),
        ),
        (
            "weak_dicts",
            if weak_dicts.is_empty() {
                "none".to_string()
            } else {
                weak_dicts.join(",")
            },
        ),
        ("token_ttl", format!("{}s", args.config.token_ttl().as_secs())),
        ("iptrk_max", args.config.iptrk_max().to_string()),
        ("iptrk_decay", args.config.iptrk_decay().to_string()),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

pub(crate) fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

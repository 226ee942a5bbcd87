use std::{process::ExitCode, sync::Arc};

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::{cli::actions::exit_code, Config, Core, Ctx};

#[derive(Debug)]
pub struct Args {
    pub dsn: SecretString,
    pub config: Config,
    pub args: Vec<String>,
}

/// Runs one menu command in-process as a loopback client, writing its output
/// straight to stdout.
/// # Errors
/// Returns an error if the database or the token keys are unusable.
pub async fn execute(args: Args) -> Result<ExitCode> {
    let core = Arc::new(Core::connect(args.dsn.expose_secret(), args.config, None).await?);
    let workers = core.start_workers();

    let mut ctx = Ctx::local(Arc::clone(&core));
    ctx.set_direct(Box::new(std::io::stdout()));

    debug!("Local command: {}", args.args.first().map_or("", String::as_str));
    ctx.run(args.args).await;
    let rc = ctx.return_code();

    drop(ctx);
    workers.stop().await;

    Ok(exit_code(rc))
}

use std::process::ExitCode;

use crate::cli::actions::{cli, cmd, serve, Action};
use anyhow::Result;

/// Execute the provided action.
// This is the single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<ExitCode> {
    match action {
        Action::Serve(args) => serve::execute(args).await.map(|()| ExitCode::SUCCESS),
        Action::Cmd(args) => cmd::execute(args).await,
        Action::Cli(args) => cli::execute(args).await,
    }
}

pub mod cli;
pub mod cmd;
pub mod serve;

// Internal "interpreter" for `Action`.
mod run;

use std::process::ExitCode;

#[derive(Debug)]
pub enum Action {
    Serve(serve::Args),
    Cmd(cmd::Args),
    Cli(cli::Args),
}

impl Action {
    /// Execute the action, yielding the process exit code.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        run::execute(self).await
    }
}

/// Exit code for a menu return code; anything outside `u8` reads as failure.
#[must_use]
pub fn exit_code(rc: i32) -> ExitCode {
    u8::try_from(rc).map_or(ExitCode::FAILURE, ExitCode::from)
}

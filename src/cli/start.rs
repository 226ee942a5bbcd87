use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;

/// Main entry point for the CLI - builds and returns the Action
///
/// # Errors
///
/// Returns an error if argument parsing, logging initialization, or action dispatch fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity = matches
        .get_one::<u8>(commands::logging::ARG_VERBOSITY)
        .copied()
        .unwrap_or(0);
    let json = matches.get_flag(commands::logging::ARG_LOG_JSON);

    telemetry::init(telemetry::verbosity_level(verbosity), json)?;

    let action = dispatch::handler(&matches)?;

    Ok(action)
}

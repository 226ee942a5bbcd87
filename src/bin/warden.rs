use std::process::ExitCode;

use anyhow::Result;
use warden::cli;

// Main function
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let action = cli::start()?;

    let code = action.execute().await?;

    Ok(code)
}

use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .help("Base URL of the warden server")
                .env("WARDEN_SERVER")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new("token-file")
                .long("token-file")
                .help("Where the session token is kept (default: ~/.warden_token)")
                .env("WARDEN_TOKENFILE"),
        )
        .arg(
            Arg::new("diagnostics")
                .long("diagnostics")
                .help("Print token handling notes on stderr")
                .env("WARDEN_VERBOSE")
                .default_value("on")
                .value_parser(["on", "off"]),
        )
}

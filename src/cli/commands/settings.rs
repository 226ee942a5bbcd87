use clap::{Arg, ArgAction, Command};

/// Arguments shared by every subcommand that opens the database.
#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("WARDEN_DSN")
                .required(true),
        )
        .arg(
            Arg::new("jwt-private-key")
                .long("jwt-private-key")
                .help("ES512 private key used to sign tokens (PEM)")
                .env("WARDEN_JWT_PRIVATE_KEY")
                .default_value("jwt.prv"),
        )
        .arg(
            Arg::new("jwt-public-key")
                .long("jwt-public-key")
                .help("ES512 public key used to verify tokens (PEM), derived from the private key when absent")
                .env("WARDEN_JWT_PUBLIC_KEY"),
        )
        .arg(
            Arg::new("weak-dict")
                .long("weak-dict")
                .help("Dictionary of weak passwords, one per line; may be repeated")
                .env("WARDEN_WEAK_DICT")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("app-name")
                .long("app-name")
                .help("Application name, used as token issuer and OTP label")
                .env("WARDEN_APP_NAME")
                .default_value("Warden"),
        )
        .arg(
            Arg::new("token-ttl-seconds")
                .long("token-ttl-seconds")
                .help("Lifetime of issued tokens in seconds")
                .env("WARDEN_TOKEN_TTL_SECONDS")
                .default_value("1200")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("login-attempts-max")
                .long("login-attempts-max")
                .help("Failed logins before an account is refused")
                .env("WARDEN_LOGIN_ATTEMPTS_MAX")
                .default_value("10")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("iptrk-max")
                .long("iptrk-max")
                .help("Failed logins per address before it is blocked")
                .env("WARDEN_IPTRK_MAX")
                .default_value("5")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("iptrk-decay")
                .long("iptrk-decay")
                .help("Idle period after which an address is forgotten (SQL interval)")
                .env("WARDEN_IPTRK_DECAY")
                .default_value("1 hour"),
        )
}

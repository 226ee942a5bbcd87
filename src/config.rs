//! Process-wide settings, assembled by the CLI and handed to [`crate::Core`].

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_APP_NAME: &str = "Warden";
const DEFAULT_TOKEN_TTL_SECONDS: u64 = 20 * 60;
const DEFAULT_REVOCATION_SWEEP_SECONDS: u64 = 30 * 60;
const DEFAULT_IPTRK_MAX: i32 = 5;
const DEFAULT_IPTRK_SWEEP_SECONDS: u64 = 10 * 60 * 60;
const DEFAULT_IPTRK_DECAY: &str = "1 hour";
const DEFAULT_LOGIN_ATTEMPTS_MAX: i32 = 10;
const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Clone, Debug)]
pub struct Config {
    app_name: String,
    token_ttl: Duration,
    revocation_sweep: Duration,
    iptrk_max: i32,
    iptrk_sweep: Duration,
    iptrk_decay: String,
    login_attempts_max: i32,
    check_two_factor: bool,
    time_format: String,
    weak_dicts: Vec<PathBuf>,
    jwt_private_key: PathBuf,
    jwt_public_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECONDS),
            revocation_sweep: Duration::from_secs(DEFAULT_REVOCATION_SWEEP_SECONDS),
            iptrk_max: DEFAULT_IPTRK_MAX,
            iptrk_sweep: Duration::from_secs(DEFAULT_IPTRK_SWEEP_SECONDS),
            iptrk_decay: DEFAULT_IPTRK_DECAY.to_string(),
            login_attempts_max: DEFAULT_LOGIN_ATTEMPTS_MAX,
            check_two_factor: true,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            weak_dicts: Vec::new(),
            jwt_private_key: PathBuf::from("jwt.prv"),
            jwt_public_key: None,
        }
    }

    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_revocation_sweep(mut self, every: Duration) -> Self {
        self.revocation_sweep = every;
        self
    }

    /// Rate limiter: maximum failures per address, sweep period and the
    /// decay interval in Postgres interval syntax (`"1 hour"`).
    #[must_use]
    pub fn with_iptrk(mut self, max: i32, sweep: Duration, decay: impl Into<String>) -> Self {
        self.iptrk_max = max;
        self.iptrk_sweep = sweep;
        self.iptrk_decay = decay.into();
        self
    }

    #[must_use]
    pub fn with_login_attempts_max(mut self, max: i32) -> Self {
        self.login_attempts_max = max;
        self
    }

    /// Development only.
    #[must_use]
    pub fn with_check_two_factor(mut self, check: bool) -> Self {
        self.check_two_factor = check;
        self
    }

    #[must_use]
    pub fn with_time_format(mut self, format: impl Into<String>) -> Self {
        self.time_format = format.into();
        self
    }

    #[must_use]
    pub fn with_weak_dicts(mut self, files: Vec<PathBuf>) -> Self {
        self.weak_dicts = files;
        self
    }

    #[must_use]
    pub fn with_jwt_keys(mut self, private: PathBuf, public: Option<PathBuf>) -> Self {
        self.jwt_private_key = private;
        self.jwt_public_key = public;
        self
    }

    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn revocation_sweep(&self) -> Duration {
        self.revocation_sweep
    }

    #[must_use]
    pub fn iptrk_max(&self) -> i32 {
        self.iptrk_max
    }

    #[must_use]
    pub fn iptrk_sweep(&self) -> Duration {
        self.iptrk_sweep
    }

    #[must_use]
    pub fn iptrk_decay(&self) -> &str {
        &self.iptrk_decay
    }

    #[must_use]
    pub fn login_attempts_max(&self) -> i32 {
        self.login_attempts_max
    }

    #[must_use]
    pub fn check_two_factor(&self) -> bool {
        self.check_two_factor
    }

    #[must_use]
    pub fn time_format(&self) -> &str {
        &self.time_format
    }

    #[must_use]
    pub fn weak_dicts(&self) -> &[PathBuf] {
        &self.weak_dicts
    }

    #[must_use]
    pub fn jwt_private_key(&self) -> &Path {
        &self.jwt_private_key
    }

    #[must_use]
    pub fn jwt_public_key(&self) -> Option<&Path> {
        self.jwt_public_key.as_deref()
    }
}

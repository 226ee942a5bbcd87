//! Process wide services shared by every [`crate::Ctx`].

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, instrument, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    hooks::{Hooks, NoHooks},
    iptrk::{IpStore, IpTracker},
    password::WeakDictionary,
    revocation::RevocationCache,
    system::{System, SystemConfig},
    token::{Claims, TokenService},
    worker::Worker,
};

#[derive(Debug)]
pub struct Core {
    pool: PgPool,
    config: Config,
    system: System,
    weak_dict: WeakDictionary,
    tokens: TokenService,
    revocation: Arc<RevocationCache>,
    iptrk: Arc<IpTracker>,
    hooks: Arc<dyn Hooks>,
    started: DateTime<Utc>,
}

impl Core {
    /// Assembles a core on an existing pool and loads the system settings.
    /// Settings that fail to load leave the conservative defaults in place.
    ///
    /// # Errors
    /// Unreadable weak password dictionaries.
    pub async fn new(
        pool: PgPool,
        config: Config,
        tokens: TokenService,
        hooks: Option<Arc<dyn Hooks>>,
    ) -> Result<Self> {
        let weak_dict = WeakDictionary::load(config.weak_dicts())
            .map_err(|err| Error::internal(format!("{err:#}")))?;
        if !weak_dict.is_empty() {
            info!("Weak password dictionary: {}", weak_dict.details());
        }

        let iptrk = IpTracker::new(IpStore::new(
            pool.clone(),
            config.iptrk_max(),
            config.iptrk_decay(),
        ));

        let core = Self {
            revocation: Arc::new(RevocationCache::new(pool.clone())),
            iptrk: Arc::new(iptrk),
            system: System::new(SystemConfig::default()),
            hooks: hooks.unwrap_or_else(|| Arc::new(NoHooks)),
            started: Utc::now(),
            pool,
            config,
            weak_dict,
            tokens,
        };

        if let Err(err) = core.refresh_system().await {
            warn!("Could not load system settings, using defaults: {err}");
        }

        Ok(core)
    }

    /// Connects to `dsn`, loads the token keys and builds the core.
    ///
    /// # Errors
    /// Connection, key or dictionary failures.
    #[instrument(skip_all)]
    pub async fn connect(
        dsn: &str,
        config: Config,
        hooks: Option<Arc<dyn Hooks>>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        let tokens = TokenService::load(&config)?;
        Ok(Self::new(pool, config, tokens, hooks).await?)
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn system(&self) -> &System {
        &self.system
    }

    #[must_use]
    pub fn weak_dict(&self) -> &WeakDictionary {
        &self.weak_dict
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn revocation(&self) -> &Arc<RevocationCache> {
        &self.revocation
    }

    #[must_use]
    pub fn iptrk(&self) -> &Arc<IpTracker> {
        &self.iptrk
    }

    #[must_use]
    pub fn hooks(&self) -> Arc<dyn Hooks> {
        Arc::clone(&self.hooks)
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Reloads the settings table.
    ///
    /// # Errors
    /// The store or validation error; defaults are installed in that case.
    pub async fn refresh_system(&self) -> Result<()> {
        self.system
            .refresh(&self.pool, self.config.time_format())
            .await
    }

    /// Validates `token` including the revocation list.
    ///
    /// # Errors
    /// `Unauthorized` for invalid or revoked tokens, or the store error.
    pub async fn parse_token(&self, token: &str, audience: Option<&str>) -> Result<(Claims, bool)> {
        let (claims, expsoon) = self.tokens.parse(token, audience)?;

        if self.revocation.is_revoked(token, &claims).await? {
            return Err(Error::unauthorized("Token has been revoked"));
        }

        Ok((claims, expsoon))
    }

    /// Starts the revocation sweeper and the IP tracker.
    #[must_use]
    pub fn start_workers(&self) -> Workers {
        Workers {
            workers: vec![
                self.revocation.start_sweeper(self.config.revocation_sweep()),
                self.iptrk.start(self.config.iptrk_sweep()),
            ],
        }
    }
}

/// Running background workers of a core.
#[derive(Debug, Default)]
pub struct Workers {
    workers: Vec<Worker>,
}

impl Workers {
    /// Stops every worker, in reverse start order.
    pub async fn stop(mut self) {
        while let Some(worker) = self.workers.pop() {
            let name = worker.name();
            worker.stop().await;
            info!("Stopped {name}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{sync::Arc, time::Duration};

    use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

    use super::Core;
    use crate::{config::Config, token::TokenService};

    /// A core whose store is unreachable; settings fall back to defaults.
    pub(crate) async fn offline_core() -> Arc<Core> {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("invalid")
            .database("invalid")
            .ssl_mode(PgSslMode::Disable);
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy_with(options);

        Arc::new(
            Core::new(pool, Config::new(), TokenService::ephemeral("Warden"), None)
                .await
                .unwrap(),
        )
    }
}

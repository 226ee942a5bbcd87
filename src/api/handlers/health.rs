use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info_span, Instrument};

use crate::{Core, GIT_COMMIT_HASH};

const HEALTH_DB_TIMEOUT_SECONDS: u64 = 2;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    pub name: String,
    pub version: String,
    pub build: String,
    pub database: String,
}

fn short_hash() -> &'static str {
    GIT_COMMIT_HASH.get(0..7).unwrap_or(GIT_COMMIT_HASH)
}

async fn database_ok(core: &Core) -> bool {
    let ping = async {
        let mut conn = core.pool().acquire().await?;
        conn.ping().await
    }
    .instrument(info_span!("db.ping", db.system = "postgresql"));

    match timeout(Duration::from_secs(HEALTH_DB_TIMEOUT_SECONDS), ping).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!("Database ping failed: {err}");
            false
        }
        Err(_) => {
            error!("Database ping timed out");
            false
        }
    }
}

// axum handler for health
pub async fn health(Extension(core): Extension<Arc<Core>>) -> impl IntoResponse {
    let db_ok = database_ok(&core).await;
    debug!("health: database ok = {db_ok}");

    let body = Json(Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: GIT_COMMIT_HASH.to_string(),
        database: if db_ok { "ok" } else { "error" }.to_string(),
    });

    let mut headers = HeaderMap::new();
    let app = format!(
        "{}:{}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_hash()
    );
    if let Ok(value) = HeaderValue::from_str(&app) {
        headers.insert("X-App", value);
    }

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, headers, body)
}

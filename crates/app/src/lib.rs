#![forbid(unsafe_code)]

//! Process wiring: environment configuration, component assembly, and the
//! shutdown sequence (flag, per-room final flush, socket close, exit).

use std::net::SocketAddr;
use std::sync::Arc;

use coderoom_api::{router, ApiState, ShutdownFlag};
use coderoom_auth::TokenKeys;
use coderoom_core::protocol::CLOSE_SERVICE_RESTART;
use coderoom_realtime::RoomRegistry;
use coderoom_storage::{MongoGateway, ProjectStore};
use url::Url;

/// Fallback secret outside production, so `cargo run` works with nothing
/// but PORT set.
const DEV_JWT_SECRET: &str = "coderoom-dev-secret";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub mongodb_uri: Option<String>,
    pub cors_origins: Vec<String>,
    pub production: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_values(
            std::env::var("PORT").ok(),
            std::env::var("JWT_SECRET").ok(),
            std::env::var("MONGODB_URI").ok(),
            std::env::var("CORS_ORIGINS").ok(),
            std::env::var("APP_ENV").ok(),
        )
    }

    fn from_values(
        port: Option<String>,
        jwt_secret: Option<String>,
        mongodb_uri: Option<String>,
        cors_origins: Option<String>,
        app_env: Option<String>,
    ) -> anyhow::Result<Self> {
        let port = port
            .ok_or_else(|| anyhow::anyhow!("PORT must be set"))?
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| anyhow::anyhow!("PORT must be a positive integer"))?;

        let production = app_env.as_deref() == Some("production");
        let jwt_secret = match jwt_secret.filter(|secret| !secret.is_empty()) {
            Some(secret) => secret,
            None if production => {
                return Err(anyhow::anyhow!("JWT_SECRET must be set in production"));
            }
            None => DEV_JWT_SECRET.to_owned(),
        };

        let mongodb_uri = mongodb_uri.filter(|uri| !uri.is_empty());
        let cors_origins = parse_origins(cors_origins)?;

        Ok(Self {
            port,
            jwt_secret,
            mongodb_uri,
            cors_origins,
            production,
        })
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    if !config.production && config.jwt_secret == DEV_JWT_SECRET {
        tracing::warn!("JWT_SECRET not set, using the development secret");
    }

    let store: Arc<dyn ProjectStore> = Arc::new(MongoGateway::new(config.mongodb_uri.clone()));
    if !store.ensure_connection().await {
        tracing::warn!("no document store configured, state is ephemeral");
    }

    let keys = Arc::new(TokenKeys::new(config.jwt_secret.as_bytes()));
    let registry = RoomRegistry::new(Arc::clone(&store));
    let state = ApiState::new(keys, store, registry.clone())
        .with_allowed_origins(config.cors_origins.clone());
    let shutdown = state.shutdown_flag();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_sequence(shutdown, registry))
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Resolves once the signal arrived and every live room has been flushed
/// and its sockets closed; completing it lets the server stop accepting.
async fn shutdown_sequence(shutdown: ShutdownFlag, registry: RoomRegistry) {
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.begin();
    registry
        .shutdown_all(CLOSE_SERVICE_RESTART, "server shutting down")
        .await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                tracing::error!(%error, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn parse_origins(value: Option<String>) -> anyhow::Result<Vec<String>> {
    let mut origins = Vec::new();
    for entry in value.unwrap_or_default().split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = Url::parse(entry)
            .map_err(|error| anyhow::anyhow!("invalid origin {entry:?}: {error}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(anyhow::anyhow!(
                "invalid origin {entry:?}: must use http or https"
            ));
        }
        origins.push(entry.to_owned());
    }
    Ok(origins)
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    fn config(
        port: Option<&str>,
        secret: Option<&str>,
        origins: Option<&str>,
        app_env: Option<&str>,
    ) -> anyhow::Result<AppConfig> {
        AppConfig::from_values(
            port.map(str::to_owned),
            secret.map(str::to_owned),
            None,
            origins.map(str::to_owned),
            app_env.map(str::to_owned),
        )
    }

    #[test]
    fn port_is_required_and_positive() {
        assert!(config(None, Some("s"), None, None).is_err());
        assert!(config(Some("0"), Some("s"), None, None).is_err());
        assert!(config(Some("nope"), Some("s"), None, None).is_err());
        assert_eq!(
            config(Some("8080"), Some("s"), None, None)
                .expect("parse config")
                .port,
            8080
        );
    }

    #[test]
    fn production_requires_a_jwt_secret() {
        let error = config(Some("8080"), None, None, Some("production"))
            .expect_err("missing secret should fail");
        assert!(error.to_string().contains("JWT_SECRET"));

        let dev = config(Some("8080"), None, None, None).expect("parse config");
        assert!(!dev.jwt_secret.is_empty());
        assert!(!dev.production);
    }

    #[test]
    fn cors_origins_parse_as_a_comma_list() {
        let parsed = config(
            Some("8080"),
            Some("s"),
            Some("https://app.example.com, http://localhost:5173 ,"),
            None,
        )
        .expect("parse config");
        assert_eq!(
            parsed.cors_origins,
            vec!["https://app.example.com", "http://localhost:5173"]
        );
    }

    #[test]
    fn empty_cors_list_means_allow_all() {
        let parsed = config(Some("8080"), Some("s"), None, None).expect("parse config");
        assert!(parsed.cors_origins.is_empty());
    }

    #[test]
    fn rejects_non_http_origins() {
        let error = config(Some("8080"), Some("s"), Some("ftp://files.example.com"), None)
            .expect_err("non-http origin should fail");
        assert!(error.to_string().contains("invalid origin"));
    }

    #[test]
    fn missing_mongodb_uri_is_ephemeral_mode() {
        let parsed = config(Some("8080"), Some("s"), None, None).expect("parse config");
        assert!(parsed.mongodb_uri.is_none());
    }
}

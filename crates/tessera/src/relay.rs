//! Running a relay from a [`RelayConfig`].

use std::future::Future;
use std::sync::Arc;

use tessera_store::SqliteRelayStore;
use tessera_sync::{Relay, RelayServer};
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::Result;

/// Open the configured store and bind the server.
pub async fn bind_relay(config: &RelayConfig) -> Result<RelayServer> {
    let store = match &config.database {
        Some(path) => SqliteRelayStore::open(path)?,
        None => SqliteRelayStore::open_memory()?,
    }
    .with_policy(config.policy()?);

    let relay = Relay::new(Arc::new(store));
    let server = RelayServer::bind(config.socket_addr(), Arc::new(relay)).await?;
    info!(
        name = %config.name,
        addr = %server.local_addr()?,
        database = ?config.database,
        "relay bound"
    );
    Ok(server)
}

/// Serve until `shutdown` resolves.
pub async fn run_relay_until(
    config: RelayConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let server = bind_relay(&config).await?;
    server.run_until(shutdown).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM on Unix.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Serve until [`shutdown_signal`] fires.
pub async fn run_relay_until_shutdown_signal(config: RelayConfig) -> Result<()> {
    run_relay_until(config, shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_on_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            port: 0,
            bind_addr: Some("127.0.0.1".parse().unwrap()),
            database: Some(dir.path().join("relay.db")),
            ..Default::default()
        };
        let server = bind_relay(&config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        server.run_until(async {}).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_stops_relay() {
        use std::time::Duration;
        use tokio::signal::unix::{signal, SignalKind};

        // Replaces the default action, which would kill the test process.
        let _term = signal(SignalKind::terminate()).unwrap();
        let config = RelayConfig {
            port: 0,
            bind_addr: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        let relay = tokio::spawn(run_relay_until_shutdown_signal(config));

        let stopped = tokio::time::timeout(Duration::from_secs(10), async {
            while !relay.is_finished() {
                std::process::Command::new("kill")
                    .args(["-TERM", &std::process::id().to_string()])
                    .status()
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(stopped.is_ok(), "relay still running after SIGTERM");
        relay.await.unwrap().unwrap();
    }
}

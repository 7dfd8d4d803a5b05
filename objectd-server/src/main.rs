//! Daemon entry point: load the config, open the tiers it names, run
//! the startup scan, start the promoter, then accept connections and
//! hand each one to its own [`Engine`] on its own thread.

use anyhow::{Context, Result};
use objectd::{
    config::ServerConfig,
    engine::{Engine, EngineConfig},
    manager::TierManager,
    tier::Tier,
};
use objectd_backends::DirectoryTier;
use std::{
    env,
    os::unix::{fs::PermissionsExt, net::UnixListener},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = env::args()
        .nth(1)
        .context("usage: objectd-server <config.toml>")?;
    let config = ServerConfig::from_file(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    let tiers: Vec<Arc<dyn Tier>> = config
        .tiers
        .iter()
        .map(|tier_config| {
            DirectoryTier::new(tier_config.clone()).map(|tier| tier as Arc<dyn Tier>)
        })
        .collect::<std::io::Result<_>>()
        .context("opening configured tiers")?;
    info!(count = tiers.len(), "tiers opened");

    let manager = Arc::new(TierManager::new(tiers, config.index_capacity, config.manager));
    manager.scan().context("scanning tiers at startup")?;

    spawn_promoter(manager.clone(), Duration::from_secs(config.promoter_interval_secs));

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("removing stale socket at {}", config.socket_path.display()))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding socket at {}", config.socket_path.display()))?;
    std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o660))
        .context("setting socket permissions")?;
    info!(path = %config.socket_path.display(), "listening");

    let engine_config = EngineConfig {
        idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
        max_pipeline: config.max_pipeline,
        ..EngineConfig::default()
    };

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let engine = Engine::new(manager.clone(), engine_config);
        std::thread::spawn(move || {
            if let Err(e) = engine.run(stream) {
                warn!(error = %e, "connection ended with an error");
            }
        });
    }

    Ok(())
}

/// Runs `promoter_tick` on a fixed interval for the life of the
/// process. Errors inside a tick are logged rather than propagated —
/// a stalled migration shouldn't take the daemon down.
fn spawn_promoter(manager: Arc<TierManager>, interval: Duration) {
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        manager.promoter_tick();
    });
}

// Core module declarations are in lib.rs
use replayd::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The main entry point for the replayd record-and-replay cache.
/// We use a standard synchronous `main` function here instead of
/// `#[tokio::main]` because we need to parse the configuration file
/// *before* building the async runtime to determine how many worker
/// threads the runtime should use.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Telemetry (Logging)
    telemetry::init_telemetry();

    // 2. Load Configuration (Synchronous)
    // This reads the path provided or defaults to `replayd.conf` and parses
    // the flat directive file into the `AppConfig` struct.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "replayd.conf".to_string());
    let cfg = config::load_config(&config_path);

    tracing::info!(
        "Starting replayd with {} worker threads... (Config: {})",
        cfg.workers,
        config_path
    );

    // 3. Build Tokio Runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .enable_all()
        .build()?;

    // 4. Start the Async Application Block
    rt.block_on(async {
        // A CancellationToken propagates shutdown signals to the accept loop.
        let shutdown_token = CancellationToken::new();

        let shutdown_token_signal = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received; initiating graceful shutdown...");
            shutdown_token_signal.cancel();
        });

        // Repository: the persistent key → response store.
        let repository: Arc<dyn store::Repository> = match cfg.store {
            config::StoreKind::Sqlite => Arc::new(store::sqlite::SqliteRepository::open(
                &cfg.sqlite_path,
                cfg.sqlite_timeout(),
            )?),
            config::StoreKind::Redis => Arc::new(store::redis::RedisRepository::new(
                cfg.redis_addr.clone(),
                cfg.redis_password.clone(),
                cfg.redis_db,
                cfg.redis_timeout(),
            )),
        };

        // Upstream origin: absent means cache misses answer 404.
        let upstream = if cfg.upstream.is_empty() {
            None
        } else {
            Some(upstream::UpstreamClient::new(
                &cfg.upstream,
                cfg.upstream_timeout(),
            )?)
        };

        let plugins = build_plugins(&cfg)?;

        let state = Arc::new(server::ServerState {
            repository: Some(Arc::clone(&repository)),
            upstream,
            options: server::ServerOptions {
                key_prefix: cfg.key_prefix.clone(),
                log_not_found: cfg.log_not_found,
                record_overwrite: cfg.record_overwrite,
                record_ignore_statuses: cfg.record_ignore_statuses.clone(),
                plugins,
            },
        });

        let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
        server::serve(listener, state, shutdown_token.clone()).await;

        if let Err(e) = repository.close().await {
            tracing::warn!("storage close failed: {}", e);
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

/// Assembles the plugin pipeline from the config. Declaration order is
/// execution order in both phases: request rewriters first, then bypass
/// rules, then the response-side decoder and dumper.
fn build_plugins(
    cfg: &config::AppConfig,
) -> Result<Vec<Box<dyn plugin::Plugin>>, Box<dyn std::error::Error>> {
    let mut plugins: Vec<Box<dyn plugin::Plugin>> = Vec::new();

    if !cfg.map_remote_file.is_empty() {
        plugins.push(Box::new(plugin::map_remote::MapRemote::from_file(
            &cfg.map_remote_file,
        )?));
    }
    if !cfg.map_local_file.is_empty() {
        plugins.push(Box::new(plugin::map_local::MapLocal::from_file(
            &cfg.map_local_file,
        )?));
    }
    if !cfg.rules_file.is_empty() {
        plugins.push(Box::new(plugin::rules::RuleSet::from_file(&cfg.rules_file)?));
    }
    if cfg.decode_responses {
        plugins.push(Box::new(plugin::decoder::Decoder::new()));
    }
    if !cfg.dump_file.is_empty() {
        plugins.push(Box::new(plugin::dumper::Dumper::new(
            &cfg.dump_file,
            cfg.dump_level,
        )));
    }

    Ok(plugins)
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to listen for Ctrl+C");
    }
}

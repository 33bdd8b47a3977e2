use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info, warn};

use marquee::actor::{ActorLoop, ActorPhase, LoopSettings};
use marquee::config::{ActorConfig, MarqueeConfig, WorkerConfig};
use marquee::handler::HandlerRegistry;
use marquee::logging;
use marquee::shutdown::{ShutdownController, ShutdownType};
use marquee_handler_tcp::{TcpHandler, TcpHandlerConfig};
use marquee_handler_worker::{WorkerPool, WorkerSettings};

use crate::args::ServeArgs;
use crate::lobby::{LobbyActor, LobbyMessage, Store, StoreWorker};

const DEFAULT_LISTEN: &str = "127.0.0.1:9100";
const DEFAULT_STORE_ALIAS: &str = "store";
const LOBBY_NET: u16 = 1;

fn expand(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::env(path)
        .map_err(|e| anyhow::anyhow!("Failed to expand '{}': {}", path, e))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Reads the config file (if any) and applies command line overrides on top.
pub fn load_config(args: &ServeArgs) -> Result<MarqueeConfig> {
    let mut config = match &args.config {
        Some(path) => MarqueeConfig::from_file(expand(path)?)?,
        None => MarqueeConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.tcp.listen = Some(listen.clone());
    }
    if config.tcp.listen.is_none() {
        config.tcp.listen = Some(DEFAULT_LISTEN.to_string());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.logging.log_dir = Some(expand(dir)?);
    }
    if args.log_stdout {
        config.logging.stdout = true;
    }
    if config.workers.is_empty() {
        config.workers.push(WorkerConfig {
            alias: DEFAULT_STORE_ALIAS.to_string(),
            ..WorkerConfig::default()
        });
    }
    if config.actor.name.is_empty() || config.actor.name == ActorConfig::default().name {
        config.actor.name = "lobby".to_string();
    }

    config.validate()?;
    Ok(config)
}

pub async fn start_server(args: &ServeArgs) -> Result<()> {
    let config = load_config(args)?;
    logging::init_from_config(&config.logging, "marquee_server.log")?;

    // Every pool shares one store; the lobby talks to the first.
    let store = Store::default();
    let reply_capacity = config.workers.iter().map(|pool| pool.reply_capacity).sum();
    let mut workers = WorkerPool::with_reply_capacity(reply_capacity);
    for pool in &config.workers {
        workers.add_pool(&pool.alias, pool.count, WorkerSettings::from(pool), |_| {
            StoreWorker::new(store.clone())
        })?;
    }
    let store_alias = config
        .workers
        .first()
        .map(|pool| pool.alias.clone())
        .unwrap_or_else(|| DEFAULT_STORE_ALIAS.to_string());

    let (mut tcp, outbound) = TcpHandler::new(TcpHandlerConfig::from_config(LOBBY_NET, &config));
    let addr = tcp.bind().await?;

    let lobby = LobbyActor::new(config.actor.name.clone(), outbound, workers, store_alias);
    let (actor_loop, handle) = ActorLoop::new(lobby, LoopSettings::from(&config.actor));
    let running = tokio::spawn(actor_loop.run());

    let mut registry: HandlerRegistry<LobbyMessage> = HandlerRegistry::new();
    registry.register(tcp);
    let mut shutdown = ShutdownController::new();
    let handlers = registry.start_all(handle.clone(), &mut shutdown);

    handle.wait_for_phase(ActorPhase::Running).await;
    info!("Marquee server '{}' listening on {}", handle.name(), addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Could not listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
            if let Err(e) = handle.quit().await {
                warn!("Lobby already gone: {}", e);
            }
        }
        _ = handle.wait_for_phase(ActorPhase::Terminated) => {}
    }
    let finished = running.await;

    shutdown.signal_shutdown(ShutdownType::Graceful).await;
    for handler in handlers {
        let _ = handler.await;
    }

    match finished {
        Ok(Ok((lobby, metrics))) => {
            info!(
                "Lobby stopped with {} connections after {} frames ({} messages, {} shed)",
                lobby.connection_count(),
                metrics.frames,
                metrics.messages_handled,
                metrics.messages_shed
            );
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Lobby failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Lobby task failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serve_args() -> ServeArgs {
        ServeArgs {
            config: None,
            listen: None,
            log_level: None,
            log_dir: None,
            log_stdout: false,
        }
    }

    #[test]
    fn test_defaults_without_config_file() {
        let config = load_config(&serve_args()).unwrap();
        assert_eq!(config.tcp.listen.as_deref(), Some(DEFAULT_LISTEN));
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].alias, DEFAULT_STORE_ALIAS);
        assert_eq!(config.actor.name, "lobby");
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tcp]\nlisten = \"127.0.0.1:7000\"\n\n[logging]\nlevel = \"warn\"\n\n[[worker]]\nalias = \"kv\"\ncount = 2"
        )
        .unwrap();

        let mut args = serve_args();
        args.config = Some(file.path().to_string_lossy().into_owned());
        args.log_level = Some("debug".to_string());
        let config = load_config(&args).unwrap();

        assert_eq!(config.tcp.listen.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].alias, "kv");
        assert_eq!(config.workers[0].count, 2);

        args.listen = Some("0.0.0.0:7001".to_string());
        let config = load_config(&args).unwrap();
        assert_eq!(config.tcp.listen.as_deref(), Some("0.0.0.0:7001"));
    }
}

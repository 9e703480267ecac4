mod agent_api;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parley_config::ParleyConfig;
use parley_core::{InboxEngine, RegistryConfig, SessionRegistry, SpeechSink};
use parley_dispatch::{DispatcherConfig, ToolDispatcher};
use parley_eventbus::{BrokerEventBus, BrokerEventBusConfig};
use parley_gateway::GatewayState;
use parley_protocol::ChoiceOption;
use parley_tts::{RecoveryPolicy, SpeechEngine, SpeechEngineConfig};
use parley_ui::Presenter;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ParleyConfig::load(default_config_path()).context("load configuration")?;

    let bus = Arc::new(BrokerEventBus::new(BrokerEventBusConfig {
        buffer_capacity: config.events.buffer_capacity,
    }));
    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        history_cap: config.session.history_cap,
    }));
    let speech = SpeechEngine::new(speech_config(&config), Arc::clone(&bus))
        .context("initialize speech engine")?;
    let engine = InboxEngine::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        Arc::new(speech.clone()) as Arc<dyn SpeechSink>,
    );
    let dispatcher = Arc::new(ToolDispatcher::new(
        Arc::clone(&engine),
        DispatcherConfig {
            extra_options: config
                .extra_options
                .iter()
                .map(|extra| ChoiceOption {
                    label: extra.label.clone(),
                    summary: extra.summary.clone(),
                    silent: extra.silent,
                })
                .collect(),
        },
        speech.settings(),
    ));

    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let router = parley_gateway::router(GatewayState {
        engine: Arc::clone(&engine),
        speech: speech.clone(),
        keys: keys_tx,
    })
    .merge(agent_api::router(Arc::clone(&dispatcher)));

    let bind = config.gateway.bind.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%bind, %err, "failed to bind gateway");
                return;
            }
        };
        tracing::info!(%bind, "broker listening");
        if let Err(err) = axum::serve(listener, router).await {
            error!(%err, "gateway server exited");
        }
    });

    spawn_maintenance(
        Arc::clone(&engine),
        speech.clone(),
        Duration::from_secs(config.session.stale_timeout_secs),
        Duration::from_secs(config.session.maintenance_interval_secs.max(1)),
    );

    Presenter::new(engine, keys_rx)
        .run()
        .await
        .context("presenter exited with error")?;
    Ok(())
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/parley/config.toml")
}

fn speech_config(config: &ParleyConfig) -> SpeechEngineConfig {
    SpeechEngineConfig {
        player_command: config.tts.player_command.clone(),
        generator_command: config.tts.generator_command.clone(),
        fallback_generator_command: config.tts.fallback_generator_command.clone(),
        voice: config.tts.voice.clone(),
        style: config.tts.style.clone(),
        speed: config.tts.speed,
        model: config.tts.model.clone(),
        cache_dir: config.tts.cache_dir.clone(),
        pregenerate_concurrency: config.tts.pregenerate_concurrency,
        recovery: RecoveryPolicy {
            max_attempts: config.recovery.max_attempts,
            cooldown: Duration::from_secs(config.recovery.cooldown_secs),
            commands: config.recovery.commands.clone(),
        },
    }
}

/// Stale-session pruning and audio-health bookkeeping, every 30 s by
/// default.
fn spawn_maintenance(
    engine: Arc<InboxEngine>,
    speech: SpeechEngine,
    stale_timeout: Duration,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = engine.prune_stale(stale_timeout);
            if !removed.is_empty() {
                debug!(count = removed.len(), "pruned stale sessions");
            }
            speech.health_tick();
        }
    });
}

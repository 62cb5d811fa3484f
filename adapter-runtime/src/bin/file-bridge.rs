//! File bridge: polls a source directory and writes batches to a target
//!
//! ```toml
//! [source]
//! name = "inbox"
//! directory = "/data/in"
//! filePattern = ".*\\.csv"
//! cursorColumn = "modifiedMs"
//! duplicateStrategy = "key+fingerprint"
//! pollingIntervalMs = 5000
//!
//! [target]
//! name = "outbox"
//! directory = "/data/out"
//! batchStrategy = "mixed"
//! batchSize = 100
//! batchTimeoutMs = 2000
//! backupEnabled = true
//! ```

use adapter_runtime::{
    bindings::{FileBinding, FileBindingConfig},
    AdapterConfig, AdapterManager, AdapterMode, AdapterRuntime, Error, ItemHandler, Payload,
    RawItem,
};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct EndpointConfig {
    #[serde(flatten)]
    adapter: AdapterConfig,
    #[serde(flatten)]
    file: FileBindingConfig,
}

#[derive(Debug, Deserialize)]
struct BridgeConfig {
    source: EndpointConfig,
    target: EndpointConfig,
}

/// Forwards every polled file to the target adapter
struct Forwarder {
    target: Arc<AdapterRuntime<FileBinding>>,
}

#[async_trait]
impl ItemHandler for Forwarder {
    async fn handle(&self, item: &RawItem) -> adapter_runtime::Result<()> {
        let payload = Payload::new(item.content.clone()).with_header("fileName", item.key.clone());
        let result = self.target.send(payload).await;
        if result.is_success() {
            Ok(())
        } else {
            Err(Error::Processing(result.message().to_string()))
        }
    }
}

fn runtime(mode: AdapterMode, endpoint: EndpointConfig) -> anyhow::Result<Arc<AdapterRuntime<FileBinding>>> {
    let binding = FileBinding::new(mode, endpoint.file, &endpoint.adapter)?;
    Ok(Arc::new(AdapterRuntime::new(binding, endpoint.adapter)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FILE_BRIDGE_CONFIG").ok())
        .unwrap_or_else(|| "file-bridge.toml".to_string());
    let content = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let config: BridgeConfig = toml::from_str(&content).with_context(|| format!("parsing {}", path))?;

    tracing::info!("Starting file bridge with {}", path);

    let source = runtime(AdapterMode::Sender, config.source)?;
    let target = runtime(AdapterMode::Receiver, config.target)?;
    source.initialize().await?;
    target.initialize().await?;

    let manager = AdapterManager::new();
    manager.register(source.clone()).await?;
    manager.register(target.clone()).await?;

    for (id, result) in manager.test_all().await {
        tracing::info!("Connection test {}: {}", id, result.message());
    }
    for adapter in [source.describe(), target.describe()] {
        tracing::info!("{}", adapter);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let forwarder = Forwarder {
        target: target.clone(),
    };
    let mut ticker = tokio::time::interval(source.config().polling_interval());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let polled = source.poll_with(&forwarder).await;
                if !polled.is_success() {
                    tracing::warn!("Poll failed: {}", polled.message());
                } else if polled.payload().map_or(false, |items| !items.is_empty()) {
                    tracing::info!("{}", polled.message());
                }

                let flushed = target.flush_if_due().await;
                if !flushed.is_success() {
                    tracing::warn!("Flush failed: {}", flushed.message());
                }
            }
        }
    }

    tracing::info!("Shutting down file bridge");
    let destroyed = manager.destroy_all().await;
    tracing::info!("Destroyed {} adapters", destroyed);
    Ok(())
}

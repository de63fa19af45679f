//! Last published configuration per provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::dynamic::{Configuration, Message};

/// Every provider's configuration, as served by `/api/rawdata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawData {
    pub providers: BTreeMap<String, Arc<Configuration>>,
}

/// Holds the latest message from each provider. Each message fully replaces
/// what the provider published before.
#[derive(Debug, Default)]
pub struct ConfigStore {
    providers: DashMap<String, Arc<Configuration>>,
    raw: ArcSwap<RawData>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, message: Message) {
        let Message {
            provider_name,
            configuration,
        } = message;
        self.providers.insert(provider_name, Arc::new(configuration));

        let providers = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.raw.store(Arc::new(RawData { providers }));
    }

    pub fn provider(&self, name: &str) -> Option<Arc<Configuration>> {
        self.providers.get(name).map(|entry| entry.value().clone())
    }

    /// A consistent view of all providers.
    pub fn raw(&self) -> Arc<RawData> {
        self.raw.load_full()
    }

    /// Consume published messages until shutdown or until every publisher
    /// has gone away.
    pub async fn consume(
        &self,
        mut messages: mpsc::Receiver<Message>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => {
                        tracing::info!(
                            provider = %message.provider_name,
                            empty = message.configuration.is_empty(),
                            "Configuration received"
                        );
                        self.apply(message);
                    }
                    None => {
                        tracing::info!("All providers stopped, aggregator exiting");
                        return;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Aggregator received shutdown signal, exiting loop");
                    return;
                }
            }
        }
    }
}

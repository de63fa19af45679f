//! The per-provider watch loop.
//!
//! # States
//! ```text
//! Connecting ──ok──▶ Streaming ──transport error──▶ Retrying
//!     ▲                                               │
//!     └──────────────── backoff sleep ◀───────────────┘
//! ```
//!
//! Every suspension point (connect, enumeration, event read, poll tick,
//! publish, backoff sleep) races the shutdown broadcast.

use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};

use crate::discovery::{Backend, BackendError, ChangeSource, Connector, EventStream};
use crate::dynamic::Message;
use crate::observability::metrics;
use crate::provider::endpoint::{HostResolver, SystemResolver};
use crate::provider::Reconciler;
use crate::resilience::{Backoff, JobBackoff};

/// How a Connecting → Streaming run ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    /// Watching is disabled and the single pass was published.
    Done,
    /// The output channel has no receiver left.
    ConsumerGone,
}

pub struct WatchLoop<C, R = SystemResolver> {
    reconciler: Reconciler<R>,
    connector: C,
    watch: bool,
    backoff: JobBackoff,
    output: mpsc::Sender<Message>,
}

impl<C, R> WatchLoop<C, R>
where
    C: Connector,
    R: HostResolver + Sync,
{
    pub fn new(
        reconciler: Reconciler<R>,
        connector: C,
        watch: bool,
        output: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            reconciler,
            connector,
            watch,
            backoff: JobBackoff::default(),
            output,
        }
    }

    pub fn with_backoff(mut self, backoff: JobBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until shutdown, the consumer going away, or (without watch) the
    /// first successful publish.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let provider = self.reconciler.name().to_string();
        tracing::info!(provider = %provider, watch = self.watch, "Provider starting");

        self.backoff.reset();
        loop {
            let outcome = tokio::select! {
                outcome = self.connect_and_stream() => outcome,
                _ = shutdown.recv() => {
                    tracing::info!(provider = %provider, "Provider received shutdown signal, exiting loop");
                    return;
                }
            };

            match outcome {
                Ok(RunEnd::Done) => {
                    tracing::info!(provider = %provider, "Configuration published, not watching for changes");
                    return;
                }
                Ok(RunEnd::ConsumerGone) => {
                    tracing::warn!(provider = %provider, "Configuration consumer is gone, stopping provider");
                    return;
                }
                Err(e) => {
                    let delay = self.backoff.next_backoff();
                    metrics::record_reconcile_error(&provider);
                    metrics::record_backoff(&provider, delay);
                    tracing::error!(
                        provider = %provider,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Provider error, retrying"
                    );

                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            tracing::info!(provider = %provider, "Provider received shutdown signal while backing off");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<RunEnd, BackendError> {
        let backend = self.connector.connect().await?;
        tracing::info!(provider = %self.reconciler.name(), "Provider connection established");

        if !self.pass(&backend).await? {
            return Ok(RunEnd::ConsumerGone);
        }
        if !self.watch {
            return Ok(RunEnd::Done);
        }

        match backend.change_source() {
            ChangeSource::Events => {
                let mut events = backend.subscribe().await?;
                loop {
                    let event = events.next().await.ok_or(BackendError::StreamClosed)??;
                    tracing::debug!(
                        provider = %self.reconciler.name(),
                        action = %event.action,
                        id = %event.entity_id,
                        "Received change event"
                    );
                    drain_ready(&mut events)?;
                    if !self.pass(&backend).await? {
                        return Ok(RunEnd::ConsumerGone);
                    }
                }
            }
            ChangeSource::Poll(period) => {
                let mut ticker = time::interval_at(time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !self.pass(&backend).await? {
                        return Ok(RunEnd::ConsumerGone);
                    }
                }
            }
        }
    }

    /// Enumerate, reconcile and publish. Returns `false` when nobody is
    /// listening any more.
    async fn pass(&self, backend: &C::Backend) -> Result<bool, BackendError> {
        let snapshot = backend.list_entities().await?;
        let configuration = self.reconciler.reconcile(&snapshot);
        let provider = self.reconciler.name();

        metrics::record_reconcile(provider);
        tracing::debug!(
            provider = %provider,
            entities = snapshot.entities.len(),
            routers = configuration.http.routers.len(),
            services = configuration.http.services.len(),
            "Publishing configuration"
        );

        let message = Message {
            provider_name: provider.to_string(),
            configuration,
        };
        Ok(self.output.send(message).await.is_ok())
    }
}

/// Swallow events that are already buffered, so a burst causes one pass.
fn drain_ready(events: &mut EventStream) -> Result<(), BackendError> {
    while let Some(next) = events.next().now_or_never() {
        match next {
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e),
            None => return Err(BackendError::StreamClosed),
        }
    }
    Ok(())
}

/// The interval a cluster provider polls at.
pub fn refresh_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}

//! Event loop.
//!
//! Pulls events off the platform stream and hands each one to the
//! orchestrator on its own task, so a slow media-group settle or a
//! rate-limit backoff never blocks unrelated chats. Each task runs under a
//! timeout; a stuck event is logged and abandoned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pipeline::{DispatchOrchestrator, DispatchOutcome};
use crate::platform::{ChatId, EventStream, InboundEvent};

/// How long shutdown waits for in-flight events.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Relay {
    orchestrator: Arc<DispatchOrchestrator>,
    event_timeout: Duration,
}

impl Relay {
    pub fn new(orchestrator: Arc<DispatchOrchestrator>, event_timeout: Duration) -> Self {
        Self {
            orchestrator,
            event_timeout,
        }
    }

    /// Run until Ctrl+C or the stream ends.
    pub async fn run(&self, events: EventStream) {
        self.run_until(events, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down...");
            }
        })
        .await;
    }

    /// Run until `shutdown` resolves or the stream ends, then drain in-flight events.
    pub async fn run_until(&self, mut events: EventStream, shutdown: impl Future<Output = ()>) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let pruning = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let pruned = orchestrator.prune_media_groups();
                if pruned > 0 {
                    debug!(pruned, "Expired media-group claims dropped");
                }
            }
        });

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);
        info!("Relay ready and listening");

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => {
                        info!("Event stream ended, shutting down...");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Event task panicked");
                    }
                    continue;
                }
            };

            if !self.accepts(&event).await {
                continue;
            }

            let orchestrator = Arc::clone(&self.orchestrator);
            let timeout = self.event_timeout;
            tasks.spawn(async move {
                let source_chat = event.source_chat();
                match tokio::time::timeout(timeout, orchestrator.handle(event)).await {
                    Ok(outcomes) => log_outcomes(source_chat, &outcomes),
                    Err(_) => warn!(?source_chat, ?timeout, "Event handling timed out"),
                }
            });
        }

        pruning.abort();
        if tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(pending = tasks.len(), "Abandoning in-flight events");
            tasks.abort_all();
        }
    }

    /// Events from chats no forwarder listens to are dropped early. Deletes
    /// may not name their chat, so they always pass.
    async fn accepts(&self, event: &InboundEvent) -> bool {
        match event.source_chat() {
            Some(chat) => self.orchestrator.rules().is_source(chat).await,
            None => true,
        }
    }
}

fn log_outcomes(source_chat: Option<ChatId>, outcomes: &[DispatchOutcome]) {
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Failed { .. }))
        .count();
    if failed > 0 {
        warn!(?source_chat, failed, total = outcomes.len(), "Event relayed with failures");
    } else {
        debug!(?source_chat, total = outcomes.len(), "Event handled");
    }
}

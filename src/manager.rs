use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alert::AlertDispatcher;
use crate::config::Config;
use crate::debounce::DebounceGate;
use crate::ingest::Ingestor;
use crate::lifecycle::Lifecycle;
use crate::mqtt::Transport;
use crate::presentation::Presentation;

const DISCONNECT_GRACE: Duration = Duration::from_millis(250);
const TRANSPORT_QUEUE: usize = 64;

/// Owns everything the alert path needs for the lifetime of the process and
/// guarantees it is released once, whichever way the process ends.
pub struct Manager {
    config: Config,
    lifecycle: Lifecycle,
    transport: Box<dyn Transport>,
    presentation: Option<Box<dyn Presentation>>,
}

impl Manager {
    pub fn new(
        config: Config,
        lifecycle: Lifecycle,
        transport: Box<dyn Transport>,
        presentation: Box<dyn Presentation>,
    ) -> Self {
        Manager {
            config,
            lifecycle,
            transport,
            presentation: Some(presentation),
        }
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let lifecycle = self.lifecycle.clone();

        let dispatcher = match self.acquire().await {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                self.release().await;
                lifecycle.fail_startup();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(TRANSPORT_QUEUE);
        let started = tokio::select! {
            biased;
            _ = lifecycle.wait_for_shutdown() => None,
            started = self.transport.start(tx) => Some(started),
        };

        let transport = match started {
            Some(Ok(transport)) => transport,
            Some(Err(err)) => {
                self.release().await;
                lifecycle.fail_startup();
                return Err(err);
            }
            None => {
                info!("Shutdown requested during start-up");
                self.release().await;
                lifecycle.fail_startup();
                return Ok(());
            }
        };

        let ingestor = Arc::new(Ingestor::new(
            self.config.target(),
            self.config.detection_timeout(),
            Arc::new(DebounceGate::new()),
            dispatcher,
        ));
        let ingest = tokio::spawn(ingestor.run(rx, lifecycle.cancellation_token()));

        lifecycle.mark_running();
        info!("Waiting for {}", self.config.target_mac);

        lifecycle.wait_for_shutdown().await;
        lifecycle.teardown(self.shutdown(ingest, transport)).await;

        Ok(())
    }

    /// Stops ingestion, disconnects, then releases the presentation. An alert
    /// that was already being dispatched finishes first.
    async fn shutdown(&mut self, ingest: JoinHandle<()>, mut transport: JoinHandle<()>) {
        if let Err(err) = ingest.await {
            warn!("Ingestion task failed: {}", err);
        }

        if let Err(err) = self.transport.disconnect().await {
            debug!("Error disconnecting transport: {:#}", err);
        }
        match tokio::time::timeout(DISCONNECT_GRACE, &mut transport).await {
            Ok(Ok(())) => debug!("Transport stopped"),
            Ok(Err(err)) => warn!("Transport task failed: {}", err),
            Err(_) => {
                debug!("Transport task did not finish in time, aborting");
                transport.abort();
            }
        }

        self.release().await;
    }

    async fn acquire(&mut self) -> anyhow::Result<AlertDispatcher> {
        let mut presentation = self
            .presentation
            .take()
            .ok_or_else(|| anyhow!("presentation already released"))?;
        let quit = self.lifecycle.handle();

        let (presentation, acquired) = tokio::task::spawn_blocking(move || {
            let acquired = presentation.acquire(quit);
            (presentation, acquired)
        })
        .await
        .context("desktop start-up panicked")?;

        self.presentation = Some(presentation);
        acquired
    }

    /// Runs at most once; later calls find nothing left to release.
    async fn release(&mut self) {
        let Some(mut presentation) = self.presentation.take() else {
            return;
        };
        if let Err(err) = tokio::task::spawn_blocking(move || presentation.release()).await {
            warn!("Failed to release desktop resources: {}", err);
        }
    }
}

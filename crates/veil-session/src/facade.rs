//! Session Facade
//!
//! Single-flight connect/disconnect on top of the [`SessionController`].
//! A new `connect()` cancels the attempt in flight and waits for its
//! teardown before starting over; requests are never queued.

use crate::controller::{SessionController, SessionError};
use crate::state::{SessionState, SessionStatus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Config retrieval failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Source of tunnel config text
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch_config_text(&self) -> Result<String, FetchError>;
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Connect/disconnect entry point for callers
pub struct SessionFacade {
    controller: SessionController,
    configs: Arc<dyn ConfigProvider>,
    attempt: Mutex<Option<Attempt>>,
    next_attempt: AtomicU64,
}

impl SessionFacade {
    pub fn new(controller: SessionController, configs: Arc<dyn ConfigProvider>) -> Self {
        Self {
            controller,
            configs,
            attempt: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
        }
    }

    /// Begin a connect attempt, preempting any attempt in flight.
    ///
    /// Returns once the new attempt is running; observe [`Self::state`]
    /// for the outcome.
    pub async fn connect(&self) {
        let mut attempt = self.attempt.lock().await;
        if let Some(prev) = attempt.take() {
            cancel_and_join(prev).await;
        }

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        info!("Connect attempt {}", id);

        let task = tokio::spawn(run_attempt(
            id,
            self.controller.clone(),
            self.configs.clone(),
            cancel.clone(),
        ));
        *attempt = Some(Attempt { id, cancel, task });
    }

    /// Cancel any attempt in flight, then stop the session
    pub async fn disconnect(&self) {
        info!("Disconnect requested");
        if let Some(prev) = self.attempt.lock().await.take() {
            cancel_and_join(prev).await;
        }
        self.controller.stop().await;
    }

    /// Disconnect and shut the controller down
    pub async fn close(self) {
        self.disconnect().await;
        self.controller.shutdown().await;
        debug!("Session facade closed");
    }

    /// Observe session state
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.controller.state()
    }

    /// Observe the user-visible status category
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.controller.status()
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }
}

async fn cancel_and_join(attempt: Attempt) {
    debug!("Cancelling connect attempt {}", attempt.id);
    attempt.cancel.cancel();
    if let Err(e) = attempt.task.await {
        warn!("Connect attempt {} ended abnormally: {}", attempt.id, e);
    }
}

async fn run_attempt(id: u64, controller: SessionController, configs: Arc<dyn ConfigProvider>, cancel: CancellationToken) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fetch_and_start(&controller, configs.as_ref()) => result,
    };

    match result {
        Ok(()) => debug!("Connect attempt {} done", id),
        Err(SessionError::AlreadyActive(state)) => debug!("Connect attempt {}: session already {}", id, state),
        Err(e) if e.is_cancelled() => {
            debug!("Connect attempt {} cancelled", id);
            // May have left a half-started engine behind
            controller.stop().await;
        }
        Err(e) => warn!("Connect attempt {} failed: {}", id, e),
    }
}

async fn fetch_and_start(controller: &SessionController, configs: &dyn ConfigProvider) -> Result<(), SessionError> {
    let config = configs.fetch_config_text().await?;
    debug!("Config fetched, {} bytes", config.len());
    controller.start(config).await
}

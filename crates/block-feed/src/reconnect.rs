//! Reconnect-with-backoff supervisor around [`BlockSubscriber`]

use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use ecoho_core::{ErrorDetail, ReconnectConfig, StreamConfig, StreamError};

use crate::callbacks::FeedCallbacks;
use crate::subscriber::{BlockSubscriber, FeedView};

/// Exponential backoff between subscriber attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based), `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Why [`ReconnectingFeed::run`] returned
#[derive(Debug, Clone, PartialEq)]
pub enum FeedExit {
    /// Shutdown was signalled
    Shutdown,
    /// Retries exhausted
    GaveUp {
        attempts: u32,
        last_error: Option<ErrorDetail>,
    },
    /// Configuration or subscription rejected, retrying cannot help
    Fatal(ErrorDetail),
}

/// Runs one subscriber at a time, building a fresh one after each terminal
/// state. Every subscriber shares the same callbacks.
#[derive(Debug, Clone)]
pub struct ReconnectingFeed {
    stream: StreamConfig,
    policy: ReconnectPolicy,
    callbacks: FeedCallbacks,
}

impl ReconnectingFeed {
    pub fn new(stream: StreamConfig, policy: ReconnectPolicy, callbacks: FeedCallbacks) -> Self {
        Self {
            stream,
            policy,
            callbacks,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Supervise subscribers until shutdown, a non-transient failure, or the
    /// retry budget runs out. The budget only resets once a subscription is
    /// acknowledged. A dropped shutdown sender counts as shutdown.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> FeedExit {
        let mut attempt: u32 = 0;

        loop {
            let mut subscriber = BlockSubscriber::new(self.stream.clone(), self.callbacks.clone());
            let mut updates = subscriber.updates();

            let opened = tokio::select! {
                result = subscriber.open() => Some(result),
                _ = &mut shutdown => None,
            };
            let Some(opened) = opened else {
                subscriber.close().await;
                return FeedExit::Shutdown;
            };

            match opened {
                Ok(()) => {
                    let stopped = tokio::select! {
                        _ = wait_terminal(&mut updates) => false,
                        _ = &mut shutdown => true,
                    };
                    if stopped {
                        subscriber.close().await;
                        return FeedExit::Shutdown;
                    }

                    let (acknowledged, failure) = {
                        let view = updates.borrow();
                        (view.subscription_id.is_some(), view.last_error.clone())
                    };
                    if acknowledged {
                        attempt = 0;
                    } else if let Some(detail) = failure.filter(|d| !d.kind.is_transient()) {
                        subscriber.close().await;
                        return FeedExit::Fatal(detail);
                    }
                }
                Err(StreamError::Failed(detail)) if !detail.kind.is_transient() => {
                    subscriber.close().await;
                    return FeedExit::Fatal(detail);
                }
                Err(e) => warn!("Block feed attempt failed: {}", e),
            }

            let last_error = subscriber.last_error();
            subscriber.close().await;

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                warn!(attempts = attempt, "Giving up on block feed");
                return FeedExit::GaveUp {
                    attempts: attempt,
                    last_error,
                };
            };

            info!(attempt, ?delay, "Reconnecting block feed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return FeedExit::Shutdown,
            }
        }
    }
}

async fn wait_terminal(updates: &mut watch::Receiver<FeedView>) {
    loop {
        let terminal = updates.borrow_and_update().state.is_terminal();
        if terminal || updates.changed().await.is_err() {
            return;
        }
    }
}

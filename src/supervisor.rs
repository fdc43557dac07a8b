//! Reconnect supervisor.
//!
//! Keeps the [`ConnectionManager`] connected: while the state is
//! `Disconnected` it issues a connect attempt, sleeping between attempts per
//! the [`RetryPolicy`]. It never touches a socket itself, so it can never open
//! a second one; the manager's compare-and-set guards that.
//!
//! ```text
//!   loop:
//!     sleep(delay)            first pass: no delay
//!     if Disconnected:
//!         connect()
//!           Ok             → failures = 0
//!           ConnectFailed  → failures += 1, stop if exhausted
//!           Closed         → exit
//!     delay = policy.delay_after(failures)
//! ```

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectOutcome, ConnectionManager, ConnectionState};
use crate::error::RelayError;

/// Growth of the delay between consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always wait the base interval.
    #[default]
    Fixed,
    /// Double the interval per consecutive failure, capped at `max`.
    Exponential {
        /// Upper bound on any single delay.
        max: Duration,
    },
}

/// When to retry and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay between checks.
    pub interval: Duration,
    /// Stop after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay growth.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    /// Unlimited retries every `interval`.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before the next check, given the consecutive failure count.
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                if failures == 0 {
                    return self.interval;
                }
                let factor = 1u32 << failures.min(16);
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }

    /// `true` once `failures` consecutive failures mean the supervisor should stop.
    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Handle to a running reconnect loop.
#[derive(Debug)]
pub struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Start supervising `manager`. The first attempt is made immediately.
    #[must_use]
    pub fn spawn(manager: Arc<ConnectionManager>, policy: RetryPolicy) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(manager, policy, cancel.clone()));
        Self { cancel, task }
    }

    /// `true` once the loop has exited (stopped, exhausted, or manager closed).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it. An in-flight attempt is abandoned.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::error!("[Supervisor] Task failed: {}", e);
        }
    }
}

async fn supervise(manager: Arc<ConnectionManager>, policy: RetryPolicy, cancel: CancellationToken) {
    log::info!(
        "[Supervisor] Watching {} (interval {:?}, max attempts {:?}, backoff {:?})",
        manager.peer(),
        policy.interval,
        policy.max_attempts,
        policy.backoff
    );

    let mut failures: u32 = 0;
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        if manager.state() == ConnectionState::Disconnected {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = manager.connect() => result,
            };

            match result {
                Ok(ConnectOutcome::Connected) => {
                    if failures > 0 {
                        log::info!("[Supervisor] Reconnected after {} failed attempt(s)", failures);
                    }
                    failures = 0;
                }
                Ok(ConnectOutcome::AlreadyActive) => {}
                Err(RelayError::Closed) => {
                    log::debug!("[Supervisor] Connection manager closed");
                    break;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if policy.exhausted(failures) {
                        log::error!(
                            "[Supervisor] Giving up on {} after {} consecutive failures",
                            manager.peer(),
                            failures
                        );
                        break;
                    }
                    log::warn!(
                        "[Supervisor] Attempt {} failed: {}; retrying in {:?}",
                        failures,
                        e,
                        policy.delay_after(failures)
                    );
                }
            }
        }

        delay = policy.delay_after(failures);
    }

    log::info!("[Supervisor] Stopped");
}

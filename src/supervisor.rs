//! Pairing supervisor
//!
//! Every configured pairing runs in its own task. When a pairing fails, for
//! whatever reason, it is torn down completely and started again from scratch
//! after the retry delay. Pairings never affect each other.
//!
//! ```text
//!   ┌──────────┐ connected ┌─────────┐ session closed ┌────────┐
//!   │ Starting │──────────▶│ Running │───────────────▶│ Failed │
//!   └──────────┘           └─────────┘                └────────┘
//!        ▲  │ bind/connect error                          │
//!        │  └─────────────────────────────────────────────┤
//!        └────────────── sleep(retry delay) ◀─────────────┘
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ClientMultiplexer;
use crate::config::{ClientConfig, LogConfig, PairingConfig, SessionConfig};

/// Restart delay used when nothing else is configured
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// How long to wait before restarting a failed pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Same delay after every failure
    Fixed(#[serde(with = "humantime_serde")] Duration),

    /// Doubling delay with up to 10% jitter, reset once a pairing runs again
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_RESTART_DELAY)
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of consecutive failures
    /// that preceded the current one.
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { initial, max } => {
                let base = 2u32
                    .checked_pow(failures)
                    .and_then(|factor| initial.checked_mul(factor))
                    .map_or(max, |delay| delay.min(max));

                let jitter_ceiling = base / 10;
                if jitter_ceiling.is_zero() {
                    return base;
                }
                base + rand::thread_rng().gen_range(Duration::ZERO..=jitter_ceiling)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            RetryPolicy::Fixed(_) => Ok(()),
            RetryPolicy::Exponential { initial, max } => {
                if initial.is_zero() {
                    return Err("retry.exponential.initial must be non-zero".to_string());
                }
                if max < initial {
                    return Err("retry.exponential.max must not be shorter than initial".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Observable lifecycle of one pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Binding the listener and connecting the tunnel
    Starting,
    /// Serving queries
    Running,
    /// Torn down, waiting for the retry delay
    Failed,
}

/// Owns and restarts every configured pairing
pub struct Supervisor {
    pairings: Vec<PairingConfig>,
    retry: RetryPolicy,
    session: SessionConfig,
    log: LogConfig,
}

impl Supervisor {
    pub fn new(client: &ClientConfig, session: SessionConfig, log: LogConfig) -> Self {
        Self {
            pairings: client.pairing_configs(),
            retry: client.retry.clone(),
            session,
            log,
        }
    }

    /// Start one task per pairing
    pub fn spawn(self) -> SupervisorHandle {
        let pairings = self
            .pairings
            .into_iter()
            .map(|pairing| {
                let (state_tx, state_rx) = watch::channel(PairingState::Starting);
                let attempts = Arc::new(AtomicU64::new(0));

                let task = tokio::spawn(supervise(
                    pairing.clone(),
                    self.retry.clone(),
                    self.session.clone(),
                    self.log,
                    state_tx,
                    attempts.clone(),
                ));

                PairingHandle {
                    pairing,
                    state: state_rx,
                    attempts,
                    task,
                }
            })
            .collect();

        SupervisorHandle { pairings }
    }

    /// Run every pairing forever
    pub async fn run(self) {
        self.spawn().wait().await;
    }
}

/// Running pairings. Dropping the handle stops them.
pub struct SupervisorHandle {
    pairings: Vec<PairingHandle>,
}

impl SupervisorHandle {
    pub fn pairings(&self) -> &[PairingHandle] {
        &self.pairings
    }

    /// Wait for every pairing task to end
    pub async fn wait(mut self) {
        for pairing in &mut self.pairings {
            if let Err(e) = (&mut pairing.task).await {
                if e.is_panic() {
                    log::error!("{}: supervisor task panicked", pairing.pairing);
                }
            }
        }
    }
}

/// One supervised pairing
pub struct PairingHandle {
    pairing: PairingConfig,
    state: watch::Receiver<PairingState>,
    attempts: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PairingHandle {
    pub fn pairing(&self) -> &PairingConfig {
        &self.pairing
    }

    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state.clone()
    }

    /// Number of times the pairing has been started, including the first
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Wait until the pairing reaches `target`
    pub async fn wait_for(&self, target: PairingState) {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise(
    pairing: PairingConfig,
    retry: RetryPolicy,
    session: SessionConfig,
    log: LogConfig,
    state: watch::Sender<PairingState>,
    attempts: Arc<AtomicU64>,
) {
    let mut failures: u32 = 0;

    loop {
        state.send_replace(PairingState::Starting);
        attempts.fetch_add(1, Ordering::Relaxed);

        let reason = match ClientMultiplexer::connect(&pairing, &session, log).await {
            Ok(mux) => {
                failures = 0;
                state.send_replace(PairingState::Running);
                log::info!("{}: pairing running", pairing);
                mux.run().await
            }
            Err(e) => e,
        };

        state.send_replace(PairingState::Failed);
        let delay = retry.delay(failures);
        failures = failures.saturating_add(1);

        log::warn!("{}: {}, restarting in {:?}", pairing, reason, delay);
        tokio::time::sleep(delay).await;
    }
}

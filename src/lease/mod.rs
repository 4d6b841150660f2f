//! Background renewal of the Vault token lease.
//!
//! The supervisor alternates between waiting and renewing:
//!
//! ```text
//! Idle -> Waiting(interval) -> Renewing -> Waiting(interval | retry) -> ... -> Stopped
//! ```
//!
//! A failed renewal is retried after the fixed retry interval, forever. The
//! loop only ends when its [`CancellationToken`] is cancelled. Cancellation
//! is observed while waiting, so a renewal already in flight runs to
//! completion. State transitions are published on a `watch` channel.

use crate::backends::SecretBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument, Span};

/// Lease parameters owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Lease length requested on every renewal.
    pub duration_secs: u64,
    /// Delay before retrying after a failed renewal.
    pub retry_interval_secs: u64,
    /// When set, renew once this share of the lease has elapsed instead of
    /// at the half-way mark.
    pub renewal_percentage: Option<u8>,
}

impl LeaseSettings {
    pub fn renewal_interval(&self) -> Duration {
        let secs = match self.renewal_percentage {
            Some(pct) => self.duration_secs * u64::from(pct) / 100,
            None => self.duration_secs / 2,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    /// Delay until the next attempt given the outcome of the last one.
    pub fn next_delay(&self, renewed: bool) -> Duration {
        if renewed {
            self.renewal_interval()
        } else {
            self.retry_interval()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Waiting(Duration),
    Renewing,
    Stopped,
}

/// Counters reported when the supervisor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub attempts: u64,
    pub failures: u64,
}

pub struct RenewalSupervisor {
    backend: Arc<dyn SecretBackend>,
    settings: LeaseSettings,
    cancel: CancellationToken,
    state: watch::Sender<RenewalState>,
    span: Span,
}

impl RenewalSupervisor {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        settings: LeaseSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RenewalState::Idle);
        Self {
            backend,
            settings,
            cancel,
            state,
            span: info_span!("lease_renewal", lease_secs = settings.duration_secs),
        }
    }

    /// Follow state transitions, including after [`RenewalSupervisor::run`]
    /// has taken ownership of the supervisor.
    pub fn subscribe(&self) -> watch::Receiver<RenewalState> {
        self.state.subscribe()
    }

    /// Run until the token is cancelled.
    pub async fn run(self) -> RenewalReport {
        let span = self.span.clone();
        self.run_loop().instrument(span).await
    }

    fn set_state(&self, state: RenewalState) {
        self.state.send_replace(state);
    }

    async fn run_loop(&self) -> RenewalReport {
        let mut report = RenewalReport::default();
        let mut delay = self.settings.renewal_interval();
        info!("Starting renewal process every {:?}", delay);

        loop {
            self.set_state(RenewalState::Waiting(delay));
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Vault renew teardown from cancellation");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(RenewalState::Renewing);
            report.attempts += 1;
            let renewed = match self.backend.renew_self(self.settings.duration_secs).await {
                Ok(()) => true,
                Err(e) => {
                    report.failures += 1;
                    error!(
                        "Error while calling renew: {}, will retry in {:?}",
                        e,
                        self.settings.retry_interval()
                    );
                    false
                }
            };

            delay = self.settings.next_delay(renewed);
            if renewed {
                info!("Next lease renewal will be in {:?}", delay);
            }
        }

        self.set_state(RenewalState::Stopped);
        info!(
            attempts = report.attempts,
            failures = report.failures,
            "Lease renewal stopped"
        );
        report
    }
}

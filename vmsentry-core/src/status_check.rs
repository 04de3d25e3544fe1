//! Internal status check oracle
//!
//! A guest with the check enabled answers HTTP on its own status endpoint.
//! 200 means healthy, 503 is an explicit "not healthy"; anything else,
//! including silence, keeps the poll going until the window closes.

use crate::abstractions::time::Clock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One HTTP answer from the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status_code: u16,
}

impl ProbeResult {
    pub const OK: ProbeResult = ProbeResult { status_code: 200 };
    pub const UNAVAILABLE: ProbeResult = ProbeResult { status_code: 503 };

    pub fn new(status_code: u16) -> Self {
        Self { status_code }
    }
}

/// Queries the guest's internal status endpoint
#[async_trait]
pub trait GuestProbe: Send + Sync {
    /// `None` when nothing answered
    async fn probe(&self, ip_address: &str) -> Option<ProbeResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    ExplicitFailure,
    Timeout,
    /// Non-terminal: no verdict yet
    KeepPolling,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::KeepPolling)
    }

    /// Process exit code for a terminal outcome
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Outcome::Success => Some(0),
            Outcome::ExplicitFailure => Some(1),
            Outcome::Timeout => Some(-1),
            Outcome::KeepPolling => None,
        }
    }
}

pub fn evaluate(response: Option<ProbeResult>, elapsed: Duration, timeout: Duration) -> Outcome {
    match response.map(|r| r.status_code) {
        Some(200) => Outcome::Success,
        Some(503) if elapsed < timeout => Outcome::ExplicitFailure,
        _ if elapsed >= timeout => Outcome::Timeout,
        _ => Outcome::KeepPolling,
    }
}

/// Result of a completed poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: Outcome,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_response: Option<ProbeResult>,
}

/// Drives [`evaluate`] against a probe until a terminal outcome
pub struct StatusPoller<'a> {
    probe: &'a dyn GuestProbe,
    clock: &'a dyn Clock,
    interval: Duration,
}

impl<'a> StatusPoller<'a> {
    pub fn new(probe: &'a dyn GuestProbe, clock: &'a dyn Clock, interval: Duration) -> Self {
        Self {
            probe,
            clock,
            interval,
        }
    }

    /// Poll `ip_address` until a verdict, the window closing or `max_attempts` probes
    pub async fn poll(&self, ip_address: &str, window: Duration, max_attempts: Option<u32>) -> PollReport {
        let start = self.clock.now();
        let mut attempts = 0;

        loop {
            let response = self.probe.probe(ip_address).await;
            attempts += 1;
            let elapsed = self.clock.now().duration_since(start);
            let outcome = evaluate(response, elapsed, window);
            debug!(ip_address, attempts, ?response, ?outcome, "Status probe");

            let budget_spent = max_attempts.map_or(false, |max| attempts >= max);
            if outcome.is_terminal() || budget_spent {
                return PollReport {
                    outcome: if outcome.is_terminal() { outcome } else { Outcome::Timeout },
                    attempts,
                    elapsed,
                    last_response: response,
                };
            }

            self.clock.sleep(self.interval).await;
            let elapsed = self.clock.now().duration_since(start);
            if elapsed >= window {
                return PollReport {
                    outcome: Outcome::Timeout,
                    attempts,
                    elapsed,
                    last_response: response,
                };
            }
        }
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Auto-Shutdown Controller (component I). Tracks whether the
// trigger condition (`no-queues` or `no-jobs`) currently holds and arms or
// cancels a deadline accordingly; the Avahi-bound variant arms
// independently on DNS-SD daemon disappearance.

use presswerk_core::{ShutdownMode, ShutdownPolicy};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::info;

pub struct ShutdownController {
    policy: ShutdownPolicy,
    deadline: Mutex<Option<Instant>>,
    /// `SIGUSR1`/`SIGUSR2`-equivalent manual toggle, applied on top of
    /// `policy.mode`: `Some(false)` forces auto-shutdown off regardless of
    /// the configured trigger; `Some(true)` re-enables it.
    manual_override: Mutex<Option<bool>>,
}

impl ShutdownController {
    pub fn new(policy: ShutdownPolicy) -> Self {
        Self {
            policy,
            deadline: Mutex::new(None),
            manual_override: Mutex::new(None),
        }
    }

    /// Apply a `SIGUSR1` (enable, `true`) / `SIGUSR2` (disable, `false`)
    /// toggle. Disabling immediately cancels any armed deadline.
    pub async fn toggle(&self, enabled: bool) {
        *self.manual_override.lock().await = Some(enabled);
        if !enabled {
            let mut deadline = self.deadline.lock().await;
            if deadline.is_some() {
                *deadline = None;
                info!("auto-shutdown disarmed: disabled via signal");
            }
        }
    }

    fn condition_met(&self, queue_count: usize, active_job_count: u32) -> bool {
        match self.policy.mode {
            ShutdownMode::Disabled => false,
            ShutdownMode::NoQueues => queue_count == 0,
            ShutdownMode::NoJobs => queue_count == 0 && active_job_count == 0,
        }
    }

    /// Re-evaluate the queue/job trigger condition. Arms a
    /// deadline on the false-to-true edge, cancels it on true-to-false.
    pub async fn evaluate(&self, queue_count: usize, active_job_count: u32) {
        if self.manual_override.lock().await == Some(false) {
            return;
        }
        let met = self.condition_met(queue_count, active_job_count);
        let mut deadline = self.deadline.lock().await;
        match (met, *deadline) {
            (true, None) => {
                *deadline = Some(Instant::now() + Duration::from_secs(self.policy.timeout_secs));
                info!(timeout_secs = self.policy.timeout_secs, "auto-shutdown armed");
            }
            (false, Some(_)) => {
                *deadline = None;
                info!("auto-shutdown disarmed");
            }
            _ => {}
        }
    }

    /// Avahi-bound variant: enters/leaves auto-shutdown on DNS-SD daemon
    /// presence changes, independent of the queue/job trigger. A no-op when
    /// the policy did not request this variant.
    pub async fn on_dns_sd_daemon_presence_changed(&self, alive: bool) {
        if !self.policy.avahi_bound || self.manual_override.lock().await == Some(false) {
            return;
        }
        let mut deadline = self.deadline.lock().await;
        if alive {
            if deadline.is_some() {
                *deadline = None;
                info!("auto-shutdown disarmed: DNS-SD daemon reconnected");
            }
        } else if deadline.is_none() {
            *deadline = Some(Instant::now() + Duration::from_secs(self.policy.timeout_secs));
            info!("auto-shutdown armed: DNS-SD daemon disappeared");
        }
    }

    /// True once an armed deadline has elapsed. The main loop selects on a
    /// short interval and calls this to decide whether to exit.
    pub async fn due(&self) -> bool {
        matches!(*self.deadline.lock().await, Some(at) if Instant::now() >= at)
    }

    pub async fn armed(&self) -> bool {
        self.deadline.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: ShutdownMode, timeout_secs: u64, avahi_bound: bool) -> ShutdownPolicy {
        ShutdownPolicy {
            mode,
            timeout_secs,
            avahi_bound,
        }
    }

    #[tokio::test]
    async fn no_queues_mode_arms_when_registry_empties() {
        let controller = ShutdownController::new(policy(ShutdownMode::NoQueues, 1, false));
        controller.evaluate(2, 0).await;
        assert!(!controller.armed().await);
        controller.evaluate(0, 0).await;
        assert!(controller.armed().await);
    }

    #[tokio::test]
    async fn condition_flipping_false_disarms_pending_shutdown() {
        let controller = ShutdownController::new(policy(ShutdownMode::NoQueues, 30, false));
        controller.evaluate(0, 0).await;
        assert!(controller.armed().await);
        controller.evaluate(1, 0).await;
        assert!(!controller.armed().await);
    }

    #[tokio::test]
    async fn no_jobs_mode_requires_both_conditions() {
        let controller = ShutdownController::new(policy(ShutdownMode::NoJobs, 1, false));
        controller.evaluate(0, 3).await;
        assert!(!controller.armed().await, "jobs still active, must not arm");
        controller.evaluate(0, 0).await;
        assert!(controller.armed().await);
    }

    #[tokio::test]
    async fn disabled_mode_never_arms() {
        let controller = ShutdownController::new(policy(ShutdownMode::Disabled, 1, false));
        controller.evaluate(0, 0).await;
        assert!(!controller.armed().await);
    }

    #[tokio::test]
    async fn avahi_bound_variant_arms_and_disarms_independently_of_queues() {
        let controller = ShutdownController::new(policy(ShutdownMode::NoQueues, 30, true));
        controller.on_dns_sd_daemon_presence_changed(false).await;
        assert!(controller.armed().await);
        controller.on_dns_sd_daemon_presence_changed(true).await;
        assert!(!controller.armed().await);
    }

    #[tokio::test]
    async fn avahi_bound_is_ignored_when_policy_does_not_request_it() {
        let controller = ShutdownController::new(policy(ShutdownMode::NoQueues, 30, false));
        controller.on_dns_sd_daemon_presence_changed(false).await;
        assert!(!controller.armed().await);
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue Reconciler (component F).
//
// Timer-driven: each call to `scan` is one tick. It picks up every entry
// whose `timeout <= now`, subject to `maxUpdatesPerCall`, and realizes the
// registry's intent onto the local scheduler: overwrite pre-check, the
// create/modify path (9 steps), and the delete path (4 steps). Every
// outgoing IPP call is off-loaded conceptually to the caller's worker model —
// here `scan` itself is the unit of work a `tokio::spawn`ed task executes
// per tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use presswerk_core::{ClusterLinkage, EntryId, EntryStatus};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cluster;
use crate::error::{should_retry, EngineError, ErrorKind, Result, RetryConfig, RetryDecision};
use crate::persist;
use crate::registry::{Registry, Trigger};
use crate::remote_client::RemotePrinterClient;
use crate::scheduler_client::{PrinterDefinition, SchedulerClient};

/// The mark option written on every managed queue so the handler can tell
/// its own queues apart from user-created ones.
pub const MARK_OPTION: &str = "cups-browsed";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_updates_per_call: u32,
    pub pause_between_updates: StdDuration,
    pub http_max_retries: u32,
    pub retry_base_delay: StdDuration,
    pub retry_max_delay: StdDuration,
    pub browse_timeout: StdDuration,
    pub scheduler_uri: String,
    pub default_options: String,
    pub cache_dir: PathBuf,
    pub allow_resharing_remote_cups_printers: bool,
    pub keep_generated_queues_on_shutdown: bool,
}

impl ReconcilerConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::from_http_max_retries(self.http_max_retries, self.retry_base_delay, self.retry_max_delay)
    }
}

/// Parse a CUPS-style space-separated `key=value` option string into a map.
fn parse_default_options(s: &str) -> HashMap<String, String> {
    s.split_whitespace()
        .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// One reconciliation scan. Scans the registry in stable insertion
    /// order, honoring the per-call update budget and the overlap-protection
    /// `called` token.
    pub async fn scan(
        &self,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        remote: &dyn RemotePrinterClient,
    ) {
        let due_ids = self.claim_due_entries(registry).await;
        for id in due_ids {
            self.process_entry(id, registry, scheduler, remote).await;
            if let Some(entry) = registry.write().await.get_mut(id) {
                entry.called = false;
            }
        }
    }

    /// Select entries whose timeout has elapsed, up to `maxUpdatesPerCall`;
    /// entries beyond the budget get their timeout pushed to
    /// `now + pauseBetweenUpdates` so the next tick resumes work.
    async fn claim_due_entries(&self, registry: &RwLock<Registry>) -> Vec<EntryId> {
        let now = Utc::now();
        let mut reg = registry.write().await;

        let mut due: Vec<EntryId> = reg
            .iter_in_order()
            .filter(|e| !e.called && e.status != EntryStatus::DeletedMaster && e.timeout <= now)
            .map(|e| e.id)
            .collect();

        let budget = self.config.max_updates_per_call as usize;
        let overflow = if due.len() > budget {
            due.split_off(budget)
        } else {
            Vec::new()
        };

        let pause = ChronoDuration::from_std(self.config.pause_between_updates).unwrap_or_default();
        for id in overflow {
            if let Some(entry) = reg.get_mut(id) {
                entry.timeout = now + pause;
            }
        }
        for id in &due {
            if let Some(entry) = reg.get_mut(*id) {
                entry.called = true;
            }
        }
        due
    }

    async fn process_entry(
        &self,
        id: EntryId,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        remote: &dyn RemotePrinterClient,
    ) {
        let status = match registry.read().await.get(id) {
            Some(e) => e.status,
            None => return,
        };

        match status {
            EntryStatus::Unconfirmed => {
                registry.write().await.apply_transition(id, Trigger::UnconfirmedTimedOut);
                self.delete_path(id, registry, scheduler).await;
            }
            EntryStatus::Confirmed => {
                self.overwrite_check(id, registry, scheduler).await;
                let after = registry.read().await.get(id).map(|e| e.status);
                match after {
                    Some(EntryStatus::ToBeCreated) => self.create_or_modify_path(id, registry, scheduler, remote).await,
                    Some(EntryStatus::ToBeReleased) => self.release_path(id, registry, scheduler).await,
                    Some(EntryStatus::Disappeared) => self.delete_path(id, registry, scheduler).await,
                    _ => {
                        // Legacy-broadcast expiry: nothing diverged, just let the
                        // caller's next discovery push the timeout out again.
                    }
                }
            }
            EntryStatus::ToBeCreated | EntryStatus::ToBeCreatedRenamed => {
                self.create_or_modify_path(id, registry, scheduler, remote).await;
            }
            EntryStatus::Disappeared => {
                self.delete_path(id, registry, scheduler).await;
            }
            EntryStatus::ToBeReleased => {
                self.release_path(id, registry, scheduler).await;
            }
            EntryStatus::DeletedMaster => {}
        }
    }

    /// Pre-check run before acting on a *confirmed* entry: compare the
    /// scheduler's live device URI and driver nickname against what this
    /// entry expects. A device-URI divergence releases and renames the
    /// entry (§4.6); a nickname-only divergence just schedules a rewrite.
    pub(crate) async fn overwrite_check(&self, id: EntryId, registry: &RwLock<Registry>, scheduler: &dyn SchedulerClient) {
        let (queue_name, expected_uri, recorded_nickname, host) = {
            let reg = registry.read().await;
            let Some(entry) = reg.get(id) else { return };
            (
                entry.queue_name.clone(),
                self.expected_device_uri(entry),
                entry.capabilities.attributes.get("printer-make-and-model").cloned(),
                entry.preferred_instance().map(|i| i.host.clone()).unwrap_or_default(),
            )
        };

        let live = match scheduler.get_printer_attributes(&self.config.scheduler_uri, &queue_name).await {
            Ok(attrs) => attrs,
            Err(_) => return, // queue vanished entirely; the delete/create path handles that.
        };

        let Some(live_uri) = live.get("device-uri") else {
            return;
        };

        if live_uri != &expected_uri {
            warn!(entry = %id, queue = %queue_name, expected = %expected_uri, found = %live_uri, "externally modified device-uri detected");
            {
                let mut reg = registry.write().await;
                if let Some(entry) = reg.get_mut(id) {
                    entry.overwrite_detected = true;
                    entry.status_text = Some(format!(
                        "queue '{queue_name}' was externally modified (device-uri changed to {live_uri})"
                    ));
                }
                reg.apply_transition(id, Trigger::OverwriteDetected);
            }
            self.recreate_under_host_suffix(&queue_name, &host, registry).await;
            return;
        }

        if let (Some(recorded), Some(live_nick)) = (&recorded_nickname, live.get("printer-make-and-model")) {
            if recorded != live_nick {
                info!(entry = %id, queue = %queue_name, recorded = %recorded, found = %live_nick, "driver nickname diverged, scheduling rewrite");
                registry.write().await.apply_transition(id, Trigger::CapabilityChangedOrForcedRefresh);
            }
        }
    }

    /// §4.6 cascade: once the old entry has been marked *to-be-released*,
    /// recreate it under an `@host`-suffixed name so the reconciler rewrites
    /// a queue under the new name instead of leaving it unmanaged. Mirrors
    /// the host-suffix fallback the cluster resolver applies on collision
    /// (§4.5 step 2), excluding the name just vacated.
    async fn recreate_under_host_suffix(&self, queue_name: &str, host: &str, registry: &RwLock<Registry>) {
        let new_name = format!("{queue_name}@{}", cluster::sanitize(host, '-'));

        let mut reg = registry.write().await;
        if reg.find_by_queue_name(&new_name).is_some() {
            warn!(queue = %new_name, "overwrite cascade: replacement name already taken, dropping entry");
            return;
        }

        let Some(old_id) = reg.find_by_queue_name(queue_name) else { return };
        let Some((instance, cups_queue, cluster_flag)) = reg
            .get(old_id)
            .map(|e| (e.preferred_instance().cloned(), e.cups_queue, e.cluster))
        else {
            return;
        };
        let Some(instance) = instance else { return };

        let new_id = reg.create(new_name.clone(), instance);
        if let Some(entry) = reg.get_mut(new_id) {
            entry.cups_queue = cups_queue;
            entry.cluster = cluster_flag;
            entry.status = EntryStatus::ToBeCreatedRenamed;
        }
        reg.apply_transition(new_id, Trigger::NameClashResolved);
        info!(old = %queue_name, new = %new_name, "overwrite cascade: entry recreated under host-suffixed name");
    }

    fn expected_device_uri(&self, entry: &presswerk_core::RemotePrinterEntry) -> String {
        if matches!(entry.linkage, ClusterLinkage::Master) {
            format!("implicitclass:{}", entry.queue_name)
        } else {
            entry.device_uri.clone()
        }
    }

    /// Create/modify path steps 1-9.
    async fn create_or_modify_path(
        &self,
        id: EntryId,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        remote: &dyn RemotePrinterClient,
    ) {
        let (queue_name, device_uri, capabilities_stale, was_default, learned_via_legacy_broadcast, retry_count) = {
            let reg = registry.read().await;
            let Some(entry) = reg.get(id) else { return };
            (
                entry.queue_name.clone(),
                entry.preferred_instance().map(|i| i.device_uri()).unwrap_or_else(|| entry.device_uri.clone()),
                entry.capabilities.is_stale(),
                entry.was_default,
                entry.learned_via_legacy_broadcast,
                entry.retry_count,
            )
        };

        // Step 1: acquire capabilities if not cached.
        if capabilities_stale {
            match remote.get_printer_attributes(&device_uri).await {
                Ok(attrs) => {
                    let mut reg = registry.write().await;
                    if let Some(entry) = reg.get_mut(id) {
                        entry.capabilities.attributes = attrs;
                        entry.capabilities.fetched_at = Some(Utc::now());
                    }
                }
                Err(e) if e.kind == ErrorKind::PermanentRemote => {
                    let mut reg = registry.write().await;
                    reg.apply_transition(id, Trigger::CreateModifyFatalFailure);
                    return;
                }
                Err(_) => {
                    self.reschedule_after_transient(id, registry, retry_count).await;
                    return;
                }
            }
        }

        // Steps 3-4: assemble option defaults and the device URI to send,
        // reading the capability cache *after* the possible refresh above.
        let (persisted_options, make_and_model, linkage) = {
            let reg = registry.read().await;
            let Some(entry) = reg.get(id) else { return };
            (
                entry.capabilities.persisted_options.clone(),
                entry
                    .capabilities
                    .attributes
                    .get("printer-make-and-model")
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string()),
                entry.linkage,
            )
        };

        let mut options = parse_default_options(&self.config.default_options);
        for (k, v) in persisted_options {
            options.insert(k, v);
        }

        let effective_uri = match linkage {
            ClusterLinkage::Master => format!("implicitclass:{queue_name}"),
            _ => device_uri.clone(),
        };

        let is_shared = self.shared_policy(registry, id).await;

        let def = PrinterDefinition {
            queue_name: queue_name.clone(),
            device_uri: effective_uri,
            make_and_model,
            info: options.get("printer-info").cloned(),
            location: options.get("printer-location").cloned(),
            is_shared,
            ppd_path: None,
        };

        // Step 5: send, with retry/backoff capped at HttpMaxRetries.
        match scheduler.create_or_modify_printer(&self.config.scheduler_uri, &def).await {
            Ok(()) => {
                // Marking managed and setting the shared bit are kept as a
                // separate set_option call so the flag stays addressable
                // independent of create-or-modify.
                let _ = scheduler
                    .set_option(&self.config.scheduler_uri, &queue_name, MARK_OPTION, "true")
                    .await;

                // Step 7: re-enable, in case a previous run left it disabled.
                let _ = scheduler.resume_printer(&self.config.scheduler_uri, &queue_name).await;

                // Step 8: restore default designation if this queue was
                // the scheduler default in a prior session.
                if was_default {
                    let _ = scheduler.set_default(&self.config.scheduler_uri, &queue_name).await;
                }

                // Step 9: confirm, and set the legacy-broadcast expiry timer
                // only if this entry was learned via legacy broadcast.
                let mut reg = registry.write().await;
                reg.apply_transition(id, Trigger::CreateModifySucceeded);
                if let Some(entry) = reg.get_mut(id) {
                    entry.retry_count = 0;
                    entry.legacy_broadcast_timeout = if learned_via_legacy_broadcast {
                        Some(Utc::now() + ChronoDuration::from_std(self.config.browse_timeout).unwrap_or_default())
                    } else {
                        None
                    };
                    entry.timeout = entry
                        .legacy_broadcast_timeout
                        .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24));
                }
                info!(entry = %id, queue = %queue_name, "reconciler: queue created/modified");
            }
            Err(_) => {
                self.reschedule_after_transient(id, registry, retry_count).await;
            }
        }
    }

    /// Shared-flag policy: a user override on a
    /// standalone network printer is preserved; a cluster queue backed by a
    /// remote scheduler is never shared unless
    /// `AllowResharingRemoteCUPSPrinters` is set.
    async fn shared_policy(&self, registry: &RwLock<Registry>, id: EntryId) -> bool {
        let reg = registry.read().await;
        let Some(entry) = reg.get(id) else { return false };
        if entry.cluster && entry.cups_queue {
            self.config.allow_resharing_remote_cups_printers
        } else {
            true
        }
    }

    async fn reschedule_after_transient(&self, id: EntryId, registry: &RwLock<Registry>, retry_count: u32) {
        let retry_cfg = self.config.retry_config();
        let err = EngineError::transient_remote("create/modify request failed");
        match should_retry(&err, retry_count, &retry_cfg) {
            RetryDecision::RetryAfter(delay) => {
                let mut reg = registry.write().await;
                reg.apply_transition(id, Trigger::CreateModifyTransientFailure);
                if let Some(entry) = reg.get_mut(id) {
                    entry.retry_count += 1;
                    entry.timeout_count += 1;
                    entry.timeout = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                }
            }
            RetryDecision::Exhausted | RetryDecision::GiveUp(_) => {
                warn!(entry = %id, "reconciler: retries exhausted, abandoning entry for this session");
                let mut reg = registry.write().await;
                reg.apply_transition(id, Trigger::CreateModifyFatalFailure);
            }
        }
    }

    /// Delete path, steps 1-4.
    async fn delete_path(&self, id: EntryId, registry: &RwLock<Registry>, scheduler: &dyn SchedulerClient) {
        let (queue_name, was_default, options) = {
            let reg = registry.read().await;
            let Some(entry) = reg.get(id) else { return };
            (
                entry.queue_name.clone(),
                entry.was_default,
                entry.capabilities.persisted_options.clone(),
            )
        };

        // Step 1: persist current option defaults unless to-be-released
        // (handled by `release_path` instead, which skips this).
        let path = self.config.cache_dir.join(format!("options-{queue_name}"));
        if let Err(e) = persist::save_options(&path, &options) {
            warn!(entry = %id, error = %e, "reconciler: failed to persist options before delete");
        }

        // Step 2: active jobs -> disable and reschedule instead of deleting.
        match scheduler.get_jobs(&self.config.scheduler_uri, &queue_name).await {
            Ok(jobs) if !jobs.is_empty() => {
                let _ = scheduler
                    .pause_printer(&self.config.scheduler_uri, &queue_name)
                    .await;
                let mut reg = registry.write().await;
                if let Some(entry) = reg.get_mut(id) {
                    entry.status_text = Some(format!("{} active job(s), deferring removal", jobs.len()));
                    entry.timeout = Utc::now() + ChronoDuration::from_std(self.config.pause_between_updates).unwrap_or_default();
                }
                return;
            }
            Err(_) => {
                // Scheduler unreachable for this queue; try again next scan.
                let mut reg = registry.write().await;
                if let Some(entry) = reg.get_mut(id) {
                    entry.timeout = Utc::now() + ChronoDuration::from_std(self.config.pause_between_updates).unwrap_or_default();
                }
                return;
            }
            Ok(_) => {}
        }

        // Step 3: default queue, no notification channel available to
        // reassign default atomically -> disable only, don't delete.
        if was_default {
            let _ = scheduler.pause_printer(&self.config.scheduler_uri, &queue_name).await;
            let mut reg = registry.write().await;
            if let Some(entry) = reg.get_mut(id) {
                entry.timeout = Utc::now() + ChronoDuration::from_std(self.config.pause_between_updates).unwrap_or_default();
            }
            return;
        }

        // Step 4: delete and free the entry.
        match scheduler.delete_printer(&self.config.scheduler_uri, &queue_name).await {
            Ok(()) => {
                let mut reg = registry.write().await;
                reg.apply_transition(id, Trigger::RemovalSucceeded);
                reg.promote_slave_if_master_disappeared(id);
                reg.remove(id);
                info!(entry = %id, queue = %queue_name, "reconciler: queue deleted");
            }
            Err(_) => {
                let mut reg = registry.write().await;
                if let Some(entry) = reg.get_mut(id) {
                    entry.timeout = Utc::now() + ChronoDuration::from_std(self.config.pause_between_updates).unwrap_or_default();
                }
            }
        }
    }

    /// Release path: an entry detected as externally modified is detached
    /// from our control without touching the scheduler queue it no longer
    /// owns.
    async fn release_path(&self, id: EntryId, registry: &RwLock<Registry>, _scheduler: &dyn SchedulerClient) {
        let mut reg = registry.write().await;
        reg.apply_transition(id, Trigger::RemovalSucceeded);
        reg.remove(id);
        info!(entry = %id, "reconciler: entry released from management (not deleted on scheduler)");
    }

    /// Final reconciliation pass run on graceful shutdown: removes every
    /// managed queue unless `KeepGeneratedQueuesOnShutdown` is set.
    pub async fn shutdown_pass(&self, registry: &RwLock<Registry>, scheduler: &dyn SchedulerClient) {
        if self.config.keep_generated_queues_on_shutdown {
            return;
        }
        let ids: Vec<EntryId> = registry.read().await.iter_in_order().map(|e| e.id).collect();
        for id in ids {
            let _ = registry.write().await.apply_transition(id, Trigger::Removed);
            self.delete_path(id, registry, scheduler).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::scheduler_client::fake::FakeSchedulerClient;
    use crate::remote_client::fake::FakeRemotePrinterClient;
    use presswerk_core::{AddressFamily, DiscoveryInstance, Protocol};

    fn instance() -> DiscoveryInstance {
        DiscoveryInstance {
            interface: "eth0".into(),
            transport: Protocol::Ipp,
            family: AddressFamily::V4,
            host: "lab.local".into(),
            ip: None,
            port: 631,
            resource_path: "printers/lab".into(),
            via_dns_sd: true,
            loopback: false,
        }
    }

    fn config(cache_dir: PathBuf) -> ReconcilerConfig {
        ReconcilerConfig {
            max_updates_per_call: 10,
            pause_between_updates: StdDuration::from_millis(100),
            http_max_retries: 3,
            retry_base_delay: StdDuration::from_millis(10),
            retry_max_delay: StdDuration::from_secs(1),
            browse_timeout: StdDuration::from_secs(300),
            scheduler_uri: "ipp://localhost/".to_string(),
            default_options: String::new(),
            cache_dir,
            allow_resharing_remote_cups_printers: false,
            keep_generated_queues_on_shutdown: false,
        }
    }

    #[tokio::test]
    async fn create_or_modify_path_confirms_entry_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        let registry = RwLock::new(reg);

        let scheduler = FakeSchedulerClient::default();
        let remote = FakeRemotePrinterClient::default();
        remote.set_attributes(
            "ipp://lab.local:631/printers/lab",
            HashMap::from([("printer-make-and-model".to_string(), "Example MFG 9000".to_string())]),
        );

        let reconciler = Reconciler::new(config(dir.path().to_path_buf()));
        reconciler.create_or_modify_path(id, &registry, &scheduler, &remote).await;

        let reg = registry.read().await;
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn budget_limits_entries_processed_per_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        for i in 0..5 {
            let id = reg.create(format!("Printer_{i}"), instance());
            reg.get_mut(id).unwrap().timeout = Utc::now() - ChronoDuration::seconds(1);
        }
        let registry = RwLock::new(reg);

        let mut cfg = config(dir.path().to_path_buf());
        cfg.max_updates_per_call = 2;
        let reconciler = Reconciler::new(cfg);

        let due = reconciler.claim_due_entries(&registry).await;
        assert_eq!(due.len(), 2);

        let reg = registry.read().await;
        let still_due = reg.iter_in_order().filter(|e| !e.called && e.timeout <= Utc::now()).count();
        assert_eq!(still_due, 0, "overflowed entries must have their timeout pushed out");
    }

    #[tokio::test]
    async fn delete_path_disables_instead_of_deleting_when_jobs_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Busy_Printer".to_string(), instance());
        reg.get_mut(id).unwrap().status = EntryStatus::Disappeared;
        let registry = RwLock::new(reg);

        struct BusyScheduler(FakeSchedulerClient);
        #[async_trait::async_trait]
        impl SchedulerClient for BusyScheduler {
            async fn create_or_modify_printer(&self, u: &str, d: &PrinterDefinition) -> Result<()> {
                self.0.create_or_modify_printer(u, d).await
            }
            async fn delete_printer(&self, u: &str, q: &str) -> Result<()> {
                self.0.delete_printer(u, q).await
            }
            async fn pause_printer(&self, u: &str, q: &str) -> Result<()> {
                self.0.pause_printer(u, q).await
            }
            async fn resume_printer(&self, u: &str, q: &str) -> Result<()> {
                self.0.resume_printer(u, q).await
            }
            async fn get_jobs(&self, _u: &str, _q: &str) -> Result<Vec<i32>> {
                Ok(vec![42])
            }
            async fn get_printer_attributes(&self, u: &str, q: &str) -> Result<HashMap<String, String>> {
                self.0.get_printer_attributes(u, q).await
            }
            async fn set_default(&self, u: &str, q: &str) -> Result<()> {
                self.0.set_default(u, q).await
            }
            async fn create_subscription(&self, u: &str, q: &str, e: &[&str], l: u32) -> Result<crate::scheduler_client::SubscriptionHandle> {
                self.0.create_subscription(u, q, e, l).await
            }
            async fn renew_subscription(&self, u: &str, id: i32, l: u32) -> Result<()> {
                self.0.renew_subscription(u, id, l).await
            }
            async fn cancel_subscription(&self, u: &str, id: i32) -> Result<()> {
                self.0.cancel_subscription(u, id).await
            }
            async fn get_notifications(&self, u: &str, id: i32, s: i32) -> Result<Vec<crate::scheduler_client::Notification>> {
                self.0.get_notifications(u, id, s).await
            }
            async fn set_option(&self, u: &str, q: &str, o: &str, v: &str) -> Result<()> {
                self.0.set_option(u, q, o, v).await
            }
        }

        let scheduler = BusyScheduler(FakeSchedulerClient::default());
        let reconciler = Reconciler::new(config(dir.path().to_path_buf()));
        reconciler.delete_path(id, &registry, &scheduler).await;

        let reg = registry.read().await;
        let entry = reg.get(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Disappeared, "entry stays until jobs drain");
        assert!(entry.status_text.as_ref().unwrap().contains("active job"));
    }

    /// Wraps `FakeSchedulerClient` but returns a caller-supplied attribute
    /// set from `get_printer_attributes`, so `overwrite_check` can be
    /// exercised against a device-uri/nickname that diverges from whatever
    /// was last sent via `create_or_modify_printer`.
    struct AttrsScheduler {
        inner: FakeSchedulerClient,
        attrs: HashMap<String, String>,
    }

    #[async_trait::async_trait]
    impl SchedulerClient for AttrsScheduler {
        async fn create_or_modify_printer(&self, u: &str, d: &PrinterDefinition) -> Result<()> {
            self.inner.create_or_modify_printer(u, d).await
        }
        async fn delete_printer(&self, u: &str, q: &str) -> Result<()> {
            self.inner.delete_printer(u, q).await
        }
        async fn pause_printer(&self, u: &str, q: &str) -> Result<()> {
            self.inner.pause_printer(u, q).await
        }
        async fn resume_printer(&self, u: &str, q: &str) -> Result<()> {
            self.inner.resume_printer(u, q).await
        }
        async fn get_jobs(&self, u: &str, q: &str) -> Result<Vec<i32>> {
            self.inner.get_jobs(u, q).await
        }
        async fn get_printer_attributes(&self, _u: &str, _q: &str) -> Result<HashMap<String, String>> {
            Ok(self.attrs.clone())
        }
        async fn set_default(&self, u: &str, q: &str) -> Result<()> {
            self.inner.set_default(u, q).await
        }
        async fn create_subscription(&self, u: &str, q: &str, e: &[&str], l: u32) -> Result<crate::scheduler_client::SubscriptionHandle> {
            self.inner.create_subscription(u, q, e, l).await
        }
        async fn renew_subscription(&self, u: &str, id: i32, l: u32) -> Result<()> {
            self.inner.renew_subscription(u, id, l).await
        }
        async fn cancel_subscription(&self, u: &str, id: i32) -> Result<()> {
            self.inner.cancel_subscription(u, id).await
        }
        async fn get_notifications(&self, u: &str, id: i32, s: i32) -> Result<Vec<crate::scheduler_client::Notification>> {
            self.inner.get_notifications(u, id, s).await
        }
        async fn set_option(&self, u: &str, q: &str, o: &str, v: &str) -> Result<()> {
            self.inner.set_option(u, q, o, v).await
        }
    }

    #[tokio::test]
    async fn overwrite_detected_creates_renamed_replacement_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        reg.get_mut(id).unwrap().status = EntryStatus::Confirmed;
        let registry = RwLock::new(reg);

        let scheduler = AttrsScheduler {
            inner: FakeSchedulerClient::default(),
            attrs: HashMap::from([(
                "device-uri".to_string(),
                "ipp://someone-else.local:631/printers/other".to_string(),
            )]),
        };

        let reconciler = Reconciler::new(config(dir.path().to_path_buf()));
        reconciler.overwrite_check(id, &registry, &scheduler).await;

        let reg = registry.read().await;
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::ToBeReleased);
        let new_id = reg
            .find_by_queue_name("Lab_Printer@lab-local")
            .expect("renamed replacement entry should have been created");
        assert_eq!(reg.get(new_id).unwrap().status, EntryStatus::ToBeCreated);
    }

    #[tokio::test]
    async fn nickname_divergence_schedules_rewrite_without_releasing() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        {
            let entry = reg.get_mut(id).unwrap();
            entry.status = EntryStatus::Confirmed;
            entry
                .capabilities
                .attributes
                .insert("printer-make-and-model".to_string(), "Old Model".to_string());
        }
        let registry = RwLock::new(reg);

        let scheduler = AttrsScheduler {
            inner: FakeSchedulerClient::default(),
            attrs: HashMap::from([
                ("device-uri".to_string(), instance().device_uri()),
                ("printer-make-and-model".to_string(), "New Model".to_string()),
            ]),
        };

        let reconciler = Reconciler::new(config(dir.path().to_path_buf()));
        reconciler.overwrite_check(id, &registry, &scheduler).await;

        let reg = registry.read().await;
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::ToBeCreated);
        assert!(reg.find_by_queue_name("Lab_Printer@lab-local").is_none());
    }
}

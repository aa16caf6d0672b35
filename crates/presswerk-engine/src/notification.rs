// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scheduler Notification Handler (component G). Subscribes to
// four event types on the local scheduler and renews the subscription at
// half the lease period; reacts to printer-deleted, printer-modified,
// printer-state-changed and job-state events.

use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::persist;
use crate::reconciler::Reconciler;
use crate::registry::{Registry, Trigger};
use crate::remote_client::RemotePrinterClient;
use crate::scheduler_client::{Notification, SchedulerClient, SubscriptionHandle};
use presswerk_core::JobConstraints;

/// Events subscribed to on the local scheduler.
pub const SUBSCRIBED_EVENTS: [&str; 4] = ["printer-deleted", "printer-modified", "printer-state-changed", "job-state-changed"];

/// Renewal cadence: half the subscription lease, so a single missed renewal
/// attempt never lets the subscription lapse.
pub fn renewal_interval_secs(lease_seconds: u32) -> u64 {
    (lease_seconds / 2).max(1) as u64
}

pub struct NotificationHandlerConfig {
    pub scheduler_uri: String,
    pub lease_seconds: u32,
    pub local_default_path: PathBuf,
    pub remote_default_path: PathBuf,
}

/// Tracks which managed queue, if any, is currently believed to be the
/// scheduler's default printer, so transitions of that marker can be told
/// apart from the steady state.
pub struct NotificationHandler {
    config: NotificationHandlerConfig,
    known_default: RwLock<Option<String>>,
}

impl NotificationHandler {
    pub fn new(config: NotificationHandlerConfig) -> Self {
        Self {
            config,
            known_default: RwLock::new(None),
        }
    }

    pub async fn subscribe(&self, scheduler: &dyn SchedulerClient) -> crate::error::Result<SubscriptionHandle> {
        scheduler
            .create_subscription(&self.config.scheduler_uri, "", &SUBSCRIBED_EVENTS, self.config.lease_seconds)
            .await
    }

    pub async fn renew(&self, scheduler: &dyn SchedulerClient, handle: &SubscriptionHandle) {
        if let Err(e) = scheduler.renew_subscription(&self.config.scheduler_uri, handle.id, handle.lease_seconds).await {
            warn!(error = %e, "notification handler: subscription renewal failed");
        }
    }

    /// Dispatch one notification to the appropriate handler. `job_constraints`
    /// is supplied by the caller (read off the job's attributes at the IPP
    /// layer) since the notification payload itself carries only a job id.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle(
        &self,
        note: &Notification,
        job_constraints: &JobConstraints,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        remote: &dyn RemotePrinterClient,
        reconciler: &Reconciler,
        dispatcher: &Dispatcher,
    ) -> Option<DispatchOutcome> {
        match note.event.as_str() {
            "printer-deleted" => {
                self.handle_printer_deleted(note, registry, scheduler).await;
                None
            }
            "printer-modified" => {
                self.handle_printer_modified(note, registry, scheduler, reconciler).await;
                None
            }
            "printer-state-changed" => {
                self.handle_printer_state_changed(note, registry, scheduler).await;
                None
            }
            "job-state-changed" => {
                let Some(job_id) = note.job_id else { return None };
                let queue_name = note.printer_uri.as_deref().map(queue_name_from_uri)?;
                Some(dispatcher.dispatch(job_id, &queue_name, job_constraints, registry, scheduler, remote).await)
            }
            other => {
                warn!(event = other, "notification handler: unrecognized event, ignoring");
                None
            }
        }
    }

    async fn handle_printer_deleted(&self, note: &Notification, registry: &RwLock<Registry>, scheduler: &dyn SchedulerClient) {
        let Some(queue_name) = note.printer_uri.as_deref().map(queue_name_from_uri) else { return };
        let Some(id) = registry.read().await.find_by_queue_name(&queue_name) else { return };

        // Only react if no re-created queue with this name is visible yet.
        if scheduler.get_printer_attributes(&self.config.scheduler_uri, &queue_name).await.is_ok() {
            return;
        }

        let was_default = registry.read().await.get(id).map(|e| e.was_default).unwrap_or(false);
        if was_default {
            if let Err(e) = persist::record_local_default(&self.config.remote_default_path, &queue_name) {
                warn!(error = %e, "notification handler: failed to persist remote-default-printer marker");
            }
        }

        let mut reg = registry.write().await;
        if reg.apply_transition(id, Trigger::CapabilityChangedOrForcedRefresh).is_some() {
            info!(queue = %queue_name, "notification handler: printer-deleted, re-creating");
        }
    }

    async fn handle_printer_modified(
        &self,
        note: &Notification,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        reconciler: &Reconciler,
    ) {
        let Some(queue_name) = note.printer_uri.as_deref().map(queue_name_from_uri) else { return };
        let ids: Vec<_> = {
            let reg = registry.read().await;
            reg.iter_in_order().filter(|e| e.queue_name == queue_name).map(|e| e.id).collect()
        };
        for id in ids {
            // `apply_transition` inside `overwrite_check` already no-ops on an
            // entry whose `called` flag is set, satisfying "never trigger
            // while the entry is itself being rewritten by the reconciler".
            reconciler.overwrite_check(id, registry, scheduler).await;
        }
    }

    async fn handle_printer_state_changed(&self, note: &Notification, registry: &RwLock<Registry>, scheduler: &dyn SchedulerClient) {
        let Some(queue_name) = note.printer_uri.as_deref().map(queue_name_from_uri) else { return };
        let is_managed = registry.read().await.find_by_queue_name(&queue_name).is_some();
        if !is_managed {
            return;
        }

        let Ok(attrs) = scheduler.get_printer_attributes(&self.config.scheduler_uri, &queue_name).await else {
            return;
        };
        let is_default_now = attrs.get("printer-is-default").map(|v| v == "true" || v == "1").unwrap_or(false);

        let mut known = self.known_default.write().await;
        let was_default_before = known.as_deref() == Some(queue_name.as_str());

        if is_default_now && !was_default_before {
            *known = Some(queue_name.clone());
            if let Err(e) = persist::record_local_default(&self.config.remote_default_path, &queue_name) {
                warn!(error = %e, "notification handler: failed to record new default");
            }
            info!(queue = %queue_name, "notification handler: queue is now the default printer");
        } else if !is_default_now && was_default_before {
            *known = None;
            if let Err(e) = persist::clear_local_default(&self.config.remote_default_path) {
                warn!(error = %e, "notification handler: failed to clear default marker");
            }
            info!(queue = %queue_name, "notification handler: queue is no longer the default printer");
        }
    }
}

fn queue_name_from_uri(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::reconciler::{Reconciler, ReconcilerConfig};
    use crate::registry::Registry;
    use crate::remote_client::fake::FakeRemotePrinterClient;
    use crate::scheduler_client::fake::FakeSchedulerClient;
    use crate::scheduler_client::PrinterDefinition;
    use presswerk_core::{AddressFamily, DispatchPolicy, DiscoveryInstance, EntryStatus, Protocol};
    use std::time::Duration as StdDuration;

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

    fn handler_config(dir: &std::path::Path) -> NotificationHandlerConfig {
        NotificationHandlerConfig {
            scheduler_uri: "ipp://localhost/".to_string(),
            lease_seconds: 300,
            local_default_path: dir.join("local-default-printer"),
            remote_default_path: dir.join("remote-default-printer"),
        }
    }

    fn reconciler_config(dir: std::path::PathBuf) -> ReconcilerConfig {
        ReconcilerConfig {
            max_updates_per_call: 10,
            pause_between_updates: StdDuration::from_millis(50),
            http_max_retries: 3,
            retry_base_delay: StdDuration::from_millis(10),
            retry_max_delay: StdDuration::from_secs(1),
            browse_timeout: StdDuration::from_secs(300),
            scheduler_uri: "ipp://localhost/".to_string(),
            default_options: String::new(),
            cache_dir: dir,
            allow_resharing_remote_cups_printers: false,
            keep_generated_queues_on_shutdown: false,
        }
    }

    #[test]
    fn renewal_interval_is_half_the_lease() {
        assert_eq!(renewal_interval_secs(300), 150);
        assert_eq!(renewal_interval_secs(1), 1);
    }

    #[test]
    fn queue_name_extracted_from_trailing_uri_segment() {
        assert_eq!(queue_name_from_uri("ipp://localhost/printers/Lab_Printer"), "Lab_Printer");
    }

    #[tokio::test]
    async fn printer_deleted_marks_managed_entry_to_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        reg.get_mut(id).unwrap().status = EntryStatus::Confirmed;
        let registry = RwLock::new(reg);

        let scheduler = FakeSchedulerClient::default();
        let handler = NotificationHandler::new(handler_config(dir.path()));

        let note = Notification {
            event: "printer-deleted".to_string(),
            printer_uri: Some("ipp://localhost/printers/Lab_Printer".to_string()),
            job_id: None,
            sequence_number: 1,
        };
        handler.handle_printer_deleted(&note, &registry, &scheduler).await;

        assert_eq!(registry.read().await.get(id).unwrap().status, EntryStatus::ToBeCreated);
    }

    #[tokio::test]
    async fn printer_deleted_is_ignored_if_queue_already_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        reg.get_mut(id).unwrap().status = EntryStatus::Confirmed;
        let registry = RwLock::new(reg);

        let scheduler = FakeSchedulerClient::default();
        scheduler
            .create_or_modify_printer(
                "ipp://localhost/",
                &PrinterDefinition {
                    queue_name: "Lab_Printer".to_string(),
                    device_uri: "ipp://lab.local:631/printers/lab".to_string(),
                    make_and_model: "Example MFG 9000".to_string(),
                    info: None,
                    location: None,
                    is_shared: true,
                    ppd_path: None,
                },
            )
            .await
            .unwrap();

        let handler = NotificationHandler::new(handler_config(dir.path()));
        let note = Notification {
            event: "printer-deleted".to_string(),
            printer_uri: Some("ipp://localhost/printers/Lab_Printer".to_string()),
            job_id: None,
            sequence_number: 1,
        };
        handler.handle_printer_deleted(&note, &registry, &scheduler).await;

        assert_eq!(registry.read().await.get(id).unwrap().status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn job_state_changed_invokes_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".to_string(), instance());
        reg.get_mut(id).unwrap().status = EntryStatus::Confirmed;
        let registry = RwLock::new(reg);

        let scheduler = FakeSchedulerClient::default();
        let remote = FakeRemotePrinterClient::default();
        remote.set_state("ipp://lab.local:631/printers/lab", presswerk_core::PrinterState::Idle, true);

        let handler = NotificationHandler::new(handler_config(dir.path()));
        let reconciler = Reconciler::new(reconciler_config(dir.path().to_path_buf()));
        let dispatcher = Dispatcher::new(DispatchPolicy::QueueOnClient, "ipp://localhost/".to_string());

        let note = Notification {
            event: "job-state-changed".to_string(),
            printer_uri: Some("ipp://localhost/printers/Lab_Printer".to_string()),
            job_id: Some(7),
            sequence_number: 1,
        };

        let outcome = handler
            .handle(&note, &JobConstraints::default(), &registry, &scheduler, &remote, &reconciler, &dispatcher)
            .await;

        assert!(matches!(outcome, Some(DispatchOutcome::Dispatched { .. })));
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `DaemonApp` — coordinates every subsystem via a single cooperative
// `tokio::select!` loop: discovery events, the reconciler timer,
// subscription renewal and polling, auto-shutdown evaluation, and graceful
// termination.

use std::collections::HashMap;
use std::sync::Arc;

use presswerk_core::{ClusterLinkage, DaemonConfig, EntryId, JobConstraints};
use presswerk_engine::access;
use presswerk_engine::cluster::{self, Resolution};
use presswerk_engine::discovery::{self, DiscoveryEvent, DiscoveryService};
use presswerk_engine::dispatcher::Dispatcher;
use presswerk_engine::netifs::NetworkInterfaceTracker;
use presswerk_engine::notification::{renewal_interval_secs, NotificationHandler, NotificationHandlerConfig};
use presswerk_engine::reconciler::{Reconciler, ReconcilerConfig};
use presswerk_engine::registry::Registry;
use presswerk_engine::remote_client::{IppRemotePrinterClient, RemotePrinterClient};
use presswerk_engine::scheduler_client::{IppSchedulerClient, SchedulerClient, SubscriptionHandle};
use presswerk_engine::shutdown::ShutdownController;
use presswerk_engine::EngineError;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

const RECONCILE_TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_CHECK_TICK: Duration = Duration::from_secs(5);
const NETIF_REFRESH_TICK: Duration = Duration::from_secs(30);
const NOTIFICATION_POLL_TICK: Duration = Duration::from_secs(2);

pub struct DaemonApp {
    config: DaemonConfig,
    registry: Arc<RwLock<Registry>>,
    netifs: Arc<NetworkInterfaceTracker>,
    scheduler: Arc<dyn SchedulerClient>,
    remote: Arc<dyn RemotePrinterClient>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    notification_handler: NotificationHandler,
    shutdown_controller: ShutdownController,
    discovery: Option<DiscoveryService>,
    discovery_rx: Option<tokio::sync::mpsc::Receiver<DiscoveryEvent>>,
    /// Maps a DNS-SD fullname to the registry entry it most recently
    /// resolved to, so a `ServiceRemoved` event (which carries only the
    /// fullname) can find its entry again without widening
    /// `DiscoveryInstance` to carry the fullname itself.
    known_services: Mutex<HashMap<String, EntryId>>,
}

impl DaemonApp {
    pub fn new(config: DaemonConfig) -> presswerk_engine::Result<Self> {
        let (discovery, discovery_rx) = DiscoveryService::start(&config.protocols)
            .map_err(|e| EngineError::fatal_init(format!("could not start DNS-SD discovery: {e}")))?;

        let reconciler = Reconciler::new(ReconcilerConfig {
            max_updates_per_call: config.update_cups_queues_max_per_call,
            pause_between_updates: config.pause_between_cups_queue_updates,
            http_max_retries: config.http_max_retries,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            browse_timeout: config.browse_timeout,
            scheduler_uri: local_scheduler_uri(),
            default_options: config.default_options.clone(),
            cache_dir: config.cache_dir.clone(),
            allow_resharing_remote_cups_printers: config.allow_resharing_remote_cups_printers,
            keep_generated_queues_on_shutdown: config.keep_generated_queues_on_shutdown,
        });

        let dispatcher = Dispatcher::new(config.dispatch, local_scheduler_uri());

        let notification_handler = NotificationHandler::new(NotificationHandlerConfig {
            scheduler_uri: local_scheduler_uri(),
            lease_seconds: config.notify_lease_duration.as_secs() as u32,
            local_default_path: config.local_default_printer_path(),
            remote_default_path: config.remote_default_printer_path(),
        });

        let shutdown_controller = ShutdownController::new(config.shutdown.clone());

        Ok(Self {
            config,
            registry: Arc::new(RwLock::new(Registry::new())),
            netifs: Arc::new(NetworkInterfaceTracker::new()),
            scheduler: Arc::new(IppSchedulerClient::default()),
            remote: Arc::new(IppRemotePrinterClient::default()),
            reconciler,
            dispatcher,
            notification_handler,
            shutdown_controller,
            discovery: Some(discovery),
            discovery_rx: Some(discovery_rx),
            known_services: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(mut self) {
        self.netifs.refresh().await;

        let subscription = match self.notification_handler.subscribe(&*self.scheduler).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not subscribe to scheduler notifications, job dispatch will be degraded");
                None
            }
        };
        let mut last_sequence = 0;

        let mut discovery_rx = self.discovery_rx.take().expect("discovery receiver taken once");
        let mut reconcile_interval = tokio::time::interval(RECONCILE_TICK);
        let mut renew_interval = tokio::time::interval(Duration::from_secs(renewal_interval_secs(
            self.config.notify_lease_duration.as_secs() as u32,
        )));
        let mut notify_poll_interval = tokio::time::interval(NOTIFICATION_POLL_TICK);
        let mut shutdown_check_interval = tokio::time::interval(SHUTDOWN_CHECK_TICK);
        let mut netif_refresh_interval = tokio::time::interval(NETIF_REFRESH_TICK);
        let mut poll_list_interval = tokio::time::interval(self.config.browse_interval.max(Duration::from_secs(1)));

        info!("main event loop started");
        loop {
            tokio::select! {
                Some(event) = discovery_rx.recv() => {
                    self.handle_discovery_event(event).await;
                }

                _ = reconcile_interval.tick() => {
                    self.reconciler.scan(&self.registry, &*self.scheduler, &*self.remote).await;
                }

                _ = poll_list_interval.tick() => {
                    self.poll_remote_servers().await;
                }

                _ = renew_interval.tick() => {
                    if let Some(handle) = &subscription {
                        self.notification_handler.renew(&*self.scheduler, handle).await;
                    }
                }

                _ = notify_poll_interval.tick() => {
                    self.poll_notifications(subscription.as_ref(), &mut last_sequence).await;
                }

                _ = shutdown_check_interval.tick() => {
                    self.evaluate_shutdown().await;
                    if self.shutdown_controller.due().await {
                        info!("auto-shutdown deadline elapsed, terminating");
                        break;
                    }
                }

                _ = netif_refresh_interval.tick() => {
                    self.netifs.refresh().await;
                }

                signal = wait_for_signal() => {
                    match signal {
                        DaemonSignal::Terminate => {
                            info!("termination signal received, shutting down");
                            break;
                        }
                        DaemonSignal::EnableAutoShutdown => {
                            info!("auto-shutdown enabled via signal");
                            self.shutdown_controller.toggle(true).await;
                        }
                        DaemonSignal::DisableAutoShutdown => {
                            info!("auto-shutdown disabled via signal");
                            self.shutdown_controller.toggle(false).await;
                        }
                    }
                }
            }
        }

        if let Some(handle) = &subscription {
            if let Err(e) = self.scheduler.cancel_subscription(&local_scheduler_uri(), handle.id).await {
                debug!(error = %e, "failed to cancel notification subscription during shutdown");
            }
        }
        self.reconciler.shutdown_pass(&self.registry, &*self.scheduler).await;
        if let Some(discovery) = self.discovery.take() {
            discovery.shutdown();
        }
    }

    async fn poll_notifications(&self, subscription: Option<&SubscriptionHandle>, last_sequence: &mut i32) {
        let Some(handle) = subscription else { return };
        let notifications = match self
            .scheduler
            .get_notifications(&local_scheduler_uri(), handle.id, *last_sequence)
            .await
        {
            Ok(notifications) => notifications,
            Err(e) => {
                debug!(error = %e, "polling scheduler notifications failed");
                return;
            }
        };

        for note in &notifications {
            *last_sequence = (*last_sequence).max(note.sequence_number);
            let constraints = JobConstraints::default();
            let outcome = self
                .notification_handler
                .handle(note, &constraints, &self.registry, &*self.scheduler, &*self.remote, &self.reconciler, &self.dispatcher)
                .await;
            if let Some(outcome) = outcome {
                debug!(?outcome, event = %note.event, "notification handler produced a dispatch outcome");
            }
        }
    }

    /// Aggregates active local-scheduler job counts across every managed
    /// queue, so the `no-jobs` auto-shutdown mode can actually observe a job
    /// arriving and cancel a pending exit.
    async fn evaluate_shutdown(&self) {
        let (queue_count, queue_names) = {
            let reg = self.registry.read().await;
            (reg.len(), reg.iter_in_order().map(|e| e.queue_name.clone()).collect::<Vec<_>>())
        };

        let scheduler_uri = local_scheduler_uri();
        let mut active_jobs: u32 = 0;
        for queue_name in &queue_names {
            match self.scheduler.get_jobs(&scheduler_uri, queue_name).await {
                Ok(jobs) => active_jobs += jobs.len() as u32,
                Err(e) => debug!(queue = %queue_name, error = %e, "could not query active jobs for shutdown evaluation"),
            }
        }

        self.shutdown_controller.evaluate(queue_count, active_jobs).await;
    }

    /// Periodic polling intake: issues a get-printer-attributes call against
    /// every `poll_list` URI and feeds the normalized result through the same
    /// `reconcile_found`/creation pipeline as DNS-SD discovery events.
    async fn poll_remote_servers(&self) {
        for uri in &self.config.poll_list {
            let attrs = match self.remote.get_printer_attributes(uri).await {
                Ok(attrs) => attrs,
                Err(e) => {
                    debug!(uri = %uri, error = %e, "poll: get-printer-attributes failed");
                    continue;
                }
            };
            match discovery::build_polled_record(uri, &attrs) {
                Some(record) => self.handle_record_found(record).await,
                None => warn!(uri = %uri, "poll: could not parse configured poll_list URI"),
            }
        }
    }

    async fn handle_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::RecordFound(record) => self.handle_record_found(record).await,
            DiscoveryEvent::RecordRemoved { service_name, .. } => self.handle_record_removed(&service_name).await,
        }
    }

    async fn handle_record_found(&self, record: presswerk_core::DiscoveredPrinterRecord) {
        if discovery::is_local_origin(&record, &self.netifs).await {
            return;
        }
        if let Some(ip) = record.ip {
            if !access::evaluate(&self.config.access, &ip) {
                debug!(host = %record.host, "discovery: record rejected by access policy");
                return;
            }
        }
        if !discovery::passes_filters(&record, &self.config.filters) {
            return;
        }

        let fullname = record.service_name.clone();
        let mut reg = self.registry.write().await;

        let resolution = {
            let existing = |name: &str| reg.find_by_queue_name(name).is_some();
            cluster::resolve(
                self.config.naming,
                Some(record.service_name.as_str()),
                record.make_and_model.as_deref(),
                None,
                &record.host,
                record.cups_queue,
                &self.config.clusters,
                self.config.auto_clustering,
                &existing,
                None,
                &existing,
            )
        };

        let wants_cluster = matches!(resolution, Resolution::JoinCluster(_));
        let queue_name = match resolution {
            Resolution::Standalone(name) | Resolution::JoinCluster(name) => name,
            Resolution::Failed => {
                warn!(host = %record.host, "discovery: no legal queue name could be derived, dropping record");
                return;
            }
        };

        if let Some(id) = discovery::reconcile_found(&mut reg, &queue_name, &record, self.config.refresh_capabilities_on_each_discovery) {
            self.known_services.lock().await.insert(fullname, id);
            return;
        }

        let cups_queue = record.cups_queue;
        let instance = record.into_instance();
        let id = reg.create(queue_name.clone(), instance);
        if let Some(entry) = reg.get_mut(id) {
            entry.cups_queue = cups_queue;
        }

        if wants_cluster {
            let master_id = reg
                .iter_in_order()
                .find(|e| e.queue_name == queue_name && e.id != id && e.is_master())
                .map(|e| e.id);
            if let Some(entry) = reg.get_mut(id) {
                entry.cluster = true;
                entry.linkage = match master_id {
                    Some(master) => ClusterLinkage::Slave(master),
                    None => ClusterLinkage::Master,
                };
            }
        }

        info!(queue = %queue_name, id = %id, "discovery: new managed entry created");
        self.known_services.lock().await.insert(fullname, id);
    }

    async fn handle_record_removed(&self, service_name: &str) {
        let Some(id) = self.known_services.lock().await.remove(service_name) else {
            return;
        };
        let mut reg = self.registry.write().await;
        let instance_count = reg.get(id).map(|e| e.instances.len()).unwrap_or(0);
        if instance_count <= 1 {
            if reg.apply_transition(id, presswerk_engine::registry::Trigger::AllInstancesGoneGracefully).is_some() {
                debug!(id = %id, "discovery: last instance for entry disappeared gracefully");
            }
        }
    }
}

/// The local scheduler's administrative URI — always the loopback CUPS
/// socket, unlike `poll_list` (remote schedulers discovery polls).
fn local_scheduler_uri() -> String {
    "ipp://localhost:631/".to_string()
}

enum DaemonSignal {
    Terminate,
    EnableAutoShutdown,
    DisableAutoShutdown,
}

/// Waits for `SIGTERM`/Ctrl+C (graceful stop) or the `SIGUSR1`/`SIGUSR2`
/// auto-shutdown toggles.
async fn wait_for_signal() -> DaemonSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
        let mut sigusr2 = signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => DaemonSignal::Terminate,
            _ = sigterm.recv() => DaemonSignal::Terminate,
            _ = sigusr1.recv() => DaemonSignal::EnableAutoShutdown,
            _ = sigusr2.recv() => DaemonSignal::DisableAutoShutdown,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        DaemonSignal::Terminate
    }
}

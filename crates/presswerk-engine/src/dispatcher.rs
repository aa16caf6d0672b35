// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job Dispatcher (component H). Triggered by the Scheduler
// Notification Handler whenever a job enters `processing` on a managed
// cluster queue; picks exactly one backing remote printer and writes the
// selection into a scheduler option for the backend to read.

use presswerk_core::{CapabilityCache, DispatchPolicy, EntryId, JobConstraints, PrinterState};
use tokio::sync::RwLock;
use tracing::info;

use crate::reconciler::MARK_OPTION;
use crate::registry::Registry;
use crate::remote_client::RemotePrinterClient;
use crate::scheduler_client::SchedulerClient;

/// Forwarding-format priority list, most-preferred first.
const FORMAT_PRIORITY: &[&str] = &[
    "application/vnd.cups-pdf",
    "image/urf",
    "application/pdf",
    "image/pwg-raster",
    "application/PCLm",
    "application/vnd.hp-pclxl",
    "application/postscript",
    "application/pcl",
];

const FALLBACK_RESOLUTION_DPI: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { candidate: EntryId, device_uri: String, format: String, resolution: u32 },
    /// No idle candidate was found but at least one candidate was `processing`
    /// and accepting jobs — reachable under either policy, since a
    /// `QueueOnClient` scan still notices busy-but-reachable candidates even
    /// though it will not select one as a winner.
    AllDestsBusy,
    /// No accepting/idle candidate and `QueueOnClient` forbids falling back
    /// to a processing one, or the candidate list was empty after filtering.
    NoDestFound,
}

struct Candidate {
    id: EntryId,
    device_uri: String,
    capabilities: CapabilityCache,
}

pub struct Dispatcher {
    policy: DispatchPolicy,
    scheduler_uri: String,
}

impl Dispatcher {
    pub fn new(policy: DispatchPolicy, scheduler_uri: String) -> Self {
        Self { policy, scheduler_uri }
    }

    /// Select a backing remote printer for a job that just entered
    /// `processing` on `queue_name`, and record the decision both in the
    /// registry (`lastPrinter`) and on the scheduler queue (the
    /// `<mark>-dest-printer` option).
    pub async fn dispatch(
        &self,
        job_id: i32,
        queue_name: &str,
        constraints: &JobConstraints,
        registry: &RwLock<Registry>,
        scheduler: &dyn SchedulerClient,
        remote: &dyn RemotePrinterClient,
    ) -> DispatchOutcome {
        let (candidates, master_id, last_printer) = {
            let reg = registry.read().await;
            let ids = reg.confirmed_with_name(queue_name);
            let mut candidates = Vec::with_capacity(ids.len());
            let mut master_id = None;
            let mut last_printer = None;
            for id in ids {
                let Some(entry) = reg.get(id) else { continue };
                if entry.is_master() {
                    master_id = Some(id);
                    last_printer = entry.last_printer;
                }
                candidates.push(Candidate {
                    id,
                    device_uri: entry.preferred_instance().map(|i| i.device_uri()).unwrap_or_else(|| entry.device_uri.clone()),
                    capabilities: entry.capabilities.clone(),
                });
            }
            (candidates, master_id, last_printer)
        };

        // Step 2: filter out candidates whose cached attributes don't
        // advertise support for the job's carried constraints.
        let candidates: Vec<Candidate> = candidates.into_iter().filter(|c| satisfies(constraints, &c.capabilities)).collect();

        if candidates.is_empty() {
            return DispatchOutcome::NoDestFound;
        }

        // Step 3: round-robin starting index from the master's lastPrinter.
        let n = candidates.len();
        let start = last_printer
            .and_then(|last| candidates.iter().position(|c| c.id == last))
            .map(|pos| (pos + 1) % n)
            .unwrap_or(0);

        // Step 4: scan for the first idle+accepting candidate; under
        // QueueOnServers, track the least-busy processing candidate too.
        let mut chosen: Option<usize> = None;
        let mut best_busy: Option<(usize, u32)> = None;
        let mut saw_busy_candidate = false;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let candidate = &candidates[idx];
            let Ok((state, accepting)) = remote.get_printer_state(&candidate.device_uri).await else {
                continue;
            };
            if !accepting {
                continue;
            }
            match state {
                PrinterState::Idle => {
                    chosen = Some(idx);
                    break;
                }
                PrinterState::Processing if self.policy == DispatchPolicy::QueueOnServers => {
                    saw_busy_candidate = true;
                    let count = remote.queued_job_count(&candidate.device_uri).await.unwrap_or(u32::MAX);
                    if best_busy.map(|(_, c)| count < c).unwrap_or(true) {
                        best_busy = Some((idx, count));
                    }
                }
                PrinterState::Processing => {
                    saw_busy_candidate = true;
                }
                PrinterState::Stopped => {}
            }
        }

        let chosen_idx = match chosen.or_else(|| best_busy.map(|(idx, _)| idx)) {
            Some(idx) => idx,
            None => {
                return if saw_busy_candidate {
                    DispatchOutcome::AllDestsBusy
                } else {
                    DispatchOutcome::NoDestFound
                };
            }
        };

        let winner = &candidates[chosen_idx];

        // Step 5: resolution.
        let resolution = compute_resolution(constraints, &winner.capabilities);

        // Step 6: forwarding format.
        let format = FORMAT_PRIORITY
            .iter()
            .find(|candidate_format| winner.capabilities.document_formats_supported.iter().any(|f| f == *candidate_format))
            .map(|f| f.to_string())
            .or_else(|| winner.capabilities.document_formats_supported.first().cloned())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let option_value = format!("{job_id} {} {format} {resolution}", winner.device_uri);
        let _ = scheduler
            .set_option(&self.scheduler_uri, queue_name, &format!("{MARK_OPTION}-dest-printer"), &option_value)
            .await;

        // Step 7: record the choice on the master entry.
        if let Some(master_id) = master_id {
            if let Some(entry) = registry.write().await.get_mut(master_id) {
                entry.last_printer = Some(winner.id);
            }
        }

        info!(job_id, queue = %queue_name, candidate = %winner.id, format = %format, resolution, "dispatcher: job routed");
        DispatchOutcome::Dispatched {
            candidate: winner.id,
            device_uri: winner.device_uri.clone(),
            format,
            resolution,
        }
    }
}

fn satisfies(constraints: &JobConstraints, caps: &CapabilityCache) -> bool {
    if let Some(format) = &constraints.document_format {
        if !caps.document_formats_supported.is_empty() && !caps.document_formats_supported.iter().any(|f| f == format) {
            return false;
        }
    }
    if let Some(media) = &constraints.media {
        if !caps.media_supported.is_empty() && !caps.media_supported.iter().any(|m| m == media) {
            return false;
        }
    }
    if let Some(sides) = &constraints.sides {
        if !caps.sides_supported.is_empty() && !caps.sides_supported.iter().any(|s| s == sides) {
            return false;
        }
    }
    if let Some(true) = constraints.color {
        if !caps.color_supported {
            return false;
        }
    }
    // staple/fold/punch/orientation/print-quality are not represented in the
    // capability cache, so they cannot be used to exclude a candidate here.
    true
}

fn compute_resolution(constraints: &JobConstraints, caps: &CapabilityCache) -> u32 {
    use presswerk_core::PrintQuality;
    match constraints.print_quality {
        Some(PrintQuality::Draft) => caps.resolutions_supported.iter().copied().min(),
        Some(PrintQuality::High) => caps.resolutions_supported.iter().copied().max(),
        _ => None,
    }
    .or(caps.default_resolution)
    .unwrap_or(FALLBACK_RESOLUTION_DPI)
}

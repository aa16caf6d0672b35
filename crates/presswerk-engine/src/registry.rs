// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Remote Printer Registry (component D).
//
// An arena keyed by `EntryId` rather than a graph of shared pointers:
// `slaveOf` stores an `EntryId`, and the deleted-master sentinel is the
// reserved identifier `EntryId::DELETED_MASTER`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use presswerk_core::{ClusterLinkage, DiscoveryInstance, EntryId, EntryStatus, RemotePrinterEntry};
use tracing::{debug, info};

/// Triggers that move an entry between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CreateModifySucceeded,
    CreateModifyTransientFailure,
    CreateModifyFatalFailure,
    CapabilityChangedOrForcedRefresh,
    AllInstancesGoneGracefully,
    DiscoveryMatched,
    UnconfirmedTimedOut,
    Removed,
    OverwriteDetected,
    RemovalSucceeded,
    SlavePromotedToMaster,
    NameClashResolved,
}

/// What the reconciler should do as a consequence of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    CreateOrModify,
    Delete,
    Release,
    None,
}

/// Pure state-machine step: given a current state and a trigger, return the
/// next state and the side effect the reconciler must execute, as a
/// tagged-variant transition function rather than an overloaded status code.
pub fn transition(current: EntryStatus, trigger: Trigger) -> Option<(EntryStatus, SideEffect)> {
    use EntryStatus::*;
    use Trigger::*;

    match (current, trigger) {
        (ToBeCreated, CreateModifySucceeded) => Some((Confirmed, SideEffect::None)),
        (ToBeCreated, CreateModifyTransientFailure) => Some((ToBeCreated, SideEffect::CreateOrModify)),
        (ToBeCreated, CreateModifyFatalFailure) => Some((Disappeared, SideEffect::Delete)),

        (Confirmed, CapabilityChangedOrForcedRefresh) => Some((ToBeCreated, SideEffect::CreateOrModify)),
        (Confirmed, AllInstancesGoneGracefully) => Some((Unconfirmed, SideEffect::None)),
        (Confirmed, Removed) => Some((Disappeared, SideEffect::Delete)),
        (Confirmed, OverwriteDetected) => Some((ToBeReleased, SideEffect::Release)),

        (Unconfirmed, DiscoveryMatched) => Some((Confirmed, SideEffect::None)),
        (Unconfirmed, UnconfirmedTimedOut) => Some((Disappeared, SideEffect::Delete)),

        (Disappeared, RemovalSucceeded) => Some((Disappeared, SideEffect::None)),
        (Disappeared, SlavePromotedToMaster) => Some((ToBeCreated, SideEffect::CreateOrModify)),

        (ToBeReleased, RemovalSucceeded) => Some((ToBeReleased, SideEffect::None)),

        (ToBeCreatedRenamed, NameClashResolved) => Some((ToBeCreated, SideEffect::CreateOrModify)),

        _ => None,
    }
}

/// In-memory arena of remote printer entries.
pub struct Registry {
    entries: HashMap<EntryId, RemotePrinterEntry>,
    /// Insertion order, preserved so the reconciler's per-scan order is
    /// deterministic.
    order: Vec<EntryId>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            // 0 is reserved for the deleted-master sentinel.
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> EntryId {
        EntryId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a new *to-be-created* entry.
    pub fn create(&mut self, queue_name: String, instance: DiscoveryInstance) -> EntryId {
        let id = self.alloc_id();
        let entry = RemotePrinterEntry::new(id, queue_name, instance);
        self.entries.insert(id, entry);
        self.order.push(id);
        debug!(entry = %id, "registry: created entry");
        id
    }

    pub fn get(&self, id: EntryId) -> Option<&RemotePrinterEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RemotePrinterEntry> {
        self.entries.get_mut(&id)
    }

    /// Entries in stable scan order (masters are inserted before the slaves
    /// that join them, satisfying ordering guarantee 2).
    pub fn iter_in_order(&self) -> impl Iterator<Item = &RemotePrinterEntry> {
        self.order.iter().filter_map(move |id| self.entries.get(id))
    }

    /// Find an entry with the given sanitized queue name whose device URI
    /// agrees with `candidate_uri` up to the trivial variants named in
    /// step 1 (plain/secure IPP, port 631/443) and whose
    /// resource path matches.
    pub fn find_matching(&self, queue_name: &str, candidate_uri: &str, resource_path: &str) -> Option<EntryId> {
        self.order.iter().copied().find(|id| {
            let Some(entry) = self.entries.get(id) else {
                return false;
            };
            entry.queue_name == queue_name
                && uri_agrees_up_to_trivial_variants(&entry.device_uri, candidate_uri)
                && entry
                    .preferred_instance()
                    .map(|i| i.resource_path == resource_path)
                    .unwrap_or(true)
        })
    }

    pub fn find_by_queue_name(&self, queue_name: &str) -> Option<EntryId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.entries.get(id).map(|e| e.queue_name == queue_name).unwrap_or(false))
    }

    /// All confirmed entries sharing a queue name — the dispatcher's
    /// candidate list.
    pub fn confirmed_with_name(&self, queue_name: &str) -> Vec<EntryId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id)
                    .map(|e| e.queue_name == queue_name && e.status == EntryStatus::Confirmed)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Apply a state transition, enforcing invariant 3 (never transition an
    /// entry whose `called` flag is set) by returning `false` without effect.
    pub fn apply_transition(&mut self, id: EntryId, trigger: Trigger) -> Option<SideEffect> {
        let entry = self.entries.get_mut(&id)?;
        if entry.called {
            debug!(entry = %id, "registry: skipping transition, entry is called");
            return None;
        }
        let (next, effect) = transition(entry.status, trigger)?;
        info!(entry = %id, from = %entry.status, to = %next, "registry: transition");
        entry.status = next;
        Some(effect)
    }

    /// Promotion rule: when a master enters *disappeared*,
    /// search for a live (non-disappeared, non-to-be-released) slave of the
    /// same cluster; if found, promote it to master and set it to
    /// *to-be-created* so the reconciler rewrites the queue.
    pub fn promote_slave_if_master_disappeared(&mut self, master_id: EntryId) -> Option<EntryId> {
        let is_disappeared = self
            .entries
            .get(&master_id)
            .map(|e| e.status == EntryStatus::Disappeared)
            .unwrap_or(false);
        if !is_disappeared {
            return None;
        }

        let candidate = self.order.iter().copied().find(|id| {
            self.entries.get(id).map(|e| {
                e.slave_of() == Some(master_id)
                    && !matches!(e.status, EntryStatus::Disappeared | EntryStatus::ToBeReleased)
            }).unwrap_or(false)
        })?;

        // Reparent remaining slaves of the old master to the deleted-master
        // sentinel before rewriting the promoted entry, so their eventual
        // removal does not delete the replacement queue created in this
        // same pass.
        for id in self.order.clone() {
            if id == candidate {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.slave_of() == Some(master_id) {
                    entry.linkage = ClusterLinkage::Slave(EntryId::DELETED_MASTER);
                }
            }
        }

        if let Some(promoted) = self.entries.get_mut(&candidate) {
            promoted.linkage = ClusterLinkage::Master;
            promoted.status = EntryStatus::ToBeCreated;
            promoted.timeout = Utc::now();
            promoted.cluster = true;
        }

        info!(old_master = %master_id, new_master = %candidate, "registry: promoted slave to master");
        Some(candidate)
    }

    /// Remove an entry entirely, after a successful delete request.
    pub fn remove(&mut self, id: EntryId) {
        self.entries.remove(&id);
        self.order.retain(|existing| *existing != id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Two URIs "agree up to trivial variants" if they differ only in scheme
/// (`ipp` vs `ipps`) and/or the corresponding default port (631 vs 443),
/// per step 1.
fn uri_agrees_up_to_trivial_variants(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let norm = |s: &str| -> String {
        s.replacen("ipps://", "ipp://", 1)
            .replace(":443", ":631")
    };
    norm(a) == norm(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::{AddressFamily, Protocol};

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

    #[test]
    fn create_then_find_matching_handles_trivial_uri_variants() {
        let mut reg = Registry::new();
        reg.create("Lab_Printer".into(), instance());
        let found = reg.find_matching("Lab_Printer", "ipps://lab.local:443/printers/lab", "printers/lab");
        assert!(found.is_some());
    }

    #[test]
    fn idempotent_intake_does_not_duplicate_entries() {
        let mut reg = Registry::new();
        let id1 = reg.create("Lab_Printer".into(), instance());
        // Simulate re-applying the same discovery event: look it up first.
        let existing = reg.find_matching("Lab_Printer", &instance().device_uri(), "printers/lab");
        assert_eq!(existing, Some(id1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn called_flag_blocks_transition() {
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".into(), instance());
        reg.get_mut(id).unwrap().called = true;
        let effect = reg.apply_transition(id, Trigger::CreateModifySucceeded);
        assert!(effect.is_none());
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::ToBeCreated);
    }

    #[test]
    fn create_modify_success_confirms_entry() {
        let mut reg = Registry::new();
        let id = reg.create("Lab_Printer".into(), instance());
        let effect = reg.apply_transition(id, Trigger::CreateModifySucceeded);
        assert_eq!(effect, Some(SideEffect::None));
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::Confirmed);
    }

    #[test]
    fn promotion_rewrites_a_live_slave_to_master() {
        let mut reg = Registry::new();
        let master = reg.create("Cluster_Queue".into(), instance());
        let slave = reg.create("Cluster_Queue".into(), instance());
        reg.get_mut(master).unwrap().linkage = ClusterLinkage::Master;
        reg.get_mut(master).unwrap().status = EntryStatus::Confirmed;
        reg.get_mut(slave).unwrap().linkage = ClusterLinkage::Slave(master);
        reg.get_mut(slave).unwrap().status = EntryStatus::Confirmed;

        reg.apply_transition(master, Trigger::Removed);
        assert_eq!(reg.get(master).unwrap().status, EntryStatus::Disappeared);

        let promoted = reg.promote_slave_if_master_disappeared(master);
        assert_eq!(promoted, Some(slave));
        assert!(reg.get(slave).unwrap().is_master());
        assert_eq!(reg.get(slave).unwrap().status, EntryStatus::ToBeCreated);
    }

    #[test]
    fn promotion_reparents_remaining_slaves_to_deleted_master_sentinel() {
        let mut reg = Registry::new();
        let master = reg.create("Cluster_Queue".into(), instance());
        let slave_a = reg.create("Cluster_Queue".into(), instance());
        let slave_b = reg.create("Cluster_Queue".into(), instance());
        reg.get_mut(master).unwrap().status = EntryStatus::Disappeared;
        reg.get_mut(slave_a).unwrap().linkage = ClusterLinkage::Slave(master);
        reg.get_mut(slave_b).unwrap().linkage = ClusterLinkage::Slave(master);

        let promoted = reg.promote_slave_if_master_disappeared(master).unwrap();
        let other = if promoted == slave_a { slave_b } else { slave_a };
        assert_eq!(reg.get(other).unwrap().slave_of(), Some(EntryId::DELETED_MASTER));
    }

    #[test]
    fn state_exclusivity_slave_never_has_own_queue() {
        // Invariant 3 of the testable properties: an entry with
        // slaveOf != nil must never simultaneously be a master.
        let mut reg = Registry::new();
        let master = reg.create("Q".into(), instance());
        let slave = reg.create("Q".into(), instance());
        reg.get_mut(slave).unwrap().linkage = ClusterLinkage::Slave(master);
        let entry = reg.get(slave).unwrap();
        assert!(entry.is_slave());
        assert!(!entry.is_master());
    }
}

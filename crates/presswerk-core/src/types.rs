// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types shared by the discovery intake, the remote printer
// registry, the cluster resolver, and the queue reconciler.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a remote printer entry in the registry arena.
///
/// Entries reference each other (master/slave linkage) by `EntryId` rather
/// than by pointer, so that a cyclic master/slave relationship can be
/// expressed without `Rc`/`RefCell`. `EntryId(0)` is reserved for the
/// deleted-master sentinel (see [`ClusterLinkage`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Reserved identifier for the deleted-master sentinel.
    pub const DELETED_MASTER: EntryId = EntryId(0);

    pub fn is_sentinel(self) -> bool {
        self == Self::DELETED_MASTER
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// IP address family, used to order discovery instances (IPv4 preferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Plain vs. secure IPP transport, and the protocol selection list in
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Ipp,
    Ipps,
}

impl Protocol {
    /// Default port for this protocol (631 for plain IPP, 443 for secure).
    pub fn default_port(self) -> u16 {
        match self {
            Self::Ipp => 631,
            Self::Ipps => 443,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Ipp => "ipp",
            Self::Ipps => "ipps",
        }
    }

    /// DNS-SD service type string for this protocol.
    pub fn service_type(self) -> &'static str {
        match self {
            Self::Ipp => "_ipp._tcp.local.",
            Self::Ipps => "_ipps._tcp.local.",
        }
    }
}

/// One discovery path through which a logical remote printer has been seen:
/// an (interface, transport, family) triple plus the resolved address
/// needed to build a device URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryInstance {
    pub interface: String,
    pub transport: Protocol,
    pub family: AddressFamily,
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub resource_path: String,
    /// True if this instance was learned from DNS-SD; false if from polling.
    pub via_dns_sd: bool,
    /// True if this instance arrived over the loopback interface.
    pub loopback: bool,
}

impl DiscoveryInstance {
    /// Device URI this instance would expose, e.g. `ipps://host:631/printers/lab`.
    pub fn device_uri(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.transport.scheme(),
            self.host,
            self.port,
            self.resource_path.trim_start_matches('/')
        )
    }

    /// Sort key implementing per-instance ordering: loopback first, then
    /// secure transport, then IPv4 over IPv6.
    fn sort_key(&self) -> (bool, bool, bool) {
        (
            !self.loopback,
            !matches!(self.transport, Protocol::Ipps),
            !matches!(self.family, AddressFamily::V4),
        )
    }
}

/// Stable-sorts `instances` so index 0 is always the preferred instance:
/// loopback, then secure, then IPv4-over-IPv6.
pub fn sort_instances(instances: &mut [DiscoveryInstance]) {
    instances.sort_by_key(DiscoveryInstance::sort_key);
}

/// A discovered-printer record: the transient output of Discovery Intake.
/// Its lifetime ends once it has been handed to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPrinterRecord {
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub resource_path: String,
    pub transport: Protocol,
    pub service_name: String,
    pub service_type: String,
    pub domain: String,
    pub interface: String,
    pub family: AddressFamily,
    pub via_dns_sd: bool,
    pub loopback: bool,

    /// Make/model, preferred order `ty` -> `product` (unwrapped) -> `usb_MFG`+`usb_MDL`.
    pub make_and_model: Option<String>,
    /// Raw supported data formats (`pdl` TXT key), comma-separated source.
    pub formats: Vec<String>,
    pub color: bool,
    pub duplex: bool,
    pub location: Option<String>,
    /// True if the upstream is itself a print-scheduler queue.
    pub cups_queue: bool,
    /// `UUID` TXT key, used by the local-origin filter.
    pub uuid: Option<String>,
    /// Raw TXT table, retained for filter-rule matching against arbitrary keys.
    pub txt: HashMap<String, String>,
}

impl DiscoveredPrinterRecord {
    pub fn into_instance(&self) -> DiscoveryInstance {
        DiscoveryInstance {
            interface: self.interface.clone(),
            transport: self.transport,
            family: self.family,
            host: self.host.clone(),
            ip: self.ip,
            port: self.port,
            resource_path: self.resource_path.clone(),
            via_dns_sd: self.via_dns_sd,
            loopback: self.loopback,
        }
    }
}

/// Result of comparing a newly discovered instance against an entry's
/// current preferred instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceComparison {
    Upgrade,
    Downgrade,
    Tie,
}

/// Cached attribute set from a get-printer-attributes query, plus the
/// parsed hints the rest of the engine needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityCache {
    pub attributes: HashMap<String, String>,
    pub media_supported: Vec<String>,
    pub sides_supported: Vec<String>,
    pub document_formats_supported: Vec<String>,
    pub color_supported: bool,
    pub resolutions_supported: Vec<u32>,
    pub default_resolution: Option<u32>,
    /// Per-queue option defaults restored from disk (Option Persistence, J).
    pub persisted_options: HashMap<String, String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl CapabilityCache {
    pub fn is_stale(&self) -> bool {
        self.fetched_at.is_none()
    }

    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}

/// Master/slave relationship of an entry within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterLinkage {
    /// Not part of a cluster.
    Standalone,
    /// Authoritative queue for the cluster; owns the scheduler-visible queue.
    Master,
    /// Points at a master entry (or the deleted-master sentinel).
    Slave(EntryId),
}

/// The seven states a managed entry can occupy, plus the deleted-master
/// sentinel which is represented as an `EntryStatus` so it can live in the
/// same arena slot shape as ordinary entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    /// Needs a create/modify IPP request.
    ToBeCreated,
    /// Matches a live scheduler queue.
    Confirmed,
    /// Recovered from a previous session, no discovery yet.
    Unconfirmed,
    /// Scheduled for queue removal.
    Disappeared,
    /// Detached from our control (external modification detected).
    ToBeReleased,
    /// Transient sub-state while a name clash is resolved by an `@host` suffix.
    ToBeCreatedRenamed,
    /// The non-functional sentinel entry reparented slaves point at while
    /// their former master is torn down.
    DeletedMaster,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToBeCreated => "to-be-created",
            Self::Confirmed => "confirmed",
            Self::Unconfirmed => "unconfirmed",
            Self::Disappeared => "disappeared",
            Self::ToBeReleased => "to-be-released",
            Self::ToBeCreatedRenamed => "to-be-created-renamed",
            Self::DeletedMaster => "deleted-master",
        };
        write!(f, "{s}")
    }
}

/// A remote printer entry: the persistent unit of state owned by the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePrinterEntry {
    pub id: EntryId,

    // -- Identity --
    pub queue_name: String,
    pub device_uri: String,
    /// Kept sorted so index 0 is the preferred instance.
    pub instances: Vec<DiscoveryInstance>,

    // -- Classification --
    pub cups_queue: bool,
    pub cluster: bool,

    // -- Capability cache --
    pub capabilities: CapabilityCache,

    // -- Cluster linkage --
    pub linkage: ClusterLinkage,

    // -- Status --
    pub status: EntryStatus,
    /// Human-readable rationale for the current status (e.g. overwrite text).
    pub status_text: Option<String>,

    // -- Timers --
    pub timeout: DateTime<Utc>,
    pub legacy_broadcast_timeout: Option<DateTime<Utc>>,
    pub learned_via_legacy_broadcast: bool,

    // -- Bookkeeping --
    /// Last chosen cluster member for round-robin dispatch (H).
    pub last_printer: Option<EntryId>,
    pub overwrite_detected: bool,
    pub retry_count: u32,
    pub timeout_count: u32,
    /// Gates overlapping reconciliation work for this entry.
    pub called: bool,
    /// Whether this queue was the scheduler default in a previous session.
    pub was_default: bool,
}

impl RemotePrinterEntry {
    pub fn new(id: EntryId, queue_name: String, instance: DiscoveryInstance) -> Self {
        let device_uri = instance.device_uri();
        let now = Utc::now();
        Self {
            id,
            queue_name,
            device_uri,
            instances: vec![instance],
            cups_queue: false,
            cluster: false,
            capabilities: CapabilityCache::default(),
            linkage: ClusterLinkage::Standalone,
            status: EntryStatus::ToBeCreated,
            status_text: None,
            timeout: now,
            legacy_broadcast_timeout: None,
            learned_via_legacy_broadcast: false,
            last_printer: None,
            overwrite_detected: false,
            retry_count: 0,
            timeout_count: 0,
            called: false,
            was_default: false,
        }
    }

    /// Preferred (index-0) discovery instance, if any is known.
    pub fn preferred_instance(&self) -> Option<&DiscoveryInstance> {
        self.instances.first()
    }

    pub fn is_master(&self) -> bool {
        matches!(self.linkage, ClusterLinkage::Master)
    }

    pub fn is_slave(&self) -> bool {
        matches!(self.linkage, ClusterLinkage::Slave(_))
    }

    pub fn slave_of(&self) -> Option<EntryId> {
        match self.linkage {
            ClusterLinkage::Slave(master) => Some(master),
            _ => None,
        }
    }
}

/// A user-defined cluster: a local queue name plus the matchers that decide
/// which discovered records join it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDef {
    pub local_queue_name: String,
    /// Each matcher is compared, after sanitization, against the sanitized
    /// remote queue name, the make/model string, or the DNS-SD service name.
    pub member_matchers: Vec<String>,
}

/// Allow or deny, used by both access rules and filter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    Allow,
    Deny,
}

/// The kind of comparison an access rule performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccessRuleKind {
    /// Family-sensitive literal address equality.
    Ip(IpAddr),
    /// Address AND mask comparison.
    Network { addr: IpAddr, mask: IpAddr },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub sense: Sense,
    pub kind: AccessRuleKind,
}

/// Evaluation order for the access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOrder {
    AllowThenDeny,
    DenyThenAllow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicyConfig {
    pub order: PolicyOrder,
    pub allow_all: bool,
    pub deny_all: bool,
    pub rules: Vec<AccessRule>,
}

impl Default for AccessPolicyConfig {
    fn default() -> Self {
        Self {
            order: PolicyOrder::AllowThenDeny,
            allow_all: true,
            deny_all: false,
            rules: Vec::new(),
        }
    }
}

/// A field a filter rule may match against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterField {
    QueueName,
    Host,
    Port,
    ServiceName,
    Domain,
    Txt(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterMatcher {
    Regex(String),
    Exact(String),
    Boolean(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub sense: Sense,
    pub field: FilterField,
    pub matcher: FilterMatcher,
}

/// Local queue naming policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingPolicy {
    /// `LocalQueueNamingRemoteCUPS`: prefer the remote scheduler's own queue name.
    RemoteCups,
    /// `LocalQueueNamingIPPPrinter`: prefer DNS-SD service name or make/model.
    IppPrinter,
}

/// Busy-candidate handling during job dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// Consider `processing` candidates as a fallback, ranked by queue depth.
    QueueOnServers,
    /// Never select a `processing` candidate; report `NO_DEST_FOUND` instead.
    QueueOnClient,
}

/// Auto-shutdown trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownMode {
    Disabled,
    NoQueues,
    NoJobs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownPolicy {
    pub mode: ShutdownMode,
    pub timeout_secs: u64,
    /// Also enter auto-shutdown when the DNS-SD daemon disappears.
    pub avahi_bound: bool,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::NoQueues,
            timeout_secs: 30,
            avahi_bound: false,
        }
    }
}

/// Current state of a discovered remote printer, as reported by the
/// scheduler notification handler / job dispatcher candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    Idle,
    Processing,
    Stopped,
}

/// Attribute constraints a pending job may carry, used to filter dispatch
/// candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConstraints {
    pub document_format: Option<String>,
    pub media: Option<String>,
    pub sides: Option<String>,
    pub color: Option<bool>,
    pub staple: Option<bool>,
    pub fold: Option<bool>,
    pub punch: Option<bool>,
    pub print_quality: Option<PrintQuality>,
    pub orientation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintQuality {
    Draft,
    Normal,
    High,
}

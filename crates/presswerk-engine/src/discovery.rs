// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Discovery Intake (component C).
//
// Bridges `mdns-sd`'s blocking browse receiver into a tokio channel (the
// same shape used elsewhere in this codebase for mDNS), classifies and
// parses each resolved service into a `DiscoveredPrinterRecord`, and
// reconciles each record against the registry.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use presswerk_core::{
    AddressFamily, DiscoveredPrinterRecord, EntryId, EntryStatus, FilterField, FilterMatcher,
    FilterRule, InstanceComparison, Protocol, RemotePrinterEntry, Sense,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::netifs::NetworkInterfaceTracker;
use crate::registry::{Registry, Trigger};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Mdns(String),
}

/// Events forwarded from the blocking mDNS browse loop into the async world.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    RecordFound(DiscoveredPrinterRecord),
    RecordRemoved { service_name: String, service_type: String },
}

/// Owns the mDNS daemon handle; dropping it stops the background browse
/// threads (the collaborator is the local DNS-SD daemon).
pub struct DiscoveryService {
    daemon: ServiceDaemon,
}

impl DiscoveryService {
    /// Start browsing for every protocol in `protocols`, forwarding resolved
    /// and removed services into the returned channel. Each protocol gets
    /// its own blocking browse thread — one thread per type since we may
    /// watch both `_ipp._tcp` and `_ipps._tcp`.
    pub fn start(protocols: &[Protocol]) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        let (tx, rx) = mpsc::channel(256);

        for protocol in protocols {
            let protocol = *protocol;
            let browse_receiver = daemon
                .browse(protocol.service_type())
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || browse_loop(browse_receiver, tx, protocol));
        }

        Ok((Self { daemon }, rx))
    }

    pub fn shutdown(self) {
        if let Ok(receiver) = self.daemon.shutdown() {
            let _ = receiver.recv();
        }
    }
}

fn browse_loop(receiver: mdns_sd::Receiver<ServiceEvent>, tx: mpsc::Sender<DiscoveryEvent>, transport: Protocol) {
    while let Ok(event) = receiver.recv() {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let record = match build_record(&info, transport) {
                    Some(r) => r,
                    None => {
                        warn!(service = info.get_fullname(), "resolved service had no usable address, ignoring");
                        continue;
                    }
                };
                info!(service = %record.service_name, host = %record.host, "printer service resolved");
                if tx.blocking_send(DiscoveryEvent::RecordFound(record)).is_err() {
                    debug!("discovery channel closed, stopping browse loop");
                    break;
                }
            }
            ServiceEvent::ServiceRemoved(service_type, fullname) => {
                let service_name = fullname
                    .strip_suffix(&format!(".{service_type}"))
                    .unwrap_or(&fullname)
                    .to_string();
                if tx
                    .blocking_send(DiscoveryEvent::RecordRemoved { service_name, service_type })
                    .is_err()
                {
                    break;
                }
            }
            _ => {}
        }
    }
    debug!(transport = ?transport, "browse loop exited");
}

fn build_record(info: &mdns_sd::ServiceInfo, transport: Protocol) -> Option<DiscoveredPrinterRecord> {
    let port = info.get_port();
    let ip = info.get_addresses().iter().next().copied();
    let host = info.get_hostname().trim_end_matches('.').to_string();

    let properties = info.get_properties();
    let mut txt = HashMap::new();
    for prop in properties.iter() {
        txt.insert(prop.key().to_string(), prop.val_str().to_string());
    }

    let resource_path = txt
        .get("rp")
        .cloned()
        .unwrap_or_else(|| "printers/".to_string());

    let make_and_model = make_and_model_from_txt(&txt);
    let formats = txt
        .get("pdl")
        .map(|s| s.split(',').map(|f| f.trim().to_string()).collect())
        .unwrap_or_default();
    let color = txt.get("Color").map(|v| v.eq_ignore_ascii_case("t")).unwrap_or(false);
    let duplex = txt.get("Duplex").map(|v| v.eq_ignore_ascii_case("t")).unwrap_or(false);
    let location = txt.get("note").cloned();
    let uuid = txt.get("UUID").cloned();
    // `printer-type` is a CUPS-specific TXT key only present on shares
    // re-exported by another scheduler.
    let cups_queue = txt.contains_key("printer-type");

    let family = ip.map(AddressFamily::of).unwrap_or(AddressFamily::V4);
    let loopback = ip.map(|a| a.is_loopback()).unwrap_or(false);

    Some(DiscoveredPrinterRecord {
        host,
        ip,
        port,
        resource_path,
        transport,
        service_name: info.get_fullname().to_string(),
        service_type: info.get_type().to_string(),
        domain: "local.".to_string(),
        interface: "unknown".to_string(),
        family,
        via_dns_sd: true,
        loopback,
        make_and_model,
        formats,
        color,
        duplex,
        location,
        cups_queue,
        uuid,
        txt,
    })
}

/// Make/model preference order: `ty` TXT key, then
/// `product` (with surrounding parens stripped), then `usb_MFG`+`usb_MDL`.
fn make_and_model_from_txt(txt: &HashMap<String, String>) -> Option<String> {
    if let Some(ty) = txt.get("ty") {
        return Some(ty.clone());
    }
    if let Some(product) = txt.get("product") {
        let stripped = product.trim().trim_start_matches('(').trim_end_matches(')');
        return Some(stripped.to_string());
    }
    match (txt.get("usb_MFG"), txt.get("usb_MDL")) {
        (Some(mfg), Some(mdl)) => Some(format!("{mfg} {mdl}")),
        _ => None,
    }
}

/// Parse a printer URI (`ipp://host[:port]/resource`) into the pieces
/// needed to build a [`DiscoveredPrinterRecord`] for a polled entry.
fn parse_printer_uri(uri: &str) -> Option<(Protocol, String, u16, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    let transport = match scheme {
        "ipp" => Protocol::Ipp,
        "ipps" => Protocol::Ipps,
        _ => return None,
    };
    let (hostport, path) = rest.split_once('/').unwrap_or((rest, ""));
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(transport.default_port())),
        None => (hostport.to_string(), transport.default_port()),
    };
    Some((transport, host, port, path.to_string()))
}

/// Build a [`DiscoveredPrinterRecord`] for a `poll_list` entry from a
/// get-printer-attributes response. For polled entries no TXT is available,
/// so make/model, formats, and capability hints come from the IPP
/// attributes themselves rather than DNS-SD TXT keys.
pub fn build_polled_record(uri: &str, attrs: &HashMap<String, String>) -> Option<DiscoveredPrinterRecord> {
    let (transport, host, port, resource_path) = parse_printer_uri(uri)?;
    let ip = host.parse::<IpAddr>().ok();
    let family = ip.map(|a| AddressFamily::of(&a)).unwrap_or(AddressFamily::V4);
    let loopback = ip.map(|a| a.is_loopback()).unwrap_or(false);

    let formats = attrs
        .get("document-format-supported")
        .map(|s| s.split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect())
        .unwrap_or_default();
    let color = attrs.get("color-supported").map(|v| v == "true" || v == "1").unwrap_or(false);
    let duplex = attrs
        .get("sides-supported")
        .map(|v| v.contains("two-sided"))
        .unwrap_or(false);
    let service_name = attrs.get("printer-info").cloned().unwrap_or_else(|| host.clone());

    Some(DiscoveredPrinterRecord {
        host,
        ip,
        port,
        resource_path,
        transport,
        service_name,
        service_type: "poll".to_string(),
        domain: "poll".to_string(),
        interface: "poll".to_string(),
        family,
        via_dns_sd: false,
        loopback,
        make_and_model: attrs.get("printer-make-and-model").cloned(),
        formats,
        color,
        duplex,
        location: attrs.get("printer-location").cloned(),
        cups_queue: attrs.contains_key("printer-type"),
        uuid: attrs.get("printer-uuid").cloned(),
        txt: HashMap::new(),
    })
}

/// True if `record` originated from this host itself — checked against
/// the network interface tracker's hostname and address sets.
pub async fn is_local_origin(record: &DiscoveredPrinterRecord, netifs: &NetworkInterfaceTracker) -> bool {
    if let Some(ip) = record.ip {
        if netifs.is_local_address(&ip).await {
            return true;
        }
    }
    netifs.is_local_hostname(&record.host).await
}

/// Evaluate the matching filter list against a record: last matching rule
/// of either sense wins; an empty list keeps everything.
pub fn passes_filters(record: &DiscoveredPrinterRecord, rules: &[FilterRule]) -> bool {
    let mut decision = true;
    for rule in rules {
        if filter_rule_matches(record, rule) {
            decision = matches!(rule.sense, Sense::Allow);
        }
    }
    decision
}

fn filter_rule_matches(record: &DiscoveredPrinterRecord, rule: &FilterRule) -> bool {
    let field_value: Option<String> = match &rule.field {
        FilterField::QueueName => None, // resolved after naming; not evaluated here
        FilterField::Host => Some(record.host.clone()),
        FilterField::Port => Some(record.port.to_string()),
        FilterField::ServiceName => Some(record.service_name.clone()),
        FilterField::Domain => Some(record.domain.clone()),
        FilterField::Txt(key) => record.txt.get(key).cloned(),
    };

    match (&rule.matcher, field_value) {
        (FilterMatcher::Exact(expected), Some(actual)) => &actual == expected,
        (FilterMatcher::Regex(pattern), Some(actual)) => {
            regex_lite_contains(&actual, pattern)
        }
        (FilterMatcher::Boolean(expected), _) => {
            matches!(&rule.field, FilterField::Txt(key) if record.txt.contains_key(key)) == *expected
        }
        _ => false,
    }
}

/// A conservative substring/glob-free matcher used in place of a full regex
/// engine: most `cups-browsed`-style match expressions in practice are exact
/// or prefix/suffix anchored, so `*` at either end is honored and anything
/// else falls back to substring containment.
fn regex_lite_contains(haystack: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        haystack.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        haystack.ends_with(suffix)
    } else {
        haystack.contains(pattern)
    }
}

/// Compare a freshly discovered instance against an entry's current
/// preferred instance: upgrade if it ranks ahead under the
/// `sort_instances` ordering, downgrade if behind, tie if equivalent.
pub fn compare_instance(entry: &RemotePrinterEntry, candidate: &presswerk_core::DiscoveryInstance) -> InstanceComparison {
    let Some(current) = entry.preferred_instance() else {
        return InstanceComparison::Upgrade;
    };
    let mut both = vec![current.clone(), candidate.clone()];
    presswerk_core::sort_instances(&mut both);
    if both[0].device_uri() == candidate.device_uri() && candidate.device_uri() != current.device_uri() {
        InstanceComparison::Upgrade
    } else if both[0].device_uri() == current.device_uri() && candidate.device_uri() != current.device_uri() {
        InstanceComparison::Downgrade
    } else {
        InstanceComparison::Tie
    }
}

/// Fold one `DiscoveryEvent::RecordFound` into the registry: find a matching
/// entry by queue name/URI, or hand back `None` when no entry exists yet (it
/// is the caller's job to resolve a queue name via the cluster resolver and
/// call `Registry::create`, since naming needs config this module does not
/// own). When a match is found, merge the new instance and drive the
/// appropriate state transition.
pub fn reconcile_found(
    registry: &mut Registry,
    queue_name: &str,
    record: &DiscoveredPrinterRecord,
    refresh_on_discovery: bool,
) -> Option<EntryId> {
    let instance = record.into_instance();
    let id = registry.find_matching(queue_name, &instance.device_uri(), &record.resource_path)?;

    let comparison = registry.get(id).map(|e| compare_instance(e, &instance))?;
    if let Some(entry) = registry.get_mut(id) {
        match comparison {
            InstanceComparison::Upgrade => {
                entry.instances.insert(0, instance);
                presswerk_core::sort_instances(&mut entry.instances);
            }
            InstanceComparison::Downgrade => {
                entry.instances.push(instance);
                presswerk_core::sort_instances(&mut entry.instances);
            }
            InstanceComparison::Tie => {}
        }
        if refresh_on_discovery {
            entry.capabilities.invalidate();
        }
    }

    match registry.get(id).map(|e| e.status) {
        Some(EntryStatus::Unconfirmed) => {
            registry.apply_transition(id, Trigger::DiscoveryMatched);
        }
        Some(EntryStatus::Disappeared) => {
            registry.promote_slave_if_master_disappeared(id);
        }
        _ => {}
    }

    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::AddressFamily;

    fn record(host: &str, rp: &str) -> DiscoveredPrinterRecord {
        DiscoveredPrinterRecord {
            host: host.to_string(),
            ip: None,
            port: 631,
            resource_path: rp.to_string(),
            transport: Protocol::Ipp,
            service_name: "Lab Printer".to_string(),
            service_type: "_ipp._tcp.local.".to_string(),
            domain: "local.".to_string(),
            interface: "eth0".to_string(),
            family: AddressFamily::V4,
            via_dns_sd: true,
            loopback: false,
            make_and_model: Some("Example MFG 9000".to_string()),
            formats: vec!["application/pdf".to_string()],
            color: true,
            duplex: false,
            location: None,
            cups_queue: false,
            uuid: None,
            txt: HashMap::new(),
        }
    }

    #[test]
    fn make_and_model_prefers_ty_over_product() {
        let mut txt = HashMap::new();
        txt.insert("ty".to_string(), "Example MFG 9000".to_string());
        txt.insert("product".to_string(), "(Some Other Model)".to_string());
        assert_eq!(make_and_model_from_txt(&txt).as_deref(), Some("Example MFG 9000"));
    }

    #[test]
    fn make_and_model_falls_back_to_product_with_parens_stripped() {
        let mut txt = HashMap::new();
        txt.insert("product".to_string(), "(Example MFG 9000)".to_string());
        assert_eq!(make_and_model_from_txt(&txt).as_deref(), Some("Example MFG 9000"));
    }

    #[test]
    fn filter_with_no_rules_passes_everything() {
        assert!(passes_filters(&record("lab.local", "printers/lab"), &[]));
    }

    #[test]
    fn deny_rule_on_host_blocks_matching_record() {
        let rules = vec![FilterRule {
            sense: Sense::Deny,
            field: FilterField::Host,
            matcher: FilterMatcher::Exact("lab.local".to_string()),
        }];
        assert!(!passes_filters(&record("lab.local", "printers/lab"), &rules));
        assert!(passes_filters(&record("other.local", "printers/lab"), &rules));
    }

    #[test]
    fn reconcile_found_matches_existing_entry_by_queue_and_uri() {
        let mut reg = Registry::new();
        let rec = record("lab.local", "printers/lab");
        let instance = rec.into_instance();
        let id = reg.create("Lab_Printer".to_string(), instance);
        reg.get_mut(id).unwrap().status = EntryStatus::Unconfirmed;

        let found = reconcile_found(&mut reg, "Lab_Printer", &rec, false);
        assert_eq!(found, Some(id));
        assert_eq!(reg.get(id).unwrap().status, EntryStatus::Confirmed);
    }

    #[test]
    fn parse_printer_uri_splits_host_port_and_resource() {
        let (transport, host, port, resource) = parse_printer_uri("ipps://printserver.example:443/printers/queue").unwrap();
        assert_eq!(transport, Protocol::Ipps);
        assert_eq!(host, "printserver.example");
        assert_eq!(port, 443);
        assert_eq!(resource, "printers/queue");
    }

    #[test]
    fn parse_printer_uri_defaults_port_when_absent() {
        let (transport, host, port, resource) = parse_printer_uri("ipp://printserver.example/printers/queue").unwrap();
        assert_eq!(transport, Protocol::Ipp);
        assert_eq!(host, "printserver.example");
        assert_eq!(port, 631);
        assert_eq!(resource, "printers/queue");
    }

    #[test]
    fn parse_printer_uri_rejects_unknown_scheme() {
        assert!(parse_printer_uri("http://printserver.example/printers/queue").is_none());
    }

    #[test]
    fn build_polled_record_derives_fields_from_attributes_not_txt() {
        let attrs = HashMap::from([
            ("printer-make-and-model".to_string(), "Example MFG 9000".to_string()),
            ("document-format-supported".to_string(), "application/pdf, image/urf".to_string()),
            ("color-supported".to_string(), "true".to_string()),
            ("sides-supported".to_string(), "one-sided,two-sided-long-edge".to_string()),
            ("printer-location".to_string(), "Lab 3".to_string()),
        ]);
        let rec = build_polled_record("ipp://printserver.example:631/printers/queue", &attrs).unwrap();
        assert_eq!(rec.make_and_model.as_deref(), Some("Example MFG 9000"));
        assert_eq!(rec.formats, vec!["application/pdf".to_string(), "image/urf".to_string()]);
        assert!(rec.color);
        assert!(rec.duplex);
        assert_eq!(rec.location.as_deref(), Some("Lab 3"));
        assert!(!rec.via_dns_sd);
        assert!(rec.txt.is_empty());
    }

    #[test]
    fn build_polled_record_rejects_malformed_uri() {
        assert!(build_polled_record("not-a-uri", &HashMap::new()).is_none());
    }
}

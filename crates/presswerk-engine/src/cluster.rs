// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cluster Resolver (component E).

use presswerk_core::{ClusterDef, NamingPolicy};

/// Sanitize a string into a legal local queue name fragment: retain
/// `[A-Za-z0-9]`, map any other character group to a single separator, and
/// strip leading/trailing separators. `'_'` is used for DNS-SD-sourced
/// names, `'-'` for make/model-sourced names.
pub fn sanitize(input: &str, separator: char) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push(separator);
            in_run = true;
        }
    }
    out.trim_matches(separator).to_string()
}

/// Source used to derive a name, which determines the separator used:
/// DNS-SD-sourced names vs. make/model-sourced names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    DnsSd,
    MakeModel,
    RemoteQueue,
}

impl NameSource {
    fn separator(self) -> char {
        match self {
            Self::DnsSd => '_',
            Self::MakeModel | Self::RemoteQueue => '-',
        }
    }
}

/// Inputs available when computing a base queue name.
#[derive(Debug, Clone)]
pub struct NameCandidate {
    pub source: NameSource,
    pub raw: String,
}

impl NameCandidate {
    pub fn sanitized(&self) -> String {
        sanitize(&self.raw, self.source.separator())
    }
}

/// Compute the base name per `naming` policy: DNS-SD service name or
/// make/model for `IppPrinter`; remote queue name for `RemoteCups`.
pub fn base_name(
    naming: NamingPolicy,
    service_name: Option<&str>,
    make_and_model: Option<&str>,
    remote_queue_name: Option<&str>,
    cups_queue: bool,
) -> Option<String> {
    match naming {
        NamingPolicy::RemoteCups if cups_queue => remote_queue_name.map(|n| {
            NameCandidate {
                source: NameSource::RemoteQueue,
                raw: n.to_string(),
            }
            .sanitized()
        }),
        _ => service_name
            .map(|n| {
                NameCandidate {
                    source: NameSource::DnsSd,
                    raw: n.to_string(),
                }
                .sanitized()
            })
            .or_else(|| {
                make_and_model.map(|n| {
                    NameCandidate {
                        source: NameSource::MakeModel,
                        raw: n.to_string(),
                    }
                    .sanitized()
                })
            }),
    }
}

/// Result of resolving a discovered record to a queue name and cluster
/// membership decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Use this exact queue name; not part of any cluster.
    Standalone(String),
    /// Join the named cluster's local queue.
    JoinCluster(String),
    /// No legal name could be produced (collision, and no clustering applies).
    Failed,
}

/// Scan user-defined clusters for one whose matcher list matches the
/// sanitized remote name, make/model, or service name.
pub fn match_user_cluster<'a>(
    clusters: &'a [ClusterDef],
    sanitized_remote_name: &str,
    make_and_model: Option<&str>,
    service_name: Option<&str>,
) -> Option<&'a ClusterDef> {
    let sanitized_make_model = make_and_model.map(|s| sanitize(s, '-'));
    let sanitized_service = service_name.map(|s| sanitize(s, '_'));

    clusters.iter().find(|cluster| {
        cluster.member_matchers.iter().any(|matcher| {
            let sanitized_matcher_underscore = sanitize(matcher, '_');
            let sanitized_matcher_dash = sanitize(matcher, '-');
            sanitized_matcher_underscore == sanitized_remote_name
                || sanitized_matcher_dash == sanitized_remote_name
                || sanitized_make_model.as_deref() == Some(sanitized_matcher_dash.as_str())
                || sanitized_service.as_deref() == Some(sanitized_matcher_underscore.as_str())
        })
    })
}

/// Full resolution: compute a base name, fall back to a host-suffixed name
/// on collision, then check for user-defined or automatic cluster
/// membership. `existing_names` is the set of names already present on the
/// scheduler (managed or not); `excluded` is an optional name this record is
/// barred from reusing (e.g. the name it was just released from).
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    naming: NamingPolicy,
    service_name: Option<&str>,
    make_and_model: Option<&str>,
    remote_queue_name: Option<&str>,
    remote_host: &str,
    cups_queue: bool,
    clusters: &[ClusterDef],
    auto_clustering: bool,
    existing_names: &dyn Fn(&str) -> bool,
    excluded: Option<&str>,
    would_collide_with_other_entry: &dyn Fn(&str) -> bool,
) -> Resolution {
    let Some(mut candidate) = base_name(naming, service_name, make_and_model, remote_queue_name, cups_queue) else {
        return Resolution::Failed;
    };

    if Some(candidate.as_str()) == excluded || existing_names(&candidate) {
        let host_suffix = sanitize(remote_host, '-');
        let fallback = format!("{candidate}@{host_suffix}");
        if Some(fallback.as_str()) == excluded || existing_names(&fallback) {
            return Resolution::Failed;
        }
        candidate = fallback;
    }

    let sanitized_remote_name = remote_queue_name
        .map(|n| sanitize(n, '-'))
        .unwrap_or_else(|| candidate.clone());

    if let Some(cluster) = match_user_cluster(clusters, &sanitized_remote_name, make_and_model, service_name) {
        return Resolution::JoinCluster(cluster.local_queue_name.clone());
    }

    if auto_clustering && would_collide_with_other_entry(&candidate) {
        return Resolution::JoinCluster(candidate);
    }

    if !auto_clustering && would_collide_with_other_entry(&candidate) {
        return Resolution::Failed;
    }

    Resolution::Standalone(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_separator_runs_and_trims_ends() {
        assert_eq!(sanitize("Lab Printer @ lab!!", '_'), "Lab_Printer_lab");
        assert_eq!(sanitize("  leading", '_'), "leading");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for s in ["Lab Printer @ lab", "Example MFG 9000", "a___b", ""] {
            let once = sanitize(s, '_');
            let twice = sanitize(&once, '_');
            assert_eq!(once, twice);
            assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
    }

    #[test]
    fn base_name_prefers_service_name_for_ipp_printer_policy() {
        let name = base_name(
            NamingPolicy::IppPrinter,
            Some("Lab Printer @ lab"),
            Some("Example MFG 9000"),
            Some("labqueue"),
            true,
        );
        assert_eq!(name.as_deref(), Some("Lab_Printer_lab"));
    }

    #[test]
    fn base_name_prefers_remote_queue_for_remote_cups_policy() {
        let name = base_name(
            NamingPolicy::RemoteCups,
            Some("Lab Printer @ lab"),
            Some("Example MFG 9000"),
            Some("labqueue"),
            true,
        );
        assert_eq!(name.as_deref(), Some("labqueue"));
    }

    #[test]
    fn collision_falls_back_to_host_suffixed_name() {
        let resolution = resolve(
            NamingPolicy::IppPrinter,
            Some("Example MFG 9000"),
            Some("Example MFG 9000"),
            None,
            "host2.local",
            false,
            &[],
            false,
            &|name| name == "Example_MFG_9000",
            None,
            &|_| false,
        );
        assert_eq!(resolution, Resolution::Standalone("Example_MFG_9000@host2-local".to_string()));
    }

    #[test]
    fn auto_clustering_joins_existing_name_instead_of_failing() {
        let resolution = resolve(
            NamingPolicy::IppPrinter,
            Some("Example MFG 9000"),
            Some("Example MFG 9000"),
            None,
            "host2.local",
            false,
            &[],
            true,
            &|_| false,
            None,
            &|name| name == "Example_MFG_9000",
        );
        assert_eq!(resolution, Resolution::JoinCluster("Example_MFG_9000".to_string()));
    }

    #[test]
    fn no_auto_clustering_reports_failure_on_collision() {
        let resolution = resolve(
            NamingPolicy::IppPrinter,
            Some("Example MFG 9000"),
            Some("Example MFG 9000"),
            None,
            "host2.local",
            false,
            &[],
            false,
            &|_| false,
            None,
            &|name| name == "Example_MFG_9000",
        );
        assert_eq!(resolution, Resolution::Failed);
    }
}

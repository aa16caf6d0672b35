// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// RemotePrinterClient trait seam — the wire-level IPP calls Discovery
// Intake and the Queue Reconciler make against a *remote* printer to learn
// its capabilities and current state. Fully covered by standard RFC 8011
// operations, so the production impl wraps `ipp::prelude::AsyncIppClient`
// directly for Get-Printer-Attributes.

use std::collections::HashMap;

use async_trait::async_trait;
use ipp::prelude::*;
use presswerk_core::PrinterState;
use tracing::{debug, error, instrument};

use crate::error::{EngineError, Result};

pub type PrinterAttributes = HashMap<String, String>;

#[async_trait]
pub trait RemotePrinterClient: Send + Sync {
    async fn get_printer_attributes(&self, uri: &str) -> Result<PrinterAttributes>;
    async fn get_printer_state(&self, uri: &str) -> Result<(PrinterState, bool)>;
    /// Active jobs queued on the remote printer, used by the `QueueOnServers`
    /// dispatch fallback to rank busy candidates.
    async fn queued_job_count(&self, uri: &str) -> Result<u32>;
}

/// Production implementation backed by the `ipp` crate's async client.
pub struct IppRemotePrinterClient;

impl Default for IppRemotePrinterClient {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl RemotePrinterClient for IppRemotePrinterClient {
    #[instrument(skip(self))]
    async fn get_printer_attributes(&self, uri: &str) -> Result<PrinterAttributes> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| EngineError::configuration(format!("invalid URI '{uri}': {e}")))?;

        let operation = IppOperationBuilder::get_printer_attributes(parsed.clone()).build();
        let client = AsyncIppClient::new(parsed);

        debug!("sending Get-Printer-Attributes");
        let response = client
            .send(operation)
            .await
            .map_err(|e| EngineError::transient_remote(format!("Get-Printer-Attributes: {e}")))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Printer-Attributes failed");
            return Err(EngineError::permanent_remote(format!(
                "Get-Printer-Attributes returned status {code:?}"
            )));
        }

        Ok(flatten_attributes(response.attributes()))
    }

    #[instrument(skip(self))]
    async fn get_printer_state(&self, uri: &str) -> Result<(PrinterState, bool)> {
        let attrs = self.get_printer_attributes(uri).await?;
        let state = attrs
            .get("printer-state")
            .map(|s| match s.as_str() {
                "3" | "idle" => PrinterState::Idle,
                "4" | "processing" => PrinterState::Processing,
                _ => PrinterState::Stopped,
            })
            .unwrap_or(PrinterState::Stopped);
        let accepting = attrs
            .get("printer-is-accepting-jobs")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        Ok((state, accepting))
    }

    #[instrument(skip(self))]
    async fn queued_job_count(&self, uri: &str) -> Result<u32> {
        let attrs = self.get_printer_attributes(uri).await?;
        Ok(attrs
            .get("queued-job-count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

/// Flatten all attribute groups into a single map, discarding group-level
/// context in favor of simple lookup — same shape as presswerk's own
/// `flatten_attributes` helper.
fn flatten_attributes(attrs: &IppAttributes) -> PrinterAttributes {
    let mut map = HashMap::new();
    for group in attrs.groups() {
        for (name, attr) in group.attributes() {
            map.insert(name.clone(), format!("{}", attr.value()));
        }
    }
    map
}

/// In-memory fake used by the reconciler/dispatcher test suites so
/// component tests never need a live CUPS/IPP endpoint.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRemotePrinterClient {
        pub attributes: Mutex<HashMap<String, PrinterAttributes>>,
        pub states: Mutex<HashMap<String, (PrinterState, bool)>>,
        pub job_counts: Mutex<HashMap<String, u32>>,
    }

    impl FakeRemotePrinterClient {
        pub fn set_attributes(&self, uri: &str, attrs: PrinterAttributes) {
            self.attributes.lock().unwrap().insert(uri.to_string(), attrs);
        }

        pub fn set_state(&self, uri: &str, state: PrinterState, accepting: bool) {
            self.states.lock().unwrap().insert(uri.to_string(), (state, accepting));
        }

        pub fn set_job_count(&self, uri: &str, count: u32) {
            self.job_counts.lock().unwrap().insert(uri.to_string(), count);
        }
    }

    #[async_trait]
    impl RemotePrinterClient for FakeRemotePrinterClient {
        async fn get_printer_attributes(&self, uri: &str) -> Result<PrinterAttributes> {
            self.attributes
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .ok_or_else(|| EngineError::transient_remote(format!("no fake attributes for {uri}")))
        }

        async fn get_printer_state(&self, uri: &str) -> Result<(PrinterState, bool)> {
            self.states
                .lock()
                .unwrap()
                .get(uri)
                .copied()
                .ok_or_else(|| EngineError::transient_remote(format!("no fake state for {uri}")))
        }

        async fn queued_job_count(&self, uri: &str) -> Result<u32> {
            Ok(self.job_counts.lock().unwrap().get(uri).copied().unwrap_or(0))
        }
    }
}

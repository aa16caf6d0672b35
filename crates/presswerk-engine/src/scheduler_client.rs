// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SchedulerClient trait seam — the administrative IPP calls the Queue
// Reconciler, Scheduler Notification Handler, and Job
// Dispatcher make against the *local* scheduler. A handful of these ops
// (create/modify/delete-printer, pause/resume, set-default, subscriptions)
// are CUPS vendor extensions with no builder support in the `ipp` crate, so
// their operation attribute groups are constructed by hand.

use std::collections::HashMap;

use async_trait::async_trait;
use ipp::prelude::*;
use tracing::{debug, instrument};

use crate::error::{EngineError, Result};

/// CUPS vendor-extension operation codes not exposed by `ipp`'s builder
/// (values per RFC 3998 / the CUPS IPP extensions registry).
mod op {
    pub const CUPS_ADD_MODIFY_PRINTER: u16 = 0x4001;
    pub const CUPS_DELETE_PRINTER: u16 = 0x4002;
    pub const PAUSE_PRINTER: u16 = 0x0010;
    pub const RESUME_PRINTER: u16 = 0x0011;
    pub const CUPS_SET_DEFAULT: u16 = 0x400a;
    pub const CREATE_PRINTER_SUBSCRIPTION: u16 = 0x0016;
    pub const RENEW_SUBSCRIPTION: u16 = 0x0017;
    pub const CANCEL_SUBSCRIPTION: u16 = 0x0018;
    pub const GET_NOTIFICATIONS: u16 = 0x0019;
}

#[derive(Debug, Clone)]
pub struct PrinterDefinition {
    pub queue_name: String,
    pub device_uri: String,
    pub make_and_model: String,
    pub info: Option<String>,
    pub location: Option<String>,
    pub is_shared: bool,
    pub ppd_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: i32,
    pub lease_seconds: u32,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub event: String,
    pub printer_uri: Option<String>,
    pub job_id: Option<i32>,
    pub sequence_number: i32,
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn create_or_modify_printer(&self, scheduler_uri: &str, def: &PrinterDefinition) -> Result<()>;
    async fn delete_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()>;
    async fn pause_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()>;
    async fn resume_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()>;
    async fn get_jobs(&self, scheduler_uri: &str, queue_name: &str) -> Result<Vec<i32>>;
    async fn get_printer_attributes(&self, scheduler_uri: &str, queue_name: &str) -> Result<HashMap<String, String>>;
    async fn set_default(&self, scheduler_uri: &str, queue_name: &str) -> Result<()>;
    async fn create_subscription(&self, scheduler_uri: &str, queue_name: &str, events: &[&str], lease_seconds: u32) -> Result<SubscriptionHandle>;
    async fn renew_subscription(&self, scheduler_uri: &str, id: i32, lease_seconds: u32) -> Result<()>;
    async fn cancel_subscription(&self, scheduler_uri: &str, id: i32) -> Result<()>;
    async fn get_notifications(&self, scheduler_uri: &str, id: i32, last_sequence: i32) -> Result<Vec<Notification>>;
    async fn set_option(&self, scheduler_uri: &str, queue_name: &str, option: &str, value: &str) -> Result<()>;
}

pub struct IppSchedulerClient;

impl Default for IppSchedulerClient {
    fn default() -> Self {
        Self
    }
}

impl IppSchedulerClient {
    fn parse_uri(uri: &str) -> Result<Uri> {
        uri.parse()
            .map_err(|e| EngineError::configuration(format!("invalid scheduler URI '{uri}': {e}")))
    }

    fn printer_uri_value(scheduler_uri: &str, queue_name: &str) -> String {
        format!("{}/printers/{queue_name}", scheduler_uri.trim_end_matches('/'))
    }

    async fn send(&self, scheduler_uri: &str, request: IppRequestResponse) -> Result<IppRequestResponse> {
        let parsed = Self::parse_uri(scheduler_uri)?;
        let client = AsyncIppClient::new(parsed);
        let response = client
            .send(request)
            .await
            .map_err(|e| EngineError::scheduler_busy(format!("scheduler request failed: {e}")))?;
        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            return Err(EngineError::scheduler_busy(format!("scheduler returned status {code:?}")));
        }
        Ok(response)
    }

    fn vendor_request(operation: u16, scheduler_uri: &str, printer_uri: &str) -> IppRequestResponse {
        let mut request = IppRequestResponse::new(
            IppVersion::v1_1(),
            Operation::from_u16(operation).unwrap_or(Operation::PrintJob),
            Some(Self::parse_uri(scheduler_uri).unwrap_or_else(|_| "ipp://localhost/".parse().unwrap())),
        );
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(IppAttribute::PRINTER_URI, IppValue::Uri(printer_uri.to_string())),
        );
        request
    }
}

#[async_trait]
impl SchedulerClient for IppSchedulerClient {
    #[instrument(skip(self, def))]
    async fn create_or_modify_printer(&self, scheduler_uri: &str, def: &PrinterDefinition) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, &def.queue_name);
        let mut request = Self::vendor_request(op::CUPS_ADD_MODIFY_PRINTER, scheduler_uri, &printer_uri);
        let attrs = request.attributes_mut();
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("device-uri", IppValue::Uri(def.device_uri.clone())),
        );
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("printer-make-and-model", IppValue::TextWithoutLanguage(def.make_and_model.clone())),
        );
        if let Some(info) = &def.info {
            attrs.add(
                DelimiterTag::OperationAttributes,
                IppAttribute::new("printer-info", IppValue::TextWithoutLanguage(info.clone())),
            );
        }
        if let Some(location) = &def.location {
            attrs.add(
                DelimiterTag::OperationAttributes,
                IppAttribute::new("printer-location", IppValue::TextWithoutLanguage(location.clone())),
            );
        }
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("printer-is-shared", IppValue::Boolean(def.is_shared)),
        );
        debug!(queue = %def.queue_name, "create-or-modify-printer");
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let request = Self::vendor_request(op::CUPS_DELETE_PRINTER, scheduler_uri, &printer_uri);
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pause_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let request = Self::vendor_request(op::PAUSE_PRINTER, scheduler_uri, &printer_uri);
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_printer(&self, scheduler_uri: &str, queue_name: &str) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let request = Self::vendor_request(op::RESUME_PRINTER, scheduler_uri, &printer_uri);
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_jobs(&self, scheduler_uri: &str, queue_name: &str) -> Result<Vec<i32>> {
        let printer_uri: Uri = Self::printer_uri_value(scheduler_uri, queue_name)
            .parse()
            .map_err(|e| EngineError::configuration(format!("invalid printer URI: {e}")))?;
        let operation = IppOperationBuilder::get_jobs(printer_uri).build();
        let response = self.send(scheduler_uri, operation).await?;

        let mut ids = Vec::new();
        for group in response.attributes().groups_of(DelimiterTag::JobAttributes) {
            for (name, attr) in group.attributes() {
                if name == "job-id" {
                    if let IppValue::Integer(id) = attr.value() {
                        ids.push(*id);
                    }
                }
            }
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn get_printer_attributes(&self, scheduler_uri: &str, queue_name: &str) -> Result<HashMap<String, String>> {
        let printer_uri: Uri = Self::printer_uri_value(scheduler_uri, queue_name)
            .parse()
            .map_err(|e| EngineError::configuration(format!("invalid printer URI: {e}")))?;
        let operation = IppOperationBuilder::get_printer_attributes(printer_uri).build();
        let response = self.send(scheduler_uri, operation).await?;

        let mut map = HashMap::new();
        for group in response.attributes().groups() {
            for (name, attr) in group.attributes() {
                map.insert(name.clone(), format!("{}", attr.value()));
            }
        }
        Ok(map)
    }

    #[instrument(skip(self))]
    async fn set_default(&self, scheduler_uri: &str, queue_name: &str) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let request = Self::vendor_request(op::CUPS_SET_DEFAULT, scheduler_uri, &printer_uri);
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_subscription(
        &self,
        scheduler_uri: &str,
        queue_name: &str,
        events: &[&str],
        lease_seconds: u32,
    ) -> Result<SubscriptionHandle> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let mut request = Self::vendor_request(op::CREATE_PRINTER_SUBSCRIPTION, scheduler_uri, &printer_uri);
        let attrs = request.attributes_mut();
        for event in events {
            attrs.add(
                DelimiterTag::SubscriptionAttributes,
                IppAttribute::new("notify-events", IppValue::Keyword(event.to_string())),
            );
        }
        attrs.add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new("notify-pull-method", IppValue::Keyword("ippget".to_string())),
        );
        attrs.add(
            DelimiterTag::SubscriptionAttributes,
            IppAttribute::new("notify-lease-duration", IppValue::Integer(lease_seconds as i32)),
        );

        let response = self.send(scheduler_uri, request).await?;
        let mut id = None;
        for group in response.attributes().groups_of(DelimiterTag::SubscriptionAttributes) {
            for (name, attr) in group.attributes() {
                if name == "notify-subscription-id" {
                    if let IppValue::Integer(v) = attr.value() {
                        id = Some(*v);
                    }
                }
            }
        }
        let id = id.ok_or_else(|| EngineError::scheduler_busy("subscription response missing id"))?;
        Ok(SubscriptionHandle { id, lease_seconds })
    }

    #[instrument(skip(self))]
    async fn renew_subscription(&self, scheduler_uri: &str, id: i32, lease_seconds: u32) -> Result<()> {
        let mut request = Self::vendor_request(op::RENEW_SUBSCRIPTION, scheduler_uri, scheduler_uri);
        let attrs = request.attributes_mut();
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-id", IppValue::Integer(id)),
        );
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-lease-duration", IppValue::Integer(lease_seconds as i32)),
        );
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(&self, scheduler_uri: &str, id: i32) -> Result<()> {
        let mut request = Self::vendor_request(op::CANCEL_SUBSCRIPTION, scheduler_uri, scheduler_uri);
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-id", IppValue::Integer(id)),
        );
        self.send(scheduler_uri, request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_notifications(&self, scheduler_uri: &str, id: i32, last_sequence: i32) -> Result<Vec<Notification>> {
        let mut request = Self::vendor_request(op::GET_NOTIFICATIONS, scheduler_uri, scheduler_uri);
        let attrs = request.attributes_mut();
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-subscription-ids", IppValue::Integer(id)),
        );
        attrs.add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new("notify-sequence-numbers", IppValue::Integer(last_sequence)),
        );
        let response = self.send(scheduler_uri, request).await?;

        let mut notifications = Vec::new();
        for group in response.attributes().groups_of(DelimiterTag::EventNotificationAttributes) {
            let mut event = None;
            let mut printer_uri = None;
            let mut job_id = None;
            let mut sequence_number = 0;
            for (name, attr) in group.attributes() {
                match name.as_str() {
                    "notify-subscribed-event" => {
                        if let IppValue::Keyword(v) = attr.value() {
                            event = Some(v.clone());
                        }
                    }
                    "printer-uri" => {
                        if let IppValue::Uri(v) = attr.value() {
                            printer_uri = Some(v.clone());
                        }
                    }
                    "notify-job-id" => {
                        if let IppValue::Integer(v) = attr.value() {
                            job_id = Some(*v);
                        }
                    }
                    "notify-sequence-number" => {
                        if let IppValue::Integer(v) = attr.value() {
                            sequence_number = *v;
                        }
                    }
                    _ => {}
                }
            }
            if let Some(event) = event {
                notifications.push(Notification {
                    event,
                    printer_uri,
                    job_id,
                    sequence_number,
                });
            }
        }
        Ok(notifications)
    }

    #[instrument(skip(self))]
    async fn set_option(&self, scheduler_uri: &str, queue_name: &str, option: &str, value: &str) -> Result<()> {
        let printer_uri = Self::printer_uri_value(scheduler_uri, queue_name);
        let mut request = Self::vendor_request(op::CUPS_ADD_MODIFY_PRINTER, scheduler_uri, &printer_uri);
        request.attributes_mut().add(
            DelimiterTag::OperationAttributes,
            IppAttribute::new(option, IppValue::Keyword(value.to_string())),
        );
        self.send(scheduler_uri, request).await?;
        Ok(())
    }
}

/// In-memory fake used throughout the reconciler/notifier/dispatcher test
/// suites so none of them need a live CUPS scheduler.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSchedulerClient {
        pub printers: Mutex<HashMap<String, PrinterDefinition>>,
        pub paused: Mutex<std::collections::HashSet<String>>,
        pub default: Mutex<Option<String>>,
        pub options: Mutex<HashMap<(String, String), String>>,
        pub next_subscription_id: Mutex<i32>,
    }

    #[async_trait]
    impl SchedulerClient for FakeSchedulerClient {
        async fn create_or_modify_printer(&self, _scheduler_uri: &str, def: &PrinterDefinition) -> Result<()> {
            self.printers.lock().unwrap().insert(def.queue_name.clone(), def.clone());
            Ok(())
        }

        async fn delete_printer(&self, _scheduler_uri: &str, queue_name: &str) -> Result<()> {
            self.printers.lock().unwrap().remove(queue_name);
            Ok(())
        }

        async fn pause_printer(&self, _scheduler_uri: &str, queue_name: &str) -> Result<()> {
            self.paused.lock().unwrap().insert(queue_name.to_string());
            Ok(())
        }

        async fn resume_printer(&self, _scheduler_uri: &str, queue_name: &str) -> Result<()> {
            self.paused.lock().unwrap().remove(queue_name);
            Ok(())
        }

        async fn get_jobs(&self, _scheduler_uri: &str, _queue_name: &str) -> Result<Vec<i32>> {
            Ok(Vec::new())
        }

        async fn get_printer_attributes(&self, _scheduler_uri: &str, queue_name: &str) -> Result<HashMap<String, String>> {
            self.printers
                .lock()
                .unwrap()
                .get(queue_name)
                .map(|def| {
                    let mut map = HashMap::new();
                    map.insert("device-uri".to_string(), def.device_uri.clone());
                    map
                })
                .ok_or_else(|| EngineError::scheduler_busy(format!("no fake printer {queue_name}")))
        }

        async fn set_default(&self, _scheduler_uri: &str, queue_name: &str) -> Result<()> {
            *self.default.lock().unwrap() = Some(queue_name.to_string());
            Ok(())
        }

        async fn create_subscription(
            &self,
            _scheduler_uri: &str,
            _queue_name: &str,
            _events: &[&str],
            lease_seconds: u32,
        ) -> Result<SubscriptionHandle> {
            let mut counter = self.next_subscription_id.lock().unwrap();
            *counter += 1;
            Ok(SubscriptionHandle {
                id: *counter,
                lease_seconds,
            })
        }

        async fn renew_subscription(&self, _scheduler_uri: &str, _id: i32, _lease_seconds: u32) -> Result<()> {
            Ok(())
        }

        async fn cancel_subscription(&self, _scheduler_uri: &str, _id: i32) -> Result<()> {
            Ok(())
        }

        async fn get_notifications(&self, _scheduler_uri: &str, _id: i32, _last_sequence: i32) -> Result<Vec<Notification>> {
            Ok(Vec::new())
        }

        async fn set_option(&self, _scheduler_uri: &str, queue_name: &str, option: &str, value: &str) -> Result<()> {
            self.options
                .lock()
                .unwrap()
                .insert((queue_name.to_string(), option.to_string()), value.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeSchedulerClient;
    use super::*;

    #[tokio::test]
    async fn fake_create_then_get_attributes_round_trips_device_uri() {
        let fake = FakeSchedulerClient::default();
        let def = PrinterDefinition {
            queue_name: "lab-printer".to_string(),
            device_uri: "implicitclass:lab-printer".to_string(),
            make_and_model: "Example MFG 9000".to_string(),
            info: None,
            location: None,
            is_shared: true,
            ppd_path: None,
        };
        fake.create_or_modify_printer("ipp://localhost/", &def).await.unwrap();
        let attrs = fake.get_printer_attributes("ipp://localhost/", "lab-printer").await.unwrap();
        assert_eq!(attrs.get("device-uri"), Some(&"implicitclass:lab-printer".to_string()));
    }

    #[tokio::test]
    async fn fake_pause_then_resume_clears_paused_set() {
        let fake = FakeSchedulerClient::default();
        fake.pause_printer("ipp://localhost/", "lab-printer").await.unwrap();
        assert!(fake.paused.lock().unwrap().contains("lab-printer"));
        fake.resume_printer("ipp://localhost/", "lab-printer").await.unwrap();
        assert!(!fake.paused.lock().unwrap().contains("lab-printer"));
    }

    #[tokio::test]
    async fn fake_subscription_ids_increase_monotonically() {
        let fake = FakeSchedulerClient::default();
        let a = fake.create_subscription("ipp://localhost/", "lab-printer", &["printer-state-changed"], 300).await.unwrap();
        let b = fake.create_subscription("ipp://localhost/", "lab-printer", &["printer-state-changed"], 300).await.unwrap();
        assert!(b.id > a.id);
    }
}

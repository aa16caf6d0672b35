// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// presswerk-engine — components A-J of the discovery-reconciliation engine:
// interface tracker, access policy, discovery intake, remote printer
// registry, cluster resolver, queue reconciler, scheduler notification
// handler, job dispatcher, auto-shutdown controller, and option
// persistence.

pub mod access;
pub mod cluster;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod netifs;
pub mod notification;
pub mod persist;
pub mod reconciler;
pub mod registry;
pub mod remote_client;
pub mod scheduler_client;
pub mod shutdown;

pub use error::{EngineError, ErrorKind, Result};
pub use registry::Registry;

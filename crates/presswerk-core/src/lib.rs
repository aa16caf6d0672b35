// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// presswerk-core — domain types, configuration, and error definitions
// shared between the engine and the daemon binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::DaemonConfig;
pub use error::CoreError;
pub use types::*;

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process crash and error reporting for Rust services.
//!
//! The agent intercepts fatal signals, captures and symbolizes stack
//! traces, fingerprints events for server-side grouping, and streams
//! them to a collector over a persistent WebSocket session. Reports
//! captured while the session is down are buffered in a bounded
//! drop-oldest queue and flushed once the collector acknowledges
//! registration.
//!
//! Initialize one [`Agent`] per process:
//!
//! ```ignore
//! let agent = vigil_agent::Agent::init(vigil_agent::AgentConfig::from_env())?;
//! agent.capture_error("something went sideways");
//! ```
//!
//! Signal capture is cooperative with the async runtime: the handler
//! itself only records raw instruction pointers into a pre-allocated
//! slot, then re-raises; symbolization and delivery happen on the
//! background session task.

pub mod agent;
pub mod backtrace;
pub mod config;
pub mod error;

mod encoder;
mod signal;
mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use transport::ConnectionState;

pub use vigil_core::{
	CapturedEvent, CapturedVariable, RuntimeInfo, StackFrame, UserContext,
};

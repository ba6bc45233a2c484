// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Vigil crash monitoring agent.
//!
//! This crate provides the shared leaf types used by the embeddable agent
//! (`vigil-agent`): captured events and stack frames, user context,
//! deduplication fingerprints, and the bounded retry queue that buffers
//! wire messages while the collector is unreachable.
//!
//! Everything here is pure data and pure computation. Network I/O, signal
//! handling, and the session state machine live in `vigil-agent`.

pub mod context;
pub mod event;
pub mod fingerprint;
pub mod queue;

pub use context::UserContext;
pub use event::{CapturedEvent, CapturedVariable, RuntimeInfo, StackFrame};
pub use fingerprint::compute_fingerprint;
pub use queue::{RetryQueue, DEFAULT_QUEUE_CAPACITY};

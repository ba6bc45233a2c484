// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the agent SDK.
//!
//! Only initialization surfaces errors to the embedding application.
//! After a successful `Agent::init`, steady-state failures (transport
//! drops, encoding problems, queue overflow) are absorbed internally and
//! at most logged.

use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the agent SDK.
#[derive(Debug, Error)]
pub enum AgentError {
	/// The API key was missing or empty.
	#[error("API key is required")]
	MissingApiKey,

	/// The backend URL did not parse or used an unsupported scheme.
	#[error("invalid backend URL: {0}")]
	InvalidBackendUrl(String),

	/// An agent is already running in this process.
	#[error("agent already initialized")]
	AlreadyInitialized,

	/// Failed to serialize a wire message.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

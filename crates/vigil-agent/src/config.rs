// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent configuration.

/// Default collector endpoint.
pub const DEFAULT_BACKEND_URL: &str = "wss://api.vigil.dev/monitor/agent";

/// Default environment name.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Default sampling rate.
pub const DEFAULT_SAMPLING_RATE: f64 = 1.0;

const DEFAULT_MAX_CAPTURE_DEPTH: usize = 10;
const DEFAULT_MAX_STRING_LENGTH: usize = 1000;
const DEFAULT_MAX_COLLECTION_SIZE: usize = 100;

/// Environment variable names consumed by [`AgentConfig::from_env`].
pub const ENV_API_KEY: &str = "VIGIL_API_KEY";
pub const ENV_BACKEND_URL: &str = "VIGIL_BACKEND_URL";
pub const ENV_ENVIRONMENT: &str = "VIGIL_ENVIRONMENT";
pub const ENV_SAMPLING_RATE: &str = "VIGIL_SAMPLING_RATE";
pub const ENV_DEBUG: &str = "VIGIL_DEBUG";

/// Configuration for the crash monitoring agent.
///
/// # Example
///
/// ```ignore
/// let config = AgentConfig {
///     api_key: "your-api-key".to_string(),
///     environment: "staging".to_string(),
///     ..AgentConfig::default()
/// };
/// let agent = Agent::init(config)?;
/// ```
#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// Required collector API key.
	pub api_key: String,
	/// Collector WebSocket URL (`ws://` or `wss://`).
	pub backend_url: String,
	/// Environment name reported with every event.
	pub environment: String,
	/// Probability in `[0, 1]` that an explicit capture is reported.
	/// Values >= 1 always capture, values <= 0 never capture.
	pub sampling_rate: f64,
	/// Maximum depth for the reserved local-variable capture tree.
	pub max_capture_depth: usize,
	/// Maximum length for captured string values.
	pub max_string_length: usize,
	/// Maximum element count for captured collections.
	pub max_collection_size: usize,
	/// Debug-logging toggle, carried for embedding applications.
	/// Connection-lifecycle events are emitted at `debug!` level and
	/// filtered by the host's `tracing` subscriber, not by this flag.
	pub debug: bool,
	/// Install handlers for fatal signals.
	pub capture_signals: bool,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			api_key: String::new(),
			backend_url: DEFAULT_BACKEND_URL.to_string(),
			environment: DEFAULT_ENVIRONMENT.to_string(),
			sampling_rate: DEFAULT_SAMPLING_RATE,
			max_capture_depth: DEFAULT_MAX_CAPTURE_DEPTH,
			max_string_length: DEFAULT_MAX_STRING_LENGTH,
			max_collection_size: DEFAULT_MAX_COLLECTION_SIZE,
			debug: false,
			capture_signals: true,
		}
	}
}

impl AgentConfig {
	/// Build a configuration from `VIGIL_*` environment variables,
	/// falling back to defaults for anything unset.
	pub fn from_env() -> Self {
		let mut config = Self::default();

		if let Ok(key) = std::env::var(ENV_API_KEY) {
			config.api_key = key;
		}
		if let Ok(url) = std::env::var(ENV_BACKEND_URL) {
			config.backend_url = url;
		}
		if let Ok(env) = std::env::var(ENV_ENVIRONMENT) {
			config.environment = env;
		}
		if let Ok(rate) = std::env::var(ENV_SAMPLING_RATE) {
			if let Ok(rate) = rate.parse::<f64>() {
				config.sampling_rate = rate;
			}
		}
		if let Ok(debug) = std::env::var(ENV_DEBUG) {
			config.debug = debug == "true" || debug == "1";
		}

		config
	}

	/// Decide whether the next capture should be reported.
	pub fn should_sample(&self) -> bool {
		if self.sampling_rate >= 1.0 {
			return true;
		}
		if self.sampling_rate <= 0.0 {
			return false;
		}
		rand::random::<f64>() < self.sampling_rate
	}
}

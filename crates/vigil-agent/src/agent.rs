// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The owned agent handle: lifecycle, explicit capture, identity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use url::Url;
use vigil_core::{RuntimeInfo, UserContext, DEFAULT_QUEUE_CAPACITY};

use crate::backtrace::capture_stack_frames;
use crate::config::AgentConfig;
use crate::encoder::{build_event, Encoder};
use crate::error::{AgentError, Result};
use crate::signal;
use crate::transport::{Connection, ConnectionState};

/// One agent may be live per process: the crash interceptor's hand-off
/// slot is necessarily process-wide.
static AGENT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Frames contributed by the capture machinery itself, discarded so the
/// first reported frame is the caller's context.
const CAPTURE_SKIP_FRAMES: usize = 3;

struct AgentInner {
	config: AgentConfig,
	encoder: Arc<Encoder>,
	connection: Connection,
	closed: AtomicBool,
}

/// In-process crash and error reporting agent.
///
/// Cheap to clone; all clones share one session and one identity.
///
/// # Example
///
/// ```ignore
/// use vigil_agent::{Agent, AgentConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let agent = Agent::init(AgentConfig {
///         api_key: "your-api-key".to_string(),
///         ..AgentConfig::from_env()
///     })?;
///
///     // Fatal signals are now captured automatically. Explicit errors:
///     agent.capture_error("payment reconciliation failed");
///
///     agent.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Agent {
	inner: Arc<AgentInner>,
}

impl Agent {
	/// Initialize the agent: validate the configuration, generate the
	/// process identity, spawn the background session task and (when
	/// enabled) install the fatal-signal handlers.
	///
	/// Must be called from within a tokio runtime. Fails if the API key
	/// is empty, the backend URL is not `ws://`/`wss://`, or another
	/// agent is already live in this process.
	pub fn init(config: AgentConfig) -> Result<Self> {
		if config.api_key.is_empty() {
			return Err(AgentError::MissingApiKey);
		}
		let url = Url::parse(&config.backend_url)
			.map_err(|e| AgentError::InvalidBackendUrl(e.to_string()))?;
		if !matches!(url.scheme(), "ws" | "wss") {
			return Err(AgentError::InvalidBackendUrl(format!(
				"unsupported scheme: {}",
				url.scheme()
			)));
		}

		if AGENT_ACTIVE.swap(true, Ordering::SeqCst) {
			return Err(AgentError::AlreadyInitialized);
		}

		let hostname = hostname::get()
			.map(|h| h.to_string_lossy().into_owned())
			.unwrap_or_else(|_| "unknown".to_string());

		let encoder = Arc::new(Encoder::new(
			config.api_key.clone(),
			generate_agent_id(),
			hostname,
			config.environment.clone(),
			RuntimeInfo::current(),
		));

		let connection = Connection::spawn(url, Arc::clone(&encoder), DEFAULT_QUEUE_CAPACITY);

		if config.capture_signals {
			signal::install_handlers();
		}

		info!(
			environment = %config.environment,
			agent_id = encoder.agent_id(),
			"agent initialized"
		);

		Ok(Self {
			inner: Arc::new(AgentInner {
				config,
				encoder,
				connection,
				closed: AtomicBool::new(false),
			}),
		})
	}

	/// Capture an error with just a message.
	pub fn capture_error(&self, message: &str) {
		self.capture(message, None, None, None);
	}

	/// Capture an error with a source location and optional JSON context.
	/// The [`vigil_capture_error!`](crate::vigil_capture_error) macro
	/// fills in `file!()`/`line!()` automatically.
	pub fn capture_error_with_context(
		&self,
		message: &str,
		file: Option<&str>,
		line: Option<u32>,
		context: Option<serde_json::Value>,
	) {
		self.capture(message, file, line, context);
	}

	fn capture(
		&self,
		message: &str,
		file: Option<&str>,
		line: Option<u32>,
		context: Option<serde_json::Value>,
	) {
		if self.inner.closed.load(Ordering::SeqCst) {
			return;
		}
		if !self.inner.config.should_sample() {
			debug!("capture sampled out");
			return;
		}

		let frames = capture_stack_frames(CAPTURE_SKIP_FRAMES);
		let encoded = build_event(
			"Error",
			message,
			frames,
			file.map(str::to_string),
			line,
			context,
		)
		.and_then(|event| self.inner.encoder.exception_message(&event));

		// A capture must never propagate a failure into the host.
		match encoded {
			Ok(frame) => self.inner.connection.submit(frame),
			Err(e) => debug!(error = %e, "capture dropped, encoding failed"),
		}
	}

	/// Replace the agent-wide custom context sent with every event.
	pub fn set_context(&self, context: serde_json::Value) {
		self.inner.encoder.set_context(Some(context));
	}

	/// Remove the agent-wide custom context.
	pub fn clear_context(&self) {
		self.inner.encoder.set_context(None);
	}

	/// Replace the user identity attached to every event.
	pub fn set_user(&self, user: UserContext) {
		self.inner.encoder.set_user(Some(user));
	}

	/// Clear the user identity.
	pub fn clear_user(&self) {
		self.inner.encoder.set_user(None);
	}

	/// Current connection state, for diagnostics.
	pub fn connection_state(&self) -> ConnectionState {
		self.inner.connection.state()
	}

	/// The process-lifetime agent id.
	pub fn agent_id(&self) -> &str {
		self.inner.encoder.agent_id()
	}

	/// True once [`shutdown`](Self::shutdown) has run.
	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Cooperative shutdown: restore signal handlers, stop the session
	/// task and wait for it to exit. Idempotent. After shutdown a new
	/// agent may be initialized.
	pub async fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		if self.inner.config.capture_signals {
			signal::uninstall_handlers();
		}
		self.inner.connection.stop().await;
		AGENT_ACTIVE.store(false, Ordering::SeqCst);

		info!("agent shutdown");
	}

	#[cfg(test)]
	pub(crate) fn queued_len(&self) -> usize {
		self.inner.connection.queued_len()
	}
}

/// Process-lifetime agent id: time-seeded with a random suffix.
fn generate_agent_id() -> String {
	format!(
		"agent-{:x}-{:08x}",
		Utc::now().timestamp(),
		rand::random::<u32>()
	)
}

/// Capture an error with the current source location.
///
/// ```ignore
/// vigil_capture_error!(agent, "cache lookup failed");
/// vigil_capture_error!(agent, "cache lookup failed", json!({"key": key}));
/// ```
#[macro_export]
macro_rules! vigil_capture_error {
	($agent:expr, $message:expr) => {
		$agent.capture_error_with_context($message, Some(file!()), Some(line!()), None)
	};
	($agent:expr, $message:expr, $context:expr) => {
		$agent.capture_error_with_context($message, Some(file!()), Some(line!()), Some($context))
	};
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	// Agent liveness is process-global; init-using tests must not overlap.
	static INIT_LOCK: Mutex<()> = Mutex::new(());

	fn unreachable_config() -> AgentConfig {
		AgentConfig {
			api_key: "key-test".to_string(),
			// Hard-closed local port: connects fail fast, everything queues.
			backend_url: "ws://127.0.0.1:9".to_string(),
			capture_signals: false,
			..Default::default()
		}
	}

	#[test]
	fn agent_id_shape() {
		let id = generate_agent_id();
		assert!(id.starts_with("agent-"));
		assert_eq!(id.split('-').count(), 3);
	}

	#[tokio::test]
	async fn init_requires_api_key() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let result = Agent::init(AgentConfig::default());
		assert!(matches!(result, Err(AgentError::MissingApiKey)));
	}

	#[tokio::test]
	async fn init_rejects_non_websocket_url() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let result = Agent::init(AgentConfig {
			api_key: "key".to_string(),
			backend_url: "https://example.com".to_string(),
			..Default::default()
		});
		assert!(matches!(result, Err(AgentError::InvalidBackendUrl(_))));
	}

	#[tokio::test]
	async fn second_init_is_rejected_until_shutdown() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let agent = Agent::init(unreachable_config()).unwrap();

		let second = Agent::init(unreachable_config());
		assert!(matches!(second, Err(AgentError::AlreadyInitialized)));

		agent.shutdown().await;

		let third = Agent::init(unreachable_config()).unwrap();
		third.shutdown().await;
	}

	#[tokio::test]
	async fn capture_while_disconnected_queues() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let agent = Agent::init(unreachable_config()).unwrap();

		agent.capture_error("first");
		agent.capture_error("second");
		assert_eq!(agent.queued_len(), 2);

		agent.shutdown().await;
	}

	#[tokio::test]
	async fn sampled_out_capture_is_dropped() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let agent = Agent::init(AgentConfig {
			sampling_rate: 0.0,
			..unreachable_config()
		})
		.unwrap();

		agent.capture_error("never reported");
		assert_eq!(agent.queued_len(), 0);

		agent.shutdown().await;
	}

	#[tokio::test]
	async fn capture_after_shutdown_is_a_no_op() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let agent = Agent::init(unreachable_config()).unwrap();
		agent.shutdown().await;

		agent.capture_error("too late");
		assert!(agent.is_closed());
	}

	#[tokio::test]
	async fn shutdown_is_idempotent() {
		let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let agent = Agent::init(unreachable_config()).unwrap();
		agent.shutdown().await;
		agent.shutdown().await;
	}
}

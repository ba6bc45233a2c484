// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WebSocket connection manager.
//!
//! One logical session to the collector, hidden behind a non-blocking
//! [`Connection::submit`]. A single background tokio task owns the
//! socket and drives the state machine:
//!
//! `Disconnected -> Connecting -> Connected -> Authenticated`
//!
//! The registration frame is the first frame sent after transport
//! establishment; the collector's `registered` acknowledgement moves the
//! session to Authenticated and triggers a FIFO drain of the retry
//! queue. Transport drops reconnect with capped exponential backoff; an
//! authentication error stops the session permanently.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;
use vigil_core::RetryQueue;

use crate::encoder::{build_event, Encoder};
use crate::signal::{signal_description, signal_name, take_crash_record};

/// Reconnection is abandoned once the attempt counter exceeds this.
pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Heartbeat cadence while authenticated.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Session task poll tick. Shutdown, heartbeats and the crash-slot poll
/// are all bounded by this granularity.
const POLL_TICK: Duration = Duration::from_millis(100);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Authenticated,
}

/// Shared session bookkeeping. The socket itself is owned exclusively by
/// the background task and never appears here.
#[derive(Debug)]
struct Session {
	state: ConnectionState,
	authenticated: bool,
	reconnect_attempts: u32,
	stop_requested: bool,
	auth_failed: bool,
	last_heartbeat: Option<Instant>,
}

impl Session {
	fn new() -> Self {
		Self {
			state: ConnectionState::Disconnected,
			authenticated: false,
			reconnect_attempts: 0,
			stop_requested: false,
			auth_failed: false,
			last_heartbeat: None,
		}
	}
}

struct Shared {
	session: Mutex<Session>,
	queue: RetryQueue,
	outbound: mpsc::UnboundedSender<String>,
}

impl Shared {
	fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
		let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
		f(&mut session)
	}

	fn set_state(&self, state: ConnectionState) {
		self.with_session(|s| s.state = state);
	}

	fn is_authenticated(&self) -> bool {
		self.with_session(|s| s.authenticated)
	}

	fn stop_requested(&self) -> bool {
		self.with_session(|s| s.stop_requested)
	}
}

/// Handle on the background session. Owned by the agent; dropped (after
/// `stop`) at shutdown.
pub(crate) struct Connection {
	shared: Arc<Shared>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
	/// Spawn the background session task. Requires an ambient tokio
	/// runtime.
	pub(crate) fn spawn(url: Url, encoder: Arc<Encoder>, queue_capacity: usize) -> Self {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let shared = Arc::new(Shared {
			session: Mutex::new(Session::new()),
			queue: RetryQueue::new(queue_capacity),
			outbound: outbound_tx,
		});

		let task = tokio::spawn(session_loop(url, encoder, Arc::clone(&shared), outbound_rx));

		Self {
			shared,
			task: Mutex::new(Some(task)),
		}
	}

	/// Submit an encoded frame. Never blocks: while authenticated the
	/// frame is handed to the session task for immediate transmission,
	/// otherwise it joins the bounded retry queue.
	pub(crate) fn submit(&self, frame: String) {
		if self.shared.is_authenticated() {
			if self.shared.outbound.send(frame).is_err() {
				debug!("session task gone, frame dropped");
			}
		} else {
			self.shared.queue.push(frame);
			debug!("message queued (not authenticated)");
		}
	}

	pub(crate) fn state(&self) -> ConnectionState {
		self.shared.with_session(|s| s.state)
	}

	#[cfg(test)]
	pub(crate) fn queued_len(&self) -> usize {
		self.shared.queue.len()
	}

	/// Request a cooperative stop and wait for the session task to exit.
	/// The task observes the flag within one poll tick.
	pub(crate) async fn stop(&self) {
		self.shared.with_session(|s| s.stop_requested = true);
		let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

/// Backoff before reconnect attempt `attempt` (1-indexed): `2^min(k, 6)`
/// seconds, so 2s, 4s, ... capped at 64s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
	Duration::from_secs(1u64 << attempt.min(6))
}

/// Reconnection is given up permanently once the consecutive-failure
/// counter exceeds the ceiling.
pub(crate) fn should_abandon(attempts: u32) -> bool {
	attempts > MAX_RECONNECT_ATTEMPTS
}

/// Move frames still sitting in the outbound channel back into the retry
/// queue, oldest first. They were accepted while authenticated but never
/// written; the next session must send nothing but registration before
/// the collector's ack.
fn requeue_unsent(shared: &Shared, outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
	while let Ok(frame) = outbound_rx.try_recv() {
		shared.queue.push(frame);
	}
}

async fn session_loop(
	url: Url,
	encoder: Arc<Encoder>,
	shared: Arc<Shared>,
	mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
	loop {
		if shared.stop_requested() {
			break;
		}

		shared.set_state(ConnectionState::Connecting);
		debug!(url = %url, "connecting to collector");

		match establish(&url).await {
			Ok(mut ws) => {
				shared.set_state(ConnectionState::Connected);
				debug!("transport established");

				// Registration is the first frame on every transport.
				let registered = match encoder.register_message() {
					Ok(frame) => ws.send(Message::Text(frame)).await.is_ok(),
					Err(e) => {
						debug!(error = %e, "failed to encode registration");
						false
					}
				};

				if registered {
					run_session(&mut ws, &encoder, &shared, &mut outbound_rx).await;
				}
				let _ = ws.close(None).await;
			}
			Err(e) => {
				debug!(error = %e, "connect failed");
			}
		}

		let (stop, auth_failed, attempts) = shared.with_session(|s| {
			s.state = ConnectionState::Disconnected;
			s.authenticated = false;
			if !s.stop_requested && !s.auth_failed {
				s.reconnect_attempts += 1;
			}
			(s.stop_requested, s.auth_failed, s.reconnect_attempts)
		});

		// Authenticated is already cleared, so new submits go to the
		// queue; whatever is still in the channel joins them in order.
		requeue_unsent(&shared, &mut outbound_rx);

		if stop || auth_failed {
			break;
		}
		if should_abandon(attempts) {
			warn!("max reconnect attempts reached, giving up");
			break;
		}

		let delay = backoff_delay(attempts);
		debug!(attempt = attempts, delay_secs = delay.as_secs(), "reconnecting after backoff");
		if backoff_wait(&shared, &encoder, delay).await {
			break;
		}
	}

	shared.set_state(ConnectionState::Disconnected);
	debug!("session loop exited");
}

/// Sleep out the backoff window in poll ticks, still servicing the stop
/// flag and the crash hand-off slot. Returns true when a stop was seen.
async fn backoff_wait(shared: &Shared, encoder: &Encoder, delay: Duration) -> bool {
	let deadline = Instant::now() + delay;
	while Instant::now() < deadline {
		if shared.stop_requested() {
			return true;
		}
		if let Some(frame) = encode_pending_crash(encoder) {
			// Disconnected: the queue is the only place for it.
			shared.queue.push(frame);
		}
		tokio::time::sleep(POLL_TICK).await;
	}
	false
}

enum FrameOutcome {
	/// Nothing actionable.
	Ignored,
	/// Collector acknowledged registration.
	Registered,
	/// Authentication rejected; stop permanently.
	AuthRejected,
}

fn handle_collector_frame(text: &str, shared: &Shared) -> FrameOutcome {
	let parsed: Option<serde_json::Value> = serde_json::from_str(text).ok();
	let kind = parsed
		.as_ref()
		.and_then(|v| v.get("type"))
		.and_then(|t| t.as_str())
		.unwrap_or_default();

	if kind == "registered" || text.contains("\"registered\"") {
		shared.with_session(|s| {
			s.authenticated = true;
			s.state = ConnectionState::Authenticated;
			// Reset so the ceiling measures consecutive failures only.
			s.reconnect_attempts = 0;
		});
		info!("agent registered with collector");
		return FrameOutcome::Registered;
	}

	if text.contains("error") && (text.contains("auth_error") || text.contains("invalid_api_key")) {
		error!("authentication failed, stopping session");
		shared.with_session(|s| {
			s.auth_failed = true;
			s.stop_requested = true;
		});
		return FrameOutcome::AuthRejected;
	}

	FrameOutcome::Ignored
}

async fn run_session(
	ws: &mut WsStream,
	encoder: &Encoder,
	shared: &Shared,
	outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) {
	let mut tick = interval(POLL_TICK);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut last_heartbeat = Instant::now();

	loop {
		tokio::select! {
			msg = ws.next() => match msg {
				Some(Ok(Message::Text(text))) => match handle_collector_frame(&text, shared) {
					FrameOutcome::Registered => {
						if drain_queue(ws, shared).await.is_err() {
							return;
						}
					}
					FrameOutcome::AuthRejected => return,
					FrameOutcome::Ignored => {}
				},
				Some(Ok(Message::Ping(data))) => {
					let _ = ws.send(Message::Pong(data)).await;
				}
				Some(Ok(Message::Close(_))) | None => {
					debug!("collector closed the connection");
					return;
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(error = %e, "transport error");
					return;
				}
			},

			frame = outbound_rx.recv() => {
				if let Some(frame) = frame {
					if ws.send(Message::Text(frame)).await.is_err() {
						return;
					}
					// Opportunistic drain: flush anything still queued.
					if shared.is_authenticated() && drain_queue(ws, shared).await.is_err() {
						return;
					}
				}
			},

			_ = tick.tick() => {
				if shared.stop_requested() {
					return;
				}

				if let Some(frame) = encode_pending_crash(encoder) {
					if shared.is_authenticated() {
						if ws.send(Message::Text(frame)).await.is_err() {
							return;
						}
					} else {
						shared.queue.push(frame);
					}
				}

				if shared.is_authenticated() {
					if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
						match encoder.heartbeat_message() {
							Ok(frame) => {
								if ws.send(Message::Text(frame)).await.is_err() {
									return;
								}
							}
							Err(e) => debug!(error = %e, "failed to encode heartbeat"),
						}
						last_heartbeat = Instant::now();
						shared.with_session(|s| s.last_heartbeat = Some(last_heartbeat));
					}

					if shared.queue.has_pending() && drain_queue(ws, shared).await.is_err() {
						return;
					}
				}
			},
		}
	}
}

/// Flush the retry queue in FIFO order. A failed write gives up so the
/// session can tear down; the popped frame is not re-queued.
async fn drain_queue(ws: &mut WsStream, shared: &Shared) -> Result<(), WsError> {
	while let Some(frame) = shared.queue.pop() {
		ws.send(Message::Text(frame)).await?;
	}
	Ok(())
}

/// Drain the crash hand-off slot, if the interceptor left a record:
/// symbolize outside signal context, fingerprint, encode.
fn encode_pending_crash(encoder: &Encoder) -> Option<String> {
	let record = take_crash_record()?;
	let frames = crate::backtrace::resolve_instruction_pointers(&record.frames);

	let event = build_event(
		signal_name(record.signal),
		&format!(
			"{} (address: 0x{:x})",
			signal_description(record.signal),
			record.fault_addr
		),
		frames,
		None,
		None,
		Some(serde_json::json!({ "signal": record.signal, "fatal": true })),
	);

	match event.and_then(|event| encoder.exception_message(&event)) {
		Ok(frame) => Some(frame),
		Err(e) => {
			debug!(error = %e, "failed to encode crash record");
			None
		}
	}
}

async fn establish(url: &Url) -> Result<WsStream, WsError> {
	let connector = if url.scheme() == "wss" {
		Some(Connector::Rustls(Arc::new(insecure_tls_config())))
	} else {
		None
	};

	let (ws, _response) = connect_async_tls_with_config(url.as_str(), None, false, connector).await?;
	Ok(ws)
}

/// TLS configuration that accepts self-signed certificates and skips
/// hostname verification. A deliberate trust trade-off for collectors
/// deployed with private certificates.
fn insecure_tls_config() -> rustls::ClientConfig {
	rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
		.with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::RSA_PKCS1_SHA1,
			SignatureScheme::ECDSA_SHA1_Legacy,
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::ECDSA_NISTP521_SHA512,
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
			SignatureScheme::ED25519,
			SignatureScheme::ED448,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_then_caps() {
		assert_eq!(backoff_delay(1), Duration::from_secs(2));
		assert_eq!(backoff_delay(2), Duration::from_secs(4));
		assert_eq!(backoff_delay(5), Duration::from_secs(32));
		assert_eq!(backoff_delay(6), Duration::from_secs(64));
		assert_eq!(backoff_delay(7), Duration::from_secs(64));
		assert_eq!(backoff_delay(20), Duration::from_secs(64));
	}

	#[test]
	fn reconnection_abandoned_after_eleventh_failure() {
		// Ten consecutive failures still retry; the eleventh gives up.
		assert!(!should_abandon(9));
		assert!(!should_abandon(MAX_RECONNECT_ATTEMPTS));
		assert!(should_abandon(MAX_RECONNECT_ATTEMPTS + 1));
		assert!(should_abandon(u32::MAX));
	}

	fn test_shared() -> Shared {
		let (outbound, _rx) = mpsc::unbounded_channel();
		Shared {
			session: Mutex::new(Session::new()),
			queue: RetryQueue::new(10),
			outbound,
		}
	}

	#[test]
	fn registered_frame_authenticates_and_resets_attempts() {
		let shared = test_shared();
		shared.with_session(|s| s.reconnect_attempts = 4);

		let outcome = handle_collector_frame(r#"{"type":"registered"}"#, &shared);
		assert!(matches!(outcome, FrameOutcome::Registered));
		assert!(shared.is_authenticated());
		shared.with_session(|s| {
			assert_eq!(s.state, ConnectionState::Authenticated);
			assert_eq!(s.reconnect_attempts, 0);
		});
	}

	#[test]
	fn auth_error_frame_is_terminal() {
		let shared = test_shared();
		let outcome = handle_collector_frame(
			r#"{"type":"error","payload":{"code":"invalid_api_key"}}"#,
			&shared,
		);
		assert!(matches!(outcome, FrameOutcome::AuthRejected));
		shared.with_session(|s| {
			assert!(s.auth_failed);
			assert!(s.stop_requested);
		});
	}

	#[test]
	fn unrelated_frames_are_ignored() {
		let shared = test_shared();
		let outcome = handle_collector_frame(r#"{"type":"pong"}"#, &shared);
		assert!(matches!(outcome, FrameOutcome::Ignored));
		assert!(!shared.is_authenticated());
	}

	#[test]
	fn unsent_outbound_frames_return_to_the_queue_in_order() {
		let (outbound, mut rx) = mpsc::unbounded_channel();
		let shared = Shared {
			session: Mutex::new(Session::new()),
			queue: RetryQueue::new(10),
			outbound,
		};
		shared.queue.push("queued-earlier".to_string());
		shared.outbound.send("in-flight-1".to_string()).unwrap();
		shared.outbound.send("in-flight-2".to_string()).unwrap();

		requeue_unsent(&shared, &mut rx);

		assert_eq!(shared.queue.pop().as_deref(), Some("queued-earlier"));
		assert_eq!(shared.queue.pop().as_deref(), Some("in-flight-1"));
		assert_eq!(shared.queue.pop().as_deref(), Some("in-flight-2"));
		assert_eq!(shared.queue.pop(), None);
	}

	#[test]
	fn non_auth_error_is_not_terminal() {
		let shared = test_shared();
		let outcome =
			handle_collector_frame(r#"{"type":"error","payload":{"code":"throttled"}}"#, &shared);
		assert!(matches!(outcome, FrameOutcome::Ignored));
		shared.with_session(|s| assert!(!s.stop_requested));
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire message encoding.
//!
//! Renders registration, heartbeat and exception frames as single-line
//! JSON objects. All user-supplied strings pass through `serde_json`,
//! which performs the required escaping; optional fields are omitted
//! rather than emitted malformed.

use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use vigil_core::{compute_fingerprint, CapturedEvent, RuntimeInfo, StackFrame, UserContext};

/// Reported in the registration payload.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch, the wire timestamp unit.
pub(crate) fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

#[derive(Serialize)]
struct WireFrame<P: Serialize> {
	#[serde(rename = "type")]
	kind: &'static str,
	payload: P,
	timestamp: i64,
}

#[derive(Serialize)]
struct RegisterPayload<'a> {
	api_key: &'a str,
	agent_id: &'a str,
	hostname: &'a str,
	environment: &'a str,
	agent_version: &'static str,
	runtime: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	runtime_version: Option<&'a str>,
	platform: &'a str,
	arch: &'a str,
}

#[derive(Serialize)]
struct HeartbeatPayload {
	timestamp: i64,
}

#[derive(Serialize)]
struct ExceptionPayload<'a> {
	id: &'a str,
	exception_type: &'a str,
	message: &'a str,
	fingerprint: &'a str,
	stack_trace: &'a [StackFrame],
	local_variables: serde_json::Value,
	context: serde_json::Value,
	captured_at: String,
	agent_id: &'a str,
	environment: &'a str,
	runtime_info: &'a RuntimeInfo,
}

/// Encodes captured events into wire frames, carrying the immutable
/// agent identity plus the replaceable custom context and user identity.
pub(crate) struct Encoder {
	api_key: String,
	agent_id: String,
	hostname: String,
	environment: String,
	runtime: RuntimeInfo,
	context: Mutex<Option<serde_json::Value>>,
	user: Mutex<Option<UserContext>>,
}

impl Encoder {
	pub(crate) fn new(
		api_key: String,
		agent_id: String,
		hostname: String,
		environment: String,
		runtime: RuntimeInfo,
	) -> Self {
		Self {
			api_key,
			agent_id,
			hostname,
			environment,
			runtime,
			context: Mutex::new(None),
			user: Mutex::new(None),
		}
	}

	pub(crate) fn agent_id(&self) -> &str {
		&self.agent_id
	}

	/// Replace the agent-wide custom context wholesale.
	pub(crate) fn set_context(&self, context: Option<serde_json::Value>) {
		*self.context.lock().unwrap_or_else(|e| e.into_inner()) = context;
	}

	/// Replace the user identity wholesale.
	pub(crate) fn set_user(&self, user: Option<UserContext>) {
		*self.user.lock().unwrap_or_else(|e| e.into_inner()) = user;
	}

	/// The registration frame, sent first on every new transport.
	pub(crate) fn register_message(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(&WireFrame {
			kind: "register",
			payload: RegisterPayload {
				api_key: &self.api_key,
				agent_id: &self.agent_id,
				hostname: &self.hostname,
				environment: &self.environment,
				agent_version: AGENT_VERSION,
				runtime: &self.runtime.runtime,
				runtime_version: self.runtime.runtime_version.as_deref(),
				platform: &self.runtime.platform,
				arch: &self.runtime.arch,
			},
			timestamp: now_ms(),
		})
	}

	pub(crate) fn heartbeat_message(&self) -> Result<String, serde_json::Error> {
		let now = now_ms();
		serde_json::to_string(&WireFrame {
			kind: "heartbeat",
			payload: HeartbeatPayload { timestamp: now },
			timestamp: now,
		})
	}

	/// Encode a captured event as an exception frame.
	pub(crate) fn exception_message(
		&self,
		event: &CapturedEvent,
	) -> Result<String, serde_json::Error> {
		serde_json::to_string(&WireFrame {
			kind: "exception",
			payload: ExceptionPayload {
				id: &event.id,
				exception_type: &event.exception_type,
				message: &event.message,
				fingerprint: &event.fingerprint,
				stack_trace: &event.stack_trace,
				local_variables: serde_json::Value::Object(serde_json::Map::new()),
				context: self.merged_context(event),
				captured_at: event
					.captured_at
					.to_rfc3339_opts(SecondsFormat::Secs, true),
				agent_id: &self.agent_id,
				environment: &self.environment,
				runtime_info: &self.runtime,
			},
			timestamp: now_ms(),
		})
	}

	/// Merge the agent-wide context, user identity, per-capture context
	/// and source location into the frame's `context` object. Later
	/// entries win on key collision.
	fn merged_context(&self, event: &CapturedEvent) -> serde_json::Value {
		let mut merged = serde_json::Map::new();

		let custom = self.context.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(serde_json::Value::Object(map)) = custom.as_ref() {
			merged.extend(map.clone());
		}
		drop(custom);

		let user = self.user.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(user) = user.as_ref().filter(|u| !u.is_empty()) {
			if let Ok(value) = serde_json::to_value(user) {
				merged.insert("user".to_string(), value);
			}
		}
		drop(user);

		match event.context.as_ref() {
			Some(serde_json::Value::Object(map)) => merged.extend(map.clone()),
			Some(other) => {
				merged.insert("extra".to_string(), other.clone());
			}
			None => {}
		}

		if let Some(file) = event.file.as_ref() {
			merged.insert("file".to_string(), serde_json::Value::from(file.clone()));
		}
		if let Some(line) = event.line {
			merged.insert("line".to_string(), serde_json::Value::from(line));
		}

		serde_json::Value::Object(merged)
	}
}

/// Assemble a captured event: serialize the frames, fingerprint them
/// together with the type name, and stamp the capture time.
pub(crate) fn build_event(
	exception_type: &str,
	message: &str,
	stack_trace: Vec<StackFrame>,
	file: Option<String>,
	line: Option<u32>,
	context: Option<serde_json::Value>,
) -> Result<CapturedEvent, serde_json::Error> {
	let stack_json = serde_json::to_string(&stack_trace)?;
	let mut event = CapturedEvent::new(exception_type, message);
	event.fingerprint = compute_fingerprint(exception_type, &stack_json);
	event.stack_trace = stack_trace;
	event.file = file;
	event.line = line;
	event.context = context;
	Ok(event)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn test_encoder() -> Encoder {
		Encoder::new(
			"key-123".to_string(),
			"agent-abc".to_string(),
			"host-1".to_string(),
			"test".to_string(),
			RuntimeInfo::current(),
		)
	}

	#[test]
	fn register_frame_shape() {
		let encoder = test_encoder();
		let frame: serde_json::Value =
			serde_json::from_str(&encoder.register_message().unwrap()).unwrap();

		assert_eq!(frame["type"], "register");
		assert_eq!(frame["payload"]["api_key"], "key-123");
		assert_eq!(frame["payload"]["agent_id"], "agent-abc");
		assert_eq!(frame["payload"]["hostname"], "host-1");
		assert_eq!(frame["payload"]["environment"], "test");
		assert_eq!(frame["payload"]["runtime"], "rust");
		assert!(frame["payload"]["platform"].is_string());
		assert!(frame["payload"]["arch"].is_string());
		assert!(frame["timestamp"].is_i64());
	}

	#[test]
	fn heartbeat_frame_shape() {
		let encoder = test_encoder();
		let frame: serde_json::Value =
			serde_json::from_str(&encoder.heartbeat_message().unwrap()).unwrap();

		assert_eq!(frame["type"], "heartbeat");
		assert!(frame["payload"]["timestamp"].is_i64());
	}

	#[test]
	fn exception_round_trip_preserves_event() {
		let encoder = test_encoder();
		let event = build_event(
			"Error",
			"something broke",
			vec![StackFrame::unknown(), StackFrame::unknown()],
			Some("src/main.rs".to_string()),
			Some(42),
			None,
		)
		.unwrap();

		let frame: serde_json::Value =
			serde_json::from_str(&encoder.exception_message(&event).unwrap()).unwrap();

		assert_eq!(frame["type"], "exception");
		let payload = &frame["payload"];
		assert_eq!(payload["exception_type"], "Error");
		assert_eq!(payload["message"], "something broke");
		assert_eq!(payload["fingerprint"], json!(event.fingerprint.clone()));
		assert_eq!(payload["stack_trace"].as_array().unwrap().len(), 2);
		assert_eq!(payload["local_variables"], json!({}));
		assert_eq!(payload["context"]["file"], "src/main.rs");
		assert_eq!(payload["context"]["line"], 42);
		assert_eq!(payload["agent_id"], "agent-abc");
		assert_eq!(payload["environment"], "test");
		assert_eq!(payload["runtime_info"]["runtime"], "rust");
	}

	#[test]
	fn message_strings_are_escaped() {
		let encoder = test_encoder();
		let event = build_event(
			"Error",
			"quote \" backslash \\ newline \n tab \t",
			Vec::new(),
			None,
			None,
			None,
		)
		.unwrap();

		let raw = encoder.exception_message(&event).unwrap();
		let frame: serde_json::Value = serde_json::from_str(&raw).unwrap();
		assert_eq!(
			frame["payload"]["message"],
			"quote \" backslash \\ newline \n tab \t"
		);
	}

	#[test]
	fn custom_context_and_user_are_merged() {
		let encoder = test_encoder();
		encoder.set_context(Some(json!({"deployment": "canary"})));
		encoder.set_user(Some(UserContext {
			id: Some("user_7".to_string()),
			..Default::default()
		}));

		let event = build_event(
			"SIGSEGV",
			"Segmentation fault",
			Vec::new(),
			None,
			None,
			Some(json!({"signal": 11, "fatal": true})),
		)
		.unwrap();

		let frame: serde_json::Value =
			serde_json::from_str(&encoder.exception_message(&event).unwrap()).unwrap();
		let context = &frame["payload"]["context"];
		assert_eq!(context["deployment"], "canary");
		assert_eq!(context["user"]["id"], "user_7");
		assert_eq!(context["signal"], 11);
		assert_eq!(context["fatal"], true);
	}

	#[test]
	fn fingerprint_stable_across_identical_events() {
		let frames = vec![StackFrame {
			method_name: "app::handler".to_string(),
			file_path: None,
			is_native: true,
			source_available: false,
		}];
		let a = build_event("Error", "m1", frames.clone(), None, None, None).unwrap();
		let b = build_event("Error", "m2", frames, None, None, None).unwrap();
		// Message differences do not affect grouping.
		assert_eq!(a.fingerprint, b.fingerprint);
	}
}

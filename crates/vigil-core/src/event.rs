// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Captured event model: exception events, stack frames, runtime identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single frame of a captured stack trace.
///
/// `source_available` is always false in this design: symbols come from
/// the symbol table or the unwinder, never from debug-info line lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
	/// Demangled function name, or `<unknown>` when the address did not
	/// resolve to a symbol.
	pub method_name: String,
	/// Module or source path for the frame, when the symbol carried one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_path: Option<String>,
	/// True when no source path is known for the frame.
	pub is_native: bool,
	/// Whether source text could be shown for this frame. Always false.
	pub source_available: bool,
}

impl StackFrame {
	/// Frame for an address that resolved to nothing.
	pub fn unknown() -> Self {
		Self {
			method_name: "<unknown>".to_string(),
			file_path: None,
			is_native: true,
			source_available: false,
		}
	}
}

/// Runtime identity, resolved once at agent start and injected wherever
/// platform information is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
	pub runtime: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub runtime_version: Option<String>,
	pub platform: String,
	pub arch: String,
}

impl RuntimeInfo {
	/// Resolve the current process runtime.
	pub fn current() -> Self {
		Self {
			runtime: "rust".to_string(),
			runtime_version: option_env!("CARGO_PKG_RUST_VERSION").map(str::to_string),
			platform: std::env::consts::OS.to_string(),
			arch: std::env::consts::ARCH.to_string(),
		}
	}
}

/// A captured exception or error, ready for encoding onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedEvent {
	/// Unique id for this event.
	pub id: String,
	/// Exception or signal type name, e.g. `Error` or `SIGSEGV`.
	pub exception_type: String,
	/// Human-readable message.
	pub message: String,
	/// 16-hex-digit deduplication fingerprint.
	pub fingerprint: String,
	/// Captured stack frames, innermost first.
	pub stack_trace: Vec<StackFrame>,
	/// Source file of the capture site, when the caller supplied one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file: Option<String>,
	/// Source line of the capture site.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub line: Option<u32>,
	/// Free-form JSON context attached to this specific capture.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub context: Option<serde_json::Value>,
	/// When the event was captured.
	pub captured_at: DateTime<Utc>,
}

impl CapturedEvent {
	/// Build an event with a fresh id and the current timestamp.
	pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			exception_type: exception_type.into(),
			message: message.into(),
			fingerprint: String::new(),
			stack_trace: Vec::new(),
			file: None,
			line: None,
			context: None,
			captured_at: Utc::now(),
		}
	}
}

/// A captured local variable.
///
/// Reserved extension point: the wire format carries a `local_variables`
/// object but this agent never populates it. Collectors that support
/// variable capture receive values shaped like this tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedVariable {
	pub name: String,
	pub type_name: String,
	pub value: String,
	pub is_null: bool,
	pub is_truncated: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub children: Vec<CapturedVariable>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_frame_has_no_source() {
		let frame = StackFrame::unknown();
		assert_eq!(frame.method_name, "<unknown>");
		assert!(frame.is_native);
		assert!(!frame.source_available);
	}

	#[test]
	fn frame_omits_absent_file_path() {
		let frame = StackFrame::unknown();
		let json = serde_json::to_value(&frame).unwrap();
		assert!(json.get("file_path").is_none());
	}

	#[test]
	fn runtime_info_reports_rust() {
		let info = RuntimeInfo::current();
		assert_eq!(info.runtime, "rust");
		assert!(!info.platform.is_empty());
		assert!(!info.arch.is_empty());
	}

	#[test]
	fn events_get_distinct_ids() {
		let a = CapturedEvent::new("Error", "one");
		let b = CapturedEvent::new("Error", "two");
		assert_ne!(a.id, b.id);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stack capture and symbol resolution.
//!
//! Two entry points exist for the two execution contexts:
//!
//! - [`capture_stack_frames`] walks and symbolizes in one pass. Used by
//!   the explicit capture path on ordinary application threads.
//! - [`trace_instruction_pointers`] records raw return addresses into a
//!   caller-provided buffer without allocating, locking, or formatting,
//!   so the crash interceptor can run it while a signal is being
//!   handled. [`resolve_instruction_pointers`] symbolizes those
//!   addresses later, outside signal context.
//!
//! No debug-info line lookup is performed; `source_available` is false
//! on every emitted frame.

use std::ffi::c_void;

use rustc_demangle::demangle;
use vigil_core::StackFrame;

/// Maximum number of frames captured per stack walk.
pub const MAX_STACK_FRAMES: usize = 50;

/// Walk the current call stack and resolve each frame to a symbol.
///
/// `skip` discards the topmost frames (the capture machinery itself) so
/// the first emitted frame is the caller's context.
pub fn capture_stack_frames(skip: usize) -> Vec<StackFrame> {
	let mut addrs = [0usize; MAX_STACK_FRAMES];
	let count = {
		let mut skipped = 0usize;
		let mut count = 0usize;
		backtrace::trace(|frame| {
			if skipped < skip {
				skipped += 1;
				return true;
			}
			if count >= MAX_STACK_FRAMES {
				return false;
			}
			addrs[count] = frame.ip() as usize;
			count += 1;
			true
		});
		count
	};

	resolve_instruction_pointers(&addrs[..count])
}

/// Record raw instruction pointers for the current stack into `addrs`,
/// skipping the topmost `skip` frames. Returns the number recorded.
///
/// Performs no allocation and takes no locks; the frame-pointer walk is
/// the only work done. Safe to call while a signal is being handled,
/// which is the sole reason this variant exists.
pub(crate) fn trace_instruction_pointers(addrs: &mut [usize], skip: usize) -> usize {
	let mut skipped = 0usize;
	let mut count = 0usize;
	// SAFETY: trace_unsynchronized requires that no other unwind is in
	// progress on this thread; the crash interceptor's re-entrancy guard
	// ensures a single invocation per process.
	unsafe {
		backtrace::trace_unsynchronized(|frame| {
			if skipped < skip {
				skipped += 1;
				return true;
			}
			if count >= addrs.len() {
				return false;
			}
			addrs[count] = frame.ip() as usize;
			count += 1;
			true
		});
	}
	count
}

/// Resolve previously recorded instruction pointers to stack frames.
///
/// Must only be called from ordinary execution context: symbol lookup
/// allocates and may take loader locks.
pub(crate) fn resolve_instruction_pointers(addrs: &[usize]) -> Vec<StackFrame> {
	let mut frames = Vec::with_capacity(addrs.len());

	for &addr in addrs {
		let mut frame: Option<StackFrame> = None;
		backtrace::resolve(addr as *mut c_void, |symbol| {
			if frame.is_some() {
				return;
			}
			let method_name = symbol
				.name()
				.and_then(|name| name.as_str())
				.map(|raw| demangle(raw).to_string());
			let file_path = symbol
				.filename()
				.map(|path| path.to_string_lossy().into_owned());

			frame = Some(StackFrame {
				is_native: file_path.is_none(),
				source_available: false,
				method_name: method_name.unwrap_or_else(|| "<unknown>".to_string()),
				file_path,
			});
		});
		frames.push(frame.unwrap_or_else(StackFrame::unknown));
	}

	frames
}

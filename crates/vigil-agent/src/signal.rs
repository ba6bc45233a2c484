// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash interceptor: fatal-signal handlers and the pre-allocated
//! crash hand-off slot.
//!
//! The handler itself does the absolute minimum that is legal while a
//! signal is being handled: one atomic re-entrancy check, a
//! frame-pointer walk into a fixed-size static slot, a short grace
//! sleep, then restore-and-re-raise. Symbolization, allocation, JSON
//! encoding and network writes all happen on the background session
//! task, which polls the slot on its regular tick.
//!
//! Handlers are single-shot (`SA_RESETHAND`); a crash during teardown
//! cannot re-enter the reporting path.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use libc::{c_int, c_void};
use tracing::debug;

use crate::backtrace::{trace_instruction_pointers, MAX_STACK_FRAMES};

/// Signals that indicate a fatal fault in the process.
const CRASH_SIGNALS: [c_int; 5] = [
	libc::SIGSEGV,
	libc::SIGABRT,
	libc::SIGFPE,
	libc::SIGBUS,
	libc::SIGILL,
];

const SLOT_EMPTY: u8 = 0;
const SLOT_WRITING: u8 = 1;
const SLOT_READY: u8 = 2;

// Single-producer crash slot. The producer is the one handler invocation
// the re-entrancy guard admits; the consumer is the session task's poll.
static SLOT_STATE: AtomicU8 = AtomicU8::new(SLOT_EMPTY);
static SLOT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static SLOT_FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);
static SLOT_FRAME_COUNT: AtomicUsize = AtomicUsize::new(0);
static SLOT_FRAMES: [AtomicUsize; MAX_STACK_FRAMES] =
	[const { AtomicUsize::new(0) }; MAX_STACK_FRAMES];

static HANDLING: AtomicBool = AtomicBool::new(false);
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

struct PrevActions(UnsafeCell<[MaybeUninit<libc::sigaction>; CRASH_SIGNALS.len()]>);

// Written once during install, before any handler can fire; read only
// from the handler and uninstall.
unsafe impl Sync for PrevActions {}

static PREV_ACTIONS: PrevActions =
	PrevActions(UnsafeCell::new([MaybeUninit::uninit(); CRASH_SIGNALS.len()]));

/// A crash captured inside a signal handler, pending symbolization.
#[derive(Debug)]
pub(crate) struct CrashRecord {
	pub signal: i32,
	pub fault_addr: usize,
	pub frames: Vec<usize>,
}

pub(crate) fn signal_name(sig: i32) -> &'static str {
	match sig {
		libc::SIGSEGV => "SIGSEGV",
		libc::SIGABRT => "SIGABRT",
		libc::SIGFPE => "SIGFPE",
		libc::SIGBUS => "SIGBUS",
		libc::SIGILL => "SIGILL",
		_ => "UNKNOWN",
	}
}

pub(crate) fn signal_description(sig: i32) -> &'static str {
	match sig {
		libc::SIGSEGV => "Segmentation fault",
		libc::SIGABRT => "Abort signal",
		libc::SIGFPE => "Floating point exception",
		libc::SIGBUS => "Bus error",
		libc::SIGILL => "Illegal instruction",
		_ => "Unknown signal",
	}
}

#[cfg(target_os = "linux")]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
	if info.is_null() {
		0
	} else {
		// SAFETY: the kernel hands the handler a valid siginfo pointer.
		unsafe { (*info).si_addr() as usize }
	}
}

#[cfg(not(target_os = "linux"))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
	if info.is_null() {
		0
	} else {
		// SAFETY: the kernel hands the handler a valid siginfo pointer.
		unsafe { (*info).si_addr as usize }
	}
}

/// Record the current stack into the crash slot. Only atomic stores and
/// a frame-pointer walk; no allocation, locks, or formatting.
fn record_crash(sig: i32, fault_addr: usize, skip: usize) {
	if SLOT_STATE
		.compare_exchange(SLOT_EMPTY, SLOT_WRITING, Ordering::AcqRel, Ordering::Acquire)
		.is_err()
	{
		return;
	}

	SLOT_SIGNAL.store(sig, Ordering::Relaxed);
	SLOT_FAULT_ADDR.store(fault_addr, Ordering::Relaxed);

	let mut addrs = [0usize; MAX_STACK_FRAMES];
	let count = trace_instruction_pointers(&mut addrs, skip);
	for (slot, &addr) in SLOT_FRAMES.iter().zip(addrs.iter()).take(count) {
		slot.store(addr, Ordering::Relaxed);
	}
	SLOT_FRAME_COUNT.store(count, Ordering::Relaxed);

	SLOT_STATE.store(SLOT_READY, Ordering::Release);
}

/// Take the pending crash record, if one is ready. Called by the session
/// task's poll tick, never from signal context.
pub(crate) fn take_crash_record() -> Option<CrashRecord> {
	if SLOT_STATE
		.compare_exchange(SLOT_READY, SLOT_EMPTY, Ordering::AcqRel, Ordering::Acquire)
		.is_err()
	{
		return None;
	}

	let count = SLOT_FRAME_COUNT.load(Ordering::Relaxed).min(MAX_STACK_FRAMES);
	let frames = SLOT_FRAMES[..count]
		.iter()
		.map(|slot| slot.load(Ordering::Relaxed))
		.collect();

	Some(CrashRecord {
		signal: SLOT_SIGNAL.load(Ordering::Relaxed),
		fault_addr: SLOT_FAULT_ADDR.load(Ordering::Relaxed),
		frames,
	})
}

extern "C" fn crash_handler(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
	if HANDLING.swap(true, Ordering::SeqCst) {
		// A handler invocation is already in progress; the reporting
		// path itself faulted. Terminate without re-entering it.
		unsafe { libc::_exit(128 + sig) };
	}

	// Skip this handler and the kernel trampoline above it.
	record_crash(sig, fault_address(info), 2);

	// Grace period spanning two session poll ticks so the slot can be
	// drained and the frame flushed before the process dies.
	let grace = libc::timespec {
		tv_sec: 0,
		tv_nsec: 200_000_000,
	};
	unsafe {
		libc::nanosleep(&grace, std::ptr::null_mut());
	}

	restore_and_reraise(sig);
}

fn restore_and_reraise(sig: c_int) {
	unsafe {
		match CRASH_SIGNALS.iter().position(|&s| s == sig) {
			Some(idx) if HANDLERS_INSTALLED.load(Ordering::SeqCst) => {
				let prev = (*PREV_ACTIONS.0.get())[idx].assume_init();
				if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN {
					libc::sigaction(sig, &prev, std::ptr::null_mut());
				} else {
					libc::signal(sig, libc::SIG_DFL);
				}
			}
			_ => {
				libc::signal(sig, libc::SIG_DFL);
			}
		}
		libc::raise(sig);
	}
}

/// Install handlers for the fatal signal set, saving the previous
/// handler for each. Idempotent.
pub(crate) fn install_handlers() {
	if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
		return;
	}

	unsafe {
		let mut action: libc::sigaction = std::mem::zeroed();
		action.sa_sigaction = crash_handler as usize;
		action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND;
		libc::sigemptyset(&mut action.sa_mask);

		for (idx, &sig) in CRASH_SIGNALS.iter().enumerate() {
			let prev = (*PREV_ACTIONS.0.get())[idx].as_mut_ptr();
			libc::sigaction(sig, &action, prev);
		}
	}

	debug!("signal handlers installed");
}

/// Restore the previously saved handlers. Idempotent.
pub(crate) fn uninstall_handlers() {
	if !HANDLERS_INSTALLED.swap(false, Ordering::SeqCst) {
		return;
	}

	unsafe {
		for (idx, &sig) in CRASH_SIGNALS.iter().enumerate() {
			let prev = (*PREV_ACTIONS.0.get())[idx].as_ptr();
			libc::sigaction(sig, prev, std::ptr::null_mut());
		}
	}

	debug!("signal handlers removed");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signal_names_cover_crash_set() {
		assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
		assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
		assert_eq!(signal_name(libc::SIGFPE), "SIGFPE");
		assert_eq!(signal_name(libc::SIGBUS), "SIGBUS");
		assert_eq!(signal_name(libc::SIGILL), "SIGILL");
		assert_eq!(signal_name(999), "UNKNOWN");
	}

	#[test]
	fn descriptions_cover_crash_set() {
		assert_eq!(signal_description(libc::SIGSEGV), "Segmentation fault");
		assert_eq!(signal_description(999), "Unknown signal");
	}

	#[test]
	fn crash_slot_round_trip() {
		// The slot is process-global; drain anything a prior test left.
		let _ = take_crash_record();

		assert!(take_crash_record().is_none());

		record_crash(libc::SIGSEGV, 0xdead, 0);
		let record = take_crash_record().expect("record should be ready");
		assert_eq!(record.signal, libc::SIGSEGV);
		assert_eq!(record.fault_addr, 0xdead);
		assert!(!record.frames.is_empty());
		assert!(record.frames.len() <= MAX_STACK_FRAMES);

		// Slot is consumed.
		assert!(take_crash_record().is_none());
	}

	#[test]
	fn install_and_uninstall_are_idempotent() {
		install_handlers();
		install_handlers();
		uninstall_handlers();
		uninstall_handlers();
	}
}

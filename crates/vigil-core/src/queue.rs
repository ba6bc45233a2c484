// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded retry queue for wire messages awaiting transmission.
//!
//! Decouples producers (capture paths on arbitrary application threads)
//! from the network session. Capacity is fixed for the lifetime of the
//! agent; insertion past capacity evicts the oldest entry, trading
//! completeness for recency under sustained collector unavailability.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Thread-safe bounded FIFO of serialized wire messages.
///
/// Carries its own lock, distinct from any session lock, so queue
/// operations never contend with longer-held network-state critical
/// sections.
#[derive(Debug)]
pub struct RetryQueue {
	entries: Mutex<VecDeque<String>>,
	capacity: usize,
}

impl RetryQueue {
	/// Create a queue holding at most `capacity` entries. A capacity of
	/// zero is clamped to one so `push` always retains the newest entry.
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			entries: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
		}
	}

	fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
		// A poisoned lock only means a panic elsewhere mid-operation;
		// the queue contents are still structurally valid.
		self.entries.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Append a message, evicting the oldest entry when at capacity.
	pub fn push(&self, message: String) {
		let mut entries = self.lock();
		if entries.len() >= self.capacity {
			entries.pop_front();
		}
		entries.push_back(message);
	}

	/// Remove and return the oldest message.
	pub fn pop(&self) -> Option<String> {
		self.lock().pop_front()
	}

	/// Non-blocking check for queued messages.
	pub fn has_pending(&self) -> bool {
		!self.lock().is_empty()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}

impl Default for RetryQueue {
	fn default() -> Self {
		Self::new(DEFAULT_QUEUE_CAPACITY)
	}
}

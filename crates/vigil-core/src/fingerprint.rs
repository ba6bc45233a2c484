// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fingerprinting for grouping similar crash events at the collector.

/// Seed for the rolling hash.
const FINGERPRINT_SEED: u64 = 5381;

/// At most this many bytes of the serialized trace contribute to the hash.
const FINGERPRINT_TRACE_LIMIT: usize = 500;

/// Compute the deduplication fingerprint for a failure.
///
/// A 64-bit djb2 rolling hash (`hash = hash * 33 + byte`) folded over the
/// exception or signal type name followed by the first 500 bytes of the
/// serialized stack trace, rendered as 16 lowercase hex digits. Cheap and
/// stable, not cryptographic; collisions only cost grouping precision at
/// the collector.
pub fn compute_fingerprint(exception_type: &str, stack_trace: &str) -> String {
	let mut hash = FINGERPRINT_SEED;

	for byte in exception_type.bytes() {
		hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
	}

	for byte in stack_trace.bytes().take(FINGERPRINT_TRACE_LIMIT) {
		hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
	}

	format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn fingerprint_is_16_hex_digits() {
		let fp = compute_fingerprint("SIGSEGV", "[]");
		assert_eq!(fp.len(), 16);
		assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}

	#[test]
	fn fingerprint_is_deterministic() {
		let a = compute_fingerprint("Error", r#"[{"method_name":"main"}]"#);
		let b = compute_fingerprint("Error", r#"[{"method_name":"main"}]"#);
		assert_eq!(a, b);
	}

	#[test]
	fn type_name_changes_fingerprint() {
		let trace = r#"[{"method_name":"handle"}]"#;
		assert_ne!(
			compute_fingerprint("SIGSEGV", trace),
			compute_fingerprint("SIGBUS", trace)
		);
	}

	#[test]
	fn trace_beyond_limit_is_ignored() {
		let head = "x".repeat(500);
		let a = compute_fingerprint("Error", &format!("{head}tail-one"));
		let b = compute_fingerprint("Error", &format!("{head}tail-two"));
		assert_eq!(a, b);
	}

	#[test]
	fn empty_inputs_hash_to_seed() {
		assert_eq!(compute_fingerprint("", ""), format!("{:016x}", 5381u64));
	}

	proptest! {
		#[test]
		fn identical_inputs_identical_fingerprints(ty in ".*", trace in ".*") {
			prop_assert_eq!(
				compute_fingerprint(&ty, &trace),
				compute_fingerprint(&ty, &trace)
			);
		}

		#[test]
		fn fingerprint_shape_holds(ty in ".*", trace in ".*") {
			let fp = compute_fingerprint(&ty, &trace);
			prop_assert_eq!(fp.len(), 16);
			prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User identity attached to captured events.

use serde::{Deserialize, Serialize};

/// User identity at capture time. All fields optional; the identity is
/// replaced wholesale via the agent's `set_user`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
}

impl UserContext {
	pub fn is_empty(&self) -> bool {
		self.id.is_none() && self.email.is_none() && self.username.is_none()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_is_empty() {
		assert!(UserContext::default().is_empty());
	}

	#[test]
	fn absent_fields_are_omitted() {
		let user = UserContext {
			id: Some("user_1".to_string()),
			..Default::default()
		};
		let json = serde_json::to_string(&user).unwrap();
		assert_eq!(json, r#"{"id":"user_1"}"#);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: Capture errors with the vigil agent.
//!
//! Run with:
//!   VIGIL_API_KEY=your-key cargo run --example capture -p vigil-agent

use serde_json::json;
use vigil_agent::{vigil_capture_error, Agent, AgentConfig, UserContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "vigil_agent=debug".into()),
		)
		.init();

	// Configure from VIGIL_* environment variables
	let config = AgentConfig::from_env();

	println!("Initializing agent...");
	println!("  Backend URL: {}", config.backend_url);
	println!("  Environment: {}", config.environment);

	let agent = Agent::init(config)?;
	println!("  Agent ID: {}", agent.agent_id());

	// Attach an identity and some ambient context
	agent.set_user(UserContext {
		id: Some("user_example_123".to_string()),
		email: Some("example@example.com".to_string()),
		username: Some("example_user".to_string()),
	});
	agent.set_context(json!({
		"service": "capture-example",
		"region": "local",
	}));

	// Capture a plain error
	println!("\nCapturing test error...");
	agent.capture_error("Example test error from the vigil agent");

	// Capture with source location and per-event context
	vigil_capture_error!(agent, "Example error with context", json!({"request_id": 42}));

	// Give the session a moment to register and flush
	tokio::time::sleep(std::time::Duration::from_secs(2)).await;
	println!("  Connection state: {:?}", agent.connection_state());

	agent.shutdown().await;
	println!("\nAgent shutdown complete.");

	Ok(())
}

//! Webhook signature verification and event classification.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use telemetry::EventKind;

type HmacSha256 = Hmac<Sha256>;

/// Verify a provider webhook signature using HMAC-SHA256.
///
/// # Arguments
/// * `body` - Raw webhook body bytes, exactly as received
/// * `signature` - Header value of the form `sha256=<hex>`
/// * `secret` - Webhook signing secret
///
/// Verification happens before any payload parsing; a missing prefix or
/// non-hex signature fails without touching the body.
#[must_use]
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_part) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Compute the `sha256=<hex>` signature for a body. Used by tests and the
/// smoke tooling; the relay itself only verifies.
#[must_use]
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Map the event-type header onto the closed event enum, case-insensitively.
///
/// Unrecognized types classify as [`EventKind::Other`]; they are accepted
/// with a 200 but generate no orchestrator action.
#[must_use]
pub fn classify_event(event_type: &str) -> EventKind {
    match event_type.to_ascii_lowercase().as_str() {
        "ping" => EventKind::Ping,
        "workflow_run" => EventKind::WorkflowCompletion,
        _ => EventKind::Other,
    }
}

/// Parsed webhook headers.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    /// Unique delivery ID (opaque).
    pub delivery_id: Option<String>,
    /// Event type.
    pub event_type: Option<String>,
    /// HMAC signature (`sha256=<hex>`).
    pub signature: Option<String>,
}

impl WebhookHeaders {
    /// Parse headers from a request.
    #[must_use]
    pub fn from_header_map(get_header: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            delivery_id: get_header("x-github-delivery"),
            event_type: get_header("x-github-event"),
            signature: get_header("x-hub-signature-256"),
        }
    }
}

/// Workflow-run event payload (the deployment trigger).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunEvent {
    /// Action type ("completed", "requested", ...).
    #[serde(default)]
    pub action: Option<String>,
    /// The run itself.
    pub workflow_run: WorkflowRun,
}

/// Nested run object.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    /// Run conclusion ("success", "failure", ...); absent while in progress.
    #[serde(default)]
    pub conclusion: Option<String>,
    /// Commit SHA the run built.
    pub head_sha: String,
    /// Workflow name.
    #[serde(default)]
    pub name: Option<String>,
}

impl WorkflowRunEvent {
    /// Whether this event should trigger a deployment.
    #[must_use]
    pub fn is_successful_completion(&self) -> bool {
        self.workflow_run.conclusion.as_deref() == Some("success")
    }

    /// Short version identifier: first 7 characters of the commit SHA.
    #[must_use]
    pub fn version(&self) -> String {
        let sha = &self.workflow_run.head_sha;
        sha.chars().take(7).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_signature_valid() {
        let body = b"test payload";
        let secret = "test-secret";
        let signature = sign(body, secret);
        assert!(verify_signature(body, &signature, secret));
    }

    #[test]
    fn test_verify_signature_deterministic() {
        let body = b"{\"zen\":\"keep it simple\"}";
        let secret = "shared";
        let signature = sign(body, secret);
        for _ in 0..3 {
            assert!(verify_signature(body, &signature, secret));
        }
    }

    #[test]
    fn test_verify_signature_rejects_mutated_body() {
        let body = b"test payload";
        let secret = "test-secret";
        let signature = sign(body, secret);

        let mut mutated = body.to_vec();
        mutated[0] ^= 0x01; // single bit flip
        assert!(!verify_signature(&mutated, &signature, secret));
    }

    #[test]
    fn test_verify_signature_rejects_mutated_signature() {
        let body = b"test payload";
        let secret = "test-secret";
        let signature = sign(body, secret);

        let mut chars: Vec<char> = signature.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '0' { '1' } else { '0' };
        let mutated: String = chars.into_iter().collect();
        assert!(!verify_signature(body, &mutated, secret));
    }

    #[test]
    fn test_verify_signature_requires_prefix() {
        let body = b"test payload";
        let secret = "test-secret";
        let bare = sign(body, secret).trim_start_matches("sha256=").to_string();
        assert!(!verify_signature(body, &bare, secret));
    }

    #[test]
    fn test_verify_signature_malformed_hex() {
        assert!(!verify_signature(b"body", "sha256=not-hex", "secret"));
    }

    #[test]
    fn test_classify_event_case_insensitive() {
        assert_eq!(classify_event("ping"), EventKind::Ping);
        assert_eq!(classify_event("PING"), EventKind::Ping);
        assert_eq!(classify_event("Workflow_Run"), EventKind::WorkflowCompletion);
        assert_eq!(classify_event("push"), EventKind::Other);
        assert_eq!(classify_event("issues"), EventKind::Other);
    }

    #[test]
    fn test_workflow_run_version_short_sha() {
        let event: WorkflowRunEvent = serde_json::from_str(
            r#"{
                "action": "completed",
                "workflow_run": {
                    "conclusion": "success",
                    "head_sha": "a1b2c3d4e5f6a7b8c9d0",
                    "name": "deploy"
                }
            }"#,
        )
        .unwrap();
        assert!(event.is_successful_completion());
        assert_eq!(event.version(), "a1b2c3d");
    }

    #[test]
    fn test_workflow_run_failure_not_trigger() {
        let event: WorkflowRunEvent = serde_json::from_str(
            r#"{
                "action": "completed",
                "workflow_run": { "conclusion": "failure", "head_sha": "deadbeef00" }
            }"#,
        )
        .unwrap();
        assert!(!event.is_successful_completion());
    }
}

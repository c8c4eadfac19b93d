//! Failure events and mined failure patterns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::ErrorKind;

const SIGNATURE_MAX_LEN: usize = 96;

/// Normalize an error message into a signature shared by recurrences of the
/// same failure: lowercased, digit runs and hex ids collapsed, whitespace squeezed.
pub fn error_signature(message: &str) -> String {
    let mut signature = String::with_capacity(message.len().min(SIGNATURE_MAX_LEN));
    let mut last_was_placeholder = false;
    let mut last_was_space = false;

    for word in message.split_whitespace() {
        if !signature.is_empty() && !last_was_space {
            signature.push(' ');
            last_was_space = true;
            last_was_placeholder = false;
        }
        let is_identifier = word.len() >= 8 && word.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
        if is_identifier {
            signature.push_str("<id>");
            last_was_space = false;
            last_was_placeholder = false;
            continue;
        }
        for c in word.chars() {
            if c.is_ascii_digit() {
                if !last_was_placeholder {
                    signature.push('#');
                    last_was_placeholder = true;
                }
            } else {
                signature.extend(c.to_lowercase());
                last_was_placeholder = false;
            }
            last_was_space = false;
        }
    }

    if signature.len() > SIGNATURE_MAX_LEN {
        let mut cut = SIGNATURE_MAX_LEN;
        while !signature.is_char_boundary(cut) {
            cut -= 1;
        }
        signature.truncate(cut);
    }
    signature
}

/// One observed failure of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: Uuid,
    pub collaborator: String,
    pub error_signature: String,
    pub kind: ErrorKind,
    pub message: String,
    pub agent_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureEvent {
    pub fn new(collaborator: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            id: Uuid::new_v4(),
            collaborator: collaborator.into(),
            error_signature: error_signature(&message),
            kind,
            message,
            agent_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

/// A recurring failure sharing a (collaborator, error-signature) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub id: Uuid,
    pub collaborator: String,
    pub error_signature: String,
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_message: String,
}

impl FailurePattern {
    /// Deterministic key so re-escalations of the same pair update one pattern.
    pub fn key(collaborator: &str, signature: &str) -> String {
        format!("{collaborator}::{signature}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_collapses_variable_parts() {
        let a = error_signature("Request 4821 rejected: quota exceeded for 3f2a9c1e-77aa");
        let b = error_signature("request 17 rejected:   quota exceeded for 00ffee11-2233");
        assert_eq!(a, b);
        assert_eq!(a, "request # rejected: quota exceeded for <id>");
    }

    #[test]
    fn test_signature_is_bounded() {
        let long = "x".repeat(500);
        assert!(error_signature(&long).len() <= SIGNATURE_MAX_LEN);
    }

    #[test]
    fn test_event_carries_signature() {
        let event = FailureEvent::new("mock", ErrorKind::Permanent, "Malformed input at line 12");
        assert_eq!(event.error_signature, "malformed input at line #");
    }
}

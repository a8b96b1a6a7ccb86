//! Runner and registration token records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum runner name length.
pub const RUNNER_NAME_MAX_LEN: usize = 100;

/// Maximum runner description length.
pub const RUNNER_DESCRIPTION_MAX_LEN: usize = 1000;

/// Unique identifier for a runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunnerId(pub String);

impl RunnerId {
    /// Generate a new random runner ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Long-lived credential of a registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunnerToken(pub String);

impl RunnerToken {
    pub fn generate() -> Self {
        Self(format!("rnt-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a registration token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RegistrationTokenId(pub String);

impl RegistrationTokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RegistrationTokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationTokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared secret an administrator hands out so runners can register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RegistrationToken {
    pub id: RegistrationTokenId,
    /// Secret presented by runners at registration time
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

impl RegistrationToken {
    /// Create a token with a random secret.
    pub fn generate() -> Self {
        Self {
            id: RegistrationTokenId::new(),
            secret: format!("rrt-{}", Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }
}

/// A remote worker known to the central service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Runner {
    pub id: RunnerId,

    /// Credential used on every authenticated call, never rotated
    pub token: RunnerToken,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Last authenticated call
    pub last_contact_at: DateTime<Utc>,

    /// Registration token used to register
    pub registration_token_id: RegistrationTokenId,

    pub created_at: DateTime<Utc>,
}

/// Registration request sent by a runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegisterRunner {
    /// Registration token secret
    pub secret: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl RegisterRunner {
    pub fn new(secret: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            name: name.into(),
            description: None,
            ip: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Validate the request.
    pub fn validate(&self) -> Result<(), String> {
        let name_len = self.name.trim().chars().count();
        if name_len == 0 {
            return Err("Runner name is required".to_string());
        }
        if name_len > RUNNER_NAME_MAX_LEN {
            return Err(format!(
                "Runner name must be at most {} characters",
                RUNNER_NAME_MAX_LEN
            ));
        }

        if let Some(description) = &self.description {
            if description.chars().count() > RUNNER_DESCRIPTION_MAX_LEN {
                return Err(format!(
                    "Runner description must be at most {} characters",
                    RUNNER_DESCRIPTION_MAX_LEN
                ));
            }
        }

        Ok(())
    }
}

/// Credential returned by a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerCredential {
    pub runner_id: RunnerId,
    pub runner_token: RunnerToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_validation() {
        assert!(RegisterRunner::new("secret", "runner-1").validate().is_ok());
        assert!(RegisterRunner::new("secret", "   ").validate().is_err());
        assert!(RegisterRunner::new("secret", "a".repeat(101)).validate().is_err());

        let long_description = RegisterRunner::new("secret", "runner")
            .with_description("d".repeat(1001));
        assert!(long_description.validate().is_err());
    }

    #[test]
    fn test_generated_secrets_differ() {
        let a = RegistrationToken::generate();
        let b = RegistrationToken::generate();
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.id, b.id);
    }
}

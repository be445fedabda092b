//! Caller identity handed in by the API layer.
//!
//! Token validation happens before the service is reached; a [`Caller`] only
//! records whether that succeeded and for whom.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    subject: Option<String>,
}

impl Caller {
    pub fn authorized(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { subject: None }
    }

    pub fn is_authorized(&self) -> bool {
        self.subject.is_some()
    }

    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// When false, anonymous callers may mutate state (local development)
    pub require_authorization: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_authorization: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller() {
        let admin = Caller::authorized("admin");
        assert!(admin.is_authorized());
        assert_eq!(admin.subject(), "admin");

        let anon = Caller::anonymous();
        assert!(!anon.is_authorized());
        assert_eq!(anon.subject(), "anonymous");
    }
}

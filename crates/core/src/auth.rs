//! Token verification seam for collaborating transports.
//!
//! The core never parses credentials itself; the hosting process plugs in
//! a verifier and the core checks claims at its public operation
//! boundaries.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Claims extracted from a verified token.
#[derive(Debug, Clone, Default)]
pub struct Claims {
    pub subject: String,
    pub roles: Vec<String>,
    pub attributes: HashMap<String, String>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Secret/auth verifier provided by the hosting process.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token and return its claims, or `Unauthorized`.
    async fn verify_token(&self, token: &str) -> Result<Claims>;
}

/// Verifier that accepts a fixed token set. Test and development helper.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify_token(&self, token: &str) -> Result<Claims> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| crate::error::Error::unauthorized("unknown token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_resolves_known_tokens() {
        let verifier = StaticTokenVerifier::new().with_token(
            "analyst-token",
            Claims {
                subject: "analyst-1".to_string(),
                roles: vec!["analyst".to_string()],
                attributes: HashMap::new(),
            },
        );

        let claims = verifier.verify_token("analyst-token").await.unwrap();
        assert!(claims.has_role("analyst"));

        let err = verifier.verify_token("bogus").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unauthorized);
    }
}

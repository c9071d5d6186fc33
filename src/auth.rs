//! Token verification
//!
//! Every request carries a bearer token scoped to exactly one target. Token
//! issuance lives outside the registry; [`TokenVerifier`] is the boundary and
//! [`MemoryTokenStore`] the in-process implementation seeded from config.
//!
//! ```text
//! Authorization: Bearer <token>
//! ```

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::usage::TargetId;

/// Capability granted to a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "usage:write")]
    UsageWrite,
    #[serde(rename = "registry:read")]
    RegistryRead,
    #[serde(rename = "registry:write")]
    RegistryWrite,
    #[serde(rename = "target:settings")]
    TargetSettings,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::UsageWrite => "usage:write",
            Scope::RegistryRead => "registry:read",
            Scope::RegistryWrite => "registry:write",
            Scope::TargetSettings => "target:settings",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a verified token resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub target: TargetId,
    pub scopes: Vec<Scope>,
}

/// Resolves a bearer token to its target and scopes
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Fails with [`RegistryError::Unauthorized`] for unknown tokens
    async fn verify(&self, token: &str) -> Result<TokenGrant>;
}

/// In-memory token table
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, TokenGrant>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token, replacing any previous grant for it
    pub fn insert(&self, token: impl Into<String>, target: TargetId, scopes: Vec<Scope>) {
        self.tokens
            .write()
            .insert(token.into(), TokenGrant { target, scopes });
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }
}

#[async_trait]
impl TokenVerifier for MemoryTokenStore {
    async fn verify(&self, token: &str) -> Result<TokenGrant> {
        self.tokens
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| RegistryError::Unauthorized("invalid token".to_string()))
    }
}

/// Per-request context, built by the request handler and threaded explicitly
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub target: TargetId,
    scopes: Vec<Scope>,
}

impl RequestContext {
    pub fn new(target: TargetId, scopes: Vec<Scope>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            target,
            scopes,
        }
    }

    /// Verify a raw bearer token and build the context for this request
    pub async fn authenticate(verifier: &dyn TokenVerifier, token: &str) -> Result<Self> {
        let grant = verifier.verify(token).await?;
        Ok(Self::new(grant.target, grant.scopes))
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Fail with [`RegistryError::Forbidden`] unless the token carries `scope`
    pub fn require(&self, scope: Scope) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(RegistryError::Forbidden {
                scope: scope.to_string(),
            })
        }
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_known_and_unknown_tokens() {
        let store = MemoryTokenStore::new();
        store.insert("secret", TargetId::from("prod"), vec![Scope::UsageWrite]);

        let grant = store.verify("secret").await.unwrap();
        assert_eq!(grant.target, TargetId::from("prod"));

        let err = store.verify("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_context_scopes() {
        let store = MemoryTokenStore::new();
        store.insert("reader", TargetId::from("prod"), vec![Scope::RegistryRead]);

        let ctx = RequestContext::authenticate(&store, "reader").await.unwrap();
        assert!(ctx.require(Scope::RegistryRead).is_ok());
        assert!(matches!(
            ctx.require(Scope::UsageWrite),
            Err(RegistryError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn test_scope_wire_names() {
        let scopes: Vec<Scope> = serde_json::from_str(r#"["usage:write", "target:settings"]"#).unwrap();
        assert_eq!(scopes, vec![Scope::UsageWrite, Scope::TargetSettings]);
    }
}

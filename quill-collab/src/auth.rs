//! Access-token verification at the connection boundary.
//!
//! Tokens are HS256 JWTs minted by the platform's auth service; the engine
//! only verifies them. Claims carry the user id and the tenant id so that
//! every downstream access decision is tenant-scoped without a directory
//! round-trip.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::EngineError;

/// JWT claims carried by an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Tenant (firm) id.
    pub tenant: Uuid,
    /// Expiration (seconds since epoch).
    pub exp: u64,
    /// Issued at (seconds since epoch).
    pub iat: u64,
}

/// The authenticated identity extracted from a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

/// Verifies and (for the auth service and tests) mints access tokens.
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Mint a token for `user_id` within `tenant_id`, valid for `ttl`.
    pub fn issue(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        ttl: Duration,
    ) -> Result<String, EngineError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            sub: user_id,
            tenant: tenant_id,
            exp: now + ttl.as_secs(),
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| EngineError::Internal(format!("token encoding failed: {e}")))
    }

    /// Verify signature and expiry, returning the authenticated identity.
    ///
    /// Malformed and expired tokens are both `Unauthenticated`; the detail
    /// string differs for log diagnostics only.
    pub fn verify(&self, token: &str) -> Result<AuthContext, EngineError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| EngineError::Unauthenticated(format!("token rejected: {e}")))?;
        Ok(AuthContext {
            user_id: data.claims.sub,
            tenant_id: data.claims.tenant,
        })
    }
}

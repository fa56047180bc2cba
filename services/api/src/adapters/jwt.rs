//! services/api/src/adapters/jwt.rs
//!
//! HS256 bearer-token verification, the concrete implementation of the
//! `TokenVerifier` port. Token issuance lives with the dashboard's auth
//! service; this side only validates.

use classdare_core::domain::{Identity, Role};
use classdare_core::ports::{PortError, PortResult, TokenVerifier};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by the access tokens the auth service mints.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// The user id.
    sub: String,
    role: String,
    /// Expiry (seconds since epoch). Checked by `Validation` by default.
    exp: i64,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw {
        "admin" => Some(Role::Admin),
        "teacher" => Some(Role::Teacher),
        "student" => Some(Role::Student),
        _ => None,
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> PortResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| PortError::Unauthorized)?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| PortError::Unauthorized)?;
        let role = parse_role(&data.claims.role).ok_or(PortError::Unauthorized)?;
        Ok(Identity { user_id, role })
    }
}

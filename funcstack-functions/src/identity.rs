//! Client context derived from bearer tokens
//!
//! Tokens are decoded without verifying their signature. This only lets
//! local functions see the claims they would see in production; it is not
//! authentication and must never be used as such.

use http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

const LOCAL_IDENTITY_SECRET: &[u8] = b"funcstack-local-identity";

/// Identity payload handed to functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContext {
    pub identity: IdentityInfo,
    pub user: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub url: String,
    pub token: String,
}

/// Builds client contexts for one site
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    info: IdentityInfo,
}

impl IdentityProvider {
    pub fn new(site_url: &str) -> Self {
        let url = format!("{}/.netlify/identity", site_url.trim_end_matches('/'));
        Self {
            info: IdentityInfo {
                url,
                token: mint_identity_token(),
            },
        }
    }

    pub fn identity_url(&self) -> &str {
        &self.info.url
    }

    /// Client context for a request; absent without a decodable bearer token
    pub fn client_context(&self, headers: &HeaderMap) -> Option<ClientContext> {
        let token = bearer_token(headers)?;
        let user = decode_claims(token)?;
        Some(ClientContext {
            identity: self.info.clone(),
            user,
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Claims of a JWT, signature and expiry unchecked
pub fn decode_claims(token: &str) -> Option<Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!(error = %e, "Ignoring undecodable bearer token");
            None
        }
    }
}

fn mint_identity_token() -> String {
    let claims = json!({
        "source": "funcstack",
        "iat": chrono::Utc::now().timestamp(),
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(LOCAL_IDENTITY_SECRET),
    )
    .unwrap_or_else(|e| {
        warn!(error = %e, "Could not mint local identity token");
        String::new()
    })
}

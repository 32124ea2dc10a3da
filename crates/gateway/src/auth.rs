//! JWT validation for the chat socket.
//!
//! Tokens are HS256-signed by the account service (token issuance is not
//! part of this process). The `sub` claim carries the username.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use cq_domain::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Validate a bearer token and return the username it names.
pub fn authenticate(token: &str, secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(Error::Auth("no JWT secret configured".into()));
    }
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| Error::Auth(format!("invalid token: {e}")))?;
    Ok(data.claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(sub: &str, secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.into(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_username() {
        let token = issue("alice", "s3cret", 3600);
        assert_eq!(authenticate(&token, "s3cret").unwrap(), "alice");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue("alice", "s3cret", 3600);
        let err = authenticate(&token, "other").unwrap_err();
        assert_eq!(err.code(), "AUTH");
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue("alice", "s3cret", -3600);
        assert!(authenticate(&token, "s3cret").is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let token = issue("alice", "s3cret", 3600);
        assert!(authenticate(&token, "").is_err());
    }
}

pub mod connection;

use jsonwebtoken::{DecodingKey, Validation, decode};

use notehub_types::api::Claims;
use notehub_types::error::{ChatError, ChatResult};

/// Token verification seam. Tokens are issued by the external NoteHub auth
/// service; this core only checks the signature and expiry and extracts
/// the principal.
#[derive(Clone)]
pub struct AuthVerifier {
    secret: String,
}

impl AuthVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, token: &str) -> ChatResult<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| ChatError::Auth(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let verifier = AuthVerifier::new("secret");
        assert!(verifier.verify(&token("secret", 3600)).is_ok());
    }

    #[test]
    fn rejects_wrong_secret_and_expired_token() {
        let verifier = AuthVerifier::new("secret");
        assert!(matches!(
            verifier.verify(&token("other-secret", 3600)),
            Err(ChatError::Auth(_))
        ));
        assert!(matches!(
            verifier.verify(&token("secret", -3600)),
            Err(ChatError::Auth(_))
        ));
    }
}

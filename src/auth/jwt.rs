use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use super::claims::Claims;
use crate::{config::JwtConfig, error::AppError, state::AppState};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token or bad signature")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token signing failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("token lifetime overflows the clock")]
    Lifetime,
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Invalid => AppError::InvalidToken,
            TokenError::Expired => AppError::TokenExpired,
            TokenError::Signing(inner) => AppError::Internal(anyhow::Error::new(inner)),
            TokenError::Lifetime => AppError::Internal(anyhow::anyhow!("token lifetime overflows the clock")),
        }
    }
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl JwtKeys {
    pub fn new(secret: &str, issuer: &str, audience: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            ttl,
        }
    }

    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self::new(
            &cfg.secret,
            &cfg.issuer,
            &cfg.audience,
            Duration::from_secs((cfg.ttl_minutes.max(0) as u64).saturating_mul(60)),
        )
    }

    fn sign_at(&self, user_id: i64, issued_at: OffsetDateTime) -> Result<String, TokenError> {
        let exp = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|secs| issued_at.checked_add(TimeDuration::seconds(secs)))
            .ok_or(TokenError::Lifetime)?;
        let claims = Claims {
            sub: user_id,
            iat: issued_at.unix_timestamp().max(0) as usize,
            exp: exp.unix_timestamp().max(0) as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Signing)?;
        debug!(user_id, "jwt signed");
        Ok(token)
    }

    /// Signs a token for `user_id` that expires `ttl` from now.
    pub fn issue(&self, user_id: i64) -> Result<String, TokenError> {
        self.sign_at(user_id, OffsetDateTime::now_utc())
    }

    /// Pure function of token, secret and the current time.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;
        debug!(user_id = data.claims.sub, "jwt verified");
        Ok(data.claims)
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_keys(secret: &str, issuer: &str, audience: &str) -> JwtKeys {
        JwtKeys::new(secret, issuer, audience, Duration::from_secs(5 * 60))
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let keys = make_keys("dev-secret", "test-issuer", "test-aud");
        let token = keys.issue(42).expect("sign");
        let claims = keys.verify(&token).expect("verify token");
        assert_eq!(claims.user_id(), 42);
        assert_eq!(claims.iss, "test-issuer");
        assert_eq!(claims.aud, "test-aud");
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[test]
    fn verify_reports_expired_for_old_token() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let issued = OffsetDateTime::now_utc() - TimeDuration::hours(2);
        let token = keys.sign_at(7, issued).expect("sign");
        assert!(matches!(keys.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn verify_reports_invalid_for_tampered_signature() {
        let keys = make_keys("dev-secret", "iss", "aud");
        let token = keys.issue(7).expect("sign");
        let (head, sig) = token.rsplit_once('.').unwrap();
        let flipped = if sig.starts_with('A') { 'B' } else { 'A' };
        let tampered = format!("{head}.{flipped}{}", &sig[1..]);
        assert!(matches!(keys.verify(&tampered), Err(TokenError::Invalid)));
    }

    #[test]
    fn verify_rejects_other_secret() {
        let good = make_keys("secret-a", "iss", "aud");
        let bad = make_keys("secret-b", "iss", "aud");
        let token = good.issue(1).expect("sign");
        assert!(matches!(bad.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_audience() {
        let good = make_keys("same-secret", "good-iss", "good-aud");
        let bad = make_keys("same-secret", "bad-iss", "bad-aud");
        let token = good.issue(1).expect("sign");
        assert!(matches!(bad.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn verify_rejects_garbage() {
        let keys = make_keys("dev-secret", "iss", "aud");
        assert!(matches!(keys.verify("not-a-jwt"), Err(TokenError::Invalid)));
    }

    #[test]
    fn oversized_ttl_is_an_error_not_a_panic() {
        let keys = JwtKeys::new("dev-secret", "iss", "aud", Duration::from_secs(u64::MAX / 2));
        assert!(matches!(keys.issue(1), Err(TokenError::Lifetime)));
        assert!(matches!(
            AppError::from(TokenError::Lifetime),
            AppError::Internal(_)
        ));
    }

    #[test]
    fn token_errors_map_to_unauthorized_kinds() {
        assert!(matches!(AppError::from(TokenError::Invalid), AppError::InvalidToken));
        assert!(matches!(AppError::from(TokenError::Expired), AppError::TokenExpired));
    }
}

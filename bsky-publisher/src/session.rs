use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::Authorization;

/// How a credential was obtained, and so how it must be presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// App-password session, `Authorization: Bearer`
    Bearer,
    /// OAuth grant bound to the signing key, `Authorization: DPoP` plus proof
    #[default]
    Dpop,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Bearer => "bearer",
            AuthScheme::Dpop => "dpop",
        }
    }
}

/// Access and refresh tokens, always held together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// A user's credential for their data server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredential {
    pub did: String,
    pub scheme: AuthScheme,
    tokens: Option<TokenPair>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Resolved lazily; not persisted
    #[serde(skip)]
    pub pds_endpoint: Option<Url>,
}

impl UserCredential {
    pub fn new(
        did: impl Into<String>,
        scheme: AuthScheme,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            did: did.into(),
            scheme,
            tokens: Some(TokenPair {
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
            }),
            token_expires_at,
            pds_endpoint: None,
        }
    }

    /// A credential for a known user who must sign in again
    pub fn cleared(did: impl Into<String>, scheme: AuthScheme) -> Self {
        Self {
            did: did.into(),
            scheme,
            tokens: None,
            token_expires_at: None,
            pds_endpoint: None,
        }
    }

    /// Rebuilds a credential from stored columns; a half-set pair loads as cleared.
    pub fn from_parts(
        did: impl Into<String>,
        scheme: AuthScheme,
        access_token: Option<String>,
        refresh_token: Option<String>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        match (access_token, refresh_token) {
            (Some(access), Some(refresh)) => {
                Self::new(did, scheme, access, refresh, token_expires_at)
            }
            _ => Self::cleared(did, scheme),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }

    pub fn has_tokens(&self) -> bool {
        self.tokens.is_some()
    }

    /// Missing expiry is treated as not expired
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn replace_tokens(
        &mut self,
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.tokens = Some(TokenPair {
            access_token,
            refresh_token,
        });
        self.token_expires_at = expires_at;
    }

    pub fn clear(&mut self) {
        self.tokens = None;
        self.token_expires_at = None;
    }

    /// Authorization to present on a data-server request
    pub fn authorization(&self) -> Authorization<'_> {
        match (self.scheme, self.access_token()) {
            (AuthScheme::Bearer, Some(token)) => Authorization::Bearer(token),
            (AuthScheme::Dpop, Some(token)) => Authorization::Dpop(token),
            (_, None) => Authorization::None,
        }
    }
}

/// Reads the `exp` claim of a JWT without verifying it
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn tokens_are_set_and_cleared_together() {
        let mut cred = UserCredential::new("did:plc:abc", AuthScheme::Dpop, "a", "r", None);
        assert!(cred.has_tokens());

        cred.clear();
        assert!(cred.access_token().is_none());
        assert!(cred.refresh_token().is_none());
        assert!(matches!(cred.authorization(), Authorization::None));
    }

    #[test]
    fn half_stored_pair_loads_cleared() {
        let cred = UserCredential::from_parts(
            "did:plc:abc",
            AuthScheme::Bearer,
            Some("a".into()),
            None,
            Some(Utc::now()),
        );
        assert!(!cred.has_tokens());
        assert!(cred.token_expires_at.is_none());
    }

    #[test]
    fn expiry_is_inclusive_and_optional() {
        let now = Utc::now();
        let mut cred = UserCredential::new("did:plc:abc", AuthScheme::Bearer, "a", "r", None);
        assert!(!cred.is_expired_at(now));

        cred.token_expires_at = Some(now);
        assert!(cred.is_expired_at(now));

        cred.token_expires_at = Some(now + Duration::minutes(5));
        assert!(!cred.is_expired_at(now));
    }

    #[test]
    fn pds_endpoint_is_not_serialized() {
        let mut cred = UserCredential::new("did:plc:abc", AuthScheme::Dpop, "a", "r", None);
        cred.pds_endpoint = Some(Url::parse("https://pds.example.com").unwrap());
        let json = serde_json::to_value(&cred).unwrap();
        assert!(json.get("pds_endpoint").is_none());
    }

    #[test]
    fn reads_jwt_expiry() {
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let payload = URL_SAFE_NO_PAD.encode(r#"{"exp":1700000000,"sub":"did:plc:abc"}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload);
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), 1_700_000_000);
        assert!(jwt_expiry("opaque-token").is_none());
    }
}

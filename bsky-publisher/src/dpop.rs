use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use http::Method;
use p256::ecdsa::SigningKey;
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};
use crate::keys::{Jwk, KeyManager};

/// Lifetime of a `private_key_jwt` client assertion, in seconds
const CLIENT_ASSERTION_TTL: i64 = 60;

/// DPoP proof payload
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct DpopClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Serialize)]
struct DpopHeader<'a> {
    typ: &'static str,
    alg: &'static str,
    jwk: &'a Jwk,
}

#[derive(Serialize)]
struct AssertionHeader<'a> {
    alg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Serialize)]
struct ClientAssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: i64,
    exp: i64,
}

/// Signs DPoP proofs and client assertions with the process signing key.
#[derive(Clone)]
pub struct DpopProofSigner {
    keys: Arc<KeyManager>,
}

impl DpopProofSigner {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Create a DPoP proof for one request
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<String> {
        let pair = self.keys.ensure_keys()?;

        let claims = DpopClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            htm: method.as_str().to_string(),
            htu: htu(url),
            iat: Utc::now().timestamp(),
            ath: access_token.map(access_token_hash),
            nonce: nonce.map(str::to_string),
        };

        let header = DpopHeader {
            typ: "dpop+jwt",
            alg: "ES256",
            jwk: &pair.jwk,
        };

        sign_jwt(&pair.signing_key, &header, &claims)
    }

    /// `private_key_jwt` assertion for the token endpoint
    pub fn client_assertion(&self, client_id: &str, audience: &str) -> Result<String> {
        let pair = self.keys.ensure_keys()?;
        let now = Utc::now().timestamp();

        let header = AssertionHeader {
            alg: "ES256",
            kid: pair.jwk.kid.as_deref(),
        };
        let claims = ClientAssertionClaims {
            iss: client_id,
            sub: client_id,
            aud: audience,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + CLIENT_ASSERTION_TTL,
        };

        sign_jwt(&pair.signing_key, &header, &claims)
    }
}

/// `ath` claim: base64url SHA-256 of the access token
pub fn access_token_hash(token: &str) -> String {
    use sha2::{Digest, Sha256};

    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

/// Target URI with query and fragment removed
pub fn htu(url: &Url) -> String {
    let mut target = url.clone();
    target.set_query(None);
    target.set_fragment(None);
    target.to_string()
}

pub(crate) fn sign_jwt<H: Serialize, C: Serialize>(
    signing_key: &SigningKey,
    header: &H,
    claims: &C,
) -> Result<String> {
    use p256::ecdsa::signature::Signer;

    let header_json = serde_json::to_string(header)
        .map_err(|e| Error::Signing(format!("failed to serialize header: {}", e)))?;
    let claims_json = serde_json::to_string(claims)
        .map_err(|e| Error::Signing(format!("failed to serialize claims: {}", e)))?;

    let header_b64 = URL_SAFE_NO_PAD.encode(&header_json);
    let payload_b64 = URL_SAFE_NO_PAD.encode(&claims_json);
    let signature_input = format!("{}.{}", header_b64, payload_b64);

    let signature: p256::ecdsa::Signature = signing_key
        .try_sign(signature_input.as_bytes())
        .map_err(|e| Error::Signing(e.to_string()))?;
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{}.{}.{}", header_b64, payload_b64, signature_b64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;

    fn signer() -> (tempfile::TempDir, DpopProofSigner) {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyManager::new(dir.path()));
        (dir, DpopProofSigner::new(keys))
    }

    fn decode_part(part: &str) -> serde_json::Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn proof_has_expected_shape_and_verifies() {
        let (_dir, signer) = signer();
        let url = Url::parse("https://pds.example.com/xrpc/com.atproto.repo.createRecord?x=1#f")
            .unwrap();
        let proof = signer
            .sign(&Method::POST, &url, Some("access-token"), Some("nonce-1"))
            .unwrap();

        let parts: Vec<&str> = proof.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_part(parts[0]);
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["jwk"]["kty"], "EC");

        let claims = decode_part(parts[1]);
        assert_eq!(claims["htm"], "POST");
        assert_eq!(
            claims["htu"],
            "https://pds.example.com/xrpc/com.atproto.repo.createRecord"
        );
        assert_eq!(claims["ath"], access_token_hash("access-token"));
        assert_eq!(claims["nonce"], "nonce-1");
        assert!(uuid::Uuid::parse_str(claims["jti"].as_str().unwrap()).is_ok());

        let jwk: Jwk = serde_json::from_value(header["jwk"].clone()).unwrap();
        let signature_bytes = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        let signature = p256::ecdsa::Signature::from_slice(&signature_bytes).unwrap();
        jwk.to_verifying_key()
            .unwrap()
            .verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn optional_claims_are_omitted() {
        let (_dir, signer) = signer();
        let url = Url::parse("https://auth.example.com/oauth/token").unwrap();
        let proof = signer.sign(&Method::POST, &url, None, None).unwrap();
        let claims = decode_part(proof.split('.').nth(1).unwrap());

        assert!(claims.get("ath").is_none());
        assert!(claims.get("nonce").is_none());
    }

    #[test]
    fn every_proof_gets_a_fresh_jti() {
        let (_dir, signer) = signer();
        let url = Url::parse("https://pds.example.com/xrpc/x").unwrap();
        let a = signer.sign(&Method::GET, &url, None, None).unwrap();
        let b = signer.sign(&Method::GET, &url, None, None).unwrap();
        let jti = |p: &str| decode_part(p.split('.').nth(1).unwrap())["jti"].clone();
        assert_ne!(jti(&a), jti(&b));
    }

    #[test]
    fn client_assertion_claims() {
        let (_dir, signer) = signer();
        let assertion = signer
            .client_assertion("https://app.example.com/oauth-client-metadata.json", "https://auth.example.com")
            .unwrap();
        let parts: Vec<&str> = assertion.split('.').collect();

        let header = decode_part(parts[0]);
        assert_eq!(header["alg"], "ES256");
        assert!(header["kid"].is_string());

        let claims = decode_part(parts[1]);
        assert_eq!(claims["iss"], claims["sub"]);
        assert_eq!(claims["aud"], "https://auth.example.com");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            CLIENT_ASSERTION_TTL
        );
    }
}

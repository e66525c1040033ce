//! Sign-in results from identity providers, and the users built from them.
//!
//! Provider payloads are normalized once, at the boundary, into [`AuthHash`].
//! Everything past that point works with the validated struct.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::session::{AuthScheme, UserCredential};

/// Provider name used by the app-password strategy
pub const APP_PASSWORD_PROVIDER: &str = "bluesky";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub handle: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Canonical sign-in result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHash {
    pub provider: String,
    /// Account DID
    pub uid: String,
    pub info: AuthInfo,
    pub credentials: Option<AuthCredentials>,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.trim().is_empty())
}

fn parse_expiry(value: &Value) -> Result<Option<DateTime<Utc>>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(Some)
            .ok_or_else(|| Error::Validation(format!("invalid expires_at: {}", n))),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| Error::Validation(format!("invalid expires_at {}: {}", s, e))),
        other => Err(Error::Validation(format!("invalid expires_at: {}", other))),
    }
}

impl AuthHash {
    /// Normalizes a provider payload.
    ///
    /// The DID may arrive as `info.did` or `uid`; the avatar under several
    /// names in `info` or `extra.raw_info`.
    pub fn from_provider_json(payload: &Value) -> Result<Self> {
        let provider = str_at(payload, &["provider"])
            .ok_or_else(|| Error::Validation("auth payload has no provider".to_string()))?;

        let uid = str_at(payload, &["info", "did"])
            .or_else(|| str_at(payload, &["uid"]))
            .ok_or_else(|| Error::Validation("auth payload has no DID".to_string()))?;
        if !uid.starts_with("did:") {
            return Err(Error::Validation(format!("uid is not a DID: {}", uid)));
        }

        let avatar_paths: [&[&str]; 6] = [
            &["info", "image"],
            &["info", "avatar"],
            &["info", "picture"],
            &["extra", "raw_info", "avatar"],
            &["extra", "raw_info", "picture"],
            &["extra", "raw_info", "image"],
        ];
        let image = avatar_paths.iter().find_map(|path| str_at(payload, path));

        let info = AuthInfo {
            handle: str_at(payload, &["info", "handle"]).map(str::to_string),
            email: str_at(payload, &["info", "email"]).map(str::to_string),
            name: str_at(payload, &["info", "name"]).map(str::to_string),
            image: image.map(str::to_string),
        };

        let token = str_at(payload, &["credentials", "token"]);
        let refresh_token = str_at(payload, &["credentials", "refresh_token"]);
        let credentials = match (token, refresh_token) {
            (Some(token), Some(refresh_token)) => Some(AuthCredentials {
                token: token.to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: parse_expiry(
                    payload
                        .get("credentials")
                        .and_then(|c| c.get("expires_at"))
                        .unwrap_or(&Value::Null),
                )?,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Validation(
                    "auth payload has only one of token and refresh_token".to_string(),
                ));
            }
        };

        Ok(Self {
            provider: provider.to_string(),
            uid: uid.to_string(),
            info,
            credentials,
        })
    }

    pub fn scheme(&self) -> AuthScheme {
        if self.provider == APP_PASSWORD_PROVIDER {
            AuthScheme::Bearer
        } else {
            AuthScheme::Dpop
        }
    }

    pub fn credential(&self) -> UserCredential {
        match &self.credentials {
            Some(c) => UserCredential::new(
                &self.uid,
                self.scheme(),
                &c.token,
                &c.refresh_token,
                c.expires_at,
            ),
            None => UserCredential::cleared(&self.uid, self.scheme()),
        }
    }
}

/// A local account, identified by DID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub did: String,
    pub handle: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub credential: UserCredential,
}

impl User {
    /// Builds a new user. `pending_handle` is the handle typed at sign-in and
    /// wins over whatever the provider reports.
    pub fn from_auth(auth: &AuthHash, pending_handle: Option<&str>) -> Self {
        let handle = pending_handle
            .map(|h| h.trim().trim_start_matches('@'))
            .filter(|h| !h.is_empty())
            .or(auth.info.handle.as_deref())
            .unwrap_or("user")
            .to_string();

        Self {
            did: auth.uid.clone(),
            email: auth
                .info
                .email
                .clone()
                .unwrap_or_else(|| format!("{}@placeholder.com", handle)),
            display_name: auth.info.name.clone().unwrap_or_else(|| handle.clone()),
            avatar_url: auth.info.image.clone(),
            credential: auth.credential(),
            handle,
        }
    }

    /// Refreshes profile fields and tokens on a later sign-in
    pub fn update_from_auth(&mut self, auth: &AuthHash) -> Result<()> {
        if auth.uid != self.did {
            return Err(Error::Validation(format!(
                "sign-in for {} cannot update {}",
                auth.uid, self.did
            )));
        }

        self.display_name = auth
            .info
            .name
            .clone()
            .unwrap_or_else(|| self.handle.clone());
        self.avatar_url = auth.info.image.clone();
        if let Some(c) = &auth.credentials {
            self.credential.scheme = auth.scheme();
            self.credential
                .replace_tokens(c.token.clone(), c.refresh_token.clone(), c.expires_at);
        }
        Ok(())
    }
}

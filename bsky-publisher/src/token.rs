use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use http::Method;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::config::{ClientAuthMethod, PublisherConfig};
use crate::error::{Error, Result};
use crate::identity::IdentityResolver;
use crate::session::{AuthScheme, UserCredential, jwt_expiry};
use crate::store::CredentialStore;
use crate::transport::{Authorization, RequestBody, Transport, xrpc_url};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Where a credential stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    ExpiredLocally,
    RejectedRemotely,
    Refreshing,
    Invalidated,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
    /// Ask the data server whether the token is still accepted
    pub force_remote_check: bool,
}

impl EnsureOptions {
    pub fn remote() -> Self {
        Self {
            force_remote_check: true,
        }
    }
}

/// A completed authorization-code grant handed over by the web layer
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub did: String,
    pub code: String,
    pub code_verifier: String,
    /// Defaults to the configured callback
    pub redirect_uri: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    sub: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
}

struct IssuedTokens {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

enum RefreshOutcome {
    Issued(IssuedTokens),
    Rejected(String),
}

/// Keeps user credentials usable: checks expiry, refreshes, and clears
/// credentials the servers no longer accept.
pub struct TokenLifecycleManager {
    config: Arc<PublisherConfig>,
    resolver: Arc<IdentityResolver>,
    transport: Arc<Transport>,
    store: Arc<dyn CredentialStore>,
    /// One refresh at a time per DID, so rotated refresh tokens are never spent twice
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenLifecycleManager {
    pub fn new(
        config: Arc<PublisherConfig>,
        resolver: Arc<IdentityResolver>,
        transport: Arc<Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            resolver,
            transport,
            store,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_state(&self, credential: &UserCredential, now: DateTime<Utc>) -> TokenState {
        if !credential.has_tokens() {
            TokenState::Invalidated
        } else if credential.is_expired_at(now) {
            TokenState::ExpiredLocally
        } else {
            TokenState::Valid
        }
    }

    /// Returns `Valid` or an error; refreshes on local expiry or remote rejection.
    pub async fn ensure_valid(
        &self,
        credential: &mut UserCredential,
        options: EnsureOptions,
    ) -> Result<TokenState> {
        match self.local_state(credential, Utc::now()) {
            TokenState::Invalidated => {
                return Err(Error::ReauthenticationRequired(format!(
                    "no tokens stored for {}",
                    credential.did
                )));
            }
            TokenState::ExpiredLocally => {
                tracing::info!("access token for {} expired locally", credential.did);
                self.refresh(credential).await?;
                return Ok(TokenState::Valid);
            }
            _ => {}
        }

        if options.force_remote_check && !self.verify_remote(credential).await? {
            tracing::info!(
                "access token for {} is {:?}",
                credential.did,
                TokenState::RejectedRemotely
            );
            self.refresh(credential).await?;
        }

        Ok(TokenState::Valid)
    }

    /// `false` only when the server explicitly refuses the token.
    pub async fn verify_remote(&self, credential: &mut UserCredential) -> Result<bool> {
        let pds = self.resolver.pds_for(credential).await;
        let url = xrpc_url(&pds, "com.atproto.server.getSession")?;

        match self.transport.get(&url, credential.authorization()).await {
            Ok(response) if response.is_success() => Ok(true),
            Ok(response) if response.is_token_rejection() => Ok(false),
            Ok(response) => {
                tracing::warn!(
                    "session check for {} returned {}, assuming token is valid",
                    credential.did,
                    response.status
                );
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "session check for {} failed, assuming token is valid: {}",
                    credential.did,
                    e
                );
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces both tokens, or clears the credential if the server refuses.
    ///
    /// Refreshes for one DID are serialized. A pair stored by a concurrent
    /// refresh is adopted instead of spending the old refresh token again.
    /// Network failures leave the credential untouched and surface as
    /// transient errors.
    pub async fn refresh(&self, credential: &mut UserCredential) -> Result<()> {
        let lock = self
            .refresh_locks
            .lock()
            .await
            .entry(credential.did.clone())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(credential).await
        };

        let mut locks = self.refresh_locks.lock().await;
        // The map and `lock` are the only holders left
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&credential.did);
        }
        result
    }

    async fn refresh_locked(&self, credential: &mut UserCredential) -> Result<()> {
        if self.adopt_stored(credential).await? && !credential.is_expired_at(Utc::now()) {
            tracing::info!("using tokens already refreshed for {}", credential.did);
            return Ok(());
        }

        let Some(refresh_token) = credential.refresh_token().map(str::to_string) else {
            return self.invalidate(credential, None, "no refresh token").await;
        };

        tracing::info!(
            "refreshing {} token for {} ({:?})",
            credential.scheme.as_str(),
            credential.did,
            TokenState::Refreshing
        );

        let outcome = match credential.scheme {
            AuthScheme::Bearer => self.refresh_session(credential, &refresh_token).await,
            AuthScheme::Dpop => self.refresh_oauth(credential, &refresh_token).await,
        };

        match outcome {
            Ok(RefreshOutcome::Issued(tokens)) => {
                credential.replace_tokens(
                    tokens.access_token,
                    tokens.refresh_token.unwrap_or(refresh_token),
                    tokens.expires_at,
                );
                self.store.save_credential(credential).await?;
                tracing::info!("refreshed tokens for {}", credential.did);
                Ok(())
            }
            Ok(RefreshOutcome::Rejected(reason)) => {
                self.invalidate(credential, Some(&refresh_token), &reason).await
            }
            Err(e) => {
                tracing::warn!("token refresh for {} failed: {}", credential.did, e);
                Err(e)
            }
        }
    }

    /// Takes the stored token pair when its refresh token differs from ours.
    async fn adopt_stored(&self, credential: &mut UserCredential) -> Result<bool> {
        let Some(stored) = self.store.load_credential(&credential.did).await? else {
            return Ok(false);
        };
        let (Some(access), Some(refresh)) = (stored.access_token(), stored.refresh_token()) else {
            return Ok(false);
        };
        if credential.refresh_token() == Some(refresh) {
            return Ok(false);
        }

        credential.replace_tokens(access.to_string(), refresh.to_string(), stored.token_expires_at);
        Ok(true)
    }

    /// Clears the stored credential unless it already holds a different
    /// refresh token than the one that was refused.
    async fn invalidate(
        &self,
        credential: &mut UserCredential,
        refused: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        if refused.is_some() && self.adopt_stored(credential).await? {
            tracing::info!(
                "refresh for {} refused but a newer pair is stored, keeping it",
                credential.did
            );
            return Ok(());
        }

        tracing::warn!(
            "clearing credential for {} ({:?}): {}",
            credential.did,
            TokenState::Invalidated,
            reason
        );
        credential.clear();
        self.store.save_credential(credential).await?;
        Err(Error::ReauthenticationRequired(reason.to_string()))
    }

    fn expiry(&self, expires_in: Option<i64>, access_token: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        expires_in
            .map(|secs| now + Duration::seconds(secs))
            .or_else(|| jwt_expiry(access_token))
            .or(Some(now + self.config.default_token_lifetime))
    }

    async fn refresh_session(
        &self,
        credential: &mut UserCredential,
        refresh_token: &str,
    ) -> Result<RefreshOutcome> {
        let pds = self.resolver.pds_for(credential).await;
        let url = xrpc_url(&pds, "com.atproto.server.refreshSession")?;
        let response = self
            .transport
            .send(
                Method::POST,
                &url,
                Authorization::Bearer(refresh_token),
                RequestBody::Empty,
            )
            .await?;

        if !response.is_success() {
            let error = response.into_error();
            return if error.is_transient() {
                Err(error)
            } else {
                Ok(RefreshOutcome::Rejected(error.to_string()))
            };
        }

        let session: SessionResponse = response.json()?;
        Ok(RefreshOutcome::Issued(IssuedTokens {
            expires_at: self.expiry(None, &session.access_jwt),
            access_token: session.access_jwt,
            refresh_token: Some(session.refresh_jwt),
        }))
    }

    async fn refresh_oauth(
        &self,
        credential: &mut UserCredential,
        refresh_token: &str,
    ) -> Result<RefreshOutcome> {
        let pds = self.resolver.pds_for(credential).await;
        let response = self
            .token_request(&pds, &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        if !response.is_success() {
            let error = response.into_error();
            return if error.is_transient() {
                Err(error)
            } else {
                Ok(RefreshOutcome::Rejected(error.to_string()))
            };
        }

        let tokens: TokenResponse = response.json()?;
        Ok(RefreshOutcome::Issued(IssuedTokens {
            expires_at: self.expiry(tokens.expires_in, ""),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }))
    }

    /// POSTs a grant to the token endpoint of the server protecting `pds`
    async fn token_request(
        &self,
        pds: &Url,
        grant: &[(&str, &str)],
    ) -> Result<crate::transport::XrpcResponse> {
        let metadata = self.resolver.discover_auth_server(pds).await?;
        let token_url = Url::parse(&metadata.token_endpoint)?;
        let client_id = self.config.client_id();

        let assertion = match self.config.client_auth_method() {
            ClientAuthMethod::PrivateKeyJwt => Some(
                self.transport
                    .signer()
                    .client_assertion(&client_id, &metadata.issuer)?,
            ),
            ClientAuthMethod::None => None,
        };

        let mut fields: Vec<(&str, &str)> = grant.to_vec();
        fields.push(("client_id", client_id.as_str()));
        if let Some(assertion) = assertion.as_deref() {
            fields.push(("client_assertion_type", CLIENT_ASSERTION_TYPE));
            fields.push(("client_assertion", assertion));
        }

        self.transport
            .send(
                Method::POST,
                &token_url,
                Authorization::DpopOnly,
                RequestBody::Form(&fields),
            )
            .await
    }

    /// Exchanges an authorization code (with its PKCE verifier) for a DPoP-bound credential.
    pub async fn exchange_code(&self, grant: AuthorizationGrant) -> Result<UserCredential> {
        let mut credential = UserCredential::cleared(&grant.did, AuthScheme::Dpop);
        let pds = self.resolver.pds_for(&mut credential).await;
        let redirect_uri = grant
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.config.redirect_uri());

        let response = self
            .token_request(&pds, &[
                ("grant_type", "authorization_code"),
                ("code", grant.code.as_str()),
                ("code_verifier", grant.code_verifier.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .await?;
        let tokens: TokenResponse = response.into_result()?;

        if let Some(sub) = &tokens.sub {
            if sub != &grant.did {
                return Err(Error::Validation(format!(
                    "token issued for {} but grant was for {}",
                    sub, grant.did
                )));
            }
        }
        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            Error::Validation("authorization server issued no refresh token".to_string())
        })?;

        let expires_at = self.expiry(tokens.expires_in, "");
        credential.replace_tokens(tokens.access_token, refresh_token, expires_at);
        self.store.save_credential(&credential).await?;
        tracing::info!("exchanged authorization code for {}", grant.did);
        Ok(credential)
    }

    /// Signs in with an app password, producing a Bearer credential.
    pub async fn create_session(&self, identifier: &str, password: &str) -> Result<UserCredential> {
        let did = if identifier.starts_with("did:") {
            identifier.to_string()
        } else {
            self.resolver.resolve_handle(identifier).await?
        };

        let mut credential = UserCredential::cleared(&did, AuthScheme::Bearer);
        let pds = self.resolver.pds_for(&mut credential).await;
        let url = xrpc_url(&pds, "com.atproto.server.createSession")?;
        let body = serde_json::json!({
            "identifier": identifier,
            "password": password,
        });

        let session: SessionResponse = self
            .transport
            .send(Method::POST, &url, Authorization::None, RequestBody::Json(&body))
            .await?
            .into_result()?;

        if session.did != did {
            return Err(Error::Validation(format!(
                "session created for {} but {} was requested",
                session.did, did
            )));
        }

        let expires_at = self.expiry(None, &session.access_jwt);
        credential.replace_tokens(session.access_jwt, session.refresh_jwt, expires_at);
        self.store.save_credential(&credential).await?;
        tracing::info!("created app-password session for {}", did);
        Ok(credential)
    }
}

use std::collections::HashMap;

use http::{HeaderMap, Method, header};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use url::Url;

use crate::dpop::DpopProofSigner;
use crate::error::{Error, Result};

/// How a request authenticates
#[derive(Debug, Clone, Copy)]
pub enum Authorization<'a> {
    None,
    /// `Authorization: Bearer <token>`
    Bearer(&'a str),
    /// `Authorization: DPoP <token>` with a token-bound proof
    Dpop(&'a str),
    /// Proof without an access token (token endpoint calls)
    DpopOnly,
}

impl Authorization<'_> {
    fn uses_dpop(&self) -> bool {
        matches!(self, Authorization::Dpop(_) | Authorization::DpopOnly)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Form(&'a [(&'a str, &'a str)]),
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct XrpcResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl XrpcResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn dpop_nonce(&self) -> Option<&str> {
        self.headers.get("DPoP-Nonce").and_then(|v| v.to_str().ok())
    }

    fn error_code(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        value.get("error")?.as_str().map(str::to_string)
    }

    /// 400/401 asking for a (new) nonce, with the nonce supplied
    pub fn is_nonce_challenge(&self) -> bool {
        if self.status != 400 && self.status != 401 {
            return false;
        }
        if self.dpop_nonce().is_none() {
            return false;
        }

        let body = String::from_utf8_lossy(&self.body);
        let www_authenticate = self
            .headers
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        body.contains("nonce") || www_authenticate.contains("use_dpop_nonce")
    }

    /// Access token refused for a reason a refresh can fix
    pub fn is_token_rejection(&self) -> bool {
        if self.is_nonce_challenge() {
            return false;
        }
        match self.status {
            401 => true,
            400 => matches!(
                self.error_code().as_deref(),
                Some("ExpiredToken") | Some("InvalidToken")
            ),
            _ => false,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Internal(format!("unexpected response body: {}", e)))
    }

    pub fn into_error(self) -> Error {
        Error::remote(self.status, &self.body)
    }

    /// Parses a 2xx body, or converts the response into a remote error
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if self.is_success() {
            self.json()
        } else {
            Err(self.into_error())
        }
    }
}

/// Builds `{base}/xrpc/{nsid}`
pub fn xrpc_url(base: &Url, nsid: &str) -> Result<Url> {
    Ok(Url::parse(&format!(
        "{}/xrpc/{}",
        base.as_str().trim_end_matches('/'),
        nsid
    ))?)
}

/// HTTP transport that attaches credentials and answers DPoP nonce challenges.
///
/// Nonces are remembered per origin for the lifetime of the transport and
/// overwritten whenever a response carries a new one.
pub struct Transport {
    http: reqwest::Client,
    signer: DpopProofSigner,
    nonces: Mutex<HashMap<String, String>>,
}

impl Transport {
    pub fn new(http: reqwest::Client, signer: DpopProofSigner) -> Self {
        Self {
            http,
            signer,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn signer(&self) -> &DpopProofSigner {
        &self.signer
    }

    /// Most recent nonce seen from the server at `url`
    pub async fn nonce_for(&self, url: &Url) -> Option<String> {
        self.nonces
            .lock()
            .await
            .get(&url.origin().ascii_serialization())
            .cloned()
    }

    async fn remember_nonce(&self, url: &Url, nonce: &str) {
        self.nonces
            .lock()
            .await
            .insert(url.origin().ascii_serialization(), nonce.to_string());
    }

    /// Sends one logical request; at most one extra attempt for a nonce challenge.
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        auth: Authorization<'_>,
        body: RequestBody<'_>,
    ) -> Result<XrpcResponse> {
        let mut retry_count = 0;
        let max_retries = 1;

        loop {
            let mut request = self.http.request(method.clone(), url.clone());

            match auth {
                Authorization::None => {}
                Authorization::Bearer(token) => {
                    request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
                }
                Authorization::Dpop(token) => {
                    let nonce = self.nonce_for(url).await;
                    let proof = self
                        .signer
                        .sign(&method, url, Some(token), nonce.as_deref())?;
                    request = request
                        .header(header::AUTHORIZATION, format!("DPoP {}", token))
                        .header("DPoP", proof);
                }
                Authorization::DpopOnly => {
                    let nonce = self.nonce_for(url).await;
                    let proof = self.signer.sign(&method, url, None, nonce.as_deref())?;
                    request = request.header("DPoP", proof);
                }
            }

            request = match body {
                RequestBody::Empty => request,
                RequestBody::Json(value) => request.json(value),
                RequestBody::Form(fields) => request.form(fields),
            };

            let response = request.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::Network(e.to_string()))?
                .to_vec();

            let response = XrpcResponse {
                status,
                headers,
                body,
            };

            tracing::debug!("{} {} -> {}", method, url.path(), status);

            if let Some(nonce) = response.dpop_nonce() {
                self.remember_nonce(url, nonce).await;
            }

            if auth.uses_dpop() && response.is_nonce_challenge() {
                if retry_count < max_retries {
                    tracing::info!("received DPoP nonce challenge, retrying {}", url.path());
                    retry_count += 1;
                    continue;
                }
                tracing::warn!("DPoP nonce challenge repeated for {}, giving up", url.path());
            }

            return Ok(response);
        }
    }

    pub async fn get(&self, url: &Url, auth: Authorization<'_>) -> Result<XrpcResponse> {
        self.send(Method::GET, url, auth, RequestBody::Empty).await
    }
}

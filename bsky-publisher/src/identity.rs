use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{Error, Result};
use crate::session::UserCredential;
use crate::transport::xrpc_url;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// Endpoint of the `#atproto_pds` service entry
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with("#atproto_pds") || s.type_ == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.as_str())
    }

    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }
}

/// OAuth authorization server metadata, as much as the publisher needs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

/// Resolves DIDs to data servers and data servers to their OAuth issuer.
pub struct IdentityResolver {
    http: reqwest::Client,
    directory: Url,
    default_pds: Url,
    pds_cache: RwLock<HashMap<String, Url>>,
    auth_servers: RwLock<HashMap<String, AuthServerMetadata>>,
}

impl IdentityResolver {
    pub fn new(http: reqwest::Client, directory: Url, default_pds: Url) -> Self {
        Self {
            http,
            directory,
            default_pds,
            pds_cache: RwLock::new(HashMap::new()),
            auth_servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_pds(&self) -> &Url {
        &self.default_pds
    }

    fn document_url(&self, did: &str) -> Result<Url> {
        if did.starts_with("did:plc:") {
            // Url::join would read "did:" as a scheme
            return Ok(Url::parse(&format!(
                "{}/{}",
                self.directory.as_str().trim_end_matches('/'),
                did
            ))?);
        }
        if let Some(host) = did.strip_prefix("did:web:") {
            let host = host.replace("%3A", ":");
            return Ok(Url::parse(&format!("https://{}/.well-known/did.json", host))?);
        }
        Err(Error::Validation(format!("unsupported DID method: {}", did)))
    }

    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument> {
        let url = self.document_url(did)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::remote(status, &body));
        }
        let document: DidDocument = response.json().await?;
        if document.id != did {
            return Err(Error::Validation(format!(
                "DID document id {} does not match {}",
                document.id, did
            )));
        }
        Ok(document)
    }

    /// Resolution that surfaces failures instead of falling back
    pub async fn try_resolve_pds(&self, did: &str) -> Result<Url> {
        if let Some(url) = self.pds_cache.read().await.get(did) {
            return Ok(url.clone());
        }

        let document = self.resolve_did_document(did).await?;
        let endpoint = document
            .pds_endpoint()
            .ok_or_else(|| Error::NotFound(format!("no PDS service in DID document for {}", did)))?;
        let url = Url::parse(endpoint)?;

        self.pds_cache
            .write()
            .await
            .insert(did.to_string(), url.clone());
        tracing::info!("resolved PDS for {}: {}", did, url);
        Ok(url)
    }

    /// Resolves the data server for `did`, falling back to the default PDS.
    pub async fn resolve_pds(&self, did: &str) -> Url {
        self.resolve_pds_checked(did).await.0
    }

    /// Same as `resolve_pds`, reporting whether the result came from resolution
    async fn resolve_pds_checked(&self, did: &str) -> (Url, bool) {
        match self.try_resolve_pds(did).await {
            Ok(url) => (url, true),
            Err(e) => {
                tracing::warn!(
                    "failed to resolve PDS for {}, using {}: {}",
                    did,
                    self.default_pds,
                    e
                );
                (self.default_pds.clone(), false)
            }
        }
    }

    /// Endpoint for a credential, cached on it only when resolution succeeded
    pub async fn pds_for(&self, credential: &mut UserCredential) -> Url {
        if let Some(url) = &credential.pds_endpoint {
            return url.clone();
        }
        let (url, resolved) = self.resolve_pds_checked(&credential.did).await;
        if resolved {
            credential.pds_endpoint = Some(url.clone());
        }
        url
    }

    pub async fn invalidate(&self, did: &str) {
        self.pds_cache.write().await.remove(did);
    }

    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let handle = handle.trim().trim_start_matches('@');
        let mut url = xrpc_url(&self.default_pds, "com.atproto.identity.resolveHandle")?;
        url.query_pairs_mut().append_pair("handle", handle);

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::remote(status, &body));
        }
        let resolved: ResolveHandleResponse = response.json().await?;
        Ok(resolved.did)
    }

    /// Finds the authorization server protecting `pds`
    pub async fn discover_auth_server(&self, pds: &Url) -> Result<AuthServerMetadata> {
        let key = pds.origin().ascii_serialization();
        if let Some(metadata) = self.auth_servers.read().await.get(&key) {
            return Ok(metadata.clone());
        }

        let resource_url = Url::parse(&format!(
            "{}/.well-known/oauth-protected-resource",
            key
        ))?;
        let resource: ProtectedResourceMetadata = self.fetch_json(resource_url).await?;
        let issuer = resource.authorization_servers.into_iter().next().ok_or_else(|| {
            Error::NotFound(format!("{} lists no authorization servers", key))
        })?;

        let metadata_url = Url::parse(&format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        ))?;
        let metadata: AuthServerMetadata = self.fetch_json(metadata_url).await?;
        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(Error::Validation(format!(
                "authorization server issuer mismatch: {} != {}",
                metadata.issuer, issuer
            )));
        }

        tracing::info!("discovered authorization server {} for {}", metadata.issuer, key);
        self.auth_servers.write().await.insert(key, metadata.clone());
        Ok(metadata)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::remote(status, &body));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            reqwest::Client::new(),
            Url::parse("https://plc.directory").unwrap(),
            Url::parse("https://bsky.social").unwrap(),
        )
    }

    #[test]
    fn document_urls() {
        let r = resolver();
        assert_eq!(
            r.document_url("did:plc:abc123").unwrap().as_str(),
            "https://plc.directory/did:plc:abc123"
        );
        assert_eq!(
            r.document_url("did:web:example.com").unwrap().as_str(),
            "https://example.com/.well-known/did.json"
        );
        assert!(r.document_url("did:key:zabc").is_err());
    }

    #[test]
    fn finds_pds_service() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:abc",
            "alsoKnownAs": ["at://alice.test"],
            "service": [
                {"id": "#other", "type": "Other", "serviceEndpoint": "https://other"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example.com"}
            ]
        }))
        .unwrap();

        assert_eq!(doc.pds_endpoint(), Some("https://pds.example.com"));
        assert_eq!(doc.handle(), Some("alice.test"));
    }

    #[test]
    fn matches_service_by_type() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:abc",
            "service": [
                {"id": "did:plc:abc#pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example.com"}
            ]
        }))
        .unwrap();
        assert_eq!(doc.pds_endpoint(), Some("https://pds.example.com"));
    }
}

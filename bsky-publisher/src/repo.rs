use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::at_uri::AtUri;
use crate::error::{Error, Result};
use crate::identity::IdentityResolver;
use crate::session::UserCredential;
use crate::token::{EnsureOptions, TokenLifecycleManager};
use crate::transport::{RequestBody, Transport, XrpcResponse, xrpc_url};

/// Page size bounds accepted by `listRecords`
const MAX_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordValue {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<RecordValue>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Record operations against the user's data server
pub struct RepositoryClient {
    resolver: Arc<IdentityResolver>,
    tokens: Arc<TokenLifecycleManager>,
    transport: Arc<Transport>,
}

impl RepositoryClient {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        tokens: Arc<TokenLifecycleManager>,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            resolver,
            tokens,
            transport,
        }
    }

    pub async fn create_record(
        &self,
        credential: &mut UserCredential,
        collection: &str,
        record: Value,
    ) -> Result<CreatedRecord> {
        let Value::Object(mut fields) = record else {
            return Err(Error::Validation("record must be a JSON object".to_string()));
        };
        fields
            .entry("$type")
            .or_insert_with(|| Value::String(collection.to_string()));
        fields.entry("createdAt").or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        });

        let body = serde_json::json!({
            "repo": credential.did,
            "collection": collection,
            "record": fields,
        });

        let created: CreatedRecord = self
            .call(
                credential,
                Method::POST,
                "com.atproto.repo.createRecord",
                &[],
                Some(&body),
                true,
            )
            .await?
            .json()?;
        tracing::info!("created record {}", created.uri);
        Ok(created)
    }

    pub async fn get_record(
        &self,
        credential: &mut UserCredential,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<RecordValue> {
        let query = [("repo", repo), ("collection", collection), ("rkey", rkey)];
        let result = self
            .call(
                credential,
                Method::GET,
                "com.atproto.repo.getRecord",
                &query,
                None,
                false,
            )
            .await;

        match result {
            Ok(response) => response.json(),
            Err(Error::Remote { status, error, .. })
                if status == 404 || error.as_deref() == Some("RecordNotFound") =>
            {
                Err(Error::NotFound(format!("at://{}/{}/{}", repo, collection, rkey)))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_record_by_uri(
        &self,
        credential: &mut UserCredential,
        at_uri: &str,
    ) -> Result<RecordValue> {
        let uri = AtUri::parse(at_uri)?;
        self.get_record(credential, &uri.repo, &uri.collection, &uri.rkey)
            .await
    }

    /// Lists records in `collection` of the credential's own repository
    pub async fn list_records(
        &self,
        credential: &mut UserCredential,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let repo = credential.did.clone();
        let limit = limit.clamp(1, MAX_LIST_LIMIT).to_string();
        let mut query = vec![
            ("repo", repo.as_str()),
            ("collection", collection),
            ("limit", limit.as_str()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        self.call(
            credential,
            Method::GET,
            "com.atproto.repo.listRecords",
            &query,
            None,
            false,
        )
        .await?
        .json()
    }

    /// Deletes the record at `at_uri`; the uri is validated before any request.
    pub async fn delete_record(&self, credential: &mut UserCredential, at_uri: &str) -> Result<()> {
        let uri = AtUri::parse(at_uri)?;
        let body = serde_json::json!({
            "repo": uri.repo,
            "collection": uri.collection,
            "rkey": uri.rkey,
        });

        self.call(
            credential,
            Method::POST,
            "com.atproto.repo.deleteRecord",
            &[],
            Some(&body),
            true,
        )
        .await?;
        tracing::info!("deleted record {}", uri);
        Ok(())
    }

    /// Resolves the endpoint once and pins it for the whole operation.
    async fn call(
        &self,
        credential: &mut UserCredential,
        method: Method,
        nsid: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        write: bool,
    ) -> Result<XrpcResponse> {
        let pds = self.resolver.pds_for(credential).await;
        let pinned = credential.pds_endpoint.is_none();
        if pinned {
            credential.pds_endpoint = Some(pds.clone());
        }

        let result = self
            .call_at(credential, &pds, method, nsid, query, body, write)
            .await;

        if pinned {
            credential.pds_endpoint = None;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_at(
        &self,
        credential: &mut UserCredential,
        pds: &Url,
        method: Method,
        nsid: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        write: bool,
    ) -> Result<XrpcResponse> {
        self.tokens
            .ensure_valid(
                credential,
                EnsureOptions {
                    force_remote_check: write,
                },
            )
            .await?;

        let mut url = xrpc_url(pds, nsid)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let body = body.map(RequestBody::Json).unwrap_or(RequestBody::Empty);

        let mut refreshed = false;
        loop {
            let response = self
                .transport
                .send(method.clone(), &url, credential.authorization(), body)
                .await?;

            if response.is_success() {
                return Ok(response);
            }

            if response.is_token_rejection() && !refreshed {
                tracing::info!("{} rejected the access token, refreshing once", nsid);
                refreshed = true;
                self.tokens.refresh(credential).await?;
                continue;
            }

            return Err(response.into_error());
        }
    }
}

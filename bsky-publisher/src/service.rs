use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::at_uri::AtUri;
use crate::config::PublisherConfig;
use crate::dpop::DpopProofSigner;
use crate::error::{Error, Result};
use crate::format::{self, BasicHtmlConverter, HtmlConverter};
use crate::identity::IdentityResolver;
use crate::keys::KeyManager;
use crate::post::{Post, PostStatus};
use crate::publish::PublicationStateMachine;
use crate::reauth::PreservedForms;
use crate::repo::{RecordPage, RecordValue, RepositoryClient};
use crate::session::UserCredential;
use crate::store::{CredentialStore, PostStore};
use crate::token::{AuthorizationGrant, TokenLifecycleManager};
use crate::transport::Transport;

/// Collections sampled by `list_collections`
pub const KNOWN_COLLECTIONS: [&str; 6] = [
    "com.whtwnd.blog.entry",
    "app.bsky.feed.post",
    "app.bsky.actor.profile",
    "app.bsky.feed.like",
    "app.bsky.feed.repost",
    "app.bsky.graph.follow",
];

const COLLECTION_SAMPLE: u32 = 5;
const PREVIEW_CHARS: usize = 300;

/// Result of a publish or unpublish, shaped for the web layer and job runner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_reauth: bool,
    /// Whether running the same operation again later may succeed
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl PublishOutcome {
    pub fn ok(uri: Option<String>) -> Self {
        Self {
            success: true,
            uri,
            ..Default::default()
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            requires_reauth: error.requires_reauth(),
            retryable: error.is_transient(),
            uri: None,
        }
    }
}

/// A public blog entry read back from the user's repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub uri: String,
    pub cid: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub created_at: Option<String>,
    pub visibility: String,
    pub word_count: usize,
    pub preview: String,
}

impl RecordSummary {
    fn from_record(record: RecordValue) -> Self {
        let field = |name: &str| {
            record
                .value
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let content = field("content").unwrap_or_default();

        Self {
            title: field("title"),
            created_at: field("createdAt"),
            visibility: field("visibility").unwrap_or_else(|| "public".to_string()),
            word_count: format::word_count(&content),
            preview: format::preview(&content, PREVIEW_CHARS),
            content,
            uri: record.uri,
            cid: record.cid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub name: String,
    pub count: usize,
}

/// The publishing surface offered to a web layer.
#[derive(Clone)]
pub struct PublishingService {
    config: Arc<PublisherConfig>,
    keys: Arc<KeyManager>,
    resolver: Arc<IdentityResolver>,
    tokens: Arc<TokenLifecycleManager>,
    repo: Arc<RepositoryClient>,
    machine: Arc<PublicationStateMachine>,
    converter: Arc<dyn HtmlConverter>,
    credentials: Arc<dyn CredentialStore>,
    posts: Arc<dyn PostStore>,
    forms: Arc<PreservedForms>,
}

impl PublishingService {
    pub fn builder() -> PublishingServiceBuilder {
        PublishingServiceBuilder::default()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn tokens(&self) -> &Arc<TokenLifecycleManager> {
        &self.tokens
    }

    pub fn preserved_forms(&self) -> &PreservedForms {
        &self.forms
    }

    /// Stored credential for a user; a missing one means sign-in is needed
    pub async fn credential_for(&self, did: &str) -> Result<UserCredential> {
        self.credentials.load_credential(did).await?.ok_or_else(|| {
            Error::ReauthenticationRequired(format!("no credential stored for {}", did))
        })
    }

    pub async fn sign_in_with_grant(&self, grant: AuthorizationGrant) -> Result<UserCredential> {
        self.tokens.exchange_code(grant).await
    }

    pub async fn sign_in_with_password(
        &self,
        identifier: &str,
        app_password: &str,
    ) -> Result<UserCredential> {
        self.tokens.create_session(identifier, app_password).await
    }

    /// Saves local edits and regenerates the excerpt
    pub async fn save_draft(&self, post: &mut Post) -> Result<()> {
        let plain = self.converter.to_plain_text(&post.content);
        post.refresh_excerpt(&plain);
        post.updated_at = chrono::Utc::now();
        self.posts.save_post(post).await
    }

    pub async fn publish(&self, post: &mut Post) -> PublishOutcome {
        if post.is_published() {
            return PublishOutcome::ok(post.bluesky_uri.clone());
        }

        let result = async {
            let mut credential = self.credential_for(&post.user_did).await?;
            self.machine.publish(post, &mut credential).await
        }
        .await;

        match result {
            Ok(()) => PublishOutcome::ok(post.bluesky_uri.clone()),
            Err(e) => PublishOutcome::failed(&e),
        }
    }

    pub async fn unpublish(&self, post: &mut Post) -> PublishOutcome {
        if post.status == PostStatus::Draft && post.bluesky_uri.is_none() {
            return PublishOutcome::ok(None);
        }

        let result = async {
            // Without a credential the remote delete fails and is logged
            let mut credential = match self.credential_for(&post.user_did).await {
                Ok(credential) => credential,
                Err(e) if e.requires_reauth() => {
                    UserCredential::cleared(&post.user_did, Default::default())
                }
                Err(e) => return Err(e),
            };
            self.machine.unpublish(post, &mut credential).await
        }
        .await;

        match result {
            Ok(()) => PublishOutcome::ok(None),
            Err(e) => PublishOutcome::failed(&e),
        }
    }

    pub async fn archive(&self, post: &mut Post) -> Result<()> {
        self.machine.archive(post).await
    }

    pub async fn unarchive(&self, post: &mut Post) -> Result<()> {
        self.machine.unarchive(post).await
    }

    /// Latest public blog entries in the user's repository
    pub async fn fetch_recent_posts(&self, did: &str, limit: u32) -> Result<Vec<RecordSummary>> {
        let mut credential = self.credential_for(did).await?;
        let page = self
            .repo
            .list_records(
                &mut credential,
                lexicons::com_whtwnd::blog::entry::NSID,
                limit,
                None,
            )
            .await?;

        Ok(page
            .records
            .into_iter()
            .map(RecordSummary::from_record)
            .filter(|summary| summary.visibility == "public")
            .collect())
    }

    /// Samples the well-known collections; collections that fail to list are skipped.
    pub async fn list_collections(&self, did: &str) -> Result<Vec<CollectionSummary>> {
        let mut credential = self.credential_for(did).await?;
        let mut summaries = Vec::new();

        for collection in KNOWN_COLLECTIONS {
            match self
                .repo
                .list_records(&mut credential, collection, COLLECTION_SAMPLE, None)
                .await
            {
                Ok(page) => summaries.push(CollectionSummary {
                    name: collection.to_string(),
                    count: page.records.len(),
                }),
                Err(e) if e.requires_reauth() => return Err(e),
                Err(e) => {
                    tracing::warn!("failed to list {} for {}: {}", collection, did, e);
                }
            }
        }

        Ok(summaries)
    }

    pub async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let mut credential = self.credential_for(did).await?;
        self.repo
            .list_records(&mut credential, collection, limit, cursor)
            .await
    }

    pub async fn get_record(&self, did: &str, at_uri: &str) -> Result<RecordValue> {
        let uri = AtUri::parse(at_uri)?;
        let mut credential = self.credential_for(did).await?;
        self.repo
            .get_record(&mut credential, &uri.repo, &uri.collection, &uri.rkey)
            .await
    }
}

/// Builder for PublishingService
#[derive(Default)]
pub struct PublishingServiceBuilder {
    config: Option<PublisherConfig>,
    credentials: Option<Arc<dyn CredentialStore>>,
    posts: Option<Arc<dyn PostStore>>,
    converter: Option<Arc<dyn HtmlConverter>>,
    http: Option<reqwest::Client>,
}

impl PublishingServiceBuilder {
    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn post_store(mut self, store: Arc<dyn PostStore>) -> Self {
        self.posts = Some(store);
        self
    }

    pub fn html_converter(mut self, converter: Arc<dyn HtmlConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<PublishingService> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("config required".to_string()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| Error::Config("credential_store required".to_string()))?;
        let posts = self
            .posts
            .ok_or_else(|| Error::Config("post_store required".to_string()))?;
        let converter = self
            .converter
            .unwrap_or_else(|| Arc::new(BasicHtmlConverter));
        let http = match self.http {
            Some(http) => http,
            None => config.http_client()?,
        };

        let config = Arc::new(config);
        let keys = Arc::new(KeyManager::new(config.key_dir.clone()));
        let resolver = Arc::new(IdentityResolver::new(
            http.clone(),
            config.identity_directory.clone(),
            config.default_pds.clone(),
        ));
        let transport = Arc::new(Transport::new(
            http,
            DpopProofSigner::new(keys.clone()),
        ));
        let tokens = Arc::new(TokenLifecycleManager::new(
            config.clone(),
            resolver.clone(),
            transport.clone(),
            credentials.clone(),
        ));
        let repo = Arc::new(RepositoryClient::new(
            resolver.clone(),
            tokens.clone(),
            transport,
        ));
        let formatter = format::formatter_for(config.publish_format, converter.clone());
        let machine = Arc::new(PublicationStateMachine::new(
            config.clone(),
            repo.clone(),
            formatter,
            posts.clone(),
        ));

        Ok(PublishingService {
            config,
            keys,
            resolver,
            tokens,
            repo,
            machine,
            converter,
            credentials,
            posts,
            forms: Arc::new(PreservedForms::default()),
        })
    }
}

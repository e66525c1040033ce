use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::post::PostId;

/// Which record shape a post is published as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishFormat {
    /// Long-form Markdown entry in `com.whtwnd.blog.entry`
    #[default]
    BlogEntry,
    /// Truncated short post in `app.bsky.feed.post`
    FeedPost,
}

impl FromStr for PublishFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blog" | "entry" | "com.whtwnd.blog.entry" => Ok(PublishFormat::BlogEntry),
            "post" | "feed" | "app.bsky.feed.post" => Ok(PublishFormat::FeedPost),
            other => Err(Error::Config(format!("unknown publish format: {}", other))),
        }
    }
}

/// How the app authenticates itself to authorization servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    /// Loopback development client, no client secret
    None,
    /// Confidential client signing `private_key_jwt` assertions
    PrivateKeyJwt,
}

/// Configuration for the publishing core
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Public base URL of the application (callback and canonical post URLs)
    pub app_url: Url,

    /// PDS used when a DID cannot be resolved
    pub default_pds: Url,

    /// DID PLC directory
    pub identity_directory: Url,

    /// Directory holding the signing key and its JWK
    pub key_dir: PathBuf,

    pub publish_format: PublishFormat,

    /// Lifetime assumed for access tokens whose expiry the server omits
    pub default_token_lifetime: chrono::Duration,

    /// OAuth scopes requested for new grants
    pub scopes: Vec<String>,

    pub client_name: String,

    /// Per-request HTTP timeout
    pub http_timeout: Duration,
}

impl PublisherConfig {
    /// Create a new configuration with sensible defaults
    pub fn new(app_url: impl Into<Url>) -> Self {
        Self {
            app_url: app_url.into(),
            default_pds: Url::parse("https://bsky.social").expect("valid url"),
            identity_directory: Url::parse("https://plc.directory").expect("valid url"),
            key_dir: PathBuf::from("config"),
            publish_format: PublishFormat::default(),
            default_token_lifetime: chrono::Duration::hours(1),
            scopes: vec!["atproto".to_string(), "transition:generic".to_string()],
            client_name: "Bluesky Blog Publisher".to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }

    /// Set default PDS
    pub fn with_default_pds(mut self, pds: Url) -> Self {
        self.default_pds = pds;
        self
    }

    /// Set the DID directory
    pub fn with_identity_directory(mut self, directory: Url) -> Self {
        self.identity_directory = directory;
        self
    }

    pub fn with_key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    pub fn with_publish_format(mut self, format: PublishFormat) -> Self {
        self.publish_format = format;
        self
    }

    pub fn with_token_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.default_token_lifetime = lifetime;
        self
    }

    /// Set custom scopes
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set client name
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    fn base(&self) -> &str {
        self.app_url.as_str().trim_end_matches('/')
    }

    /// Loopback hosts use the unregistered development client
    pub fn is_localhost(&self) -> bool {
        matches!(
            self.app_url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        )
    }

    pub fn client_auth_method(&self) -> ClientAuthMethod {
        if self.is_localhost() {
            ClientAuthMethod::None
        } else {
            ClientAuthMethod::PrivateKeyJwt
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.base())
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/oauth/jwks.json", self.base())
    }

    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// OAuth `client_id`; loopback clients encode their redirect and scope
    /// in the query instead of publishing a metadata document.
    pub fn client_id(&self) -> String {
        if self.is_localhost() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("redirect_uri", &self.redirect_uri())
                .append_pair("scope", &self.scope())
                .finish();
            format!("http://localhost?{}", query)
        } else {
            format!("{}/oauth-client-metadata.json", self.base())
        }
    }

    /// Canonical public URL of a post on this application
    pub fn post_url(&self, id: PostId) -> Result<Url> {
        Ok(Url::parse(&format!("{}/posts/{}", self.base(), id))?)
    }

    /// OAuth client metadata document served at `client_id`
    pub fn client_metadata(&self) -> serde_json::Value {
        let mut metadata = serde_json::json!({
            "client_id": self.client_id(),
            "client_name": self.client_name,
            "client_uri": self.base(),
            "application_type": "web",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "scope": self.scope(),
            "redirect_uris": [self.redirect_uri()],
            "dpop_bound_access_tokens": true,
            "token_endpoint_auth_method": "none",
        });

        if self.client_auth_method() == ClientAuthMethod::PrivateKeyJwt {
            metadata["token_endpoint_auth_method"] = "private_key_jwt".into();
            metadata["token_endpoint_auth_signing_alg"] = "ES256".into();
            metadata["jwks_uri"] = self.jwks_uri().into();
        }

        metadata
    }

    /// HTTP client shared by resolver, token manager and repository client
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("bsky-publisher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))
    }
}

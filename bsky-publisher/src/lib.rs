//! # bsky-publisher
//!
//! Publishes locally authored blog posts to an AT Protocol repository and
//! keeps the local copy in step with the remote record.
//!
//! The crate covers the client side of the protocol only:
//!
//! - **Keys**: one P-256 signing key per deployment, kept on disk
//! - **DPoP**: proof-of-possession headers and `private_key_jwt` assertions
//! - **Identity**: DID to PDS resolution with a default fallback
//! - **Tokens**: expiry checks, refresh, and invalidation of dead credentials
//! - **Repository**: create/get/list/delete records with nonce retry
//! - **Publishing**: the post state machine and the service wrapped around it
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bsky_publisher::{MemoryStore, Post, PublisherConfig, PublishingService};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let service = PublishingService::builder()
//!     .config(PublisherConfig::new("https://blog.example.com".parse::<url::Url>()?))
//!     .credential_store(store.clone())
//!     .post_store(store)
//!     .build()?;
//!
//! let mut post = Post::draft(1, "did:plc:abc", "Hello", "<p>World</p>");
//! let outcome = service.publish(&mut post).await;
//! println!("published: {}", outcome.success);
//! # Ok(())
//! # }
//! ```

pub mod at_uri;
pub mod auth;
pub mod config;
pub mod dpop;
pub mod error;
pub mod format;
#[cfg(feature = "axum")]
pub mod handlers;
pub mod identity;
pub mod keys;
pub mod memory;
pub mod post;
pub mod publish;
pub mod reauth;
pub mod repo;
pub mod service;
pub mod session;
pub mod store;
pub mod token;
pub mod transport;

pub use at_uri::AtUri;
pub use auth::{AuthHash, User};
pub use config::{PublishFormat, PublisherConfig};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use post::{Post, PostId, PostStatus};
pub use service::{PublishOutcome, PublishingService, PublishingServiceBuilder};
pub use session::{AuthScheme, UserCredential};
pub use store::{CredentialStore, PostStore};
pub use token::{AuthorizationGrant, EnsureOptions, TokenState};

use async_trait::async_trait;

use crate::error::Result;
use crate::post::{Post, PostId};
use crate::session::UserCredential;

/// Storage abstraction for user credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Get the stored credential for a DID
    async fn load_credential(&self, did: &str) -> Result<Option<UserCredential>>;

    /// Persist a credential, including a cleared one
    async fn save_credential(&self, credential: &UserCredential) -> Result<()>;
}

/// Storage abstraction for posts
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>>;

    /// Persist every field of the post in one write
    async fn save_post(&self, post: &Post) -> Result<()>;
}
